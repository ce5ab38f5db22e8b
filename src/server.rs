//!
//! confide HTTP server
//! -------------------
//! This module defines the Axum-based HTTP API for confide.
//!
//! Responsibilities:
//! - Session management with an HttpOnly cookie bearing the session token.
//! - Register/login/logout endpoints backed by the `security` and `identity`
//!   modules, with one uniform invalid-credentials response.
//! - The protected secrets wall and secret submission endpoints.
//! - Per-provider OAuth entry and callback routes delegating to the
//!   federation adapters; provider failures bounce to the login entry.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::identity::{build_adapters, AuthProvider, FederationAdapter, LocalAuthProvider, LoginRequest, Principal, SessionManager};
use crate::security::CredentialVerifier;
use crate::store::{Provider, SharedUserStore};

const SESSION_COOKIE: &str = "confide_session";

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedUserStore,
    pub sm: SessionManager,
    pub local: LocalAuthProvider,
    pub federation: HashMap<Provider, FederationAdapter>,
}

fn log_startup(cfg: &ServerConfig) {
    let providers: Vec<&str> = cfg.oauth_clients.keys().map(|p| p.as_str()).collect();
    info!(
        target: "startup",
        "confide starting: http_port={}, db_root='{}', scheme={}, session_ttl_secs={}, providers={:?}",
        cfg.http_port, cfg.db_root, cfg.scheme.as_str(), cfg.session_ttl.as_secs(), providers
    );
}

/// Build the full application state from resolved configuration.
pub fn build_state(cfg: &ServerConfig) -> anyhow::Result<AppState> {
    let store = SharedUserStore::new(&cfg.db_root)?;
    let verifier = CredentialVerifier::new(cfg.scheme, cfg.secret_key.clone())?;
    let sm = SessionManager::new(cfg.session_ttl);
    let local = LocalAuthProvider::new(store.clone(), verifier, sm.clone());
    let federation = build_adapters(&cfg.oauth_clients, &cfg.oauth_redirect_base, &store, &sm)?;
    Ok(AppState { store, sm, local, federation })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/register", get(register_view).post(register))
        .route("/login", get(login_view).post(login))
        .route("/secrets", get(secrets))
        .route("/submit", get(submit_view).post(submit))
        .route("/logout", get(logout))
        .route("/auth/{provider}", get(auth_begin))
        .route("/auth/{provider}/secrets", get(auth_callback))
        .with_state(state)
}

/// Start the confide HTTP server with the given configuration.
pub async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    log_startup(&cfg);
    let state = build_state(&cfg)?;
    let app = build_router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct CredentialsPayload {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct SubmitPayload {
    secret: String,
}

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie").or_else(|| headers.get("Cookie"))?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name { return Some(v[1..].to_string()); }
        }
    }
    None
}

fn set_session_cookie(token: &str) -> HeaderValue {
    // HttpOnly cookie scoped to path / with SameSite=Lax so provider
    // redirects still carry it
    HeaderValue::from_str(&format!("{}={}; HttpOnly; SameSite=Lax; Path=/", SESSION_COOKIE, token)).unwrap()
}

fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_str(&format!("{}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; SameSite=Lax; Path=/", SESSION_COOKIE)).unwrap()
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
}

fn current_principal(state: &AppState, headers: &HeaderMap) -> Option<Principal> {
    let token = parse_cookie(headers, SESSION_COOKIE)?;
    state.sm.resolve(&token)
}

/// Anonymous-path response for protected resources: not an error, a pointer
/// back to the login entry.
fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"status":"unauthorized","view":"login"}))).into_response()
}

fn error_response(e: &AppError) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"status":"error","code": e.code_str(), "message": e.message()}))).into_response()
}

async fn home() -> impl IntoResponse {
    Json(json!({"status":"ok","view":"home","service":"confide"}))
}

async fn register_view() -> impl IntoResponse {
    Json(json!({"status":"ok","view":"register"}))
}

async fn login_view(State(state): State<AppState>) -> impl IntoResponse {
    let mut providers: Vec<&str> = state.federation.keys().map(|p| p.as_str()).collect();
    providers.sort();
    Json(json!({"status":"ok","view":"login","providers": providers}))
}

async fn register(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<CredentialsPayload>) -> Response {
    if payload.username.trim().is_empty() || payload.password.is_empty() {
        return error_response(&AppError::user("missing_credentials", "username and password are required"));
    }
    let req = LoginRequest { username: payload.username, password: payload.password, ip: client_ip(&headers) };
    match state.local.register(&req) {
        Ok(resp) => {
            let mut h = HeaderMap::new();
            h.insert("Set-Cookie", set_session_cookie(&resp.session.token));
            (StatusCode::OK, h, Json(json!({"status":"ok","view":"secrets"}))).into_response()
        }
        Err(e @ AppError::Conflict { .. }) => error_response(&e),
        Err(e @ AppError::Store { .. }) => {
            error!("register failed: {e}");
            error_response(&e)
        }
        Err(e) => {
            error!("register error: {e}");
            error_response(&e)
        }
    }
}

async fn login(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<CredentialsPayload>) -> Response {
    let req = LoginRequest { username: payload.username, password: payload.password, ip: client_ip(&headers) };
    match state.local.login(&req) {
        Ok(resp) => {
            let mut h = HeaderMap::new();
            h.insert("Set-Cookie", set_session_cookie(&resp.session.token));
            (StatusCode::OK, h, Json(json!({"status":"ok","view":"secrets"}))).into_response()
        }
        // Unknown user and wrong password arrive here as the same Auth error;
        // nothing in the response may tell them apart.
        Err(e @ AppError::Auth { .. }) => error_response(&e),
        Err(e) => {
            error!("login error: {e}");
            error_response(&e)
        }
    }
}

async fn secrets(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(_principal) = current_principal(&state, &headers) else {
        return unauthorized();
    };
    let wall = state.store.0.lock().secrets_wall();
    (StatusCode::OK, Json(json!({"status":"ok","view":"secrets","secrets": wall}))).into_response()
}

async fn submit_view(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if current_principal(&state, &headers).is_none() {
        return unauthorized();
    }
    (StatusCode::OK, Json(json!({"status":"ok","view":"submit"}))).into_response()
}

async fn submit(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<SubmitPayload>) -> Response {
    let Some(principal) = current_principal(&state, &headers) else {
        return unauthorized();
    };
    if payload.secret.trim().is_empty() {
        return error_response(&AppError::user("empty_secret", "secret text is required"));
    }
    let result = state.store.0.lock().append_secret(principal.user_id, payload.secret.trim());
    match result {
        Ok(()) => (StatusCode::OK, Json(json!({"status":"ok","view":"secrets"}))).into_response(),
        Err(e) => {
            error!("submit failed: {e}");
            error_response(&AppError::from(e))
        }
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = parse_cookie(&headers, SESSION_COOKIE) {
        state.sm.destroy(&token);
    }
    let mut h = HeaderMap::new();
    h.insert("Set-Cookie", clear_session_cookie());
    (StatusCode::OK, h, Json(json!({"status":"ok","view":"home"}))).into_response()
}

async fn auth_begin(State(state): State<AppState>, Path(provider): Path<String>) -> Response {
    let provider: Provider = match provider.parse() {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };
    let Some(adapter) = state.federation.get(&provider) else {
        return error_response(&AppError::not_found("provider_not_configured", "provider has no registered client"));
    };
    Redirect::to(&adapter.begin()).into_response()
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

async fn auth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let provider: Provider = match provider.parse() {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };
    let Some(adapter) = state.federation.get(&provider) else {
        return error_response(&AppError::not_found("provider_not_configured", "provider has no registered client"));
    };
    let (Some(code), Some(csrf_state)) = (query.code, query.state) else {
        // Provider denied or the user backed out; back to the login entry.
        warn!(target: "confide::federation", "{}: callback without code/state", provider);
        return Redirect::to("/login").into_response();
    };
    match adapter.complete(&code, &csrf_state).await {
        Ok(resp) => {
            let mut h = HeaderMap::new();
            h.insert("Set-Cookie", set_session_cookie(&resp.session.token));
            (h, Redirect::to("/secrets")).into_response()
        }
        Err(e @ AppError::Provider { .. }) => {
            // Logged server-side only; the user just lands back at login.
            warn!(target: "confide::federation", "{}: federation failed: {}", provider, e);
            Redirect::to("/login").into_response()
        }
        Err(e) => {
            error!("callback error: {e}");
            error_response(&e)
        }
    }
}
