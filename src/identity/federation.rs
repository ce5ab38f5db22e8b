//! Federated sign-in. One adapter per configured provider exchanges the
//! authorization code for an access token, fetches the provider's stable
//! subject id, links it to a local user record (creating one on first sight)
//! and binds the user into a session. No local password is ever involved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope, TokenResponse, TokenUrl};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::OAuthClientConfig;
use crate::error::{AppError, AppResult};
use crate::store::{Provider, SharedUserStore};

use super::principal::{Attrs, Principal};
use super::provider::LoginResponse;
use super::session::SessionManager;

/// How long an issued authorize-state stays redeemable.
const STATE_TTL: Duration = Duration::from_secs(10 * 60);

struct Endpoints {
    auth_url: &'static str,
    token_url: &'static str,
    userinfo_url: &'static str,
    scopes: &'static [&'static str],
}

fn endpoints(provider: Provider) -> Endpoints {
    match provider {
        Provider::Google => Endpoints {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
            token_url: "https://oauth2.googleapis.com/token",
            userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
            scopes: &["openid"],
        },
        Provider::Github => Endpoints {
            auth_url: "https://github.com/login/oauth/authorize",
            token_url: "https://github.com/login/oauth/access_token",
            userinfo_url: "https://api.github.com/user",
            scopes: &["read:user"],
        },
        Provider::Twitter => Endpoints {
            auth_url: "https://twitter.com/i/oauth2/authorize",
            token_url: "https://api.twitter.com/2/oauth2/token",
            userinfo_url: "https://api.twitter.com/2/users/me",
            scopes: &["users.read", "tweet.read"],
        },
        Provider::Facebook => Endpoints {
            auth_url: "https://www.facebook.com/v12.0/dialog/oauth",
            token_url: "https://graph.facebook.com/v12.0/oauth/access_token",
            userinfo_url: "https://graph.facebook.com/me",
            scopes: &["public_profile"],
        },
    }
}

/// Pull the stable subject id out of a provider's userinfo document.
fn extract_subject(provider: Provider, doc: &serde_json::Value) -> Option<String> {
    match provider {
        Provider::Google => doc.get("sub").and_then(|v| v.as_str()).map(str::to_string),
        // GitHub reports a numeric account id
        Provider::Github => doc.get("id").and_then(|v| {
            v.as_i64().map(|n| n.to_string()).or_else(|| v.as_str().map(str::to_string))
        }),
        Provider::Twitter => doc.pointer("/data/id").and_then(|v| v.as_str()).map(str::to_string),
        Provider::Facebook => doc.get("id").and_then(|v| v.as_str()).map(str::to_string),
    }
}

#[derive(Clone)]
pub struct FederationAdapter {
    provider: Provider,
    client: BasicClient,
    http: reqwest::Client,
    store: SharedUserStore,
    sm: SessionManager,
    /// Outstanding authorize-state tokens -> issue time. Checked and removed
    /// on callback, the same one-shot model as a per-session CSRF token.
    pending: Arc<RwLock<HashMap<String, Instant>>>,
}

impl FederationAdapter {
    pub fn new(
        provider: Provider,
        cfg: &OAuthClientConfig,
        redirect_base: &str,
        store: SharedUserStore,
        sm: SessionManager,
    ) -> anyhow::Result<Self> {
        let ep = endpoints(provider);
        let redirect = format!("{}/auth/{}/secrets", redirect_base.trim_end_matches('/'), provider);
        let client = BasicClient::new(
            ClientId::new(cfg.client_id.clone()),
            Some(ClientSecret::new(cfg.client_secret.clone())),
            AuthUrl::new(ep.auth_url.to_string())?,
            Some(TokenUrl::new(ep.token_url.to_string())?),
        )
        .set_redirect_uri(RedirectUrl::new(redirect)?);
        let http = reqwest::Client::builder().user_agent("confide").build()?;
        Ok(Self {
            provider,
            client,
            http,
            store,
            sm,
            pending: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Build the provider authorize URL and remember its state token.
    pub fn begin(&self) -> String {
        let ep = endpoints(self.provider);
        let mut req = self.client.authorize_url(CsrfToken::new_random);
        for scope in ep.scopes {
            req = req.add_scope(Scope::new(scope.to_string()));
        }
        let (url, state) = req.url();
        let now = Instant::now();
        {
            let mut pending = self.pending.write();
            pending.retain(|_, issued| now.duration_since(*issued) < STATE_TTL);
            pending.insert(state.secret().clone(), now);
        }
        url.to_string()
    }

    fn take_state(&self, state: &str) -> bool {
        let mut pending = self.pending.write();
        match pending.remove(state) {
            Some(issued) => issued.elapsed() < STATE_TTL,
            None => false,
        }
    }

    /// Redeem a provider callback. Any failure is a `Provider` error the
    /// HTTP layer turns into a redirect back to the login entry point.
    pub async fn complete(&self, code: &str, state: &str) -> AppResult<LoginResponse> {
        if !self.take_state(state) {
            warn!(target: "confide::federation", "{}: callback with unknown or expired state", self.provider);
            return Err(AppError::provider("state_mismatch", "authorization state not recognized"));
        }

        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| {
                warn!(target: "confide::federation", "{}: code exchange failed: {}", self.provider, e);
                AppError::provider("token_exchange_failed".to_string(), e.to_string())
            })?;

        let ep = endpoints(self.provider);
        let doc: serde_json::Value = self
            .http
            .get(ep.userinfo_url)
            .bearer_auth(token.access_token().secret())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                warn!(target: "confide::federation", "{}: userinfo fetch failed: {}", self.provider, e);
                AppError::provider("userinfo_failed".to_string(), e.to_string())
            })?
            .json()
            .await
            .map_err(|e| AppError::provider("userinfo_malformed".to_string(), e.to_string()))?;

        let subject = extract_subject(self.provider, &doc).ok_or_else(|| {
            warn!(target: "confide::federation", "{}: userinfo document carries no subject id", self.provider);
            AppError::provider("subject_missing", "provider assertion carries no subject id")
        })?;

        let rec = self.store.0.lock().find_or_create_by_provider_id(self.provider, &subject)?;
        let principal = Principal { user_id: rec.id, username: rec.username.clone(), attrs: Attrs::default() };
        let session = self.sm.issue(principal);
        info!(target: "confide::federation", "{}: subject {} -> user {} sid={}", self.provider, subject, rec.id, session.session_id);
        Ok(LoginResponse { session })
    }
}

/// Build one adapter per provider that has a registered OAuth client.
pub fn build_adapters(
    clients: &HashMap<Provider, OAuthClientConfig>,
    redirect_base: &str,
    store: &SharedUserStore,
    sm: &SessionManager,
) -> anyhow::Result<HashMap<Provider, FederationAdapter>> {
    let mut adapters = HashMap::new();
    for (provider, cfg) in clients {
        let adapter = FederationAdapter::new(*provider, cfg, redirect_base, store.clone(), sm.clone())?;
        adapters.insert(*provider, adapter);
    }
    Ok(adapters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn adapter(provider: Provider) -> (FederationAdapter, tempfile::TempDir) {
        let tmp = tempdir().unwrap();
        let store = SharedUserStore::new(tmp.path()).unwrap();
        let cfg = OAuthClientConfig { client_id: "id".into(), client_secret: "secret".into() };
        let a = FederationAdapter::new(provider, &cfg, "http://localhost:3000", store, SessionManager::default()).unwrap();
        (a, tmp)
    }

    #[test]
    fn subject_extraction_per_provider() {
        assert_eq!(extract_subject(Provider::Google, &json!({"sub": "g-123"})), Some("g-123".into()));
        assert_eq!(extract_subject(Provider::Github, &json!({"id": 42})), Some("42".into()));
        assert_eq!(extract_subject(Provider::Twitter, &json!({"data": {"id": "t-9"}})), Some("t-9".into()));
        assert_eq!(extract_subject(Provider::Facebook, &json!({"id": "fb-7"})), Some("fb-7".into()));
        assert_eq!(extract_subject(Provider::Google, &json!({"name": "nobody"})), None);
    }

    #[test]
    fn begin_embeds_state_and_redirect() {
        let (a, _tmp) = adapter(Provider::Github);
        let url = a.begin();
        assert!(url.starts_with("https://github.com/login/oauth/authorize"));
        assert!(url.contains("state="));
        assert!(url.contains("redirect_uri="));
        assert!(url.contains(urlencoding::encode("/auth/github/secrets").as_ref()));
    }

    #[tokio::test]
    async fn callback_with_unknown_state_is_a_provider_failure() {
        let (a, _tmp) = adapter(Provider::Google);
        let err = a.complete("some-code", "never-issued").await.unwrap_err();
        assert_eq!(err.code_str(), "state_mismatch");
        assert_eq!(err.http_status(), 502);
    }

    #[test]
    fn state_is_single_use() {
        let (a, _tmp) = adapter(Provider::Facebook);
        let url = a.begin();
        let state = url
            .split("state=")
            .nth(1)
            .and_then(|s| s.split('&').next())
            .unwrap()
            .to_string();
        assert!(a.take_state(&state));
        assert!(!a.take_state(&state));
    }
}
