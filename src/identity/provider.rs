use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::security::{CredentialVerifier, Verdict};
use crate::store::SharedUserStore;

use super::principal::{Attrs, Principal};
use super::session::{Session, SessionManager};

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub session: Session,
}

pub trait AuthProvider: Send + Sync {
    fn login(&self, req: &LoginRequest) -> AppResult<LoginResponse>;
}

/// Username/password login against the local store, under the deployment's
/// credential scheme.
#[derive(Clone)]
pub struct LocalAuthProvider {
    pub store: SharedUserStore,
    pub verifier: CredentialVerifier,
    pub sm: SessionManager,
}

impl LocalAuthProvider {
    pub fn new(store: SharedUserStore, verifier: CredentialVerifier, sm: SessionManager) -> Self {
        Self { store, verifier, sm }
    }

    /// Create a local account and sign it straight in. Duplicate usernames
    /// surface as an actionable conflict.
    pub fn register(&self, req: &LoginRequest) -> AppResult<LoginResponse> {
        let sealed = self.verifier.seal(&req.password).map_err(AppError::from)?;
        let rec = self.store.0.lock().create_user(&req.username, sealed)?;
        let principal = Principal {
            user_id: rec.id,
            username: rec.username.clone(),
            attrs: Attrs { ip: req.ip.clone() },
        };
        let session = self.sm.issue(principal);
        info!(target: "confide::auth", "register user={} sid={}", req.username, session.session_id);
        Ok(LoginResponse { session })
    }
}

impl AuthProvider for LocalAuthProvider {
    fn login(&self, req: &LoginRequest) -> AppResult<LoginResponse> {
        // A store failure propagates as a server error; only a real verdict
        // turns into the generic invalid-credentials answer.
        match self.verifier.verify(&self.store, &req.username, &req.password)? {
            Verdict::Accept(user_id) => {
                let username = self.store.0.lock().get(user_id).and_then(|r| r.username);
                let principal = Principal { user_id, username, attrs: Attrs { ip: req.ip.clone() } };
                let session = self.sm.issue(principal);
                info!(target: "confide::auth", "login user={} sid={}", req.username, session.session_id);
                Ok(LoginResponse { session })
            }
            Verdict::Reject(reason) => {
                // The reason stays server-side; clients get one generic answer
                // whether the user is unknown or the secret mismatched.
                debug!(target: "confide::auth", "login rejected user={} reason={:?}", req.username, reason);
                Err(AppError::auth("invalid_credentials", "invalid credentials"))
            }
        }
    }
}
