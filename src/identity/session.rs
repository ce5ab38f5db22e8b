use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::RwLock;

use crate::tprintln;

use super::principal::Principal;

pub type SessionToken = String;

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub token: SessionToken,
    pub principal: Principal,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

fn gen_id() -> String {
    // 256-bit random token base64url without padding
    let mut buf = [0u8; 32];
    let _ = getrandom::getrandom(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// Issues and resolves opaque session tokens. The maps are owned by the
/// manager instance; cloning shares them, so every handler sees one session
/// table.
#[derive(Clone)]
pub struct SessionManager {
    pub ttl: Duration,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    revoked: Arc<RwLock<HashSet<String>>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(60 * 60))
    }
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            revoked: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn issue(&self, principal: Principal) -> Session {
        let now = Instant::now();
        let sid = gen_id();
        let token = gen_id();
        let sess = Session {
            session_id: sid.clone(),
            token: token.clone(),
            principal,
            issued_at: now,
            expires_at: now + self.ttl,
        };
        self.sessions.write().insert(token, sess.clone());
        tprintln!("session.issue user={} sid={} ttl_secs={}", sess.principal.user_id, sid, self.ttl.as_secs());
        sess
    }

    /// Resolve a bearer token to its principal. Expired entries are pruned on
    /// the way out; revoked tokens never resolve again.
    pub fn resolve(&self, token: &str) -> Option<Principal> {
        if self.revoked.read().contains(token) {
            return None;
        }
        let now = Instant::now();
        let mut drop_key: Option<String> = None;
        let out = {
            let map = self.sessions.read();
            if let Some(sess) = map.get(token) {
                if sess.expires_at > now {
                    Some(sess.principal.clone())
                } else {
                    drop_key = Some(token.to_string());
                    None
                }
            } else { None }
        };
        if let Some(k) = drop_key {
            self.sessions.write().remove(&k);
        }
        out
    }

    pub fn destroy(&self, token: &str) -> bool {
        let removed = self.sessions.write().remove(token);
        if let Some(sess) = removed {
            self.revoked.write().insert(token.to_string());
            tprintln!("session.destroy user={} sid={}", sess.principal.user_id, sess.session_id);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn principal() -> Principal {
        Principal { user_id: Uuid::new_v4(), username: Some("alice".into()), attrs: Default::default() }
    }

    #[test]
    fn issue_then_resolve_roundtrip() {
        let sm = SessionManager::default();
        let p = principal();
        let sess = sm.issue(p.clone());
        assert_eq!(sm.resolve(&sess.token), Some(p));
    }

    #[test]
    fn resolve_after_destroy_is_invalid() {
        let sm = SessionManager::default();
        let sess = sm.issue(principal());
        assert!(sm.destroy(&sess.token));
        assert_eq!(sm.resolve(&sess.token), None);
        // second destroy is a no-op
        assert!(!sm.destroy(&sess.token));
    }

    #[test]
    fn expired_sessions_do_not_resolve() {
        let sm = SessionManager::new(Duration::ZERO);
        let sess = sm.issue(principal());
        assert_eq!(sm.resolve(&sess.token), None);
    }

    #[test]
    fn unknown_token_is_invalid() {
        let sm = SessionManager::default();
        assert_eq!(sm.resolve("no-such-token"), None);
    }

    #[test]
    fn tokens_are_unique_per_issue() {
        let sm = SessionManager::default();
        let a = sm.issue(principal());
        let b = sm.issue(principal());
        assert_ne!(a.token, b.token);
    }
}
