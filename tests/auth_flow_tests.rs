//! End-to-end auth scenarios at the provider/verifier boundary: registration,
//! login, and the requirement that wrong-password and unknown-user rejections
//! are indistinguishable in everything a client could observe.

use anyhow::Result;
use base64::Engine;
use tempfile::tempdir;

use confide::error::AppError;
use confide::identity::{AuthProvider, LocalAuthProvider, LoginRequest, SessionManager};
use confide::security::{CredentialScheme, CredentialVerifier, SymmetricKey, Verdict};
use confide::store::SharedUserStore;

fn test_key() -> SymmetricKey {
    SymmetricKey::from_base64(&base64::engine::general_purpose::STANDARD.encode([3u8; 32])).unwrap()
}

fn provider_for(scheme: CredentialScheme, root: &std::path::Path) -> LocalAuthProvider {
    let store = SharedUserStore::new(root).unwrap();
    let key = if scheme == CredentialScheme::Encrypted { Some(test_key()) } else { None };
    let verifier = CredentialVerifier::new(scheme, key).unwrap();
    LocalAuthProvider::new(store, verifier, SessionManager::default())
}

fn req(username: &str, password: &str) -> LoginRequest {
    LoginRequest { username: username.into(), password: password.into(), ip: None }
}

fn assert_same_rejection(a: &AppError, b: &AppError) {
    assert_eq!(a.http_status(), b.http_status());
    assert_eq!(a.code_str(), b.code_str());
    assert_eq!(a.message(), b.message());
}

#[test]
fn register_login_scenario_under_each_scheme() -> Result<()> {
    for scheme in [CredentialScheme::Plaintext, CredentialScheme::Encrypted, CredentialScheme::Hashed] {
        let tmp = tempdir()?;
        let provider = provider_for(scheme, tmp.path());

        // register alice/secret1 -> login alice/secret1 -> Accept
        let reg = provider.register(&req("alice", "secret1"))?;
        let login = provider.login(&req("alice", "secret1"))?;
        assert_eq!(reg.session.principal.user_id, login.session.principal.user_id);

        // login alice/wrong -> rejection; login bob/anything -> same shape
        let wrong = provider.login(&req("alice", "wrong")).unwrap_err();
        let unknown = provider.login(&req("bob", "anything")).unwrap_err();
        assert_eq!(wrong.http_status(), 401);
        assert_same_rejection(&wrong, &unknown);
    }
    Ok(())
}

#[test]
fn stored_credential_verifies_after_reopen() -> Result<()> {
    // Durability round-trip: the sealed credential written at registration
    // still verifies against the original plaintext after the store is
    // reloaded from disk.
    let tmp = tempdir()?;
    let verifier = CredentialVerifier::new(CredentialScheme::Hashed, None)?;
    let user_id;
    {
        let provider = LocalAuthProvider::new(
            SharedUserStore::new(tmp.path())?,
            verifier.clone(),
            SessionManager::default(),
        );
        user_id = provider.register(&req("alice", "secret1"))?.session.principal.user_id;
    }
    let reopened = SharedUserStore::new(tmp.path())?;
    match verifier.verify(&reopened, "alice", "secret1")? {
        Verdict::Accept(id) => assert_eq!(id, user_id),
        other => panic!("expected accept after reopen, got {:?}", other),
    }
    Ok(())
}

#[test]
fn duplicate_registration_is_actionable() -> Result<()> {
    let tmp = tempdir()?;
    let provider = provider_for(CredentialScheme::Hashed, tmp.path());
    provider.register(&req("alice", "secret1"))?;
    let err = provider.register(&req("alice", "other")).unwrap_err();
    assert_eq!(err.http_status(), 409);
    assert_eq!(err.code_str(), "duplicate_identity");
    Ok(())
}

#[test]
fn encrypted_store_rejects_under_a_rotated_key() -> Result<()> {
    // Credentials sealed under one key must reject (not crash) when the
    // process comes back with a different key.
    let tmp = tempdir()?;
    let provider = provider_for(CredentialScheme::Encrypted, tmp.path());
    provider.register(&req("alice", "secret1"))?;

    let other_key = SymmetricKey::from_base64(&base64::engine::general_purpose::STANDARD.encode([4u8; 32]))?;
    let rotated = CredentialVerifier::new(CredentialScheme::Encrypted, Some(other_key))?;
    let reopened = SharedUserStore::new(tmp.path())?;
    match rotated.verify(&reopened, "alice", "secret1")? {
        Verdict::Reject(_) => {}
        other => panic!("expected reject under rotated key, got {:?}", other),
    }
    Ok(())
}
