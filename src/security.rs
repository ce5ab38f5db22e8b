use anyhow::{anyhow, Result};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use base64::Engine;
use password_hash::{PasswordHash, SaltString};
use tracing::warn;
use uuid::Uuid;

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};

use crate::store::{CredentialMaterial, SharedUserStore, StoreError};

/// Credential scheme in effect for a deployment. Selected once at startup,
/// never mixed within one running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScheme {
    /// Stored secret compared byte-for-byte. Weakest option, no timing
    /// mitigation; kept for parity with the earliest deployments.
    Plaintext,
    /// Secret encrypted at rest with a process-wide AES-256-GCM key and
    /// compared after decryption.
    Encrypted,
    /// Argon2id salted hash, recompute-and-compare. Default recommendation;
    /// the only scheme safe against offline store compromise.
    Hashed,
}

impl CredentialScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialScheme::Plaintext => "plaintext",
            CredentialScheme::Encrypted => "encrypted",
            CredentialScheme::Hashed => "hashed",
        }
    }
}

impl std::str::FromStr for CredentialScheme {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "plaintext" => Ok(CredentialScheme::Plaintext),
            "encrypted" => Ok(CredentialScheme::Encrypted),
            "hashed" => Ok(CredentialScheme::Hashed),
            other => Err(anyhow!("unknown credential scheme '{}'", other)),
        }
    }
}

/// Process-wide symmetric key for the encrypted-at-rest scheme. Lives in
/// configuration only; never persisted alongside the data it protects.
#[derive(Clone)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| anyhow!("secret key is not valid base64: {}", e))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| anyhow!("secret key must be 32 bytes, got {}", v.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2.hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(phc)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(password.as_bytes(), &parsed).is_ok()
    } else { false }
}

/// Encrypt a secret under the process key. Returns (ciphertext, nonce), both
/// base64. A fresh nonce is drawn per call.
pub fn encrypt_secret(key: &SymmetricKey, plaintext: &str) -> Result<(String, String)> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| anyhow!("cipher init failed: {}", e))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| anyhow!("encryption failed: {}", e))?;
    let b64 = base64::engine::general_purpose::STANDARD;
    Ok((b64.encode(ciphertext), b64.encode(nonce)))
}

/// Decrypt stored credential material. Any failure (wrong key, corrupt
/// ciphertext, bad nonce) is an error the caller turns into a rejection.
pub fn decrypt_secret(key: &SymmetricKey, ciphertext_b64: &str, nonce_b64: &str) -> Result<String> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let ciphertext = b64.decode(ciphertext_b64).map_err(|e| anyhow!("bad ciphertext encoding: {}", e))?;
    let nonce_bytes = b64.decode(nonce_b64).map_err(|e| anyhow!("bad nonce encoding: {}", e))?;
    if nonce_bytes.len() != 12 {
        return Err(anyhow!("nonce must be 12 bytes, got {}", nonce_bytes.len()));
    }
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| anyhow!("cipher init failed: {}", e))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| anyhow!("decryption failed"))?;
    String::from_utf8(plaintext).map_err(|e| anyhow!("decrypted secret is not utf-8: {}", e))
}

/// Why a verification was rejected. Distinct in code; the HTTP surface maps
/// both to one generic invalid-credentials response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownUser,
    Mismatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept(Uuid),
    Reject(RejectReason),
}

/// Verifies presented credentials against the store under the configured
/// scheme. Constructed once at startup from `ServerConfig`.
#[derive(Clone)]
pub struct CredentialVerifier {
    scheme: CredentialScheme,
    key: Option<SymmetricKey>,
}

impl CredentialVerifier {
    pub fn new(scheme: CredentialScheme, key: Option<SymmetricKey>) -> Result<Self> {
        if scheme == CredentialScheme::Encrypted && key.is_none() {
            return Err(anyhow!("the encrypted credential scheme requires a secret key"));
        }
        Ok(Self { scheme, key })
    }

    pub fn scheme(&self) -> CredentialScheme {
        self.scheme
    }

    /// Produce the stored form of a new secret under the active scheme.
    pub fn seal(&self, secret: &str) -> Result<CredentialMaterial> {
        match self.scheme {
            CredentialScheme::Plaintext => Ok(CredentialMaterial::Plaintext { secret: secret.to_string() }),
            CredentialScheme::Encrypted => {
                let key = self.key.as_ref().ok_or_else(|| anyhow!("missing secret key"))?;
                let (ciphertext, nonce) = encrypt_secret(key, secret)?;
                Ok(CredentialMaterial::Encrypted { ciphertext, nonce })
            }
            CredentialScheme::Hashed => Ok(CredentialMaterial::Hashed { phc: hash_password(secret)? }),
        }
    }

    /// Decide accept/reject for a presented username/secret pair.
    ///
    /// Unknown user and credential mismatch stay distinct here so callers can
    /// log and test them separately; they must not be distinguishable in the
    /// response a client sees. An unavailable store is neither: it propagates
    /// as a store error so the caller can answer with a server failure.
    pub fn verify(&self, store: &SharedUserStore, username: &str, secret: &str) -> Result<Verdict, StoreError> {
        // Clone the record out and drop the lock before any slow hashing.
        let rec = {
            let guard = store.0.lock();
            guard.find_by_username(username)
        };
        let rec = match rec {
            Ok(r) => r,
            Err(StoreError::NotFound) => return Ok(Verdict::Reject(RejectReason::UnknownUser)),
            Err(e) => return Err(e),
        };
        let Some(material) = rec.credential.as_ref() else {
            // Federated-only account; no local secret can ever match.
            return Ok(Verdict::Reject(RejectReason::Mismatch));
        };
        let ok = match (self.scheme, material) {
            (CredentialScheme::Plaintext, CredentialMaterial::Plaintext { secret: stored }) => stored == secret,
            (CredentialScheme::Encrypted, CredentialMaterial::Encrypted { ciphertext, nonce }) => {
                let Some(key) = self.key.as_ref() else { return Ok(Verdict::Reject(RejectReason::Mismatch)) };
                match decrypt_secret(key, ciphertext, nonce) {
                    Ok(stored) => stored == secret,
                    Err(e) => {
                        warn!(target: "confide::security", "credential decryption failed for user {}: {}", rec.id, e);
                        false
                    }
                }
            }
            (CredentialScheme::Hashed, CredentialMaterial::Hashed { phc }) => verify_password(phc, secret),
            (scheme, _) => {
                // One encoding per deployment; a stray record under another
                // encoding is unverifiable.
                warn!(target: "confide::security", "user {} holds credential material not matching scheme '{}'", rec.id, scheme.as_str());
                false
            }
        };
        Ok(if ok { Verdict::Accept(rec.id) } else { Verdict::Reject(RejectReason::Mismatch) })
    }
}
