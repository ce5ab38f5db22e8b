//! Startup configuration. All environment reads happen here, once, at boot;
//! components receive the resolved struct and never consult the environment
//! mid-request.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::security::{CredentialScheme, SymmetricKey};
use crate::store::Provider;

/// OAuth client registration for one provider.
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    /// Root folder for the user store snapshot.
    pub db_root: String,
    pub scheme: CredentialScheme,
    /// Required when `scheme` is `Encrypted`; never persisted with the data.
    pub secret_key: Option<SymmetricKey>,
    pub session_ttl: Duration,
    /// Public base URL used to build per-provider callback URLs.
    pub oauth_redirect_base: String,
    /// Providers with a registered client; others stay disabled.
    pub oauth_clients: HashMap<Provider, OAuthClientConfig>,
}

impl ServerConfig {
    /// Resolve configuration from `CONFIDE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_source(&|name| std::env::var(name).ok())
    }

    /// Resolve configuration from an arbitrary variable source. Split out so
    /// tests can drive it without touching the process environment.
    pub fn from_source(get: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let http_port: u16 = match get("CONFIDE_HTTP_PORT") {
            Some(v) => v.parse().with_context(|| format!("CONFIDE_HTTP_PORT is not a port: '{}'", v))?,
            None => 3000,
        };
        let db_root = get("CONFIDE_DB_FOLDER").unwrap_or_else(|| "userdb".to_string());
        let scheme: CredentialScheme = get("CONFIDE_CREDENTIAL_SCHEME")
            .unwrap_or_else(|| "hashed".to_string())
            .parse()
            .context("CONFIDE_CREDENTIAL_SCHEME")?;
        let secret_key = match get("CONFIDE_SECRET_KEY") {
            Some(v) => Some(SymmetricKey::from_base64(&v).context("CONFIDE_SECRET_KEY")?),
            None => None,
        };
        if scheme == CredentialScheme::Encrypted && secret_key.is_none() {
            return Err(anyhow!("CONFIDE_CREDENTIAL_SCHEME=encrypted requires CONFIDE_SECRET_KEY"));
        }
        let session_ttl = match get("CONFIDE_SESSION_TTL_SECS") {
            Some(v) => Duration::from_secs(v.parse().with_context(|| format!("CONFIDE_SESSION_TTL_SECS is not seconds: '{}'", v))?),
            None => Duration::from_secs(60 * 60),
        };
        let oauth_redirect_base = get("CONFIDE_OAUTH_REDIRECT_BASE")
            .unwrap_or_else(|| format!("http://localhost:{}", http_port));

        let mut oauth_clients = HashMap::new();
        for provider in Provider::ALL {
            let upper = provider.as_str().to_ascii_uppercase();
            let id_var = format!("CONFIDE_{}_CLIENT_ID", upper);
            let secret_var = format!("CONFIDE_{}_CLIENT_SECRET", upper);
            match (get(&id_var), get(&secret_var)) {
                (Some(client_id), Some(client_secret)) => {
                    oauth_clients.insert(provider, OAuthClientConfig { client_id, client_secret });
                }
                (Some(_), None) | (None, Some(_)) => {
                    return Err(anyhow!("{} and {} must be set together", id_var, secret_var));
                }
                (None, None) => {}
            }
        }

        Ok(Self {
            http_port,
            db_root,
            scheme,
            secret_key,
            session_ttl,
            oauth_redirect_base,
            oauth_clients,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = ServerConfig::from_source(&source(&[])).unwrap();
        assert_eq!(cfg.http_port, 3000);
        assert_eq!(cfg.db_root, "userdb");
        assert_eq!(cfg.scheme, CredentialScheme::Hashed);
        assert_eq!(cfg.session_ttl, Duration::from_secs(3600));
        assert!(cfg.oauth_clients.is_empty());
    }

    #[test]
    fn encrypted_scheme_demands_a_key() {
        let err = ServerConfig::from_source(&source(&[("CONFIDE_CREDENTIAL_SCHEME", "encrypted")])).unwrap_err();
        assert!(err.to_string().contains("CONFIDE_SECRET_KEY"));

        use base64::Engine;
        let key = base64::engine::general_purpose::STANDARD.encode([1u8; 32]);
        let cfg = ServerConfig::from_source(&source(&[
            ("CONFIDE_CREDENTIAL_SCHEME", "encrypted"),
            ("CONFIDE_SECRET_KEY", key.as_str()),
        ]))
        .unwrap();
        assert_eq!(cfg.scheme, CredentialScheme::Encrypted);
        assert!(cfg.secret_key.is_some());
    }

    #[test]
    fn provider_credentials_must_pair() {
        let err = ServerConfig::from_source(&source(&[("CONFIDE_GITHUB_CLIENT_ID", "abc")])).unwrap_err();
        assert!(err.to_string().contains("CONFIDE_GITHUB_CLIENT_SECRET"));

        let cfg = ServerConfig::from_source(&source(&[
            ("CONFIDE_GITHUB_CLIENT_ID", "abc"),
            ("CONFIDE_GITHUB_CLIENT_SECRET", "xyz"),
        ]))
        .unwrap();
        assert_eq!(cfg.oauth_clients.len(), 1);
        assert!(cfg.oauth_clients.contains_key(&Provider::Github));
    }

    #[test]
    fn redirect_base_defaults_to_bound_port() {
        let cfg = ServerConfig::from_source(&source(&[("CONFIDE_HTTP_PORT", "8080")])).unwrap();
        assert_eq!(cfg.oauth_redirect_base, "http://localhost:8080");
    }
}
