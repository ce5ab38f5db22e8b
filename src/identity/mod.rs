//! Central identity and session management for unified login across confide.
//! Keep the public surface thin and split implementation across sub-modules.

mod federation;
mod principal;
mod provider;
mod session;

pub use federation::{build_adapters, FederationAdapter};
pub use principal::{Attrs, Principal};
pub use provider::{AuthProvider, LocalAuthProvider, LoginRequest, LoginResponse};
pub use session::{Session, SessionManager, SessionToken};
