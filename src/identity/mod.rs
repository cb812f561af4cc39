//! Caller identity, sessions and access policies.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod password;
mod request_context;
mod guard;

pub use principal::{Identity, Role};
pub use session::{CredentialIssuer, Session, SessionManager, SessionToken};
pub use password::{hash_password, verify_password};
pub use request_context::{AuthContext, RequestContext};
pub use guard::{OperationGuard, Policy, PolicyError};
