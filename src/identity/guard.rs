//! Access policies attached to operations.
//!
//! Each externally callable operation carries an `OperationGuard`: a name plus an
//! ordered list of `Policy` values. The list is validated when the guard is built,
//! so a role check can never exist without an authentication check in front of
//! it. Guards declared as `const` fail to compile if the list is malformed; guards
//! built at runtime go through `OperationGuard::try_new`.
//!
//! Evaluation is pure control flow: no I/O, and the wrapped operation is never
//! entered when a policy fails.

use std::future::Future;
use thiserror::Error;
use tracing::debug;

use super::principal::{Identity, Role};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// An identity must be present.
    Authenticated,
    /// The identity's role must equal the given role. Only valid after `Authenticated`.
    HasRole(Role),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PolicyError {
    #[error("role policy at position {0} is not preceded by an authentication policy")]
    RoleWithoutAuthentication(usize),
}

const fn validate(policies: &[Policy]) -> Result<(), PolicyError> {
    let mut authenticated = false;
    let mut i = 0;
    while i < policies.len() {
        match policies[i] {
            Policy::Authenticated => authenticated = true,
            Policy::HasRole(_) => {
                if !authenticated {
                    return Err(PolicyError::RoleWithoutAuthentication(i));
                }
            }
        }
        i += 1;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationGuard {
    name: &'static str,
    policies: &'static [Policy],
}

impl OperationGuard {
    /// Compile-time constructor; panics (a compile error in `const` context) on a
    /// role policy with no authentication before it.
    pub const fn new(name: &'static str, policies: &'static [Policy]) -> Self {
        match validate(policies) {
            Ok(()) => Self { name, policies },
            Err(_) => panic!("role policy must be preceded by an authentication policy"),
        }
    }

    pub fn try_new(name: &'static str, policies: &'static [Policy]) -> Result<Self, PolicyError> {
        validate(policies)?;
        Ok(Self { name, policies })
    }

    pub const fn public(name: &'static str) -> Self { Self { name, policies: &[] } }

    pub const fn authenticated(name: &'static str) -> Self {
        Self { name, policies: &[Policy::Authenticated] }
    }

    pub fn name(&self) -> &'static str { self.name }

    pub fn policies(&self) -> &'static [Policy] { self.policies }

    pub fn requires_authentication(&self) -> bool { self.policies.contains(&Policy::Authenticated) }

    /// Evaluate every policy in order against the request identity.
    pub fn check<'a>(&self, identity: Option<&'a Identity>) -> AppResult<Option<&'a Identity>> {
        for policy in self.policies {
            match policy {
                Policy::Authenticated => {
                    if identity.is_none() {
                        debug!(op = self.name, "rejected: unauthenticated");
                        return Err(AppError::unauthenticated(format!("{} requires authentication", self.name)));
                    }
                }
                Policy::HasRole(role) => {
                    // validated: an Authenticated policy already ran
                    let Some(id) = identity else {
                        return Err(AppError::unauthenticated(format!("{} requires authentication", self.name)));
                    };
                    if id.role != *role {
                        debug!(op = self.name, user = %id.id, required = %role, actual = %id.role, "rejected: forbidden");
                        return Err(AppError::forbidden(format!("{} requires role {}", self.name, role)));
                    }
                }
            }
        }
        Ok(identity)
    }

    /// `check`, then hand back the identity itself. Used by operations whose body
    /// needs the caller; a public guard with no identity yields `Unauthenticated`.
    pub fn require<'a>(&self, identity: Option<&'a Identity>) -> AppResult<&'a Identity> {
        self.check(identity)?
            .ok_or_else(|| AppError::unauthenticated(format!("{} requires authentication", self.name)))
    }

    /// Run `op` behind this guard. `op` is not invoked when a policy fails.
    pub async fn run<'a, T, F, Fut>(&self, identity: Option<&'a Identity>, op: F) -> AppResult<T>
    where
        F: FnOnce(Option<&'a Identity>) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let identity = self.check(identity)?;
        op(identity).await
    }
}
