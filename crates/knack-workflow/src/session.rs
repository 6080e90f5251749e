//! Resolving the acting user.
//!
//! Triggering a workflow requires knowing who is asking, both for the
//! visibility check and for the run record. The chat surface supplies
//! its own notion of identity through [`SessionProvider`].

use knack_types::UserId;

pub trait SessionProvider: Send + Sync {
    /// The user on whose behalf workflows run, or `None` when no
    /// identity is established.
    fn current_user(&self) -> Option<UserId>;
}

/// Reads the acting user from an environment variable.
pub struct EnvSession {
    var: String,
}

impl EnvSession {
    pub const DEFAULT_VAR: &'static str = "KNACK_USER";

    pub fn new() -> Self {
        Self::from_var(Self::DEFAULT_VAR)
    }

    pub fn from_var(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionProvider for EnvSession {
    fn current_user(&self) -> Option<UserId> {
        std::env::var(&self.var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(UserId::new)
    }
}

/// A fixed identity, for explicit `--user` overrides and tests.
pub struct StaticSession(pub UserId);

impl SessionProvider for StaticSession {
    fn current_user(&self) -> Option<UserId> {
        Some(self.0.clone())
    }
}
