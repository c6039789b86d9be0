//! Server identity shared by all backup runs
//!
//! The identity and token used to be process-wide globals in older designs;
//! here they are an explicit value handed to the orchestrator.

/// Identity the server presents to agents, plus the token agents must echo
#[derive(Debug, Clone)]
pub struct ServerContext {
    /// Stable identity string for this server installation
    pub server_identity: String,
    /// Shared secret agents use to authorise metadata access
    pub server_token: String,
}

impl ServerContext {
    /// Create a new context
    #[must_use]
    pub fn new(server_identity: impl Into<String>, server_token: impl Into<String>) -> Self {
        Self {
            server_identity: server_identity.into(),
            server_token: server_token.into(),
        }
    }
}
