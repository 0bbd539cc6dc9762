//! Domain-level error taxonomy for RAZAR.

use razar_state::StorageError;

/// RAZAR domain errors.
///
/// Configuration and credential errors are never retried. Launch, agent
/// request and patch validation failures feed the retry and escalation path.
/// Crown transport failures have their own [`crate::HandshakeError`].
#[derive(Debug, thiserror::Error)]
pub enum RazarError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("launch of {component} failed: {reason}")]
    LaunchFailure { component: String, reason: String },

    #[error("agent {agent} has no usable credential: {reason}")]
    AgentCredential { agent: String, reason: String },

    #[error("patch for {module} rejected: {reason}")]
    PatchValidation { module: String, reason: String },

    #[error("quarantine state error for {component}: {reason}")]
    QuarantineState { component: String, reason: String },

    #[error("illegal transition for {component}: {from} -> {to}")]
    IllegalTransition {
        component: String,
        from: String,
        to: String,
    },

    #[error("agent {agent} request failed: {reason}")]
    AgentRequest { agent: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RazarError {
    /// Whether retrying the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RazarError::LaunchFailure { .. }
                | RazarError::PatchValidation { .. }
                | RazarError::AgentRequest { .. }
        )
    }
}

/// Result type for RAZAR domain operations.
pub type Result<T> = std::result::Result<T, RazarError>;
