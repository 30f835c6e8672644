//! Error types for the conclave domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all conclave operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider (transport) errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Persistence errors ---
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A run was cancelled on purpose. Never reported as a failure.
    #[error("Operation cancelled")]
    Cancelled,

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a deliberate cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::Cancelled
                | Error::Provider(ProviderError::Cancelled)
                | Error::Tool(ToolError::Cancelled { .. })
        )
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the model transport.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Network error: {0}")]
    Network(String),

    /// The stream was aborted because its cancellation token fired.
    #[error("Completion cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Unknown tool: {name}. Available tools: {available}")]
    NotFound { name: String, available: String },

    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool cancelled: {tool_name}")]
    Cancelled { tool_name: String },
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session has ended: {0}")]
    Ended(String),

    #[error("Unknown participant '{participant_id}' in session {session_id}")]
    UnknownParticipant {
        session_id: String,
        participant_id: String,
    },

    #[error("Participant '{0}' is already generating")]
    ParticipantBusy(String),

    #[error("Invalid status transition for '{participant_id}': {from} -> {to}")]
    InvalidTransition {
        participant_id: String,
        from: String,
        to: String,
    },

    #[error("Duplicate participant id: {0}")]
    DuplicateParticipant(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
