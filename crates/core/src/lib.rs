//! # Conclave Core
//!
//! Domain types, traits, and error definitions for the conclave multi-agent
//! conversation runtime. Every collaborator the orchestrator talks to (model
//! transport, capability provider, persistence sink) is a trait here, and
//! implementations live in their respective crates.

pub mod error;
pub mod event;
pub mod message;
pub mod participant;
pub mod persistence;
pub mod provider;
pub mod session;
pub mod tool;
pub mod turn;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use event::{DomainEvent, EventBus};
pub use message::{Context, Message, Role};
pub use participant::{
    ModelBinding, NoopStatusTracker, Participant, ParticipantRole, ParticipantStatus,
    StatusTracker,
};
pub use persistence::{
    InMemorySink, JsonlSink, NoopSink, PersistedRecord, PersistenceQueue, PersistenceSink,
};
pub use provider::{CompletionRequest, DeltaSink, Provider};
pub use session::{SessionId, SpeakingMode};
pub use tool::{CapabilityProvider, Tool, ToolCall, ToolDefinition, ToolRegistry, ToolResult};
pub use turn::{ToolCallRecord, ToolCallStatus, Turn, USER_AUTHOR};
