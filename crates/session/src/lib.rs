//! Sessions: where participants, history, scheduling and streaming meet.
//!
//! A [`SessionRegistry`] is the entry point. It creates and destroys
//! sessions, routes user messages and invitations to them, and exposes
//! their history, roster and live stream.
//!
//! ```text
//! post_user_message ─► TurnScheduler::select_next ─► AgentLoop per speaker
//!                                                      │
//!                   history ◄── append_turn ◄──────────┘
//! ```

pub mod context;
pub mod registry;
pub mod roster;
pub mod session;

pub use context::ContextBuilder;
pub use registry::{SessionRegistry, SessionSummary};
pub use roster::Roster;
pub use session::{Dispatch, Session, SessionOptions};
