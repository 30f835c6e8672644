//! The participant side of a conversation.
//!
//! An [`AgentLoop`] turns one participant's model binding into a reply:
//!
//! 1. **Stream** a completion for the current context
//! 2. **If the reply asks for tools**: fan them out, append results, go to 1
//! 3. **Otherwise**: the reply is final
//!
//! Everything a participant says while generating goes through the
//! session's [`StreamMultiplexer`], which throttles rendering and brackets
//! each turn with `thinking` and `complete` notifications.

pub mod loop_runner;
pub mod stream;
pub mod stream_event;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use loop_runner::{AgentLoop, DEFAULT_MAX_ITERATIONS, DEFAULT_MODEL_TIMEOUT};
pub use stream::{DEFAULT_THROTTLE, StreamMultiplexer, StreamObserver, Subscription};
pub use stream_event::{StreamEvent, StreamPhase};
