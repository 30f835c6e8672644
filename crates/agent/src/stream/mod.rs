//! Streaming output plumbing: the per-session multiplexer and its throttle.

pub mod multiplexer;
pub mod throttle;

pub use multiplexer::{DEFAULT_THROTTLE, StreamMultiplexer, StreamObserver, Subscription};
pub use throttle::{Throttle, ThrottleDecision};
