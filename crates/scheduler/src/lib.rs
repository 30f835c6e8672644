//! Turn scheduling: who speaks next, and who breaks a silence.
//!
//! [`TurnScheduler`] applies the session's [`SpeakingMode`] to each incoming
//! message. [`FlowLockTimer`] watches for inactivity and, once the cooldown
//! elapses, asks the session to let one participant speak unprompted.
//!
//! [`SpeakingMode`]: conclave_core::session::SpeakingMode

pub mod flow_lock;
pub mod policy;
pub mod scorer;

pub use flow_lock::FlowLockTimer;
pub use policy::TurnScheduler;
pub use scorer::{RelevanceScorer, TagOverlapScorer};
