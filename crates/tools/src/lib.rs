//! Tool invocation for conclave.
//!
//! Participants request capabilities with text directives; the runner fans
//! the requested calls out concurrently, audits every outcome, and hands
//! the records back in request order. External programs plug in as tools
//! over a JSON stdio protocol.

pub mod audit;
pub mod directive;
pub mod plugin;
pub mod runner;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use audit::{AuditEntry, AuditLog, AuditOutcome, AuditSink, TracingAuditSink};
pub use directive::{MalformedDirective, ParsedDirectives};
pub use plugin::{StdioPluginTool, registry_from_plugins};
pub use runner::{InvocationContext, ToolInvocationRunner};
