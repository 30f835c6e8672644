//! ToolInvocationRunner — concurrent fan-out of a batch of tool calls.
//!
//! Every call runs in its own task, its duration is measured, its outcome
//! is normalized into a [`ToolCallRecord`] and audited. Outcomes come back
//! in request order no matter which call settles first, and one failing
//! call never aborts its siblings.

use conclave_core::tool::{CapabilityProvider, ToolCall, ToolDefinition};
use conclave_core::turn::ToolCallRecord;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::AuditLog;

/// Who asked for a batch, and the token that discards it.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub session_id: String,
    pub participant_id: String,
    pub cancel: CancellationToken,
}

impl InvocationContext {
    pub fn new(
        session_id: impl Into<String>,
        participant_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            cancel,
        }
    }
}

pub struct ToolInvocationRunner {
    capabilities: Arc<dyn CapabilityProvider>,
    audit: Arc<AuditLog>,
}

impl ToolInvocationRunner {
    pub fn new(capabilities: Arc<dyn CapabilityProvider>, audit: Arc<AuditLog>) -> Self {
        Self {
            capabilities,
            audit,
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Capabilities advertised to participants.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.capabilities.definitions()
    }

    /// Run every call concurrently and wait for all of them to settle.
    ///
    /// Returns exactly one record per call, in input order.
    pub async fn invoke_all(
        &self,
        calls: Vec<ToolCall>,
        ctx: &InvocationContext,
    ) -> Vec<ToolCallRecord> {
        if calls.is_empty() {
            return Vec::new();
        }

        debug!(
            session_id = %ctx.session_id,
            participant_id = %ctx.participant_id,
            count = calls.len(),
            "Fanning out tool calls"
        );

        let mut placeholders = Vec::with_capacity(calls.len());
        let mut handles = Vec::with_capacity(calls.len());
        for call in calls {
            placeholders.push(ToolCallRecord::pending(&call));
            let capabilities = Arc::clone(&self.capabilities);
            let audit = Arc::clone(&self.audit);
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                invoke_one(capabilities.as_ref(), &audit, call, &ctx).await
            }));
        }

        join_all(handles)
            .await
            .into_iter()
            .zip(placeholders)
            .map(|(joined, mut placeholder)| match joined {
                Ok(record) => record,
                Err(e) => {
                    warn!(tool = %placeholder.tool_name, error = %e, "Tool task did not complete");
                    placeholder.fail(format!("tool task aborted: {e}"), 0);
                    self.audit.record(&ctx.session_id, &ctx.participant_id, &placeholder);
                    placeholder
                }
            })
            .collect()
    }
}

async fn invoke_one(
    capabilities: &dyn CapabilityProvider,
    audit: &AuditLog,
    call: ToolCall,
    ctx: &InvocationContext,
) -> ToolCallRecord {
    let mut record = ToolCallRecord::pending(&call);
    record.mark_running();

    let start = Instant::now();
    let outcome = capabilities
        .execute(&call.name, call.arguments, &ctx.cancel)
        .await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(result) if result.success => {
            let output = match (result.output, result.data) {
                (Some(output), _) => output,
                (None, Some(data)) => data.to_string(),
                (None, None) => String::new(),
            };
            record.succeed(output, duration_ms);
        }
        Ok(result) => {
            let error = result
                .error
                .unwrap_or_else(|| format!("{} reported a failure without details", call.name));
            record.fail(error, duration_ms);
        }
        Err(e) => {
            record.fail(e.to_string(), duration_ms);
        }
    }

    debug!(
        tool = %record.tool_name,
        success = record.is_success(),
        duration_ms,
        "Tool call settled"
    );
    audit.record(&ctx.session_id, &ctx.participant_id, &record);
    record
}
