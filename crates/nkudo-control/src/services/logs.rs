//! Log ingest — bounded acceptance of ordered execution log frames.
//!
//! Per execution the repository tracks a high-water `seq`; a frame is
//! accepted iff its sequence is strictly greater, otherwise it is
//! dropped and counted. Accepted frames buffer up to the flush
//! threshold before a bulk write; the tail flushes at batch close.
//! Frames for executions outside the caller's tenant never match the
//! guarded update and are dropped the same way.

use nkudo_core::wire::{
    LogBatchRequest, LogIngestResponse, LOG_FLUSH_THRESHOLD, MAX_LOG_MESSAGE_BYTES,
};

use crate::auth::AgentIdentity;
use crate::error::ApiError;
use crate::repository::{self, AcceptedFrame};
use crate::state::AppState;

/// Ingest a batch of frames from an authenticated agent.
///
/// # Errors
///
/// `unavailable` on storage failure; ordering and ownership violations
/// are counted, not surfaced as errors.
pub async fn ingest(
    state: &AppState,
    identity: &AgentIdentity,
    batch: &LogBatchRequest,
) -> Result<LogIngestResponse, ApiError> {
    let tenant_id = identity.agent.tenant_id;
    let mut accepted: u64 = 0;
    let mut dropped: u64 = 0;
    let mut buffer: Vec<AcceptedFrame> = Vec::new();

    let mut tx = state.pool.begin().await.map_err(ApiError::from)?;

    for frame in &batch.frames {
        let Ok(seq) = i64::try_from(frame.seq) else {
            dropped = dropped.saturating_add(1);
            continue;
        };

        let advanced =
            repository::try_advance_log_seq(&mut tx, tenant_id, frame.execution_id, seq)
                .await?;
        if !advanced {
            dropped = dropped.saturating_add(1);
            continue;
        }

        accepted = accepted.saturating_add(1);
        buffer.push(AcceptedFrame {
            execution_id: frame.execution_id,
            operation_id: frame.operation_id.clone(),
            vm_id: frame.vm_id,
            seq,
            severity: frame.severity.to_string(),
            message: truncate_message(&frame.message),
            emitted_at: frame.emitted_at,
        });

        if buffer.len() >= LOG_FLUSH_THRESHOLD {
            repository::insert_log_frames(&mut tx, tenant_id, &buffer).await?;
            buffer.clear();
        }
    }

    if !buffer.is_empty() {
        repository::insert_log_frames(&mut tx, tenant_id, &buffer).await?;
    }

    tx.commit().await.map_err(ApiError::from)?;

    if dropped > 0 {
        tracing::debug!(
            agent_id = %identity.agent.id,
            accepted,
            dropped,
            "log batch ingested with drops"
        );
    }

    Ok(LogIngestResponse { accepted, dropped })
}

/// Truncate at the ingest cap on a UTF-8 boundary.
fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_LOG_MESSAGE_BYTES {
        return message.to_owned();
    }
    let mut end = MAX_LOG_MESSAGE_BYTES;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let short = "hello";
        assert_eq!(truncate_message(short), "hello");

        let long = "a".repeat(MAX_LOG_MESSAGE_BYTES + 100);
        assert_eq!(truncate_message(&long).len(), MAX_LOG_MESSAGE_BYTES);

        // Multibyte char straddling the cap is dropped whole.
        let mut tricky = "a".repeat(MAX_LOG_MESSAGE_BYTES - 1);
        tricky.push('€');
        let out = truncate_message(&tricky);
        assert!(out.len() < MAX_LOG_MESSAGE_BYTES);
        assert!(out.chars().all(|c| c == 'a'));
    }
}
