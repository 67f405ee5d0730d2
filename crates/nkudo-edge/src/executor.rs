//! Plan executor.
//!
//! Runs the operations of a leased plan in order, each bounded by a
//! timeout and dispatched to the microVM provider. The persisted action
//! store is the authority for "already done": outcomes are recorded
//! before they are reported, and a re-leased plan short-circuits
//! completed operations to their cached outcomes without re-invoking
//! side effects. Operation failures are independent — the rest of the
//! plan still runs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use nkudo_core::plan::{ExecutionState, OperationType};
use nkudo_core::wire::{ExecutionUpdate, LeasedOperation, LeasedPlan, LogFrame, LogSeverity};

use crate::config::AgentConfig;
use crate::provider::{Provider, ProviderError};
use crate::statestore::{ActionRecord, StateStore};

/// Stable per-operation idempotency key.
#[must_use]
pub fn action_id(plan_id: Uuid, operation_id: &str) -> String {
    format!("{plan_id}:{operation_id}")
}

/// Why an operation failed, with its stable short code.
enum OpError {
    Provider(ProviderError),
    BadInput(String),
    Timeout(u64),
}

impl OpError {
    fn code(&self) -> &'static str {
        match self {
            Self::Provider(e) => e.code(),
            Self::BadInput(_) => "bad_input",
            Self::Timeout(_) => "timeout",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Provider(e) => e.to_string(),
            Self::BadInput(m) => m.clone(),
            Self::Timeout(secs) => format!("operation timed out after {secs}s"),
        }
    }
}

/// Executes leased plans against the provider.
pub struct Executor {
    config: AgentConfig,
    store: Arc<StateStore>,
    provider: Arc<Provider>,
    log_tx: mpsc::Sender<LogFrame>,
    /// Next log sequence per execution (starts at 1).
    log_seq: Mutex<HashMap<Uuid, u64>>,
}

impl Executor {
    #[must_use]
    pub fn new(
        config: AgentConfig,
        store: Arc<StateStore>,
        provider: Arc<Provider>,
        log_tx: mpsc::Sender<LogFrame>,
    ) -> Self {
        Self {
            config,
            store,
            provider,
            log_tx,
            log_seq: Mutex::new(HashMap::new()),
        }
    }

    /// Run every operation of a leased plan, returning one terminal
    /// update per operation for the next heartbeat.
    pub async fn execute_plan(&self, plan: &LeasedPlan) -> Vec<ExecutionUpdate> {
        let mut updates = Vec::with_capacity(plan.operations.len());

        for op in &plan.operations {
            let aid = action_id(plan.plan_id, &op.operation_id);

            // A retriable failure is not "already done" — a re-lease is
            // exactly the retry path for it.
            if let Some(cached) = self
                .cached_outcome(&aid)
                .await
                .filter(|c| c.ok || !is_retriable_code(c.error_code.as_deref()))
            {
                tracing::debug!(
                    action_id = %aid,
                    ok = cached.ok,
                    "operation already terminal, replaying cached outcome"
                );
                self.emit_log(
                    op,
                    LogSeverity::Info,
                    format!("operation '{}' cached, skipping", op.operation_id),
                )
                .await;
                updates.push(update_from_cache(op.execution_id, &cached));
                continue;
            }

            self.emit_log(
                op,
                LogSeverity::Info,
                format!("operation '{}' ({}) started", op.operation_id, op.op_type),
            )
            .await;

            let timeout = match op.op_type {
                OperationType::Create => self.config.create_timeout,
                _ => self.config.operation_timeout,
            };

            let result = match tokio::time::timeout(timeout, self.dispatch(op)).await {
                Ok(inner) => inner,
                Err(_) => Err(OpError::Timeout(timeout.as_secs())),
            };

            let (ok, error_code, error_message) = match &result {
                Ok(()) => (true, None, None),
                Err(e) => (false, Some(e.code().to_owned()), Some(e.message())),
            };

            // The cache is authoritative — record before reporting.
            let record = ActionRecord {
                action_id: aid.clone(),
                execution_id: op.execution_id,
                operation_id: op.operation_id.clone(),
                plan_id: plan.plan_id,
                ok,
                error_code: error_code.clone(),
                message: error_message.clone(),
                finished_at: Utc::now(),
            };
            if let Err(e) = self
                .store
                .mutate(|state| {
                    state.actions.insert(aid.clone(), record.clone());
                })
                .await
            {
                tracing::error!(action_id = %aid, error = %e, "failed to persist action outcome");
            }

            match &result {
                Ok(()) => {
                    self.emit_log(
                        op,
                        LogSeverity::Info,
                        format!("operation '{}' finished", op.operation_id),
                    )
                    .await;
                }
                Err(e) => {
                    self.emit_log(
                        op,
                        LogSeverity::Error,
                        format!("operation '{}' failed: {}", op.operation_id, e.message()),
                    )
                    .await;
                }
            }

            updates.push(ExecutionUpdate {
                execution_id: op.execution_id,
                state: if ok {
                    ExecutionState::Succeeded
                } else {
                    ExecutionState::Failed
                },
                error_code,
                error_message,
            });
        }

        updates
    }

    async fn dispatch(&self, op: &LeasedOperation) -> Result<(), OpError> {
        match op.op_type {
            OperationType::Create => {
                let spec = op
                    .create
                    .as_ref()
                    .ok_or_else(|| OpError::BadInput("create requires a spec".to_owned()))?;
                // A create without an assigned id uses the execution id,
                // so a crashed-and-retried create converges on one VM.
                let vm_id = op.vm_id.unwrap_or(op.execution_id);
                self.provider
                    .create(vm_id, spec)
                    .await
                    .map_err(OpError::Provider)
            }
            OperationType::Start => {
                let vm_id = required_vm(op)?;
                self.provider.start(vm_id).await.map_err(OpError::Provider)
            }
            OperationType::Stop => {
                let vm_id = required_vm(op)?;
                self.provider.stop(vm_id).await.map_err(OpError::Provider)
            }
            OperationType::Delete => {
                let vm_id = required_vm(op)?;
                self.provider.delete(vm_id).await.map_err(OpError::Provider)
            }
        }
    }

    async fn cached_outcome(&self, aid: &str) -> Option<ActionRecord> {
        self.store.snapshot().await.actions.get(aid).cloned()
    }

    async fn emit_log(&self, op: &LeasedOperation, severity: LogSeverity, message: String) {
        let seq = {
            let mut seqs = self.log_seq.lock().await;
            let next = seqs.entry(op.execution_id).or_insert(1);
            let seq = *next;
            *next += 1;
            seq
        };
        let frame = LogFrame {
            execution_id: op.execution_id,
            operation_id: Some(op.operation_id.clone()),
            vm_id: op.vm_id,
            seq,
            severity,
            message,
            emitted_at: Utc::now(),
            eof: false,
        };
        // Log streaming must never block execution; a full channel
        // just loses the frame.
        if self.log_tx.try_send(frame).is_err() {
            tracing::debug!(execution_id = %op.execution_id, "log channel full, frame dropped");
        }
    }
}

fn is_retriable_code(code: Option<&str>) -> bool {
    matches!(code, Some("unavailable" | "timeout"))
}

fn required_vm(op: &LeasedOperation) -> Result<Uuid, OpError> {
    op.vm_id
        .ok_or_else(|| OpError::BadInput(format!("{} requires vm_id", op.op_type)))
}

fn update_from_cache(execution_id: Uuid, cached: &ActionRecord) -> ExecutionUpdate {
    ExecutionUpdate {
        execution_id,
        state: if cached.ok {
            ExecutionState::Succeeded
        } else {
            ExecutionState::Failed
        },
        error_code: cached.error_code.clone(),
        error_message: cached.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::provider::hypervisor::HypervisorKind;
    use std::path::Path;
    use std::time::Duration;

    fn harness(root: &Path) -> (Executor, Arc<StateStore>, mpsc::Receiver<LogFrame>) {
        let store = Arc::new(StateStore::open(&root.join("state.json"), None).unwrap());
        let config = AgentConfig {
            control_plane_url: "http://127.0.0.1:1".to_owned(),
            data_dir: root.to_owned(),
            state_key: None,
            hypervisor: HypervisorKind::CloudHypervisor,
            hypervisor_binary: None,
            bridge: "nkbr0".to_owned(),
            base_image: root.join("missing.img"),
            kernel_image: None,
            http_timeout: Duration::from_secs(1),
            rotation_check_interval: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(5),
            create_timeout: Duration::from_secs(5),
        };
        let provider = Arc::new(Provider::new(config.clone(), Arc::clone(&store)));
        let (tx, rx) = mpsc::channel(64);
        (
            Executor::new(config, Arc::clone(&store), provider, tx),
            store,
            rx,
        )
    }

    fn leased(plan_id: Uuid, ops: Vec<LeasedOperation>) -> LeasedPlan {
        LeasedPlan {
            plan_id,
            plan_version: 1,
            lease_expires_at: Utc::now() + chrono::Duration::seconds(45),
            operations: ops,
        }
    }

    fn start_op(id: &str, vm_id: Uuid) -> LeasedOperation {
        LeasedOperation {
            execution_id: Uuid::new_v4(),
            operation_id: id.to_owned(),
            op_type: OperationType::Start,
            vm_id: Some(vm_id),
            create: None,
        }
    }

    #[tokio::test]
    async fn failed_operation_does_not_stop_the_plan() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _store, _rx) = harness(dir.path());
        let plan_id = Uuid::new_v4();

        // Start of an unknown VM fails; delete of an unknown VM is an
        // idempotent success. Both must report.
        let plan = leased(
            plan_id,
            vec![
                start_op("o1", Uuid::new_v4()),
                LeasedOperation {
                    execution_id: Uuid::new_v4(),
                    operation_id: "o2".to_owned(),
                    op_type: OperationType::Delete,
                    vm_id: Some(Uuid::new_v4()),
                    create: None,
                },
            ],
        );

        let updates = executor.execute_plan(&plan).await;
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].state, ExecutionState::Failed);
        assert_eq!(updates[0].error_code.as_deref(), Some("not_found"));
        assert_eq!(updates[1].state, ExecutionState::Succeeded);
    }

    #[tokio::test]
    async fn outcomes_are_recorded_before_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, store, _rx) = harness(dir.path());
        let plan_id = Uuid::new_v4();
        let plan = leased(plan_id, vec![start_op("o1", Uuid::new_v4())]);

        executor.execute_plan(&plan).await;

        let snapshot = store.snapshot().await;
        let record = &snapshot.actions[&action_id(plan_id, "o1")];
        assert!(!record.ok);
        assert_eq!(record.error_code.as_deref(), Some("not_found"));
    }

    #[tokio::test]
    async fn reexecution_replays_cached_outcomes_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, store, _rx) = harness(dir.path());
        let plan_id = Uuid::new_v4();

        let op = start_op("o1", Uuid::new_v4());
        let execution_id = op.execution_id;

        // Simulate a prior run that succeeded (even though the provider
        // would fail now) — the cache must win.
        store
            .mutate(|s| {
                s.actions.insert(
                    action_id(plan_id, "o1"),
                    ActionRecord {
                        action_id: action_id(plan_id, "o1"),
                        execution_id,
                        operation_id: "o1".to_owned(),
                        plan_id,
                        ok: true,
                        error_code: None,
                        message: None,
                        finished_at: Utc::now(),
                    },
                );
            })
            .await
            .unwrap();

        let updates = executor.execute_plan(&leased(plan_id, vec![op])).await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].state, ExecutionState::Succeeded);
        assert!(updates[0].error_code.is_none());
    }

    #[tokio::test]
    async fn lifecycle_log_frames_have_increasing_seq() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _store, mut rx) = harness(dir.path());
        let plan_id = Uuid::new_v4();

        let op = LeasedOperation {
            execution_id: Uuid::new_v4(),
            operation_id: "o1".to_owned(),
            op_type: OperationType::Delete,
            vm_id: Some(Uuid::new_v4()),
            create: None,
        };
        let execution_id = op.execution_id;
        executor.execute_plan(&leased(plan_id, vec![op])).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.execution_id, execution_id);
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert!(second.message.contains("finished"));
    }

    #[tokio::test]
    async fn cached_retriable_failure_is_retried_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, store, _rx) = harness(dir.path());
        let plan_id = Uuid::new_v4();

        // A prior attempt failed with a retriable code; the delete now
        // succeeds, so the new outcome must replace the cached one.
        let op = LeasedOperation {
            execution_id: Uuid::new_v4(),
            operation_id: "o1".to_owned(),
            op_type: OperationType::Delete,
            vm_id: Some(Uuid::new_v4()),
            create: None,
        };
        store
            .mutate(|s| {
                s.actions.insert(
                    action_id(plan_id, "o1"),
                    ActionRecord {
                        action_id: action_id(plan_id, "o1"),
                        execution_id: op.execution_id,
                        operation_id: "o1".to_owned(),
                        plan_id,
                        ok: false,
                        error_code: Some("unavailable".to_owned()),
                        message: Some("bridge was down".to_owned()),
                        finished_at: Utc::now(),
                    },
                );
            })
            .await
            .unwrap();

        let updates = executor.execute_plan(&leased(plan_id, vec![op])).await;
        assert_eq!(updates[0].state, ExecutionState::Succeeded);
        assert!(store.snapshot().await.actions[&action_id(plan_id, "o1")].ok);
    }

    #[tokio::test]
    async fn create_without_spec_is_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _store, _rx) = harness(dir.path());
        let plan = leased(
            Uuid::new_v4(),
            vec![LeasedOperation {
                execution_id: Uuid::new_v4(),
                operation_id: "o1".to_owned(),
                op_type: OperationType::Create,
                vm_id: None,
                create: None,
            }],
        );

        let updates = executor.execute_plan(&plan).await;
        assert_eq!(updates[0].state, ExecutionState::Failed);
        assert_eq!(updates[0].error_code.as_deref(), Some("bad_input"));
    }
}
