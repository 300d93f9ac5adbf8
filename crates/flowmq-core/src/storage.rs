// Storage port
//
// `StateStore` is the driver contract: append-only state-log and history
// operations, plus the queries the correlator gates on. `Storage` wraps a
// driver and stamps progress details onto the flow before every state-log
// append, so drivers persist documents verbatim.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::Result;
use crate::flow::{Flow, ProgressStatus};
use crate::history::{HistoryEntry, HistoryRecord};

/// Driver contract for the durable state log and history
///
/// Implementations can:
/// - Persist to a database for production
/// - Keep rows in memory for tests and examples
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Most recent state-log row for `(flow_id, step_id)`, or `None` when
    /// there is nothing to resume.
    async fn get_resumable_step(&self, flow_id: Uuid, step_id: Uuid) -> Result<Option<Flow>>;

    /// Append a state-log row for `(flow_id, step_id, status)` only if none
    /// exists for that triple. Must stay idempotent under concurrent
    /// duplicate deliveries. The stored row is a deep clone with a fresh
    /// branch id and the given routing key stamped on.
    async fn create_state_log_if_not_exist(
        &self,
        flow: &Flow,
        routing_key: &str,
        status: ProgressStatus,
    ) -> Result<()>;

    /// Append a state-log row unconditionally. The flow's progress has
    /// already been stamped by the caller.
    async fn create_state_log(&self, flow: &Flow) -> Result<()>;

    /// Append a business history row.
    async fn store_history_entry(&self, entry: &HistoryEntry) -> Result<()>;

    /// For every chain token: collect state-log rows of this flow whose
    /// step id differs from `step_id` and whose correlation chain contains
    /// the token, keep the newest row per step id, and require every kept
    /// status to be `success` or `dropped`. A token with no matching rows
    /// is not successful; the answer is the AND across tokens.
    async fn is_chains_successful(
        &self,
        flow_id: Uuid,
        step_id: Uuid,
        chain: &[String],
    ) -> Result<bool>;

    /// True iff the newest history row for the flow carries the
    /// `shutdowned` state. No rows means not shut down.
    async fn is_flow_shutdown(&self, flow_id: Uuid) -> Result<bool>;

    /// Append the `shutdowned` history row that makes `is_flow_shutdown`
    /// start answering true.
    async fn store_shutdown_entry(&self, flow_id: Uuid, workflow_name: &str) -> Result<()>;
}

/// Storage facade used by the engine
///
/// Owns the progress stamping the state-log contract requires: status and
/// routing key on every append, end date and duration on terminal ones.
#[derive(Clone)]
pub struct Storage {
    store: Arc<dyn StateStore>,
}

impl Storage {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn get_resumable_step(&self, flow_id: Uuid, step_id: Uuid) -> Result<Option<Flow>> {
        self.store.get_resumable_step(flow_id, step_id).await
    }

    pub async fn create_state_log_if_not_exist(
        &self,
        flow: &Flow,
        routing_key: &str,
        status: ProgressStatus,
    ) -> Result<()> {
        self.store
            .create_state_log_if_not_exist(flow, routing_key, status)
            .await
    }

    /// Stamp the transition onto the flow, then append it.
    pub async fn create_state_log(
        &self,
        flow: &mut Flow,
        routing_key: &str,
        status: ProgressStatus,
    ) -> Result<()> {
        flow.progress.status = status;
        flow.progress.routing_key = routing_key.to_string();
        if status.is_terminal() {
            let end = Utc::now();
            let start = flow.progress.start_date.unwrap_or(flow.progress.create_date);
            let elapsed = end - start;
            flow.progress.end_date = Some(end);
            flow.progress.duration = elapsed.num_nanoseconds().unwrap_or(i64::MAX);
            flow.progress.duration_str = elapsed
                .to_std()
                .map(|d| format!("{d:?}"))
                .unwrap_or_default();
        }

        self.store.create_state_log(flow).await
    }

    pub async fn store_history_entry(&self, flow: &Flow, record: &HistoryRecord) -> Result<()> {
        self.store
            .store_history_entry(&HistoryEntry::started(flow, record))
            .await
    }

    pub async fn is_chains_successful(&self, flow: &Flow, chain: &[String]) -> Result<bool> {
        self.store
            .is_chains_successful(flow.flow_id, flow.step_id, chain)
            .await
    }

    pub async fn is_flow_shutdown(&self, flow: &Flow) -> Result<bool> {
        self.store.is_flow_shutdown(flow.flow_id).await
    }

    pub async fn store_shutdown_entry(&self, flow_id: Uuid, workflow_name: &str) -> Result<()> {
        self.store.store_shutdown_entry(flow_id, workflow_name).await
    }
}
