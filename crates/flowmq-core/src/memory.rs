// In-memory implementations for examples and testing
//
// These keep all rows in memory and reproduce the exact query semantics the
// durable drivers provide, so the acceptance suite can observe every state
// transition without external services. Fault-injection switches stand in
// for storage and bus outages.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::bus::{BusDriver, DeliveryHandler};
use crate::error::{BusError, Result, WorkflowError};
use crate::flow::{Flow, ProgressStatus};
use crate::history::{FlowState, HistoryEntry};
use crate::report::Reporter;
use crate::storage::StateStore;

// ============================================================================
// InMemoryStateStore - state log and history in two vectors
// ============================================================================

/// One state-log row: a whole-flow snapshot in insertion order
#[derive(Debug, Clone)]
pub struct StateLogRow {
    pub seq: u64,
    pub flow: Flow,
}

/// One history row
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub seq: u64,
    pub entry: HistoryEntry,
}

/// In-memory state store with the same observable semantics as the
/// Postgres driver
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    seq: AtomicU64,
    state_log: RwLock<Vec<StateLogRow>>,
    history: RwLock<Vec<HistoryRow>>,
    state_log_error: StdMutex<Option<String>>,
    if_not_exist_error: StdMutex<Option<String>>,
    shutdown_error: StdMutex<Option<String>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// All state-log rows in insertion order.
    pub async fn state_log(&self) -> Vec<StateLogRow> {
        self.state_log.read().await.clone()
    }

    /// `(status, routing_key)` of every state-log row in insertion order -
    /// the shape most assertions want.
    pub async fn transitions(&self) -> Vec<(ProgressStatus, String)> {
        self.state_log
            .read()
            .await
            .iter()
            .map(|row| (row.flow.progress.status, row.flow.progress.routing_key.clone()))
            .collect()
    }

    /// All history entries in insertion order.
    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.history
            .read()
            .await
            .iter()
            .map(|row| row.entry.clone())
            .collect()
    }

    /// Make every `create_state_log` call fail until cleared.
    pub fn inject_state_log_error(&self, message: impl Into<String>) {
        *self.state_log_error.lock().unwrap() = Some(message.into());
    }

    pub fn clear_state_log_error(&self) {
        *self.state_log_error.lock().unwrap() = None;
    }

    /// Make every `create_state_log_if_not_exist` call fail until cleared.
    pub fn inject_if_not_exist_error(&self, message: impl Into<String>) {
        *self.if_not_exist_error.lock().unwrap() = Some(message.into());
    }

    /// Make every `is_flow_shutdown` call fail until cleared.
    pub fn inject_shutdown_error(&self, message: impl Into<String>) {
        *self.shutdown_error.lock().unwrap() = Some(message.into());
    }

    fn injected(&self, slot: &StdMutex<Option<String>>) -> Option<WorkflowError> {
        slot.lock().unwrap().as_deref().map(WorkflowError::storage)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_resumable_step(&self, flow_id: Uuid, step_id: Uuid) -> Result<Option<Flow>> {
        let rows = self.state_log.read().await;
        Ok(rows
            .iter()
            .filter(|row| row.flow.flow_id == flow_id && row.flow.step_id == step_id)
            .max_by_key(|row| row.seq)
            .map(|row| row.flow.clone()))
    }

    async fn create_state_log_if_not_exist(
        &self,
        flow: &Flow,
        routing_key: &str,
        status: ProgressStatus,
    ) -> Result<()> {
        if let Some(err) = self.injected(&self.if_not_exist_error) {
            return Err(err);
        }

        // The whole check-then-insert happens under the write lock, which
        // is what keeps duplicate deliveries down to one row.
        let mut rows = self.state_log.write().await;
        let exists = rows.iter().any(|row| {
            row.flow.flow_id == flow.flow_id
                && row.flow.step_id == flow.step_id
                && row.flow.progress.status == status
        });
        if !exists {
            let mut clone = flow.deep_copy();
            clone.assign_branch_id();
            clone.progress.status = status;
            clone.progress.routing_key = routing_key.to_string();
            rows.push(StateLogRow {
                seq: self.next_seq(),
                flow: clone,
            });
        }
        Ok(())
    }

    async fn create_state_log(&self, flow: &Flow) -> Result<()> {
        if let Some(err) = self.injected(&self.state_log_error) {
            return Err(err);
        }

        self.state_log.write().await.push(StateLogRow {
            seq: self.next_seq(),
            flow: flow.clone(),
        });
        Ok(())
    }

    async fn store_history_entry(&self, entry: &HistoryEntry) -> Result<()> {
        self.history.write().await.push(HistoryRow {
            seq: self.next_seq(),
            entry: entry.clone(),
        });
        Ok(())
    }

    async fn is_chains_successful(
        &self,
        flow_id: Uuid,
        step_id: Uuid,
        chain: &[String],
    ) -> Result<bool> {
        if chain.is_empty() {
            return Ok(false);
        }

        let rows = self.state_log.read().await;
        for token in chain {
            let mut newest_per_step: HashMap<Uuid, (u64, ProgressStatus)> = HashMap::new();
            for row in rows.iter() {
                if row.flow.flow_id != flow_id
                    || row.flow.step_id == step_id
                    || !row.flow.correlation_chain.contains(token)
                {
                    continue;
                }
                let entry = newest_per_step
                    .entry(row.flow.step_id)
                    .or_insert((row.seq, row.flow.progress.status));
                if row.seq >= entry.0 {
                    *entry = (row.seq, row.flow.progress.status);
                }
            }

            if newest_per_step.is_empty() {
                return Ok(false);
            }
            let all_settled = newest_per_step.values().all(|(_, status)| {
                matches!(status, ProgressStatus::Success | ProgressStatus::Dropped)
            });
            if !all_settled {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn is_flow_shutdown(&self, flow_id: Uuid) -> Result<bool> {
        if let Some(err) = self.injected(&self.shutdown_error) {
            return Err(err);
        }

        let rows = self.history.read().await;
        Ok(rows
            .iter()
            .filter(|row| row.entry.flow_id == flow_id)
            .max_by_key(|row| row.seq)
            .map(|row| row.entry.state == FlowState::Shutdowned)
            .unwrap_or(false))
    }

    async fn store_shutdown_entry(&self, flow_id: Uuid, workflow_name: &str) -> Result<()> {
        self.history.write().await.push(HistoryRow {
            seq: self.next_seq(),
            entry: HistoryEntry::shutdowned(flow_id, workflow_name),
        });
        Ok(())
    }
}

// ============================================================================
// InMemoryBus - records publishes, replays an inbox
// ============================================================================

/// In-memory bus driver
///
/// `push`/`unsafe_push` record into a publish log; `consume` drains bodies
/// previously queued with `enqueue`, which is enough to exercise the whole
/// consume loop without a broker.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    published: RwLock<Vec<(String, Vec<u8>)>>,
    inbox: Mutex<VecDeque<Vec<u8>>>,
    push_error: StdMutex<Option<String>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a body for the next `consume` call.
    pub async fn enqueue(&self, body: Vec<u8>) {
        self.inbox.lock().await.push_back(body);
    }

    /// Every `(routing_key, payload)` published so far, in order.
    pub async fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.read().await.clone()
    }

    /// Just the routing keys, in publish order.
    pub async fn published_keys(&self) -> Vec<String> {
        self.published
            .read()
            .await
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Make every `push` call fail until cleared.
    pub fn inject_push_error(&self, message: impl Into<String>) {
        *self.push_error.lock().unwrap() = Some(message.into());
    }

    pub fn clear_push_error(&self) {
        *self.push_error.lock().unwrap() = None;
    }
}

#[async_trait]
impl BusDriver for InMemoryBus {
    async fn push(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        if let Some(message) = self.push_error.lock().unwrap().clone() {
            return Err(BusError::Publish(message).into());
        }

        self.published
            .write()
            .await
            .push((routing_key.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn unsafe_push(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.published
            .write()
            .await
            .push((routing_key.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn consume(
        &self,
        _queue: &str,
        _routing_keys: &[String],
        handler: std::sync::Arc<dyn DeliveryHandler>,
    ) -> Result<()> {
        loop {
            let body = self.inbox.lock().await.pop_front();
            match body {
                // The driver applies its ack policy here; in memory every
                // delivery is simply consumed.
                Some(body) => {
                    let _ = handler.on_delivery(&body).await;
                }
                None => return Ok(()),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// RecordingReporter - captures every reporting call for assertions
// ============================================================================

/// Reporter that records every call
#[derive(Debug, Default)]
pub struct RecordingReporter {
    tags: StdMutex<Vec<(String, String)>>,
    contexts: StdMutex<Vec<(String, Value)>>,
    captured: StdMutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        self.tags.lock().unwrap().clone()
    }

    pub fn contexts(&self) -> Vec<(String, Value)> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn captured(&self) -> Vec<String> {
        self.captured.lock().unwrap().clone()
    }
}

impl Reporter for RecordingReporter {
    fn set_tag(&self, key: &str, value: &str) {
        self.tags
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
    }

    fn set_context(&self, key: &str, value: Value) {
        self.contexts.lock().unwrap().push((key.to_string(), value));
    }

    fn capture(&self, message: &str) {
        self.captured.lock().unwrap().push(message.to_string());
    }
}
