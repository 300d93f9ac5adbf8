// The orchestration engine
//
// One `Orchestrator` owns the three ports and drives the state machine for
// every delivery: decode, tag, checkpoint, correlate, invoke the user
// handler at most once per (flow, step), then propagate success or failure
// back onto the bus. Deliveries from one subscription are processed
// sequentially; correlation and state-log writes depend on ordered
// observation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusDriver, DeliveryHandler};
use crate::error::{Result, WorkflowError};
use crate::flow::{Flow, JoinResult, ProgressDetail, ProgressError, ProgressStatus};
use crate::report::Reporter;
use crate::step::{PatternIn, PatternOut, StepIn, StepOut};
use crate::storage::Storage;
use crate::table::Table;

/// Whether a propagation publishes successor start messages or only writes
/// the state log (the in-process auto-propagate walk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Publish,
    LogOnly,
}

/// Failure returned by a step handler
///
/// Metadata travels with the failure so partial results a handler produced
/// before failing are still merged onto the flow, mirroring the success
/// path.
#[derive(Debug)]
pub struct StepError {
    pub metadata: Option<Table>,
    pub source: anyhow::Error,
}

impl StepError {
    pub fn new(source: impl Into<anyhow::Error>) -> Self {
        StepError {
            metadata: None,
            source: source.into(),
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        StepError {
            metadata: None,
            source: anyhow::Error::msg(message.into()),
        }
    }

    pub fn with_metadata(mut self, metadata: Table) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.source.fmt(f)
    }
}

/// Outcome of one handler invocation: optional metadata to merge, or a
/// failure that routes the flow down its `fail` fanout.
pub type StepResult = std::result::Result<Option<Table>, StepError>;

/// User code run at most once per (flow, step)
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, flow: &Flow) -> StepResult;
}

#[async_trait]
impl<F> StepHandler for F
where
    F: Fn(&Flow) -> StepResult + Send + Sync,
{
    async fn handle(&self, flow: &Flow) -> StepResult {
        (self)(flow)
    }
}

/// The engine: storage, bus and reporting ports plus the state machine
#[derive(Clone)]
pub struct Orchestrator {
    storage: Storage,
    bus: Arc<dyn BusDriver>,
    reporter: Arc<dyn Reporter>,
}

impl Orchestrator {
    pub fn new(storage: Storage, bus: Arc<dyn BusDriver>, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            storage,
            bus,
            reporter,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Subscribe `handler` to a queue bound to the given routing keys.
    /// Blocks for the lifetime of the subscription.
    pub async fn consume(
        &self,
        queue: &str,
        routing_keys: &[String],
        handler: Arc<dyn StepHandler>,
    ) -> Result<()> {
        let delivery = Arc::new(ConsumeLoop {
            engine: self.clone(),
            handler,
        });
        self.bus.consume(queue, routing_keys, delivery).await
    }

    /// Process one raw delivery body end to end.
    ///
    /// Always returns after doing its own logging and capturing; the
    /// returned result only feeds the driver's acknowledgement policy.
    /// `Ok` covers business failures that were routed down the `fail`
    /// fanout - the delivery itself was handled.
    pub async fn handle_delivery(&self, body: &[u8], handler: &dyn StepHandler) -> Result<()> {
        let mut flow = match Flow::decode(body) {
            Ok(flow) => flow,
            Err(err) => {
                warn!(error = %err, "failed to parse delivery body into a flow");
                self.reporter.capture(&err.to_string());
                return Err(err);
            }
        };

        self.reporter.set_tag("w_id", &flow.flow_id.to_string());
        self.reporter.set_tag("b_id", &flow.branch_id.to_string());
        self.reporter.set_tag("s_id", &flow.step_id.to_string());
        self.reporter.set_tag("step_name", &flow.current_step().name);

        flow.progress.start_date = Some(Utc::now());
        let in_key = flow.current_in_key();
        if let Err(err) = self
            .storage
            .create_state_log_if_not_exist(&flow, &in_key, ProgressStatus::Pending)
            .await
        {
            self.reporter.capture(&err.to_string());
            return Err(err);
        }
        if let Err(err) = self
            .storage
            .create_state_log(&mut flow, &in_key, ProgressStatus::Running)
            .await
        {
            self.reporter.capture(&err.to_string());
            return Err(err);
        }

        info!(flow_id = %flow.flow_id, step = %flow.current_step().name, "processing flow");
        match self.correlate(&mut flow).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) => {
                warn!(error = %err, "failed to correlate flow");
                self.reporter.capture(&err.to_string());
                return Err(err);
            }
        }

        let (metadata, handler_err) = match handler.handle(&flow).await {
            Ok(metadata) => (metadata, None),
            Err(StepError { metadata, source }) => (metadata, Some(source)),
        };

        if let Some(table) = metadata {
            if let Err(err) = flow.set_metadata(table) {
                warn!(error = %err, "failed to update flow metadata");
                self.reporter.capture(&err.to_string());
                return Err(err);
            }
        }

        if let Some(err) = handler_err {
            self.enrich_failure_scope(&flow);
            self.reporter.capture(&err.to_string());
            self.fail(&mut flow).await;
            return Ok(());
        }

        if let Err(err) = self
            .propagate(&mut flow, ProgressStatus::Success, PublishMode::Publish)
            .await
        {
            self.enrich_failure_scope(&flow);
            self.reporter.capture(&err.to_string());
            self.fail(&mut flow).await;
        }
        Ok(())
    }

    /// Gate one delivery before user code runs.
    ///
    /// Returns false when the delivery must be swallowed: the flow is shut
    /// down, or a prerequisite is unsatisfied (which also writes the
    /// `dropped` row).
    async fn correlate(&self, flow: &mut Flow) -> Result<bool> {
        if self.storage.is_flow_shutdown(flow).await? {
            debug!(flow_id = %flow.flow_id, "flow is shut down, swallowing delivery");
            return Ok(false);
        }

        // Walk chained auto-propagate steps in process. Each log-only
        // propagation continues the flow at its successor, and the delivery
        // preamble is replayed for the step the flow lands on, as if the
        // start message had arrived over the bus.
        while flow.current_step().auto_propagate {
            let before = flow.current_step;
            self.propagate(flow, ProgressStatus::Success, PublishMode::LogOnly)
                .await?;
            if flow.current_step == before {
                break;
            }

            flow.progress.start_date = Some(Utc::now());
            let in_key = flow.current_in_key();
            self.storage
                .create_state_log_if_not_exist(flow, &in_key, ProgressStatus::Pending)
                .await?;
            self.storage
                .create_state_log(flow, &in_key, ProgressStatus::Running)
                .await?;
        }

        let inputs = flow.current_step().inputs.clone();
        if !inputs.is_empty() {
            let mut check = true;
            for input in &inputs {
                match input.pattern {
                    PatternIn::Passthrough => {}
                    PatternIn::Aggregate => {
                        if !self.aggregate(flow, input).await? {
                            check = false;
                        }
                    }
                    PatternIn::Unknown => check = false,
                }
            }

            if !check {
                let mut clone = flow.deep_copy();
                clone.assign_branch_id();
                let in_key = clone.current_in_key();
                self.storage
                    .create_state_log(&mut clone, &in_key, ProgressStatus::Dropped)
                    .await?;
                debug!(flow_id = %flow.flow_id, step = %flow.current_step().name, "prerequisite unsatisfied, delivery dropped");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluate one aggregate prerequisite.
    ///
    /// A successful join consumes the head of the correlation chain.
    async fn aggregate(&self, flow: &mut Flow, input: &StepIn) -> Result<bool> {
        if flow.correlation_chain.is_empty() {
            flow.join_result = Some(JoinResult::Joined);
            return Ok(true);
        }

        let depth = input.depth.min(flow.correlation_chain.len());
        let chain = flow.correlation_chain[..depth].to_vec();
        if self.storage.is_chains_successful(flow, &chain).await? {
            flow.join_result = Some(JoinResult::Joined);
            flow.correlation_chain.remove(0);
            Ok(true)
        } else {
            flow.join_result = Some(JoinResult::NotJoined);
            Ok(false)
        }
    }

    /// Record the step's completion and fan out to its successors.
    ///
    /// Fanout is sequential and fail-fast: a failure in action k aborts
    /// actions k+1..n without rolling back already-published predecessors.
    /// In `LogOnly` mode the flow continues in place at the last
    /// passthrough successor instead of publishing.
    pub async fn propagate(
        &self,
        flow: &mut Flow,
        status: ProgressStatus,
        mode: PublishMode,
    ) -> Result<()> {
        flow.assign_branch_id();
        let out_key = flow.current_out_key();
        self.storage.create_state_log(flow, &out_key, status).await?;

        let actions = match status {
            ProgressStatus::Success => flow.current_step().outputs.clone(),
            ProgressStatus::Failure => flow.current_step().fail_outputs.clone(),
            _ => Vec::new(),
        };

        let mut continuation: Option<Flow> = None;
        for action in &actions {
            let mut clone = flow.deep_copy();
            clone.progress = ProgressDetail::pending(clone.name.clone());
            clone.current_step = action.next_step;

            if let Some(record) = &action.record {
                self.storage.store_history_entry(&clone, record).await?;
            }

            // `enrich` is reserved; nothing dispatches on it yet.

            // Fanout never re-enters step 0; seed steps start by injection
            // only.
            if clone.current_step != 0 {
                self.handle_pattern(&mut clone, action, mode).await?;
                if mode == PublishMode::LogOnly && action.pattern == PatternOut::Passthrough {
                    continuation = Some(clone);
                }
            }
        }

        if let Some(next) = continuation {
            *flow = next;
        }
        Ok(())
    }

    /// Dispatch one fanout action for a cloned successor flow.
    async fn handle_pattern(
        &self,
        clone: &mut Flow,
        action: &StepOut,
        mode: PublishMode,
    ) -> Result<()> {
        match action.pattern {
            PatternOut::Passthrough => {
                let in_key = clone.current_in_key();
                clone.assign_step_id();

                self.storage
                    .create_state_log(clone, &in_key, ProgressStatus::Pending)
                    .await?;

                if mode == PublishMode::Publish {
                    let payload = clone.encode()?;
                    self.bus.push(&in_key, &payload).await?;
                }
                Ok(())
            }
            // Reserved for the expander hook.
            PatternOut::Split => Ok(()),
            PatternOut::Unknown => Ok(()),
        }
    }

    /// Route a flow down its failure fanout.
    ///
    /// Panics when the failure propagation itself fails: the state machine
    /// can no longer be recovered locally and restarting the consumer is
    /// the only way forward. This is the sole fatal path in the engine.
    async fn fail(&self, flow: &mut Flow) {
        flow.progress.error_code = Some(ProgressError::Unknown);
        if let Err(err) = self
            .propagate(flow, ProgressStatus::Failure, PublishMode::Publish)
            .await
        {
            panic!("failure propagation failed for flow {}: {err}", flow.flow_id);
        }
    }

    /// Republish the last checkpoint for `(flow_id, step_id)`.
    ///
    /// The checkpoint goes out on its *end* key: resume picks up where the
    /// step had already been reported complete but the downstream
    /// propagation was lost. Returns false when there is nothing to resume.
    pub async fn resume_step(
        &self,
        flow_id: Uuid,
        workflow_name: &str,
        step_id: Uuid,
    ) -> Result<bool> {
        let Some(flow) = self.storage.get_resumable_step(flow_id, step_id).await? else {
            return Ok(false);
        };

        if flow.name != workflow_name {
            return Err(WorkflowError::validation(format!(
                "resumable step belongs to workflow {:?}, not {workflow_name:?}",
                flow.name
            )));
        }

        let payload = flow.encode()?;
        self.bus.push(&flow.current_out_key(), &payload).await?;
        info!(%flow_id, %step_id, "resumed flow from last checkpoint");
        Ok(true)
    }

    fn enrich_failure_scope(&self, flow: &Flow) {
        let step = serde_json::to_value(flow.current_step()).unwrap_or(Value::Null);
        self.reporter.set_context("current_step", step);
        let metadata = serde_json::to_value(&flow.metadata).unwrap_or(Value::Null);
        self.reporter.set_context("metadata", metadata);
    }
}

/// Glue between the bus driver's delivery stream and the engine
struct ConsumeLoop {
    engine: Orchestrator,
    handler: Arc<dyn StepHandler>,
}

#[async_trait]
impl DeliveryHandler for ConsumeLoop {
    async fn on_delivery(&self, body: &[u8]) -> Result<()> {
        self.engine.handle_delivery(body, self.handler.as_ref()).await
    }
}
