// The Flow envelope
//
// One Flow value is the whole wire message and the whole stored document:
// identity, program, cursor, correlation state, user metadata and the
// progress of the most recent transition. Unknown envelope fields are kept
// in a flattened map so a decode→encode round trip never loses producer
// extensions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::step::Step;
use crate::table::Table;

/// Status of a step transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Success,
    Failure,
    #[default]
    Pending,
    Running,
    Dropped,
}

impl ProgressStatus {
    /// Terminal statuses close the step: they carry an end date and a
    /// duration in the state log.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressStatus::Success | ProgressStatus::Failure | ProgressStatus::Dropped
        )
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressStatus::Success => write!(f, "success"),
            ProgressStatus::Failure => write!(f, "failure"),
            ProgressStatus::Pending => write!(f, "pending"),
            ProgressStatus::Running => write!(f, "running"),
            ProgressStatus::Dropped => write!(f, "dropped"),
        }
    }
}

/// Coarse error code stamped on a failed transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressError {
    #[serde(rename = "err-unknown")]
    Unknown,
}

/// Outcome of the most recent aggregate evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinResult {
    #[serde(rename = "joined")]
    Joined,
    #[serde(rename = "not-joined")]
    NotJoined,
}

/// Details about the most recent status transition of a flow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressDetail {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub create_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: ProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ProgressError>,
    #[serde(default)]
    pub entity_ref: String,
    /// Elapsed nanoseconds between start and end, terminal statuses only
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub duration_str: String,
    #[serde(default)]
    pub routing_key: String,
}

impl ProgressDetail {
    /// Fresh pending progress for a newly created or fanned-out flow.
    pub fn pending(name: impl Into<String>) -> Self {
        ProgressDetail {
            name: name.into(),
            create_date: Utc::now(),
            status: ProgressStatus::Pending,
            ..Default::default()
        }
    }
}

/// One instance of a workflow program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Identity of the workflow instance; immutable after instantiation
    #[serde(rename = "w_id", default)]
    pub flow_id: Uuid,
    /// Identity of one fanout branch; reassigned before every propagation
    #[serde(rename = "b_id", default)]
    pub branch_id: Uuid,
    /// Identity of one executing step; reassigned on every start emission
    #[serde(rename = "s_id", default)]
    pub step_id: Uuid,
    /// Ancestor tokens consumed head-first by aggregate prerequisites
    #[serde(rename = "c_chain", default)]
    pub correlation_chain: Vec<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub current_step: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_result: Option<JoinResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Table>,
    #[serde(default)]
    pub progress: ProgressDetail,
    /// Producer extensions we do not interpret but must not drop
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Flow {
    /// Instantiate a flow at step 0 with fresh identities.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        let name = name.into();
        Flow {
            flow_id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            correlation_chain: Vec::new(),
            progress: ProgressDetail::pending(name.clone()),
            name,
            steps,
            current_step: 0,
            join_result: None,
            metadata: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Parse an envelope received from the bus and validate it.
    pub fn decode(body: &[u8]) -> Result<Flow> {
        let flow: Flow = serde_json::from_slice(body)?;
        flow.validate()?;
        Ok(flow)
    }

    /// Serialize the envelope for the bus or the state log.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Structural validation: identities present, program non-empty, cursor
    /// and every fanout target in range, metadata scalar-only.
    pub fn validate(&self) -> Result<()> {
        if self.flow_id.is_nil() {
            return Err(WorkflowError::validation("flow id is required"));
        }
        if self.branch_id.is_nil() {
            return Err(WorkflowError::validation("branch id is required"));
        }
        if self.step_id.is_nil() {
            return Err(WorkflowError::validation("step id is required"));
        }
        if self.name.is_empty() {
            return Err(WorkflowError::validation("workflow name is required"));
        }
        if self.steps.is_empty() {
            return Err(WorkflowError::validation("workflow has no steps"));
        }
        if self.current_step >= self.steps.len() {
            return Err(WorkflowError::validation(format!(
                "current step {} out of range for {} steps",
                self.current_step,
                self.steps.len()
            )));
        }
        for (index, step) in self.steps.iter().enumerate() {
            for action in step.outputs.iter().chain(step.fail_outputs.iter()) {
                if action.next_step >= self.steps.len() {
                    return Err(WorkflowError::validation(format!(
                        "step {index} fans out to step {} which does not exist",
                        action.next_step
                    )));
                }
            }
        }
        if let Some(metadata) = &self.metadata {
            metadata.validate()?;
        }
        Ok(())
    }

    /// The step the cursor points at.
    ///
    /// Callers hold a validated flow, so the index is in range.
    pub fn current_step(&self) -> &Step {
        &self.steps[self.current_step]
    }

    /// Routing key that starts the current step.
    pub fn current_in_key(&self) -> String {
        self.current_step().in_key(&self.name)
    }

    /// Routing key that ends the current step.
    pub fn current_out_key(&self) -> String {
        self.current_step().out_key(&self.name)
    }

    pub fn assign_flow_id(&mut self) {
        self.flow_id = Uuid::new_v4();
    }

    pub fn assign_branch_id(&mut self) {
        self.branch_id = Uuid::new_v4();
    }

    pub fn assign_step_id(&mut self) {
        self.step_id = Uuid::new_v4();
    }

    /// Whole-graph clone used for sibling-branch isolation: mutating the
    /// copy is never observable in the original.
    pub fn deep_copy(&self) -> Flow {
        self.clone()
    }

    /// Install or shallow-merge user metadata, rejecting invalid tables.
    pub fn set_metadata(&mut self, metadata: Table) -> Result<()> {
        metadata.validate()?;

        match &mut self.metadata {
            Some(existing) => existing.merge(metadata),
            None => self.metadata = Some(metadata),
        }
        Ok(())
    }
}
