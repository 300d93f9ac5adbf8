// Business history records
//
// History rows are append-only business breadcrumbs: a `started` entry is
// written whenever a fanout action carries a record, and a `shutdowned`
// entry (written externally, e.g. by an operator) gates further processing
// of the flow.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::{Flow, ProgressStatus};

/// Lifecycle state carried by a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowState {
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "shutdowned")]
    Shutdowned,
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowState::Started => write!(f, "started"),
            FlowState::Shutdowned => write!(f, "shutdowned"),
        }
    }
}

/// Business tag declared on a fanout action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub entity: String,
    #[serde(default)]
    pub status: ProgressStatus,
}

impl HistoryRecord {
    pub fn new(entity: impl Into<String>, status: ProgressStatus) -> Self {
        HistoryRecord {
            entity: entity.into(),
            status,
        }
    }
}

/// One persisted history row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProgressStatus>,
    pub state: FlowState,
    #[serde(rename = "w_id")]
    pub flow_id: Uuid,
    #[serde(rename = "b_id")]
    pub branch_id: Uuid,
    #[serde(rename = "s_id")]
    pub step_id: Uuid,
    pub name: String,
}

impl HistoryEntry {
    /// Entry written when a fanout action carries a record.
    pub fn started(flow: &Flow, record: &HistoryRecord) -> Self {
        HistoryEntry {
            entity: record.entity.clone(),
            status: Some(record.status),
            state: FlowState::Started,
            flow_id: flow.flow_id,
            branch_id: flow.branch_id,
            step_id: flow.step_id,
            name: flow.name.clone(),
        }
    }

    /// Entry that marks a whole flow as externally shut down.
    pub fn shutdowned(flow_id: Uuid, workflow_name: impl Into<String>) -> Self {
        HistoryEntry {
            entity: String::new(),
            status: None,
            state: FlowState::Shutdowned,
            flow_id,
            branch_id: Uuid::nil(),
            step_id: Uuid::nil(),
            name: workflow_name.into(),
        }
    }
}
