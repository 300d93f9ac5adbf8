// Workflow Orchestration Engine
//
// This crate is the bus- and store-agnostic core of flowmq: an application
// describes a workflow as an ordered list of steps, and the engine decides -
// per that definition - when to run user code, when to checkpoint, when to
// fan out to successors, when to drop a delivery and when to resume after a
// crash. Every step start and step end is a message on a topic-routed bus.
//
// Key design decisions:
// - Uses traits (StateStore, BusDriver, Reporter) for pluggable backends
// - One serde model (Flow) is both the wire envelope and the stored document
// - Metadata values are a closed scalar union validated element-wise
// - Deep copies isolate sibling fanout branches from each other
// - The auto-propagate walk is an explicit LogOnly publish mode, never a
//   nullable bus handle
// - Reporting is injected and infallible; it can never alter control flow

pub mod bus;
pub mod error;
pub mod flow;
pub mod history;
pub mod orchestrator;
pub mod report;
pub mod step;
pub mod storage;
pub mod table;

// In-memory implementations for examples and testing
pub mod memory;

// Re-exports for convenience
pub use bus::{BusDriver, DeliveryHandler};
pub use error::{BusError, Result, WorkflowError};
pub use flow::{Flow, JoinResult, ProgressDetail, ProgressError, ProgressStatus};
pub use history::{FlowState, HistoryEntry, HistoryRecord};
pub use orchestrator::{Orchestrator, PublishMode, StepError, StepHandler, StepResult};
pub use report::{NoopReporter, Reporter, TracingReporter};
pub use step::{PatternIn, PatternOut, Step, StepIn, StepOut};
pub use storage::{StateStore, Storage};
pub use table::{Table, TableValue};
