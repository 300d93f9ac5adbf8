// The demo `test` workflow: two passthrough steps with history records on
// both fanout branches. `launch` seeds it, `consume` runs it with a no-op
// handler.

use tracing::info;

use flowmq_core::{Flow, HistoryRecord, ProgressStatus, Step, StepIn, StepOut, StepResult};

pub fn demo_flow() -> Flow {
    let steps = vec![
        Step {
            name: "test_step_1".into(),
            inputs: vec![StepIn::passthrough()],
            outputs: vec![StepOut::passthrough(1)
                .with_record(HistoryRecord::new("test_entity", ProgressStatus::Running))],
            fail_outputs: vec![StepOut::passthrough(1)
                .with_record(HistoryRecord::new("test_entity", ProgressStatus::Failure))],
            ..Default::default()
        },
        Step {
            name: "test_step_2".into(),
            inputs: vec![StepIn::passthrough()],
            outputs: vec![StepOut::passthrough(0)
                .with_record(HistoryRecord::new("test_entity", ProgressStatus::Success))],
            fail_outputs: vec![StepOut::passthrough(0)
                .with_record(HistoryRecord::new("test_entity", ProgressStatus::Failure))],
            ..Default::default()
        },
    ];
    Flow::new("test", steps)
}

pub fn demo_routing_keys() -> Vec<String> {
    vec![
        "flow.test.test_step_1.start".to_string(),
        "flow.test.test_step_2.start".to_string(),
    ]
}

/// Handler that does nothing but log - enough to watch a flow traverse the
/// workflow end to end.
pub fn demo_handler(flow: &Flow) -> StepResult {
    info!(flow_id = %flow.flow_id, step = %flow.current_step().name, "demo handler invoked");
    Ok(None)
}
