// End-to-end delivery scenarios driven through the in-memory fakes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use flowmq_core::memory::{InMemoryBus, InMemoryStateStore, RecordingReporter};
use flowmq_core::{
    Flow, HistoryRecord, JoinResult, Orchestrator, PatternIn, ProgressError, ProgressStatus,
    StateStore, Step, StepError, StepHandler, StepIn, StepOut, StepResult, Storage, Table,
};

struct Harness {
    store: Arc<InMemoryStateStore>,
    bus: Arc<InMemoryBus>,
    reporter: Arc<RecordingReporter>,
    engine: Arc<Orchestrator>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryStateStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let reporter = Arc::new(RecordingReporter::new());
    let engine = Arc::new(Orchestrator::new(
        Storage::new(store.clone()),
        bus.clone(),
        reporter.clone(),
    ));
    Harness {
        store,
        bus,
        reporter,
        engine,
    }
}

/// The two-step `test` workflow both steps fan out through.
fn simple_workflow() -> Flow {
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
            ..Default::default()
        },
    ];
    Flow::new("test", steps)
}

fn ok_handler(_flow: &Flow) -> StepResult {
    Ok(None)
}

fn failing_handler(_flow: &Flow) -> StepResult {
    Err(StepError::msg("boom"))
}

fn transitions_of(
    rows: &[(ProgressStatus, String)],
) -> Vec<(ProgressStatus, &str)> {
    rows.iter()
        .map(|(status, key)| (*status, key.as_str()))
        .collect()
}

#[tokio::test]
async fn test_happy_path_two_step_workflow() {
    let h = harness();
    let flow = simple_workflow();
    let body = flow.encode().unwrap();

    h.engine.handle_delivery(&body, &ok_handler).await.unwrap();

    let rows = h.store.transitions().await;
    assert_eq!(
        transitions_of(&rows),
        vec![
            (ProgressStatus::Pending, "flow.test.test_step_1.start"),
            (ProgressStatus::Running, "flow.test.test_step_1.start"),
            (ProgressStatus::Success, "flow.test.test_step_1.end"),
            (ProgressStatus::Pending, "flow.test.test_step_2.start"),
        ]
    );

    let history = h.store.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].entity, "test_entity");
    assert_eq!(history[0].status, Some(ProgressStatus::Running));

    let published = h.bus.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "flow.test.test_step_2.start");

    let successor = Flow::decode(&published[0].1).unwrap();
    assert_eq!(successor.flow_id, flow.flow_id);
    assert_eq!(successor.current_step, 1);
    assert_ne!(successor.step_id, flow.step_id);
    assert_ne!(successor.branch_id, flow.branch_id);
    assert_eq!(successor.progress.status, ProgressStatus::Pending);

    assert!(h.reporter.captured().is_empty());
}

#[tokio::test]
async fn test_reporting_tags_are_set_once_per_delivery() {
    let h = harness();
    let flow = simple_workflow();

    h.engine
        .handle_delivery(&flow.encode().unwrap(), &ok_handler)
        .await
        .unwrap();

    let tags = h.reporter.tags();
    assert_eq!(tags.len(), 4);
    assert_eq!(tags[0], ("w_id".into(), flow.flow_id.to_string()));
    assert_eq!(tags[1], ("b_id".into(), flow.branch_id.to_string()));
    assert_eq!(tags[2], ("s_id".into(), flow.step_id.to_string()));
    assert_eq!(tags[3], ("step_name".into(), "test_step_1".into()));
}

#[tokio::test]
async fn test_handler_error_routes_through_fail_fanout() {
    let h = harness();
    let flow = simple_workflow();

    h.engine
        .handle_delivery(&flow.encode().unwrap(), &failing_handler)
        .await
        .unwrap();

    let rows = h.store.transitions().await;
    assert_eq!(
        transitions_of(&rows),
        vec![
            (ProgressStatus::Pending, "flow.test.test_step_1.start"),
            (ProgressStatus::Running, "flow.test.test_step_1.start"),
            (ProgressStatus::Failure, "flow.test.test_step_1.end"),
            (ProgressStatus::Pending, "flow.test.test_step_2.start"),
        ]
    );

    // The failure transition carries the coarse error code.
    let log = h.store.state_log().await;
    let failure_row = &log[2].flow;
    assert_eq!(failure_row.progress.error_code, Some(ProgressError::Unknown));

    let history = h.store.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, Some(ProgressStatus::Failure));

    assert_eq!(h.reporter.captured().len(), 1);
    let contexts = h.reporter.contexts();
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[0].0, "current_step");
    assert_eq!(contexts[1].0, "metadata");

    // The fail branch fans out to step 2 exactly like the success branch.
    assert_eq!(
        h.bus.published_keys().await,
        vec!["flow.test.test_step_2.start".to_string()]
    );
}

#[tokio::test]
async fn test_malformed_body_is_swallowed() {
    let h = harness();

    let result = h.engine.handle_delivery(b"not_json", &ok_handler).await;

    assert!(result.is_err());
    assert_eq!(h.reporter.captured().len(), 1);
    assert!(h.reporter.tags().is_empty());
    assert!(h.store.transitions().await.is_empty());
    assert!(h.bus.published().await.is_empty());
}

#[tokio::test]
async fn test_invalid_body_is_swallowed() {
    let h = harness();

    let result = h
        .engine
        .handle_delivery(br#"{ "test": "test" }"#, &ok_handler)
        .await;

    assert!(result.is_err());
    assert_eq!(h.reporter.captured().len(), 1);
    assert!(h.store.transitions().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_flow_skips_handler_and_fanout() {
    let h = harness();
    let flow = simple_workflow();
    h.store
        .store_shutdown_entry(flow.flow_id, "test")
        .await
        .unwrap();

    let called = Arc::new(AtomicBool::new(false));
    let seen = called.clone();
    let handler = move |_: &Flow| -> StepResult {
        seen.store(true, Ordering::SeqCst);
        Ok(None)
    };

    h.engine
        .handle_delivery(&flow.encode().unwrap(), &handler)
        .await
        .unwrap();

    assert!(!called.load(Ordering::SeqCst));
    let rows = h.store.transitions().await;
    assert_eq!(
        transitions_of(&rows),
        vec![
            (ProgressStatus::Pending, "flow.test.test_step_1.start"),
            (ProgressStatus::Running, "flow.test.test_step_1.start"),
        ]
    );
    assert!(h.bus.published().await.is_empty());
    assert_eq!(h.reporter.tags().len(), 4);
}

#[tokio::test]
async fn test_unsatisfied_aggregate_drops_the_delivery() {
    let h = harness();
    let steps = vec![Step {
        name: "join_step".into(),
        inputs: vec![StepIn::aggregate(2)],
        ..Default::default()
    }];
    let mut flow = Flow::new("test", steps);
    flow.correlation_chain = vec!["x".into(), "y".into(), "z".into()];

    h.engine
        .handle_delivery(&flow.encode().unwrap(), &failing_handler)
        .await
        .unwrap();

    let rows = h.store.transitions().await;
    assert_eq!(
        transitions_of(&rows),
        vec![
            (ProgressStatus::Pending, "flow.test.join_step.start"),
            (ProgressStatus::Running, "flow.test.join_step.start"),
            (ProgressStatus::Dropped, "flow.test.join_step.start"),
        ]
    );

    let dropped = &h.store.state_log().await[2].flow;
    assert_eq!(dropped.join_result, Some(JoinResult::NotJoined));
    // The chain is only consumed on a successful join.
    assert_eq!(dropped.correlation_chain.len(), 3);
    assert_ne!(dropped.branch_id, flow.branch_id);

    assert!(h.bus.published().await.is_empty());
    assert!(h.reporter.captured().is_empty());
}

#[tokio::test]
async fn test_satisfied_aggregate_consumes_chain_head() {
    let h = harness();
    let steps = vec![Step {
        name: "join_step".into(),
        inputs: vec![StepIn::aggregate(2)],
        ..Default::default()
    }];
    let mut flow = Flow::new("test", steps.clone());
    flow.correlation_chain = vec!["x".into(), "y".into(), "z".into()];

    // An ancestor branch that carried both tokens and settled successfully.
    let mut ancestor = Flow::new("test", steps);
    ancestor.flow_id = flow.flow_id;
    ancestor.correlation_chain = vec!["x".into(), "y".into()];
    ancestor.progress.status = ProgressStatus::Success;
    h.store.create_state_log(&ancestor).await.unwrap();

    h.engine
        .handle_delivery(&flow.encode().unwrap(), &ok_handler)
        .await
        .unwrap();

    let log = h.store.state_log().await;
    let end_row = &log.last().unwrap().flow;
    assert_eq!(end_row.progress.status, ProgressStatus::Success);
    assert_eq!(end_row.join_result, Some(JoinResult::Joined));
    assert_eq!(
        end_row.correlation_chain,
        vec!["y".to_string(), "z".to_string()]
    );
}

#[tokio::test]
async fn test_unknown_input_pattern_is_never_satisfied() {
    let h = harness();
    let steps = vec![Step {
        name: "odd".into(),
        inputs: vec![StepIn {
            pattern: PatternIn::Unknown,
            depth: 0,
        }],
        ..Default::default()
    }];
    let flow = Flow::new("test", steps);

    h.engine
        .handle_delivery(&flow.encode().unwrap(), &ok_handler)
        .await
        .unwrap();

    let rows = h.store.transitions().await;
    assert_eq!(rows.last().unwrap().0, ProgressStatus::Dropped);
    assert!(h.bus.published().await.is_empty());
}

#[tokio::test]
async fn test_auto_propagate_chain_stays_in_process() {
    let h = harness();
    let steps = vec![
        Step {
            name: "step_0".into(),
            auto_propagate: true,
            outputs: vec![StepOut::passthrough(1)],
            ..Default::default()
        },
        Step {
            name: "step_1".into(),
            inputs: vec![StepIn::passthrough()],
            ..Default::default()
        },
    ];
    let flow = Flow::new("test", steps);

    let handled_steps = Arc::new(Mutex::new(Vec::new()));
    let sink = handled_steps.clone();
    let handler = move |flow: &Flow| -> StepResult {
        sink.lock().unwrap().push(flow.current_step().name.clone());
        Ok(None)
    };

    h.engine
        .handle_delivery(&flow.encode().unwrap(), &handler)
        .await
        .unwrap();

    let rows = h.store.transitions().await;
    assert_eq!(
        transitions_of(&rows),
        vec![
            (ProgressStatus::Pending, "flow.test.step_0.start"),
            (ProgressStatus::Running, "flow.test.step_0.start"),
            (ProgressStatus::Success, "flow.test.step_0.end"),
            (ProgressStatus::Pending, "flow.test.step_1.start"),
            (ProgressStatus::Running, "flow.test.step_1.start"),
            (ProgressStatus::Success, "flow.test.step_1.end"),
        ]
    );

    // The whole chain ran in process: the handler saw only step_1 and
    // nothing touched the bus.
    assert_eq!(*handled_steps.lock().unwrap(), vec!["step_1".to_string()]);
    assert!(h.bus.published().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_delivery_writes_one_pending_row() {
    let h = harness();
    let steps = vec![Step {
        name: "solo".into(),
        inputs: vec![StepIn::passthrough()],
        ..Default::default()
    }];
    let flow = Flow::new("test", steps);
    let body = flow.encode().unwrap();

    h.engine.handle_delivery(&body, &ok_handler).await.unwrap();
    h.engine.handle_delivery(&body, &ok_handler).await.unwrap();

    let log = h.store.state_log().await;
    let pendings = log
        .iter()
        .filter(|row| {
            row.flow.step_id == flow.step_id
                && row.flow.progress.status == ProgressStatus::Pending
        })
        .count();
    let runnings = log
        .iter()
        .filter(|row| row.flow.progress.status == ProgressStatus::Running)
        .count();

    assert_eq!(pendings, 1);
    assert_eq!(runnings, 2);
}

#[tokio::test]
async fn test_fanout_publishes_every_successor_in_order() {
    let h = harness();
    let steps = vec![
        Step {
            name: "fan".into(),
            inputs: vec![StepIn::passthrough()],
            outputs: vec![StepOut::passthrough(1), StepOut::passthrough(2)],
            ..Default::default()
        },
        Step {
            name: "left".into(),
            ..Default::default()
        },
        Step {
            name: "right".into(),
            ..Default::default()
        },
    ];
    let flow = Flow::new("test", steps);

    h.engine
        .handle_delivery(&flow.encode().unwrap(), &ok_handler)
        .await
        .unwrap();

    assert_eq!(
        h.bus.published_keys().await,
        vec![
            "flow.test.left.start".to_string(),
            "flow.test.right.start".to_string(),
        ]
    );

    // Each published successor is its own pending row with its own step id.
    let log = h.store.state_log().await;
    let successors: Vec<_> = log
        .iter()
        .filter(|row| {
            row.flow.progress.status == ProgressStatus::Pending && row.flow.current_step != 0
        })
        .map(|row| row.flow.step_id)
        .collect();
    assert_eq!(successors.len(), 2);
    assert_ne!(successors[0], successors[1]);
    assert_ne!(successors[0], flow.step_id);
}

#[tokio::test]
async fn test_storage_error_before_handler_skips_the_delivery() {
    let h = harness();
    let flow = simple_workflow();
    h.store.inject_if_not_exist_error("Sample");

    let called = Arc::new(AtomicBool::new(false));
    let seen = called.clone();
    let handler = move |_: &Flow| -> StepResult {
        seen.store(true, Ordering::SeqCst);
        Ok(None)
    };

    let result = h
        .engine
        .handle_delivery(&flow.encode().unwrap(), &handler)
        .await;

    assert!(result.is_err());
    assert!(!called.load(Ordering::SeqCst));
    assert_eq!(h.reporter.captured().len(), 1);
    assert!(h.store.transitions().await.is_empty());
}

#[tokio::test]
async fn test_storage_error_on_running_write_skips_the_delivery() {
    let h = harness();
    let flow = simple_workflow();
    h.store.inject_state_log_error("Sample");

    let result = h
        .engine
        .handle_delivery(&flow.encode().unwrap(), &ok_handler)
        .await;

    assert!(result.is_err());
    assert_eq!(h.reporter.captured().len(), 1);
    // Only the idempotent pending row made it in.
    let rows = h.store.transitions().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, ProgressStatus::Pending);
}

#[tokio::test]
async fn test_shutdown_check_error_is_captured() {
    let h = harness();
    let flow = simple_workflow();
    h.store.inject_shutdown_error("Sample");

    let result = h
        .engine
        .handle_delivery(&flow.encode().unwrap(), &ok_handler)
        .await;

    assert!(result.is_err());
    assert_eq!(h.reporter.captured().len(), 1);
    assert!(h.bus.published().await.is_empty());
}

#[tokio::test]
async fn test_handler_metadata_is_merged_onto_the_flow() {
    let h = harness();
    let flow = simple_workflow();

    let handler = |_: &Flow| -> StepResult {
        let mut table = Table::new();
        table.insert("test", "test");
        Ok(Some(table))
    };

    h.engine
        .handle_delivery(&flow.encode().unwrap(), &handler)
        .await
        .unwrap();

    let log = h.store.state_log().await;
    let end_row = log
        .iter()
        .find(|row| row.flow.progress.status == ProgressStatus::Success)
        .unwrap();
    let metadata = end_row.flow.metadata.as_ref().unwrap();
    assert!(metadata.get("test").is_some());

    let successor = Flow::decode(&h.bus.published().await[0].1).unwrap();
    assert!(successor.metadata.unwrap().get("test").is_some());
}

#[tokio::test]
async fn test_invalid_handler_metadata_stops_the_delivery() {
    let h = harness();
    let flow = simple_workflow();

    let handler = |_: &Flow| -> StepResult {
        let table: Table =
            serde_json::from_value(serde_json::json!({ "bad": { "nested": true } })).unwrap();
        Ok(Some(table))
    };

    let result = h
        .engine
        .handle_delivery(&flow.encode().unwrap(), &handler)
        .await;

    assert!(result.is_err());
    assert_eq!(h.reporter.captured().len(), 1);

    // No terminal transition and no fanout happened.
    let rows = h.store.transitions().await;
    assert_eq!(rows.len(), 2);
    assert!(h.bus.published().await.is_empty());
    assert!(h.store.history().await.is_empty());
}

#[tokio::test]
async fn test_failing_handler_still_contributes_metadata() {
    let h = harness();
    let flow = simple_workflow();

    let handler = |_: &Flow| -> StepResult {
        let mut table = Table::new();
        table.insert("partial", 1i64);
        Err(StepError::msg("boom").with_metadata(table))
    };

    h.engine
        .handle_delivery(&flow.encode().unwrap(), &handler)
        .await
        .unwrap();

    let log = h.store.state_log().await;
    let failure_row = log
        .iter()
        .find(|row| row.flow.progress.status == ProgressStatus::Failure)
        .unwrap();
    assert!(failure_row.flow.metadata.as_ref().unwrap().get("partial").is_some());
}

#[tokio::test]
async fn test_publish_failure_routes_through_fail_fanout() {
    let h = harness();
    // Success fans out, failure does not: the fail propagate can complete
    // even with a dead bus.
    let steps = vec![
        Step {
            name: "step_1".into(),
            inputs: vec![StepIn::passthrough()],
            outputs: vec![StepOut::passthrough(1)],
            ..Default::default()
        },
        Step {
            name: "step_2".into(),
            ..Default::default()
        },
    ];
    let flow = Flow::new("test", steps);
    h.bus.inject_push_error("broker gone");

    h.engine
        .handle_delivery(&flow.encode().unwrap(), &ok_handler)
        .await
        .unwrap();

    let rows = h.store.transitions().await;
    // The success fanout got as far as the successor's pending row before
    // the publish failed; nothing is rolled back, and the failure
    // transition lands on top.
    assert_eq!(
        transitions_of(&rows),
        vec![
            (ProgressStatus::Pending, "flow.test.step_1.start"),
            (ProgressStatus::Running, "flow.test.step_1.start"),
            (ProgressStatus::Success, "flow.test.step_1.end"),
            (ProgressStatus::Pending, "flow.test.step_2.start"),
            (ProgressStatus::Failure, "flow.test.step_1.end"),
        ]
    );
    assert_eq!(h.reporter.captured().len(), 1);
    assert_eq!(h.reporter.contexts().len(), 2);
}

#[tokio::test]
#[should_panic(expected = "failure propagation failed")]
async fn test_double_propagation_failure_panics() {
    let h = harness();
    // Both fanout lists publish, so the fail propagate hits the dead bus
    // too and the engine gives up.
    let flow = simple_workflow();
    h.bus.inject_push_error("broker gone");

    let _ = h
        .engine
        .handle_delivery(&flow.encode().unwrap(), &ok_handler)
        .await;
}

#[tokio::test]
async fn test_consume_drains_queued_deliveries() {
    let h = harness();
    let flow = simple_workflow();
    h.bus.enqueue(flow.encode().unwrap()).await;
    h.bus.enqueue(b"not_json".to_vec()).await;

    let handler: Arc<dyn StepHandler> = Arc::new(ok_handler);
    h.engine
        .consume(
            "test_queue",
            &["flow.test.test_step_1.start".to_string()],
            handler,
        )
        .await
        .unwrap();

    // First body processed end to end, second swallowed after capture.
    assert_eq!(h.store.transitions().await.len(), 4);
    assert_eq!(h.reporter.captured().len(), 1);
    assert_eq!(h.bus.published().await.len(), 1);
}
