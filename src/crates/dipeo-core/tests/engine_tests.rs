//! End-to-end engine tests: full executions over compiled diagrams with
//! in-memory services and the mock LLM.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use dipeo_core::services::LocalFileService;
use dipeo_core::{
    compile, DiagramSpec, EventType, ExecutionEngine, ExecutionOptions, ExecutionStatus,
    ServiceRegistry, Status,
};
use dipeo_llm::MockLlm;

fn diagram(yaml: &str) -> Arc<dipeo_core::ExecutableDiagram> {
    let spec = DiagramSpec::from_yaml(yaml).expect("valid yaml");
    Arc::new(compile(&spec).into_diagram().expect("compiles"))
}

async fn drain(
    events: dipeo_core::EventStream,
) -> Vec<dipeo_core::ExecutionEvent> {
    tokio::time::timeout(Duration::from_secs(60), events.collect_to_end())
        .await
        .expect("execution did not terminate in time")
}

fn types_for(events: &[dipeo_core::ExecutionEvent], node: &str) -> Vec<EventType> {
    events
        .iter()
        .filter(|e| e.node_id.as_deref() == Some(node))
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn linear_execution_produces_ordered_events_and_file_output() {
    // S1: start -> code_job (uppercases the greeting) -> end (saves to file).
    let dir = tempfile::tempdir().unwrap();
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
    properties:
      custom_data: { greeting: "hi" }
  - id: job
    type: code_job
    properties:
      language: bash
      code: "printf '%s' \"$greeting\" | tr '[:lower:]' '[:upper:]'"
  - id: end
    type: end
    properties:
      save_to_file: out.txt
arrows:
  - source: start
    target: job
    packing: spread
  - source: job
    target: end
"#,
    );

    let services = ServiceRegistry::for_tests()
        .with_file(Arc::new(LocalFileService::new(dir.path())));
    let engine = ExecutionEngine::with_builtins();

    let mut handle = engine.execute(diagram, ExecutionOptions::default(), services);
    let events = drain(handle.take_events().unwrap()).await;
    let state = handle.wait().await;

    assert_eq!(state.status, ExecutionStatus::Completed);

    // Event order for a linear chain is fully determined.
    let sequence: Vec<(EventType, Option<&str>)> = events
        .iter()
        .map(|e| (e.event_type, e.node_id.as_deref()))
        .collect();
    assert_eq!(
        sequence,
        vec![
            (EventType::ExecutionStarted, None),
            (EventType::NodeStarted, Some("start")),
            (EventType::NodeCompleted, Some("start")),
            (EventType::NodeStarted, Some("job")),
            (EventType::NodeCompleted, Some("job")),
            (EventType::NodeStarted, Some("end")),
            (EventType::NodeCompleted, Some("end")),
            (EventType::ExecutionCompleted, None),
        ]
    );

    // Sequence numbers are a strictly increasing prefix of publish order.
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, i as u64);
    }

    // The code job uppercased the input and the end node persisted it.
    let output = state.node_states["job"].output_envelope().unwrap();
    assert_eq!(output.as_text().unwrap(), "HI");
    assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "HI");
}

#[tokio::test]
async fn branch_takes_condfalse_and_skips_the_other_arm() {
    // S2: condition on x > 10 with x = 5; the condtrue arm never runs.
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
    properties:
      custom_data: { x: 5 }
  - id: cond
    type: condition
    properties:
      kind: custom_expression
      expression: "x > 10"
  - id: a
    type: code_job
    properties: { language: bash, code: "printf took_true" }
  - id: b
    type: code_job
    properties: { language: bash, code: "printf took_false" }
arrows:
  - source: start
    target: cond
  - source: "cond:condtrue"
    target: a
  - source: "cond:condfalse"
    target: b
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let mut handle =
        engine.execute(diagram, ExecutionOptions::default(), ServiceRegistry::for_tests());
    let events = drain(handle.take_events().unwrap()).await;
    let state = handle.wait().await;

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.branch_decisions["cond"], "condfalse");

    assert_eq!(state.node_states["b"].status, Status::Completed);
    assert_eq!(
        state.node_states["b"].output_envelope().unwrap().as_text().unwrap(),
        "took_false"
    );

    // The non-taken arm was never started, only skipped at settlement.
    assert_eq!(state.node_states["a"].status, Status::Skipped);
    assert_eq!(state.node_states["a"].execution_count, 0);
    assert_eq!(types_for(&events, "a"), vec![EventType::NodeSkipped]);
}

#[tokio::test]
async fn bounded_loop_runs_person_job_to_its_cap() {
    // S3: person_job capped at 2 inside a condition-gated cycle.
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
  - id: agent
    type: person_job
    properties:
      person: writer
      first_only_prompt: "Begin"
      default_prompt: "Continue"
      max_iteration: 2
  - id: loop
    type: condition
    properties:
      kind: max_iterations
      expose_index_as: i
  - id: end
    type: end
arrows:
  - source: start
    target: agent
    metadata: { is_first_execution: true }
  - source: agent
    target: loop
  - source: "loop:condfalse"
    target: agent
  - source: "loop:condtrue"
    target: end
persons:
  - id: writer
    model: mock-model
"#,
    );

    let llm = Arc::new(MockLlm::new());
    llm.push_text("draft one");
    llm.push_text("draft two");
    let services = ServiceRegistry::for_tests().with_llm(llm.clone());

    let engine = ExecutionEngine::with_builtins();
    let mut handle = engine.execute(diagram, ExecutionOptions::default(), services);
    let _events = drain(handle.take_events().unwrap()).await;
    let state = handle.wait().await;

    assert_eq!(state.status, ExecutionStatus::Completed);

    // Exactly two executions, then the cap.
    assert_eq!(state.node_states["agent"].execution_count, 2);
    assert_eq!(state.node_states["agent"].status, Status::MaxiterReached);
    assert_eq!(llm.call_count(), 2);

    // First-only prompt on the first pass, default prompt afterwards.
    let requests = llm.requests();
    assert_eq!(requests[0].messages.last().unwrap().content, "Begin");
    assert_eq!(requests[1].messages.last().unwrap().content, "Continue");

    // Loop exited through condtrue and exposed its index variable.
    assert_eq!(state.branch_decisions["loop"], "condtrue");
    assert!(state.variables.contains_key("i"));
    assert_eq!(state.node_states["end"].status, Status::Completed);
}

#[tokio::test]
async fn spread_collision_fails_the_target_node() {
    // S4: two spread edges carrying the same key into one target.
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
  - id: a
    type: code_job
    properties: { language: bash, code: "printf '{\"name\": \"left\"}'" }
  - id: b
    type: code_job
    properties: { language: bash, code: "printf '{\"name\": \"right\"}'" }
  - id: merge
    type: code_job
    properties: { language: bash, code: "printf unreachable" }
arrows:
  - source: start
    target: a
  - source: start
    target: b
  - source: a
    target: merge
    packing: spread
  - source: b
    target: merge
    packing: spread
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let mut handle =
        engine.execute(diagram, ExecutionOptions::default(), ServiceRegistry::for_tests());
    let events = drain(handle.take_events().unwrap()).await;
    let state = handle.wait().await;

    assert_eq!(state.node_states["merge"].status, Status::Failed);
    let failed = events
        .iter()
        .find(|e| e.event_type == EventType::NodeFailed && e.node_id.as_deref() == Some("merge"))
        .expect("NODE_FAILED for merge");
    assert_eq!(failed.data["error_type"], "SpreadCollisionError");
    assert!(failed.data["error"].as_str().unwrap().contains("name"));

    // No other frontier and no end node: the execution reports failure.
    assert_eq!(state.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn concurrent_subscribers_receive_identical_ordered_streams() {
    // S5 part one: two subscribers attached before the execution starts.
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
  - id: end
    type: end
arrows:
  - source: start
    target: end
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let bus = engine.event_bus();
    let mut handle =
        engine.execute(diagram, ExecutionOptions::default(), ServiceRegistry::for_tests());

    let s1 = handle.take_events().unwrap();
    let s2 = bus.subscribe(&handle.execution_id);

    let events1 = drain(s1).await;
    let events2 = drain(s2).await;
    handle.wait().await;

    assert_eq!(events1.len(), events2.len());
    for (a, b) in events1.iter().zip(&events2) {
        assert_eq!(a.sequence, b.sequence);
        assert_eq!(a.event_type, b.event_type);
    }
    assert!(events1.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[tokio::test]
async fn late_subscriber_only_sees_subsequent_events() {
    // S5 part two: a subscriber attaching mid-execution has no claim on
    // earlier events.
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
  - id: slow
    type: code_job
    properties: { language: bash, code: "sleep 0.5" }
  - id: end
    type: end
arrows:
  - source: start
    target: slow
  - source: slow
    target: end
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let bus = engine.event_bus();
    let mut handle =
        engine.execute(diagram, ExecutionOptions::default(), ServiceRegistry::for_tests());
    let mut early = handle.take_events().unwrap();

    // Read until the slow node starts, then attach the late subscriber
    // while it sleeps.
    let mut seen_before_attach = 0;
    loop {
        let event = early.next().await.expect("stream ended early");
        seen_before_attach += 1;
        if event.event_type == EventType::NodeStarted && event.node_id.as_deref() == Some("slow") {
            break;
        }
    }
    let late = bus.subscribe(&handle.execution_id);

    let late_events = drain(late).await;
    handle.wait().await;

    assert!(!late_events.is_empty());
    assert!(late_events[0].sequence >= seen_before_attach as u64);
    assert!(late_events.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(
        late_events.last().unwrap().event_type,
        EventType::ExecutionCompleted
    );
}

#[tokio::test]
async fn abort_cancels_in_flight_work() {
    // S6: abort while a long job is in flight.
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
  - id: slow
    type: code_job
    properties: { language: bash, code: "sleep 30" }
  - id: end
    type: end
arrows:
  - source: start
    target: slow
  - source: slow
    target: end
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let mut handle =
        engine.execute(diagram, ExecutionOptions::default(), ServiceRegistry::for_tests());
    let mut events = handle.take_events().unwrap();

    let mut collected = Vec::new();
    loop {
        let event = events.next().await.expect("stream ended early");
        let is_slow_start = event.event_type == EventType::NodeStarted
            && event.node_id.as_deref() == Some("slow");
        collected.push(event);
        if is_slow_start {
            break;
        }
    }

    handle.abort();
    while let Some(event) = events.next().await {
        let terminal = event.event_type == EventType::ExecutionAborted;
        collected.push(event);
        if terminal {
            break;
        }
    }

    let state = handle.wait().await;
    assert_eq!(state.status, ExecutionStatus::Aborted);
    assert_eq!(state.node_states["slow"].status, Status::Failed);
    assert_eq!(state.node_states["end"].status, Status::Pending);

    // No NODE_STARTED after the abort request.
    let aborted_at = collected
        .iter()
        .position(|e| e.event_type == EventType::ExecutionAborted)
        .unwrap();
    assert!(collected[aborted_at..]
        .iter()
        .all(|e| e.event_type != EventType::NodeStarted));
}

#[tokio::test]
async fn pause_suspends_dispatch_and_resume_continues() {
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
  - id: job
    type: code_job
    properties: { language: bash, code: "sleep 0.3; printf done" }
  - id: end
    type: end
arrows:
  - source: start
    target: job
  - source: job
    target: end
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let mut handle =
        engine.execute(diagram, ExecutionOptions::default(), ServiceRegistry::for_tests());
    let mut events = handle.take_events().unwrap();

    // Wait for the job to start, then pause.
    loop {
        let event = events.next().await.expect("stream ended early");
        if event.event_type == EventType::NodeStarted && event.node_id.as_deref() == Some("job") {
            break;
        }
    }
    handle.pause();

    // The running job finishes and its result is recorded, but `end` is not
    // dispatched while paused.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, ExecutionStatus::Paused);
    assert_eq!(snapshot.node_states["job"].status, Status::Completed);
    assert_eq!(snapshot.node_states["end"].status, Status::Pending);

    handle.resume();
    let state = handle.wait().await;
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.node_states["end"].status, Status::Completed);
}

#[tokio::test]
async fn start_only_diagram_completes() {
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
arrows: []
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let mut handle =
        engine.execute(diagram, ExecutionOptions::default(), ServiceRegistry::for_tests());
    let events = drain(handle.take_events().unwrap()).await;
    let state = handle.wait().await;

    assert_eq!(state.status, ExecutionStatus::Completed);
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::ExecutionStarted,
            EventType::NodeStarted,
            EventType::NodeCompleted,
            EventType::ExecutionCompleted,
        ]
    );
}

#[tokio::test]
async fn missing_required_input_fails_the_node() {
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
  - id: needy
    type: code_job
    properties: { language: bash, code: "printf ok" }
    required_inputs: [x]
arrows:
  - source: start
    target: needy
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let mut handle =
        engine.execute(diagram, ExecutionOptions::default(), ServiceRegistry::for_tests());
    let events = drain(handle.take_events().unwrap()).await;
    let state = handle.wait().await;

    assert_eq!(state.node_states["needy"].status, Status::Failed);
    assert_eq!(state.status, ExecutionStatus::Failed);

    let failed = events
        .iter()
        .find(|e| e.event_type == EventType::NodeFailed)
        .expect("NODE_FAILED event");
    assert_eq!(failed.data["error_type"], "InputResolutionError");
    assert!(failed.data["error"].as_str().unwrap().contains("'x'"));
}

#[tokio::test]
async fn failure_in_one_branch_does_not_stop_independent_branches() {
    // Two parallel arms from start; one fails, the other reaches an end
    // node, so the execution still completes.
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
  - id: bad
    type: code_job
    properties: { language: bash, code: "exit 7" }
  - id: good
    type: code_job
    properties: { language: bash, code: "printf fine" }
  - id: end
    type: end
arrows:
  - source: start
    target: bad
  - source: start
    target: good
  - source: good
    target: end
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let mut handle =
        engine.execute(diagram, ExecutionOptions::default(), ServiceRegistry::for_tests());
    let events = drain(handle.take_events().unwrap()).await;
    let state = handle.wait().await;

    assert_eq!(state.node_states["bad"].status, Status::Failed);
    assert_eq!(state.node_states["good"].status, Status::Completed);
    assert_eq!(state.node_states["end"].status, Status::Completed);
    assert_eq!(state.status, ExecutionStatus::Completed);

    // Subscribers saw the node failure followed by execution completion.
    assert!(events.iter().any(|e| e.event_type == EventType::NodeFailed));
    assert_eq!(
        events.last().unwrap().event_type,
        EventType::ExecutionCompleted
    );
}

#[tokio::test]
async fn execution_timeout_aborts_the_run() {
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
  - id: slow
    type: code_job
    properties: { language: bash, code: "sleep 30" }
arrows:
  - source: start
    target: slow
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let options = ExecutionOptions {
        timeout_seconds: Some(1),
        heartbeat_seconds: 1,
        ..Default::default()
    };
    let mut handle = engine.execute(diagram, options, ServiceRegistry::for_tests());
    let events = drain(handle.take_events().unwrap()).await;
    let state = handle.wait().await;

    assert_eq!(state.status, ExecutionStatus::Aborted);
    let aborted = events
        .iter()
        .find(|e| e.event_type == EventType::ExecutionAborted)
        .expect("EXECUTION_ABORTED event");
    assert!(aborted.data["reason"].as_str().unwrap().contains("exceeded"));
}

#[tokio::test]
async fn skip_signal_short_circuits_a_pending_node() {
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
  - id: gate
    type: code_job
    properties: { language: bash, code: "sleep 0.5" }
  - id: after
    type: code_job
    properties: { language: bash, code: "printf ran" }
  - id: end
    type: end
arrows:
  - source: start
    target: gate
  - source: gate
    target: after
  - source: after
    target: end
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let mut handle =
        engine.execute(diagram, ExecutionOptions::default(), ServiceRegistry::for_tests());

    // Skip `after` before it can run; its downstream resolves against the
    // null envelope and still executes.
    handle.skip_node("after");
    let events = drain(handle.take_events().unwrap()).await;
    let state = handle.wait().await;

    assert_eq!(state.node_states["after"].status, Status::Skipped);
    assert_eq!(state.node_states["after"].execution_count, 0);
    assert_eq!(state.node_states["end"].status, Status::Completed);
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert!(events.iter().any(|e| e.event_type == EventType::NodeSkipped));
}

#[tokio::test]
async fn hook_triggered_start_waits_for_matching_event() {
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
    properties:
      trigger_mode: hook
      hook_event: deploy
      hook_filters: { env: prod }
  - id: end
    type: end
arrows:
  - source: start
    target: end
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let mut handle =
        engine.execute(diagram, ExecutionOptions::default(), ServiceRegistry::for_tests());
    let events_stream = handle.take_events().unwrap();

    // A non-matching event must not release the start node.
    handle.send_hook_event("deploy", json!({"env": "dev"}));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.snapshot().node_states["start"].status, Status::Running);

    handle.send_hook_event("deploy", json!({"env": "prod", "version": "1.2.3"}));
    let _events = drain(events_stream).await;
    let state = handle.wait().await;

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.hook_event_data.unwrap()["version"], "1.2.3");

    let start_output = state.node_states["start"].output_envelope().unwrap();
    assert_eq!(
        start_output.as_json().unwrap()["hook_event"]["env"],
        "prod"
    );
}

#[tokio::test]
async fn initial_variables_flow_into_the_run() {
    let diagram = diagram(
        r#"
nodes:
  - id: start
    type: start
  - id: echo
    type: code_job
    properties: { language: bash, code: "printf '%s' \"$who\"" }
arrows:
  - source: start
    target: echo
    packing: spread
"#,
    );

    let engine = ExecutionEngine::with_builtins();
    let options = ExecutionOptions::default().with_variable("who", json!("dipeo"));
    let mut handle = engine.execute(diagram, options, ServiceRegistry::for_tests());
    let _events = drain(handle.take_events().unwrap()).await;
    let state = handle.wait().await;

    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(
        state.node_states["echo"].output_envelope().unwrap().as_text().unwrap(),
        "dipeo"
    );
}
