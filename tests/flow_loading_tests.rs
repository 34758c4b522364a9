use std::io::Write;
use std::sync::Arc;

use serde_json::json;

use chatflow::{
    load_flows_from_file, ChatFlowError, EngineConfig, EngineOutcome, ExecutionPhase, FlowEngine,
    InboundEvent, InboundPayload, NewTrigger, RecordingGateway, TriggerFilter, TriggerKind,
    TriggerMatcher,
};

const BUNDLE: &str = r#"{
    "flows": [
        {
            "id": "onboarding",
            "name": "Onboarding",
            "start": "start",
            "nodes": [
                {"id": "start", "type": "start", "edges": {"default": "ask"}},
                {"id": "ask", "type": "question",
                 "config": {"prompt": "Your email?", "variable": "email", "expected": "email"},
                 "edges": {"default": "thanks"}},
                {"id": "thanks", "type": "message", "config": {"text": "Saved {{email}}"}}
            ]
        },
        {
            "id": "reminder",
            "start": "start",
            "nodes": [
                {"id": "start", "type": "start", "edges": {"default": "nudge"}},
                {"id": "nudge", "type": "message", "config": {"text": "Daily reminder"}}
            ]
        }
    ]
}"#;

#[test]
fn bundle_file_loads_every_flow() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(BUNDLE.as_bytes())?;

    let flows = load_flows_from_file(file.path())?;
    let ids: Vec<&str> = flows.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["onboarding", "reminder"]);
    assert_eq!(flows[0].name.as_deref(), Some("Onboarding"));
    Ok(())
}

#[test]
fn missing_file_is_a_config_error() {
    let err = load_flows_from_file("/nonexistent/chatflow/flows.json").unwrap_err();
    assert!(matches!(err, ChatFlowError::Config(_)));
}

#[test]
fn publishing_rejects_broken_flow() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    let broken = json!({
        "id": "broken",
        "start": "nowhere",
        "nodes": [
            {"id": "a", "type": "condition", "config": {"predicates": []}}
        ]
    });
    file.write_all(broken.to_string().as_bytes())?;

    let flows = load_flows_from_file(file.path())?;
    let engine = FlowEngine::new(EngineConfig::default());
    match engine.publish(flows.into_iter().next().expect("one flow")) {
        Err(ChatFlowError::Validation { flow, problems }) => {
            assert_eq!(flow, "broken");
            assert!(problems.len() >= 2, "problems: {problems:?}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(engine.flows().get("broken").is_none());
    Ok(())
}

#[tokio::test]
async fn loaded_bundle_runs_with_triggers() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(BUNDLE.as_bytes())?;

    let gateway = Arc::new(RecordingGateway::new());
    let engine = FlowEngine::new(EngineConfig::default()).with_gateway(gateway.clone());
    for flow in load_flows_from_file(file.path())? {
        engine.publish(flow)?;
    }
    engine
        .triggers()
        .create(NewTrigger::new("onboarding", TriggerMatcher::keywords(["start"])))?;
    engine.triggers().create(NewTrigger::new(
        "reminder",
        TriggerMatcher::Scheduled {
            schedule: "daily".into(),
        },
    ))?;

    engine
        .handle_event(InboundEvent::text("c1", "Start please"))
        .await?;
    let outcome = engine
        .handle_event(InboundEvent::text("c1", "  Ana@Example.COM "))
        .await?;
    assert_eq!(
        outcome,
        EngineOutcome::Advanced {
            flow_id: "onboarding".into(),
            phase: ExecutionPhase::Completed,
        }
    );
    assert_eq!(
        gateway.sent_texts(),
        vec!["Your email?", "Saved ana@example.com"]
    );

    let outcome = engine
        .handle_event(InboundEvent::new(
            "c1",
            InboundPayload::Scheduled {
                schedule: "daily".into(),
            },
        ))
        .await?;
    assert!(matches!(outcome, EngineOutcome::Advanced { ref flow_id, .. } if flow_id == "reminder"));

    let scheduled = engine.triggers().list(&TriggerFilter {
        kind: Some(TriggerKind::Scheduled),
        ..TriggerFilter::default()
    });
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].stats().trigger_count, 1);
    Ok(())
}
