//! Integration tests for history condensation with an HTTP reflector and
//! file-backed state

use consensus_escrow::budget::InMemoryLedger;
use consensus_escrow::condensation::{
    CondensationTrigger, JsonFilePersistence, LessonKind, MIN_RETAINED_ENTRIES,
};
use consensus_escrow::{AgentCore, AgentDeps, Config, HistoryEntry};
use serde_json::json;
use std::sync::Arc;

fn completion(content: &str) -> String {
    json!({"choices": [{"message": {"role": "assistant", "content": content}}]}).to_string()
}

fn config_for(server_url: &str, state_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.reflector.endpoint = format!("{}/v1/chat/completions", server_url);
    config.reflector.max_retries = 1;
    config.condensation.default_context_limit = 200;
    config.state_dir = Some(state_dir.to_path_buf());
    config
}

#[tokio::test]
async fn test_requested_condensation_learns_and_persists() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(completion(
            r#"{"lessons": [{"type": "factual", "content": "The staging database is read-only"}],
                "state": {"summary": "migrations blocked on staging"}}"#,
        ))
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server.url(), dir.path());
    let deps = AgentDeps::from_config(&config, Arc::new(InMemoryLedger::new())).unwrap();
    let mut agent = AgentCore::root("agent-7", None, deps);

    agent.record_entry("model-a", HistoryEntry::user("Run the migrations on staging"));
    agent.record_entry("model-a", HistoryEntry::assistant("Running migrations"));
    agent.record_entry("model-a", HistoryEntry::user("Error: database is read-only"));

    let outcome = agent
        .after_model_response("model-a", r#"{"action": "wait", "condense": 2}"#)
        .await;
    mock.assert_async().await;

    let report = outcome.report().unwrap();
    assert!(report.reflected);
    assert!(report.persisted);
    assert_eq!(report.discarded, 2);
    assert_eq!(report.lessons_added, 1);

    let state = agent.state();
    assert_eq!(state.history("model-a").len(), 2);
    assert_eq!(state.lessons("model-a")[0].kind, LessonKind::Factual);
    assert_eq!(
        state.model_state("model-a"),
        Some(&json!({"summary": "migrations blocked on staging"}))
    );

    let stored = JsonFilePersistence::new(dir.path())
        .load("agent-7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&stored, state);
}

#[tokio::test]
async fn test_reflector_outage_still_condenses() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(503)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server.url(), dir.path());
    let deps = AgentDeps::from_config(&config, Arc::new(InMemoryLedger::new())).unwrap();
    let mut agent = AgentCore::root("agent-8", None, deps);

    for i in 0..6 {
        agent.record_entry("model-a", HistoryEntry::user(format!("step {}", i)));
    }

    let outcome = agent.condense("model-a", 100).await;
    let report = outcome.report().unwrap();
    assert!(!report.reflected);
    assert_eq!(report.kept, MIN_RETAINED_ENTRIES);
    assert!(agent.state().lessons("model-a").is_empty());
}

#[tokio::test]
async fn test_token_overflow_before_round() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for("http://127.0.0.1:9", dir.path());
    config.reflector.enabled = false;
    config.condensation.context_limits.insert("tiny".to_string(), 20);

    let deps = AgentDeps::from_config(&config, Arc::new(InMemoryLedger::new())).unwrap();
    let mut agent = AgentCore::root("agent-9", None, deps);

    let long = "lorem ipsum ".repeat(20);
    for _ in 0..5 {
        agent.record_entry("tiny", HistoryEntry::user(long.as_str()));
    }
    agent.record_entry("roomy", HistoryEntry::user("hello"));

    let outcomes = agent.before_round().await;
    assert_eq!(outcomes.len(), 2);

    let (model, outcome) = &outcomes[0];
    assert_eq!(model, "tiny");
    let report = outcome.report().unwrap();
    assert!(matches!(report.trigger, CondensationTrigger::TokenOverflow { .. }));
    assert!(agent.state().history("tiny").len() >= MIN_RETAINED_ENTRIES);
    assert!(agent.state().history("tiny").len() < 5);

    assert!(!outcomes[1].1.is_condensed());
    assert_eq!(agent.state().history("roomy").len(), 1);
}
