//! Mission brief exchange over a real WebSocket and its effect on a boot run.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use common::{component, fast_options, no_abort, Harness};
use razar_core::recovery::RecoveryAction;
use razar_core::{
    BootConfig, BootOptions, CapabilityRequirement, CrownHandshake, CrownTransport,
    HandshakeError, MissionBrief, RecoveryManager, StaticProbe, WsCrownTransport,
};
use razar_state::{
    BootState, InvocationKind, InvocationLog, JsonDocument, JsonlLog, TranscriptEntry,
    TranscriptRole,
};

/// Accept one connection, capture the brief, answer with `reply`.
async fn one_shot_crown(reply: Value) -> (String, tokio::task::JoinHandle<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let brief = match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };
        ws.send(Message::Text(reply.to_string())).await.unwrap();
        let _ = ws.next().await;
        brief
    });
    (url, task)
}

fn crown(h: &Harness, url: &str) -> CrownHandshake {
    CrownHandshake::new(
        Arc::new(WsCrownTransport::new(url, Duration::from_secs(5))),
        Arc::new(JsonlLog::new(&h.settings.transcript_path)),
        &h.settings.brief_archive_dir,
        RecoveryManager::new(&h.settings.recovery_dir),
    )
    .with_identity(Some(json!("fp-1234")))
}

fn config() -> BootConfig {
    let mut db = component("db");
    db.priority = 0;
    let mut api = component("api");
    api.priority = 1;
    BootConfig {
        components: vec![db, api],
        capabilities: vec![CapabilityRequirement {
            name: "coder".to_string(),
            launch: vec!["true".to_string()],
        }],
    }
}

#[tokio::test]
async fn brief_round_trip_over_websocket() {
    let h = Harness::new(&["primary"]);
    let (url, server) = one_shot_crown(json!({
        "ack": "ready",
        "capabilities": ["GLM-4.1V"],
        "downtime": {"api": {"patch": "restart worker"}, "db": null}
    }))
    .await;

    let hs = crown(&h, &url);
    let brief = MissionBrief::for_config(&config(), &["legacy".to_string()]);
    let response = hs.perform(&brief).await.unwrap();

    let sent = server.await.unwrap();
    assert_eq!(sent["priority_map"]["db"], 0);
    assert_eq!(sent["priority_map"]["api"], 1);
    assert_eq!(sent["open_issues"], json!(["legacy"]));

    assert_eq!(response.ack, "ready");
    assert_eq!(response.identity, Some(json!({"value": "fp-1234"})));

    let transcript: Vec<TranscriptEntry> = JsonlLog::new(&h.settings.transcript_path)
        .read_all()
        .unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, TranscriptRole::Razar);
    assert_eq!(transcript[1].role, TranscriptRole::Crown);
    assert_eq!(transcript[1].identity, Some(json!({"value": "fp-1234"})));

    let archived: Vec<String> = std::fs::read_dir(&h.settings.brief_archive_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(archived.iter().filter(|n| n.ends_with("_response.json")).count(), 1);
    assert_eq!(archived.iter().filter(|n| n.ends_with("_api_patch.json")).count(), 1);
    assert!(!archived.iter().any(|n| n.ends_with("_db_patch.json")));

    // Both components get shutdown/resume; only api gets a patch request.
    let recovery = RecoveryManager::new(&h.settings.recovery_dir);
    for comp in ["api", "db"] {
        assert!(recovery
            .request_path(comp, RecoveryAction::Shutdown)
            .exists());
        assert!(recovery
            .request_path(comp, RecoveryAction::Resume)
            .exists());
    }
    assert!(recovery
        .request_path("api", RecoveryAction::Patch)
        .exists());
    assert!(!recovery
        .request_path("db", RecoveryAction::Patch)
        .exists());
}

#[tokio::test]
async fn unreachable_crown_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let transport = WsCrownTransport::new(url, Duration::from_secs(2));
    let err = transport.exchange("{}".to_string()).await.unwrap_err();
    assert!(matches!(
        err,
        HandshakeError::Connect { .. } | HandshakeError::Timeout(_)
    ));
}

#[tokio::test]
async fn missing_url_is_rejected_up_front() {
    assert!(matches!(
        WsCrownTransport::from_url(Some("  "), Duration::from_secs(1)),
        Err(HandshakeError::MissingUrl)
    ));
}

#[tokio::test]
async fn successful_handshake_records_state_and_launches_missing_capabilities() {
    let mut h = Harness::new(&["primary"]);
    h.register_probe("db", Arc::new(StaticProbe::new(true)));
    h.register_probe("api", Arc::new(StaticProbe::new(true)));
    let (url, server) = one_shot_crown(json!({
        "ack": "ok",
        "capabilities": ["GLM-4.1V"],
        "downtime": {}
    }))
    .await;

    let options = BootOptions {
        handshake: true,
        ..fast_options()
    };
    let orch = h.orchestrator(options, Some(crown(&h, &url)), no_abort());
    let report = orch.boot(&config()).await.unwrap();
    server.await.unwrap();

    assert!(report.succeeded());
    let response = report.handshake.unwrap();
    assert_eq!(response.capabilities, vec!["GLM-4.1V".to_string()]);

    let state: BootState = JsonDocument::new(&h.settings.state_path).load().unwrap();
    assert_eq!(state.capabilities, vec!["GLM-4.1V".to_string()]);
    assert_eq!(state.launched_models, vec!["coder".to_string()]);
    assert!(state.last_handshake.is_some());
    assert!(state
        .events
        .iter()
        .any(|e| e.step == "model_launch" && e.status == "success"));

    for comp in ["db", "api"] {
        let events = h.events.events_for(comp).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, InvocationKind::Handshake);
        assert!(events[0].error.is_none());
    }
}
