//! Integration tests exercising the public `termharbor_core` API without a
//! live network, mirroring the teacher's fixture-replay style: the Event Bus
//! recording sink stands in for the teacher's `SessionRecorder`/
//! `SessionReplayer` JSONL round-trip, and the `Engine` paths below are
//! exactly the ones that fail fast before ever touching a transport.

use termharbor_core::catalog::{AuthMode, CatalogNode, ConnectionSpec, Credential, Protocol};
use termharbor_core::config::EngineConfig;
use termharbor_core::error::EngineError;
use termharbor_core::events::{EngineEvent, EventBus};
use termharbor_core::Engine;

fn sample_spec(id: &str) -> ConnectionSpec {
    ConnectionSpec {
        id: id.to_string(),
        name: "demo".to_string(),
        protocol: Protocol::Ssh,
        host: "203.0.113.10".to_string(),
        port: 22,
        username: Some("demo".to_string()),
        credential: Credential {
            password: Some("hunter2".to_string()),
            private_key_path: None,
        },
        auth_mode: AuthMode::Password,
        proxy: None,
        keep_alive_interval_secs: None,
        security_level: Default::default(),
    }
}

async fn test_engine() -> std::sync::Arc<Engine> {
    let dir = tempfile::tempdir().expect("tempdir");
    Engine::new(EngineConfig::default(), dir.path().to_path_buf())
        .await
        .expect("engine construction")
}

#[tokio::test]
async fn engine_rejects_operations_on_an_unknown_tab() {
    let engine = test_engine().await;

    let err = engine.write_input(1, b"show version\n").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = engine.resize(1, 80, 24).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = engine.delete_remote_path("tab-x", "/etc/passwd").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn catalog_load_emits_a_connections_changed_event() {
    let engine = test_engine().await;
    let mut events = engine.subscribe_events();

    engine.load_catalog(vec![CatalogNode::Connection {
        spec: sample_spec("router-1"),
    }]);

    let event = events.recv().await.expect("event");
    assert!(matches!(event, EngineEvent::ConnectionsChanged));
    assert_eq!(engine.catalog_tree().len(), 1);
}

#[tokio::test]
async fn credential_update_is_idempotent_and_only_notifies_on_real_change() {
    let engine = test_engine().await;
    engine.load_catalog(vec![CatalogNode::Connection {
        spec: sample_spec("router-1"),
    }]);

    let same = Credential {
        password: Some("hunter2".to_string()),
        private_key_path: None,
    };
    let changed = engine
        .update_connection_credentials("router-1", same)
        .expect("update");
    assert!(!changed);

    let different = Credential {
        password: Some("correcthorse".to_string()),
        private_key_path: None,
    };
    let changed = engine
        .update_connection_credentials("router-1", different)
        .expect("update");
    assert!(changed);
}

#[tokio::test]
async fn shutdown_is_idempotent_with_no_sessions_open() {
    let engine = test_engine().await;
    engine.shutdown().await;
    engine.shutdown().await;
}

/// Stands in for the teacher's `tests/replay_fixtures.rs` JSONL round-trip:
/// instead of replaying a fixture recorded from a device session, this
/// records live bus traffic and verifies the serialized log reparses to an
/// equivalent sequence of events.
#[test]
fn event_bus_recording_round_trips_through_jsonl() {
    let bus = EventBus::new(32);
    bus.start_recording();

    bus.publish(EngineEvent::TabConnectionStatus {
        tab_id: "tab-1".to_string(),
        status: termharbor_core::events::ConnectionStatus::Connecting,
        quality: None,
        protocol: Some("ssh".to_string()),
    });
    bus.publish(EngineEvent::SftpTransferStart {
        transfer_id: "xfer-1".to_string(),
        total_bytes: 4096,
    });
    bus.publish(EngineEvent::SftpTransferComplete {
        transfer_id: "xfer-1".to_string(),
        checksum: Some("deadbeef".to_string()),
    });

    let jsonl = bus.to_jsonl();
    assert_eq!(jsonl.lines().count(), 3);

    let replayed: Vec<EngineEvent> = jsonl
        .lines()
        .map(|line| {
            let parsed: serde_json::Value = serde_json::from_str(line).expect("parse line");
            serde_json::from_value(parsed["event"].clone()).expect("parse event")
        })
        .collect();

    assert!(matches!(replayed[0], EngineEvent::TabConnectionStatus { .. }));
    assert!(matches!(
        replayed[2],
        EngineEvent::SftpTransferComplete { ref checksum, .. } if checksum.as_deref() == Some("deadbeef")
    ));
}
