//! Event Bus (C11): typed event emission to the UI transport.
//!
//! Generalizes the teacher's `SessionRecorder`/`SessionReplayer` JSONL pattern
//! (`session/recording.rs`) from a single-session command log into a
//! process-wide typed bus with one broadcast channel per engine. Every
//! variant below corresponds to a wire channel named in the design spec's
//! external interface table; the `kind` tag is the canonical channel name for
//! on-disk/recorded inspection.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use tokio::sync::broadcast;

/// One payload for every channel the engine can emit toward the UI transport.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    /// `process:output:{id}` — decoded UTF-8 text for a shell process.
    ProcessOutput { process_id: u64, text: String },
    /// `process:exit:{id}`.
    ProcessExit {
        process_id: u64,
        code: Option<i32>,
        signal: Option<String>,
    },
    /// `tab-connection-status`.
    TabConnectionStatus {
        tab_id: String,
        status: ConnectionStatus,
        quality: Option<LatencyClass>,
        protocol: Option<String>,
    },
    /// `top-connections-changed`.
    TopConnectionsChanged { connection_ids: Vec<String> },
    /// `connections-changed` — catalog mutated.
    ConnectionsChanged,
    /// `ssh:auth-request` — engine asks the UI transport for credentials.
    AuthRequest {
        request_id: String,
        tab_id: String,
        step: AuthStep,
        host: String,
        port: u16,
        fingerprint: Option<String>,
        fingerprint_changed: bool,
        require_credentials: bool,
        existing_username: Option<String>,
        is_retry: bool,
        error_message: Option<String>,
    },
    /// `sftp:transferStart`.
    SftpTransferStart { transfer_id: String, total_bytes: u64 },
    /// `sftp:transferProgress`.
    SftpTransferProgress {
        transfer_id: String,
        percent: f64,
        bytes_transferred: u64,
        total_bytes: u64,
        current_chunk: u64,
        total_chunks: u64,
        throughput_bytes_per_sec: f64,
    },
    /// `sftp:transferComplete`.
    SftpTransferComplete { transfer_id: String, checksum: Option<String> },
    /// `sftp:transferError`.
    SftpTransferError { transfer_id: String, message: String },
    /// `sftp:transferCancelled`.
    SftpTransferCancelled { transfer_id: String },
    /// `latency:updated`.
    LatencyUpdated {
        tab_id: String,
        host: String,
        port: u16,
        latency_ms: u64,
        status: LatencyClass,
        last_check_ms: u128,
    },
    /// `latency:error`.
    LatencyError { tab_id: String, host: String, port: u16, message: String },
    /// `latency:disconnected`.
    LatencyDisconnected { tab_id: String, host: String, port: u16 },
}

/// Connection status reported alongside `tab-connection-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Offline,
    Error,
}

/// Authentication step conveyed in an `ssh:auth-request` event, per the
/// "hostVerify" step described in the glossary: fingerprint approval and
/// missing credentials are solicited together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthStep {
    HostVerify,
    Credentials,
}

/// Latency classification thresholds: ≤50 excellent, ≤100 good, ≤200 fair,
/// ≤500 poor, otherwise bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    Excellent,
    Good,
    Fair,
    Poor,
    Bad,
}

impl LatencyClass {
    pub fn classify(latency_ms: u64) -> Self {
        match latency_ms {
            0..=50 => LatencyClass::Excellent,
            51..=100 => LatencyClass::Good,
            101..=200 => LatencyClass::Fair,
            201..=500 => LatencyClass::Poor,
            _ => LatencyClass::Bad,
        }
    }
}

/// A recorded event with a millisecond timestamp, for the optional JSONL sink.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RecordedEvent {
    pub ts_ms: u128,
    pub event: EngineEvent,
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Process-wide typed event bus. Cloning shares the same broadcast channel
/// and recording sink; this is the explicit handle the design spec calls for
/// in place of a global singleton.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    recorder: Arc<Mutex<Option<Vec<RecordedEvent>>>>,
}

impl EventBus {
    /// Creates a bus with the given broadcast channel capacity. Subscribers
    /// that fall behind this many events will observe a `Lagged` error on
    /// their next receive rather than blocking the publisher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            recorder: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribes to the bus. Each subscriber gets every event published
    /// after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. A publish with no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        if let Ok(mut guard) = self.recorder.lock()
            && let Some(log) = guard.as_mut()
        {
            log.push(RecordedEvent {
                ts_ms: now_ms(),
                event: event.clone(),
            });
        }
        let _ = self.sender.send(event);
    }

    /// Enables in-memory recording of every published event from this point
    /// forward. Mirrors the teacher's `SessionRecorder` but at bus scope.
    pub fn start_recording(&self) {
        if let Ok(mut guard) = self.recorder.lock() {
            *guard = Some(Vec::new());
        }
    }

    /// Stops recording and clears any buffered events.
    pub fn stop_recording(&self) {
        if let Ok(mut guard) = self.recorder.lock() {
            *guard = None;
        }
    }

    /// Snapshot of recorded events so far, oldest first.
    pub fn recorded_events(&self) -> Vec<RecordedEvent> {
        self.recorder
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Serializes the current recording as JSONL, one event per line.
    pub fn to_jsonl(&self) -> String {
        self.recorded_events()
            .iter()
            .filter_map(|entry| serde_json::to_string(entry).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_thresholds() {
        assert_eq!(LatencyClass::classify(10), LatencyClass::Excellent);
        assert_eq!(LatencyClass::classify(50), LatencyClass::Excellent);
        assert_eq!(LatencyClass::classify(51), LatencyClass::Good);
        assert_eq!(LatencyClass::classify(100), LatencyClass::Good);
        assert_eq!(LatencyClass::classify(150), LatencyClass::Fair);
        assert_eq!(LatencyClass::classify(500), LatencyClass::Poor);
        assert_eq!(LatencyClass::classify(501), LatencyClass::Bad);
    }

    #[tokio::test]
    async fn publish_is_received_by_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::ConnectionsChanged);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::ConnectionsChanged));
    }

    #[tokio::test]
    async fn recording_captures_published_events_in_order() {
        let bus = EventBus::new(16);
        bus.start_recording();
        bus.publish(EngineEvent::ProcessOutput {
            process_id: 1,
            text: "a".to_string(),
        });
        bus.publish(EngineEvent::ProcessOutput {
            process_id: 1,
            text: "b".to_string(),
        });
        let recorded = bus.recorded_events();
        assert_eq!(recorded.len(), 2);
        let jsonl = bus.to_jsonl();
        assert_eq!(jsonl.lines().count(), 2);
    }

    #[test]
    fn stop_recording_clears_buffer() {
        let bus = EventBus::new(16);
        bus.start_recording();
        bus.publish(EngineEvent::ConnectionsChanged);
        bus.stop_recording();
        assert!(bus.recorded_events().is_empty());
    }
}
