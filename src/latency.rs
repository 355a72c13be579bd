//! Latency Prober (C8): scheduled and on-demand round-trip measurement for
//! pooled SSH/Telnet clients.
//!
//! The periodic-task-per-resource shape is grounded on the teacher's spawned
//! worker loop in `session/manager.rs` (one `tokio::spawn` per cached
//! connection, driven by a `tokio::select!` over a command channel and a
//! timer), generalized here from "drain commands" to "probe on an interval or
//! on demand", since latency probing has no command payload of its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::{Mutex, mpsc};

use crate::catalog::{ConnectionKey, Protocol};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus, LatencyClass};
use crate::pool::{ConnectionPool, PooledClient};

/// Status of the most recent probe for a session, per spec.md §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Ok,
    Checking,
    Error,
    Offline,
}

/// Rolling per-session latency state. `samples_ms` is a bounded ring buffer
/// (newest last) capped at the configured window size, used only for trend
/// reporting — the engine does not currently expose trend directly, but
/// keeping it here avoids re-deriving it if the UI layer asks for it later.
struct ProbeState {
    tab_id: String,
    key: ConnectionKey,
    host: String,
    port: u16,
    last_sample_ms: Option<u64>,
    last_check: Option<Instant>,
    status: ProbeStatus,
    samples_ms: Vec<u64>,
    window_size: usize,
}

impl ProbeState {
    fn record(&mut self, sample_ms: u64) {
        self.last_sample_ms = Some(sample_ms);
        self.last_check = Some(Instant::now());
        self.status = ProbeStatus::Ok;
        self.samples_ms.push(sample_ms);
        if self.samples_ms.len() > self.window_size {
            self.samples_ms.remove(0);
        }
    }

    fn record_error(&mut self, status: ProbeStatus) {
        self.last_check = Some(Instant::now());
        self.status = status;
    }
}

/// Drives periodic and on-demand RTT probes for every registered session,
/// publishing `latency:updated|error|disconnected` on the event bus.
pub struct LatencyProber {
    pool: Arc<ConnectionPool>,
    events: EventBus,
    probe_interval: Duration,
    window_size: usize,
    sessions: Mutex<HashMap<String, Arc<Mutex<ProbeState>>>>,
    on_demand: mpsc::Sender<String>,
}

impl LatencyProber {
    /// Builds the prober and spawns its background scheduling loop. The
    /// returned `mpsc::Sender` half lives inside `self` for `probe_now`; the
    /// receiver is consumed by the spawned loop.
    pub fn new(pool: Arc<ConnectionPool>, events: EventBus, probe_interval: Duration, window_size: usize) -> Arc<Self> {
        let (on_demand_tx, on_demand_rx) = mpsc::channel(32);
        let prober = Arc::new(Self {
            pool,
            events,
            probe_interval,
            window_size,
            sessions: Mutex::new(HashMap::new()),
            on_demand: on_demand_tx,
        });
        prober.clone().spawn_loop(on_demand_rx);
        prober
    }

    /// Registers a tab for periodic probing against `key`. Idempotent: a
    /// second registration for the same tab replaces its tracked key.
    pub async fn register(&self, tab_id: String, key: ConnectionKey, host: String, port: u16) {
        let state = ProbeState {
            tab_id: tab_id.clone(),
            key,
            host,
            port,
            last_sample_ms: None,
            last_check: None,
            status: ProbeStatus::Checking,
            samples_ms: Vec::new(),
            window_size: self.window_size,
        };
        self.sessions
            .lock()
            .await
            .insert(tab_id, Arc::new(Mutex::new(state)));
    }

    /// Stops probing a tab, e.g. on session close. Mirrors spec.md §5's
    /// "cancellation of a Session cancels its latency probe".
    pub async fn unregister(&self, tab_id: &str) {
        self.sessions.lock().await.remove(tab_id);
    }

    /// Enqueues an immediate probe for `tab_id` outside the periodic
    /// schedule. A no-op if the tab is not registered.
    pub async fn probe_now(&self, tab_id: &str) {
        let _ = self.on_demand.send(tab_id.to_string()).await;
    }

    fn spawn_loop(self: Arc<Self>, mut on_demand_rx: mpsc::Receiver<String>) {
        let interval = self.probe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.probe_all().await;
                    }
                    Some(tab_id) = on_demand_rx.recv() => {
                        self.probe_one_by_tab(&tab_id).await;
                    }
                }
            }
        });
    }

    async fn probe_all(&self) {
        let tab_ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for tab_id in tab_ids {
            self.probe_one_by_tab(&tab_id).await;
        }
    }

    async fn probe_one_by_tab(&self, tab_id: &str) {
        let Some(state) = self.sessions.lock().await.get(tab_id).cloned() else {
            return;
        };
        let (host, port, key) = {
            let guard = state.lock().await;
            (guard.host.clone(), guard.port, guard.key.clone())
        };

        let Some(client) = self.pool.get(&key) else {
            let mut guard = state.lock().await;
            guard.record_error(ProbeStatus::Offline);
            self.events.publish(EngineEvent::LatencyDisconnected {
                tab_id: tab_id.to_string(),
                host,
                port,
            });
            return;
        };

        match probe_round_trip(&client).await {
            Ok(elapsed) => {
                let latency_ms = elapsed.as_millis() as u64;
                let mut guard = state.lock().await;
                guard.record(latency_ms);
                let last_check_ms = guard
                    .last_check
                    .map(|_| now_ms())
                    .unwrap_or_else(now_ms);
                self.events.publish(EngineEvent::LatencyUpdated {
                    tab_id: tab_id.to_string(),
                    host,
                    port,
                    latency_ms,
                    status: LatencyClass::classify(latency_ms),
                    last_check_ms,
                });
            }
            Err(err) => {
                warn!("latency: probe for tab {tab_id} ({host}:{port}) failed: {err}");
                let mut guard = state.lock().await;
                guard.record_error(ProbeStatus::Error);
                self.events.publish(EngineEvent::LatencyError {
                    tab_id: tab_id.to_string(),
                    host,
                    port,
                    message: err.to_string(),
                });
            }
        }
    }
}

/// Times a minimal channel round trip: open a session channel (SSH) or a
/// zero-length write probe (Telnet), then tear it down immediately. This is
/// the "keepalive or no-op exec" spec.md §4.8 calls for — it exercises the
/// transport without running any remote command.
async fn probe_round_trip(client: &Arc<PooledClient>) -> Result<Duration> {
    let start = Instant::now();
    match client.protocol {
        Protocol::Ssh => {
            let channel = client.open_ssh_channel().await?;
            channel.close().await.map_err(EngineError::from)?;
        }
        Protocol::Telnet => {
            use tokio::io::AsyncWriteExt;
            let stream = client.telnet_handle().await?;
            let mut guard = stream.lock().await;
            // IAC NOP: a byte pair every Telnet peer must silently discard,
            // so this exercises the socket round trip without side effects.
            guard.write_all(&[0xFFu8, 0xF1]).await.map_err(EngineError::from)?;
            guard.flush().await.map_err(EngineError::from)?;
        }
    }
    Ok(start.elapsed())
}

fn now_ms() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_state_window_stays_bounded() {
        let mut state = ProbeState {
            tab_id: "t".to_string(),
            key: ConnectionKey::from_parts(Protocol::Ssh, "h", 22, None, None),
            host: "h".to_string(),
            port: 22,
            last_sample_ms: None,
            last_check: None,
            status: ProbeStatus::Checking,
            samples_ms: Vec::new(),
            window_size: 3,
        };
        for sample in [10, 20, 30, 40, 50] {
            state.record(sample);
        }
        assert_eq!(state.samples_ms, vec![30, 40, 50]);
        assert_eq!(state.last_sample_ms, Some(50));
        assert_eq!(state.status, ProbeStatus::Ok);
    }

    #[test]
    fn probe_state_error_preserves_last_sample() {
        let mut state = ProbeState {
            tab_id: "t".to_string(),
            key: ConnectionKey::from_parts(Protocol::Ssh, "h", 22, None, None),
            host: "h".to_string(),
            port: 22,
            last_sample_ms: None,
            last_check: None,
            status: ProbeStatus::Checking,
            samples_ms: Vec::new(),
            window_size: 10,
        };
        state.record(42);
        state.record_error(ProbeStatus::Error);
        assert_eq!(state.last_sample_ms, Some(42));
        assert_eq!(state.status, ProbeStatus::Error);
    }
}
