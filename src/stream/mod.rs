//! Stream Multiplexer (C7): per-process shell stream lifecycle, UTF-8
//! framing, fan-out to the event bus, and backpressure-driven pausing.
//!
//! The `tokio::select!` loop over an input channel and `channel.wait()` is
//! grounded directly on the teacher's SSH I/O task in `session.rs` (the
//! `SharedSshClient::new` constructor), generalized from "collect lines into
//! a prompt-detection buffer" to "decode incrementally and fan out on the
//! event bus", and extended with a parallel Telnet NVT loop since spec.md
//! §4.7 requires both transports.

pub mod framing;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, warn};
use russh::{Channel, ChannelMsg, client::Msg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};

use crate::backpressure::BackpressureController;
use crate::config::EngineConfig;
use crate::catalog::Protocol;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::pool::PooledClient;

use framing::IngressBuffer;

/// Callback invoked once a stream's I/O task ends, so the owning `Engine`
/// can release the backing `PooledClient` and cancel dependent transfers.
/// `intentional` reflects whether the close was requested by the user
/// (`StreamMultiplexer::close`) rather than a transport-level drop.
pub type OnStreamClosed = Arc<dyn Fn(String, u64, bool) + Send + Sync>;

/// A handle to a live or recently-closed shell stream.
struct StreamState {
    tab_id: String,
    input_tx: mpsc::Sender<Vec<u8>>,
    resize_tx: Option<mpsc::Sender<(u32, u32)>>,
    closed: Arc<AtomicBool>,
    intentional_close: Arc<AtomicBool>,
    backpressure: Arc<BackpressureController>,
}

/// Owns every live [`StreamState`], keyed by process id, and the
/// configuration knobs spec.md §3/§4.7 name for ingress framing.
pub struct StreamMultiplexer {
    events: EventBus,
    streams: Mutex<HashMap<u64, Arc<StreamState>>>,
    process_id_gen: AtomicU64,
    ingress_hard_cap: usize,
    ingress_pause_threshold: usize,
    pause_duration: std::time::Duration,
    initial_cols: u32,
    initial_rows: u32,
    backpressure_initial_credit: usize,
    backpressure_max_credit: usize,
    backpressure_throttle_ratio: f64,
    on_closed: Mutex<Option<OnStreamClosed>>,
}

impl StreamMultiplexer {
    pub fn new(events: EventBus, config: &EngineConfig) -> Self {
        Self {
            events,
            streams: Mutex::new(HashMap::new()),
            process_id_gen: AtomicU64::new(1),
            ingress_hard_cap: config.shell_ingress_hard_cap_bytes,
            ingress_pause_threshold: config.shell_ingress_pause_threshold_bytes,
            pause_duration: config.shell_pause_duration,
            initial_cols: config.shell_initial_cols,
            initial_rows: config.shell_initial_rows,
            backpressure_initial_credit: config.backpressure_initial_credit,
            backpressure_max_credit: config.backpressure_max_credit,
            backpressure_throttle_ratio: config.backpressure_throttle_ratio,
            on_closed: Mutex::new(None),
        }
    }

    /// Registers the callback invoked when any stream's I/O task ends.
    /// Set once by the `Engine` at construction time.
    pub async fn set_on_closed(&self, callback: OnStreamClosed) {
        *self.on_closed.lock().await = Some(callback);
    }

    /// Opens a shell stream over `client` (SSH `shell` channel with
    /// `xterm-256color`, or a raw Telnet NVT loop) and starts its I/O task.
    /// Returns the new process id.
    pub async fn open(&self, client: Arc<PooledClient>, tab_id: String) -> Result<u64> {
        let process_id = self.process_id_gen.fetch_add(1, Ordering::Relaxed);
        let on_closed = self.on_closed.lock().await.clone();
        let backpressure = Arc::new(BackpressureController::new(
            self.backpressure_initial_credit,
            self.backpressure_max_credit,
            self.backpressure_throttle_ratio,
        ));
        let closed = Arc::new(AtomicBool::new(false));
        let intentional_close = Arc::new(AtomicBool::new(false));

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(256);

        let state = match client.protocol {
            Protocol::Ssh => {
                let channel = client.open_ssh_channel().await?;
                channel
                    .request_pty(false, "xterm-256color", self.initial_cols, self.initial_rows, 0, 0, &[])
                    .await
                    .map_err(EngineError::from)?;
                channel.request_shell(false).await.map_err(EngineError::from)?;

                let (resize_tx, resize_rx) = mpsc::channel::<(u32, u32)>(8);

                self.spawn_ssh_loop(
                    process_id,
                    tab_id.clone(),
                    channel,
                    input_rx,
                    resize_rx,
                    closed.clone(),
                    intentional_close.clone(),
                    backpressure.clone(),
                    on_closed.clone(),
                );

                StreamState {
                    tab_id: tab_id.clone(),
                    input_tx,
                    resize_tx: Some(resize_tx),
                    closed,
                    intentional_close,
                    backpressure,
                }
            }
            Protocol::Telnet => {
                let stream = client.telnet_handle().await?;
                self.spawn_telnet_loop(
                    process_id,
                    tab_id.clone(),
                    stream,
                    input_rx,
                    closed.clone(),
                    intentional_close.clone(),
                    backpressure.clone(),
                    on_closed.clone(),
                );

                StreamState {
                    tab_id: tab_id.clone(),
                    input_tx,
                    resize_tx: None,
                    closed,
                    intentional_close,
                    backpressure,
                }
            }
        };

        self.streams.lock().await.insert(process_id, Arc::new(state));
        Ok(process_id)
    }

    /// Writes input bytes to the shell, reserving backpressure credit first.
    pub async fn write_input(&self, process_id: u64, data: &[u8]) -> Result<()> {
        let state = self.get(process_id).await?;
        state.backpressure.reserve(data.len()).await?;
        state
            .input_tx
            .send(data.to_vec())
            .await
            .map_err(|_| EngineError::ConnectionClosed)?;
        state.backpressure.acknowledge(data.len());
        Ok(())
    }

    /// Issues an SSH window-change request. A no-op on Telnet streams (no
    /// NAWS handshake is required by this engine).
    pub async fn resize(&self, process_id: u64, cols: u32, rows: u32) -> Result<()> {
        let state = self.get(process_id).await?;
        if let Some(resize_tx) = &state.resize_tx {
            resize_tx
                .send((cols, rows))
                .await
                .map_err(|_| EngineError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Closes a stream. `intentional` distinguishes a user-initiated close
    /// (which permits the backing `PooledClient` to be torn down) from an
    /// internal teardown during, e.g., engine shutdown.
    pub async fn close(&self, process_id: u64, intentional: bool) -> Result<()> {
        let state = self.get(process_id).await?;
        state.intentional_close.store(intentional, Ordering::Release);
        state.closed.store(true, Ordering::Release);
        state.backpressure.destroy();
        // Dropping the sender ends the I/O task's select loop on its next
        // iteration, which runs the shared close sequence below.
        self.streams.lock().await.remove(&process_id);
        Ok(())
    }

    async fn get(&self, process_id: u64) -> Result<Arc<StreamState>> {
        self.streams
            .lock()
            .await
            .get(&process_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("process {process_id}")))
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_ssh_loop(
        &self,
        process_id: u64,
        tab_id: String,
        mut channel: Channel<Msg>,
        mut input_rx: mpsc::Receiver<Vec<u8>>,
        mut resize_rx: mpsc::Receiver<(u32, u32)>,
        closed: Arc<AtomicBool>,
        intentional_close: Arc<AtomicBool>,
        backpressure: Arc<BackpressureController>,
        on_closed: Option<OnStreamClosed>,
    ) {
        let events = self.events.clone();
        let hard_cap = self.ingress_hard_cap;
        let pause_threshold = self.ingress_pause_threshold;
        let pause_duration = self.pause_duration;

        tokio::spawn(async move {
            let mut ingress = IngressBuffer::new(hard_cap, pause_threshold);
            loop {
                tokio::select! {
                    maybe_input = input_rx.recv() => {
                        match maybe_input {
                            Some(data) => {
                                if let Err(err) = channel.data(&data[..]).await {
                                    debug!("process {process_id}: write to shell failed: {err}");
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    Some((cols, rows)) = resize_rx.recv() => {
                        if let Err(err) = channel.window_change(cols, rows, 0, 0).await {
                            warn!("process {process_id}: resize failed: {err}");
                        }
                    }
                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { data }) => {
                                emit_chunk(&events, &mut ingress, process_id, &data, false, pause_duration).await;
                            }
                            Some(ChannelMsg::ExtendedData { data, .. }) => {
                                emit_chunk(&events, &mut ingress, process_id, &data, true, pause_duration).await;
                            }
                            Some(ChannelMsg::ExitStatus { exit_status }) => {
                                events.publish(EngineEvent::ProcessExit {
                                    process_id,
                                    code: Some(exit_status as i32),
                                    signal: None,
                                });
                            }
                            Some(ChannelMsg::Eof) | None => break,
                            _ => {}
                        }
                    }
                }
            }
            let intentional = intentional_close.load(Ordering::Acquire);
            finish_stream(&events, process_id, &tab_id, closed, intentional_close, backpressure).await;
            if let Some(callback) = on_closed {
                callback(tab_id, process_id, intentional);
            }
        });
    }

    fn spawn_telnet_loop(
        &self,
        process_id: u64,
        tab_id: String,
        stream: Arc<tokio::sync::Mutex<tokio::net::TcpStream>>,
        mut input_rx: mpsc::Receiver<Vec<u8>>,
        closed: Arc<AtomicBool>,
        intentional_close: Arc<AtomicBool>,
        backpressure: Arc<BackpressureController>,
        on_closed: Option<OnStreamClosed>,
    ) {
        let events = self.events.clone();
        let hard_cap = self.ingress_hard_cap;
        let pause_threshold = self.ingress_pause_threshold;
        let pause_duration = self.pause_duration;

        tokio::spawn(async move {
            let mut ingress = IngressBuffer::new(hard_cap, pause_threshold);
            let mut read_buf = [0u8; 4096];
            loop {
                let mut guard = stream.lock().await;
                tokio::select! {
                    maybe_input = input_rx.recv() => {
                        drop(guard);
                        match maybe_input {
                            Some(data) => {
                                let mut guard = stream.lock().await;
                                if let Err(err) = guard.write_all(&data).await {
                                    debug!("process {process_id}: telnet write failed: {err}");
                                    break;
                                }
                            }
                            None => break,
                        }
                        continue;
                    }
                    read_result = guard.read(&mut read_buf) => {
                        match read_result {
                            Ok(0) => { drop(guard); break; }
                            Ok(n) => {
                                let data = read_buf[..n].to_vec();
                                drop(guard);
                                emit_chunk(&events, &mut ingress, process_id, &data, false, pause_duration).await;
                            }
                            Err(err) => {
                                debug!("process {process_id}: telnet read failed: {err}");
                                drop(guard);
                                break;
                            }
                        }
                    }
                }
            }
            let intentional = intentional_close.load(Ordering::Acquire);
            finish_stream(&events, process_id, &tab_id, closed, intentional_close, backpressure).await;
            if let Some(callback) = on_closed {
                callback(tab_id, process_id, intentional);
            }
        });
    }
}

/// Feeds one chunk through the ingress framer and emits the decoded text
/// (or, for SSH extended data i.e. stderr, ANSI-red-wrapped text) on the
/// event bus; pauses the caller briefly when the pause threshold trips.
async fn emit_chunk(
    events: &EventBus,
    ingress: &mut IngressBuffer,
    process_id: u64,
    data: &[u8],
    is_stderr: bool,
    pause_duration: std::time::Duration,
) {
    let outcome = ingress.push(data);
    if outcome.overflowed {
        warn!("process {process_id}: ingress buffer overflow, dropping oldest bytes");
    }
    if !outcome.text.is_empty() {
        let text = if is_stderr {
            format!("\x1b[31m{}\x1b[0m", outcome.text)
        } else {
            outcome.text
        };
        events.publish(EngineEvent::ProcessOutput { process_id, text });
    }
    if outcome.should_pause {
        tokio::time::sleep(pause_duration).await;
    }
}

async fn finish_stream(
    events: &EventBus,
    process_id: u64,
    tab_id: &str,
    closed: Arc<AtomicBool>,
    intentional_close: Arc<AtomicBool>,
    backpressure: Arc<BackpressureController>,
) {
    closed.store(true, Ordering::Release);
    backpressure.destroy();
    events.publish(EngineEvent::ProcessOutput {
        process_id,
        text: "*** connection closed ***\n".to_string(),
    });
    events.publish(EngineEvent::ProcessExit {
        process_id,
        code: None,
        signal: None,
    });
    debug!(
        "process {process_id}: stream closed (tab {tab_id}, intentional={})",
        intentional_close.load(Ordering::Acquire)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn test_multiplexer() -> StreamMultiplexer {
        StreamMultiplexer::new(EventBus::new(16), &EngineConfig::default())
    }

    #[tokio::test]
    async fn write_input_on_unknown_process_id_is_not_found() {
        let mux = test_multiplexer();
        let err = mux.write_input(999, b"ls\n").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn resize_on_unknown_process_id_is_not_found() {
        let mux = test_multiplexer();
        let err = mux.resize(999, 80, 24).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn close_on_unknown_process_id_is_not_found() {
        let mux = test_multiplexer();
        let err = mux.close(999, true).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn emit_chunk_wraps_stderr_in_ansi_red() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let mut ingress = IngressBuffer::new(10 * 1024 * 1024, 1024 * 1024);
        emit_chunk(&events, &mut ingress, 1, b"boom", true, std::time::Duration::from_millis(0)).await;
        match rx.recv().await.unwrap() {
            EngineEvent::ProcessOutput { text, .. } => {
                assert_eq!(text, "\x1b[31mboom\x1b[0m");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn emit_chunk_emits_plain_text_for_stdout() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let mut ingress = IngressBuffer::new(10 * 1024 * 1024, 1024 * 1024);
        emit_chunk(&events, &mut ingress, 1, b"hello", false, std::time::Duration::from_millis(0)).await;
        match rx.recv().await.unwrap() {
            EngineEvent::ProcessOutput { text, .. } => assert_eq!(text, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
