//! SFTP Transfer Engine (C9): queued, resumable file transfers over a
//! pooled SSH client's SFTP subsystem.
//!
//! The queue/active-set/per-item-task shape is grounded on the teacher's
//! `session/manager.rs` worker pattern (a bounded set of live workers,
//! spawned lazily, draining a shared queue), generalized here from "one
//! worker per cached connection" to "one task per in-flight TransferRecord,
//! bounded by `max_concurrent_transfers`". Chunks are read as fixed-size
//! byte buffers rather than the teacher's line-oriented fixture reads,
//! since SFTP payloads aren't newline-delimited.

pub mod journal;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use sha2::{Digest, Sha256};
use tokio::fs::File as LocalFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, watch};

use crate::backpressure::BackpressureController;
use crate::catalog::ConnectionKey;
use crate::config::{EngineConfig, chunk_size_for};
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::events::EventBus;
use crate::memory::BlockId;
use crate::pool::ConnectionPool;

use journal::ResumeJournal;

/// Kind of transfer a [`TransferRecord`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Upload,
    Download,
    Copy,
}

/// Lifecycle state of a transfer, per spec.md §4.9's state diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Preparing,
    Transferring,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// One entry in a [`TransferRecord`]'s bounded chunk ledger, used to resume
/// after a crash without re-deriving throughput history.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChunkLedgerEntry {
    pub chunk_index: u64,
    pub bytes: u64,
    pub at_ms: u128,
}

/// Durable, resumable description of one file transfer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub kind: TransferKind,
    pub local_path: String,
    pub remote_path: String,
    pub tab_id: String,
    pub connection_key: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub chunk_size: usize,
    pub state: TransferState,
    pub retry_count: u32,
    pub enable_checksum: bool,
    pub expected_checksum: Option<String>,
    pub checksum: Option<String>,
    pub error: Option<String>,
    pub created_at_ms: u128,
    pub updated_at_ms: u128,
    pub chunk_ledger: VecDeque<ChunkLedgerEntry>,
}

const CHUNK_LEDGER_CAPACITY: usize = 500;

impl TransferRecord {
    fn new(
        id: String,
        kind: TransferKind,
        local_path: String,
        remote_path: String,
        tab_id: String,
        connection_key: String,
        enable_checksum: bool,
        expected_checksum: Option<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id,
            kind,
            local_path,
            remote_path,
            tab_id,
            connection_key,
            total_bytes: 0,
            transferred_bytes: 0,
            chunk_size: 0,
            state: TransferState::Pending,
            retry_count: 0,
            enable_checksum,
            expected_checksum,
            checksum: None,
            error: None,
            created_at_ms: now,
            updated_at_ms: now,
            chunk_ledger: VecDeque::new(),
        }
    }

    fn push_chunk(&mut self, chunk_index: u64, bytes: u64) {
        self.chunk_ledger.push_back(ChunkLedgerEntry {
            chunk_index,
            bytes,
            at_ms: now_ms(),
        });
        while self.chunk_ledger.len() > CHUNK_LEDGER_CAPACITY {
            self.chunk_ledger.pop_front();
        }
        self.updated_at_ms = now_ms();
    }
}

/// Derives a deterministic transfer id from the parameters spec.md §4.9
/// identifies it by, so re-submitting the same logical transfer after a
/// restart recovers the same id.
pub fn transfer_id(kind: TransferKind, local_path: &str, remote_path: &str, tab_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{kind:?}"));
    hasher.update(b"\0");
    hasher.update(local_path.as_bytes());
    hasher.update(b"\0");
    hasher.update(remote_path.as_bytes());
    hasher.update(b"\0");
    hasher.update(tab_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// In-process control signal for a running transfer task, checked at each
/// chunk-boundary safepoint per spec.md §5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Run,
    Paused,
    Cancelled,
}

struct TransferHandle {
    record: Arc<Mutex<TransferRecord>>,
    signal_tx: watch::Sender<Signal>,
}

/// Owns the transfer queue, active set, and per-transfer tasks.
pub struct TransferEngine {
    pool: Arc<ConnectionPool>,
    memory: Arc<crate::memory::MemoryPool>,
    events: EventBus,
    journal: Arc<ResumeJournal>,
    max_concurrent: usize,
    retry_limit: u32,
    chunk_preallocate: usize,
    backpressure_initial_credit: usize,
    backpressure_max_credit: usize,
    backpressure_throttle_ratio: f64,
    transfers: Mutex<HashMap<String, Arc<TransferHandle>>>,
    queue: Mutex<VecDeque<String>>,
    active_count: Mutex<usize>,
}

impl TransferEngine {
    pub fn new(
        pool: Arc<ConnectionPool>,
        memory: Arc<crate::memory::MemoryPool>,
        events: EventBus,
        journal: Arc<ResumeJournal>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            pool,
            memory,
            events,
            journal,
            max_concurrent: config.max_concurrent_transfers,
            retry_limit: config.transfer_retry_limit,
            chunk_preallocate: config.transfer_chunk_preallocate,
            backpressure_initial_credit: config.backpressure_initial_credit,
            backpressure_max_credit: config.backpressure_max_credit,
            backpressure_throttle_ratio: config.backpressure_throttle_ratio,
            transfers: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            active_count: Mutex::new(0),
        }
    }

    /// Enqueues a new transfer and returns its id. If the active set is
    /// below `max_concurrent_transfers` it starts immediately; otherwise it
    /// waits in the queue.
    pub async fn submit(
        self: &Arc<Self>,
        kind: TransferKind,
        local_path: String,
        remote_path: String,
        tab_id: String,
        key: ConnectionKey,
        enable_checksum: bool,
        expected_checksum: Option<String>,
    ) -> Result<String> {
        let id = transfer_id(kind, &local_path, &remote_path, &tab_id);
        let record = TransferRecord::new(
            id.clone(),
            kind,
            local_path,
            remote_path,
            tab_id,
            key.as_str().to_string(),
            enable_checksum,
            expected_checksum,
        );
        self.enqueue(record).await;
        Ok(id)
    }

    /// Reinstates a record loaded from the journal (state `Transferring` or
    /// `Paused`) so it resumes from `transferred_bytes` instead of restarting.
    pub async fn resume_from_journal(self: &Arc<Self>, mut record: TransferRecord) {
        record.state = TransferState::Pending;
        self.enqueue(record).await;
    }

    async fn enqueue(self: &Arc<Self>, record: TransferRecord) {
        let id = record.id.clone();
        let (signal_tx, _signal_rx) = watch::channel(Signal::Run);
        let handle = Arc::new(TransferHandle {
            record: Arc::new(Mutex::new(record)),
            signal_tx,
        });
        self.transfers.lock().await.insert(id.clone(), handle);
        self.queue.lock().await.push_back(id);
        self.drain_queue().await;
    }

    async fn drain_queue(self: &Arc<Self>) {
        loop {
            {
                let active = *self.active_count.lock().await;
                if active >= self.max_concurrent {
                    return;
                }
            }
            let next_id = {
                let mut queue = self.queue.lock().await;
                queue.pop_front()
            };
            let Some(id) = next_id else { return };
            let Some(handle) = self.transfers.lock().await.get(&id).cloned() else {
                continue;
            };
            *self.active_count.lock().await += 1;
            let engine = self.clone();
            tokio::spawn(async move {
                engine.run_transfer(handle).await;
                *engine.active_count.lock().await -= 1;
                engine.drain_queue().await;
            });
        }
    }

    /// Pauses a running transfer before its next chunk boundary.
    pub async fn pause(&self, id: &str) -> Result<()> {
        let handle = self.get(id).await?;
        let _ = handle.signal_tx.send(Signal::Paused);
        Ok(())
    }

    /// Resumes a paused transfer.
    pub async fn resume(&self, id: &str) -> Result<()> {
        let handle = self.get(id).await?;
        let _ = handle.signal_tx.send(Signal::Run);
        Ok(())
    }

    /// Cancels a transfer at its next safepoint. Never tears down the
    /// backing `PooledClient` (spec.md §5).
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let handle = self.get(id).await?;
        let _ = handle.signal_tx.send(Signal::Cancelled);
        Ok(())
    }

    /// Cancels every transfer belonging to `tab_id`, e.g. when its Stream
    /// Multiplexer stream closes.
    pub async fn cancel_all_for_tab(&self, tab_id: &str) {
        let handles: Vec<Arc<TransferHandle>> = self.transfers.lock().await.values().cloned().collect();
        for handle in handles {
            let belongs = handle.record.lock().await.tab_id == tab_id;
            if belongs {
                let _ = handle.signal_tx.send(Signal::Cancelled);
            }
        }
    }

    pub async fn snapshot(&self, id: &str) -> Result<TransferRecord> {
        let handle = self.get(id).await?;
        Ok(handle.record.lock().await.clone())
    }

    async fn get(&self, id: &str) -> Result<Arc<TransferHandle>> {
        self.transfers
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("transfer {id}")))
    }

    async fn run_transfer(&self, handle: Arc<TransferHandle>) {
        let id = handle.record.lock().await.id.clone();
        debug!("transfer {id}: starting");
        let mut signal_rx = handle.signal_tx.subscribe();

        self.set_state(&handle, TransferState::Preparing).await;

        let key_str = handle.record.lock().await.connection_key.clone();
        let Some(client) = self
            .pool
            .clients_snapshot()
            .into_iter()
            .find(|c| c.key.as_str() == key_str)
        else {
            self.fail(&handle, "backing connection no longer pooled").await;
            return;
        };

        let outcome = self.prepare_and_run(&handle, &client, &mut signal_rx).await;
        match outcome {
            Ok(TransferOutcome::Completed) => {
                self.set_state(&handle, TransferState::Completed).await;
                let checksum = handle.record.lock().await.checksum.clone();
                self.events.publish(EngineEvent::SftpTransferComplete {
                    transfer_id: id.clone(),
                    checksum,
                });
                self.journal.schedule_completed_cleanup(id);
            }
            Ok(TransferOutcome::Cancelled) => {
                self.set_state(&handle, TransferState::Cancelled).await;
                self.events
                    .publish(EngineEvent::SftpTransferCancelled { transfer_id: id.clone() });
                self.journal.schedule_cancelled_cleanup(id);
            }
            Err(err) => {
                self.fail(&handle, &err.to_string()).await;
            }
        }
    }

    async fn fail(&self, handle: &Arc<TransferHandle>, message: &str) {
        {
            let mut record = handle.record.lock().await;
            record.state = TransferState::Failed;
            record.error = Some(message.to_string());
            record.updated_at_ms = now_ms();
        }
        let id = handle.record.lock().await.id.clone();
        warn!("transfer {id}: failed: {message}");
        self.events.publish(EngineEvent::SftpTransferError {
            transfer_id: id,
            message: message.to_string(),
        });
    }

    async fn set_state(&self, handle: &Arc<TransferHandle>, state: TransferState) {
        let mut record = handle.record.lock().await;
        record.state = state;
        record.updated_at_ms = now_ms();
    }

    async fn prepare_and_run(
        &self,
        handle: &Arc<TransferHandle>,
        client: &Arc<crate::pool::PooledClient>,
        signal_rx: &mut watch::Receiver<Signal>,
    ) -> Result<TransferOutcome> {
        let (kind, local_path, remote_path, transfer_id_str, enable_checksum, expected_checksum) = {
            let record = handle.record.lock().await;
            (
                record.kind,
                record.local_path.clone(),
                record.remote_path.clone(),
                record.id.clone(),
                record.enable_checksum,
                record.expected_checksum.clone(),
            )
        };

        let total_bytes = self.analyze_source(client, kind, &local_path, &remote_path).await?;
        let chunk_size = chunk_size_for(total_bytes);
        {
            let mut record = handle.record.lock().await;
            record.total_bytes = total_bytes;
            record.chunk_size = chunk_size;
        }
        self.events.publish(EngineEvent::SftpTransferStart {
            transfer_id: transfer_id_str.clone(),
            total_bytes,
        });

        let blocks: Vec<BlockId> = (0..self.chunk_preallocate)
            .filter_map(|_| self.memory.allocate(chunk_size).ok().map(|a| a.block_id))
            .collect();

        let backpressure = Arc::new(BackpressureController::new(
            self.backpressure_initial_credit,
            self.backpressure_max_credit,
            self.backpressure_throttle_ratio,
        ));

        self.set_state(handle, TransferState::Transferring).await;

        let mut hasher = enable_checksum.then(Sha256::new);
        let total_chunks = if chunk_size == 0 { 0 } else { total_bytes.div_ceil(chunk_size as u64) };

        // spec.md §4.9 step 7: non-fatal chunk errors retry with linear
        // backoff (1s * attempt), resuming from the last persisted offset.
        let mut attempt = 0u32;
        let outcome = loop {
            let resume_from = handle.record.lock().await.transferred_bytes;
            let attempt_result = match kind {
                TransferKind::Upload => {
                    self.run_upload(
                        handle,
                        client,
                        &local_path,
                        &remote_path,
                        chunk_size,
                        total_bytes,
                        total_chunks,
                        resume_from,
                        &blocks,
                        &backpressure,
                        &mut hasher,
                        signal_rx,
                    )
                    .await
                }
                TransferKind::Download => {
                    self.run_download(
                        handle,
                        client,
                        &local_path,
                        &remote_path,
                        chunk_size,
                        total_bytes,
                        total_chunks,
                        resume_from,
                        &blocks,
                        &backpressure,
                        &mut hasher,
                        signal_rx,
                    )
                    .await
                }
                TransferKind::Copy => {
                    self.run_copy(
                        handle,
                        client,
                        &local_path,
                        &remote_path,
                        chunk_size,
                        total_bytes,
                        total_chunks,
                        &blocks,
                        &backpressure,
                        signal_rx,
                    )
                    .await
                }
            };

            match attempt_result {
                Ok(outcome) => break outcome,
                Err(err) if attempt < self.retry_limit && err.is_retryable_transfer_error() => {
                    attempt += 1;
                    handle.record.lock().await.retry_count = attempt;
                    warn!(
                        "transfer {transfer_id_str}: attempt {attempt} failed ({err}), retrying in {attempt}s"
                    );
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(err) => return Err(err),
            }
        };

        for block_id in blocks {
            self.memory.free(block_id);
        }

        if let TransferOutcome::Completed = outcome {
            if let Some(hasher) = hasher {
                let digest = hex::encode(hasher.finalize());
                if let Some(expected) = &expected_checksum
                    && expected != &digest
                {
                    return Err(EngineError::TransferIntegrity(
                        "integrity check failed".to_string(),
                    ));
                }
                handle.record.lock().await.checksum = Some(digest);
            }
            let final_size = handle.record.lock().await.transferred_bytes;
            if final_size != total_bytes {
                return Err(EngineError::TransferIntegrity(
                    "integrity check failed".to_string(),
                ));
            }
        }

        Ok(outcome)
    }

    async fn analyze_source(
        &self,
        client: &Arc<crate::pool::PooledClient>,
        kind: TransferKind,
        local_path: &str,
        remote_path: &str,
    ) -> Result<u64> {
        match kind {
            TransferKind::Upload => {
                let meta = tokio::fs::metadata(local_path).await.map_err(EngineError::from)?;
                Ok(meta.len())
            }
            TransferKind::Download | TransferKind::Copy => {
                let sftp = open_sftp(client).await?;
                let attrs = sftp
                    .metadata(remote_path.to_string())
                    .await
                    .map_err(|e| EngineError::Protocol(e.to_string()))?;
                Ok(attrs.size.unwrap_or(0))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_upload(
        &self,
        handle: &Arc<TransferHandle>,
        client: &Arc<crate::pool::PooledClient>,
        local_path: &str,
        remote_path: &str,
        chunk_size: usize,
        total_bytes: u64,
        total_chunks: u64,
        resume_from: u64,
        blocks: &[BlockId],
        backpressure: &Arc<BackpressureController>,
        hasher: &mut Option<Sha256>,
        signal_rx: &mut watch::Receiver<Signal>,
    ) -> Result<TransferOutcome> {
        let sftp = open_sftp(client).await?;
        let mut remote_file = sftp
            .open_with_flags(
                remote_path.to_string(),
                OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        remote_file
            .seek(std::io::SeekFrom::Start(resume_from))
            .await
            .map_err(EngineError::from)?;

        let mut local_file = LocalFile::open(local_path).await.map_err(EngineError::from)?;
        local_file
            .seek(std::io::SeekFrom::Start(resume_from))
            .await
            .map_err(EngineError::from)?;

        let mut transferred = resume_from;
        let mut chunk_index = if chunk_size == 0 { 0 } else { resume_from / chunk_size as u64 };
        let started = Instant::now();
        let mut buf = vec![0u8; chunk_size.max(1)];

        loop {
            match self.wait_for_safepoint(signal_rx).await {
                Signal::Cancelled => return Ok(TransferOutcome::Cancelled),
                Signal::Paused => unreachable!("wait_for_safepoint resolves paused internally"),
                Signal::Run => {}
            }

            let read = local_file.read(&mut buf).await.map_err(EngineError::from)?;
            if read == 0 {
                break;
            }
            backpressure.reserve(read).await?;
            if let Some(&block_id) = blocks.get(chunk_index as usize % blocks.len().max(1)) {
                self.memory.write_into(block_id, &buf[..read])?;
                let staged = self.memory.read_from(block_id, read)?;
                remote_file.write_all(&staged).await.map_err(EngineError::from)?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&staged);
                }
            } else {
                remote_file.write_all(&buf[..read]).await.map_err(EngineError::from)?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&buf[..read]);
                }
            }
            backpressure.acknowledge(read);

            transferred += read as u64;
            chunk_index += 1;
            self.report_progress(
                handle,
                transferred,
                total_bytes,
                chunk_index,
                total_chunks,
                started,
            )
            .await;
        }

        remote_file.shutdown().await.map_err(EngineError::from)?;
        Ok(TransferOutcome::Completed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_download(
        &self,
        handle: &Arc<TransferHandle>,
        client: &Arc<crate::pool::PooledClient>,
        local_path: &str,
        remote_path: &str,
        chunk_size: usize,
        total_bytes: u64,
        total_chunks: u64,
        resume_from: u64,
        blocks: &[BlockId],
        backpressure: &Arc<BackpressureController>,
        hasher: &mut Option<Sha256>,
        signal_rx: &mut watch::Receiver<Signal>,
    ) -> Result<TransferOutcome> {
        let sftp = open_sftp(client).await?;
        let mut remote_file = sftp
            .open(remote_path.to_string())
            .await
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        remote_file
            .seek(std::io::SeekFrom::Start(resume_from))
            .await
            .map_err(EngineError::from)?;

        let mut local_file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(local_path)
            .await
            .map_err(EngineError::from)?;
        local_file
            .seek(std::io::SeekFrom::Start(resume_from))
            .await
            .map_err(EngineError::from)?;

        let mut transferred = resume_from;
        let mut chunk_index = if chunk_size == 0 { 0 } else { resume_from / chunk_size as u64 };
        let started = Instant::now();
        let mut buf = vec![0u8; chunk_size.max(1)];

        loop {
            match self.wait_for_safepoint(signal_rx).await {
                Signal::Cancelled => return Ok(TransferOutcome::Cancelled),
                Signal::Paused => unreachable!("wait_for_safepoint resolves paused internally"),
                Signal::Run => {}
            }

            let read = remote_file.read(&mut buf).await.map_err(EngineError::from)?;
            if read == 0 {
                break;
            }
            backpressure.reserve(read).await?;
            if let Some(&block_id) = blocks.get(chunk_index as usize % blocks.len().max(1)) {
                self.memory.write_into(block_id, &buf[..read])?;
                let staged = self.memory.read_from(block_id, read)?;
                local_file.write_all(&staged).await.map_err(EngineError::from)?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&staged);
                }
            } else {
                local_file.write_all(&buf[..read]).await.map_err(EngineError::from)?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&buf[..read]);
                }
            }
            backpressure.acknowledge(read);

            transferred += read as u64;
            chunk_index += 1;
            self.report_progress(
                handle,
                transferred,
                total_bytes,
                chunk_index,
                total_chunks,
                started,
            )
            .await;
        }

        local_file.flush().await.map_err(EngineError::from)?;
        Ok(TransferOutcome::Completed)
    }

    /// Server-side copy when the SFTP server supports `copy-data`; this
    /// crate stack has no extension negotiation, so it always falls back to
    /// download-then-upload via a local temp file, as spec.md §4.9 step 6
    /// permits ("not required in minimum implementation").
    #[allow(clippy::too_many_arguments)]
    async fn run_copy(
        &self,
        handle: &Arc<TransferHandle>,
        client: &Arc<crate::pool::PooledClient>,
        source_remote_path: &str,
        dest_remote_path: &str,
        chunk_size: usize,
        total_bytes: u64,
        total_chunks: u64,
        blocks: &[BlockId],
        backpressure: &Arc<BackpressureController>,
        signal_rx: &mut watch::Receiver<Signal>,
    ) -> Result<TransferOutcome> {
        let temp_path = std::env::temp_dir().join(format!(
            "termharbor-copy-{}",
            handle.record.lock().await.id
        ));
        let temp_path_str = temp_path.to_string_lossy().to_string();

        let mut no_hasher = None;
        let down = self
            .run_download(
                handle,
                client,
                &temp_path_str,
                source_remote_path,
                chunk_size,
                total_bytes,
                total_chunks,
                0,
                blocks,
                backpressure,
                &mut no_hasher,
                signal_rx,
            )
            .await?;
        if !matches!(down, TransferOutcome::Completed) {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Ok(down);
        }

        let up = self
            .run_upload(
                handle,
                client,
                &temp_path_str,
                dest_remote_path,
                chunk_size,
                total_bytes,
                total_chunks,
                0,
                blocks,
                backpressure,
                &mut no_hasher,
                signal_rx,
            )
            .await?;
        let _ = tokio::fs::remove_file(&temp_path).await;
        Ok(up)
    }

    /// Blocks until the transfer is cleared to proceed with its next chunk:
    /// resolves immediately on `Run`/`Cancelled`, but on `Paused` waits for
    /// the signal to change before returning.
    async fn wait_for_safepoint(&self, signal_rx: &mut watch::Receiver<Signal>) -> Signal {
        loop {
            let current = *signal_rx.borrow();
            match current {
                Signal::Run | Signal::Cancelled => return current,
                Signal::Paused => {
                    if signal_rx.changed().await.is_err() {
                        return Signal::Cancelled;
                    }
                }
            }
        }
    }

    async fn report_progress(
        &self,
        handle: &Arc<TransferHandle>,
        transferred: u64,
        total_bytes: u64,
        current_chunk: u64,
        total_chunks: u64,
        started: Instant,
    ) {
        {
            let mut record = handle.record.lock().await;
            record.transferred_bytes = transferred;
            record.push_chunk(current_chunk, transferred);
        }
        self.journal.maybe_persist(handle.record.clone()).await;

        let elapsed_ms = started.elapsed().as_millis().max(1) as f64;
        let throughput = transferred as f64 / elapsed_ms * 1000.0;
        let percent = if total_bytes == 0 {
            100.0
        } else {
            (transferred as f64 / total_bytes as f64) * 100.0
        };
        let id = handle.record.lock().await.id.clone();
        self.events.publish(EngineEvent::SftpTransferProgress {
            transfer_id: id,
            percent,
            bytes_transferred: transferred,
            total_bytes,
            current_chunk,
            total_chunks,
            throughput_bytes_per_sec: throughput,
        });
    }
}

enum TransferOutcome {
    Completed,
    Cancelled,
}

pub(crate) async fn open_sftp(client: &Arc<crate::pool::PooledClient>) -> Result<SftpSession> {
    let channel = client.open_ssh_channel().await?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(EngineError::from)?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| EngineError::Protocol(e.to_string()))
}

fn now_ms() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Rejects delete/move/rename operations targeting the filesystem root
/// synchronously, before any SFTP call is issued, per spec.md §7/§8 (S6).
pub fn validate_destructive_path(path: &str) -> Result<()> {
    let normalized = path.trim();
    if normalized == "/" || normalized == "\\" || PathBuf::from(normalized).parent().is_none() {
        return Err(EngineError::InvalidOperation(
            "refusing to operate on the filesystem root".to_string(),
        ));
    }
    Ok(())
}

/// Deletes a remote file over `client`'s SFTP subsystem. Validates the path
/// synchronously before issuing any SFTP call, per spec.md §8 (S6).
pub async fn remove_remote_path(client: &Arc<crate::pool::PooledClient>, path: &str) -> Result<()> {
    validate_destructive_path(path)?;
    let sftp = open_sftp(client).await?;
    sftp.remove_file(path.to_string())
        .await
        .map_err(|e| EngineError::Protocol(e.to_string()))
}

/// Moves/renames a remote path over `client`'s SFTP subsystem. Validates
/// both endpoints synchronously before issuing any SFTP call.
pub async fn rename_remote_path(
    client: &Arc<crate::pool::PooledClient>,
    from: &str,
    to: &str,
) -> Result<()> {
    validate_destructive_path(from)?;
    validate_destructive_path(to)?;
    let sftp = open_sftp(client).await?;
    sftp.rename(from.to_string(), to.to_string())
        .await
        .map_err(|e| EngineError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_id_is_deterministic_for_same_inputs() {
        let a = transfer_id(TransferKind::Upload, "/local/a", "/remote/a", "tab1");
        let b = transfer_id(TransferKind::Upload, "/local/a", "/remote/a", "tab1");
        assert_eq!(a, b);
    }

    #[test]
    fn transfer_id_differs_for_different_kind() {
        let up = transfer_id(TransferKind::Upload, "/local/a", "/remote/a", "tab1");
        let down = transfer_id(TransferKind::Download, "/local/a", "/remote/a", "tab1");
        assert_ne!(up, down);
    }

    #[test]
    fn root_path_is_rejected() {
        assert!(validate_destructive_path("/").is_err());
        assert!(validate_destructive_path("\\").is_err());
    }

    #[test]
    fn non_root_path_is_accepted() {
        assert!(validate_destructive_path("/home/user/file.txt").is_ok());
    }

    #[test]
    fn chunk_ledger_stays_bounded() {
        let mut record = TransferRecord::new(
            "id".to_string(),
            TransferKind::Upload,
            "/l".to_string(),
            "/r".to_string(),
            "tab".to_string(),
            "key".to_string(),
            false,
            None,
        );
        for i in 0..600u64 {
            record.push_chunk(i, i * 10);
        }
        assert_eq!(record.chunk_ledger.len(), CHUNK_LEDGER_CAPACITY);
        assert_eq!(record.chunk_ledger.front().unwrap().chunk_index, 100);
    }
}
