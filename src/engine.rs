//! Engine façade (§4.12 of the design spec): the single entry point a UI
//! transport drives. Owns `Arc`-shared handles to every component (memory
//! pool, known-hosts cache, event bus, connection pool, reconnection
//! manager, stream multiplexer, transfer engine, resume journal, latency
//! prober, connection catalog) instead of the teacher's `Lazy<MANAGER>`
//! global, so the whole engine can be torn down deterministically and more
//! than one can coexist in a test process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::broadcast;

use crate::auth::AuthOrchestrator;
use crate::catalog::{Catalog, CatalogNode, ConnectionKey, ConnectionSpec, Credential, Protocol};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::hosts::KnownHostsCache;
use crate::latency::LatencyProber;
use crate::memory::MemoryPool;
use crate::pool::{ConnectionPool, ReconnectionManager};
use crate::stream::StreamMultiplexer;
use crate::transfer::journal::ResumeJournal;
use crate::transfer::{TransferEngine, TransferKind, TransferRecord};

/// Tracks the connection key and originating spec backing a live tab, so a
/// transient stream close can hand the right spec to the Reconnection
/// Manager and an explicit close can release the right pooled client.
struct TabState {
    key: ConnectionKey,
    spec: ConnectionSpec,
    process_id: u64,
}

/// The session & transfer engine. Construct once per UI transport instance
/// with [`Engine::new`]; call [`Engine::shutdown`] to release background
/// tasks deterministically.
pub struct Engine {
    config: EngineConfig,
    events: EventBus,
    memory: Arc<MemoryPool>,
    hosts: Arc<KnownHostsCache>,
    auth: Arc<AuthOrchestrator>,
    pool: Arc<ConnectionPool>,
    reconnect: Arc<ReconnectionManager>,
    streams: Arc<StreamMultiplexer>,
    transfers: Arc<TransferEngine>,
    journal: Arc<ResumeJournal>,
    latency: Arc<LatencyProber>,
    catalog: Arc<Catalog>,
    tabs: Mutex<HashMap<String, TabState>>,
    resumable: Mutex<HashMap<String, TransferRecord>>,
}

impl Engine {
    /// Builds every component and wires the Stream Multiplexer's close
    /// callback to the Connection Pool, Reconnection Manager, latency
    /// prober and Transfer Engine, per spec.md §5's cancellation rules.
    /// `journal_dir` is the user-data directory the Resume Journal writes
    /// one file per in-flight transfer under.
    pub async fn new(config: EngineConfig, journal_dir: PathBuf) -> Result<Arc<Self>> {
        let events = EventBus::default();
        let memory = Arc::new(MemoryPool::new(&config));
        let hosts = Arc::new(KnownHostsCache::new());
        let auth = Arc::new(AuthOrchestrator::new(
            events.clone(),
            config.auth_timeout,
            config.auth_max_retries,
        ));
        let pool = Arc::new(ConnectionPool::new(
            hosts.clone(),
            auth.clone(),
            events.clone(),
            config.top_connections_limit,
            config.ssh_ready_timeout,
        ));
        let reconnect = Arc::new(ReconnectionManager::new(
            pool.clone(),
            events.clone(),
            config.reconnect_initial_backoff,
            config.reconnect_max_backoff,
            config.reconnect_window,
        ));
        let streams = Arc::new(StreamMultiplexer::new(events.clone(), &config));
        let journal = Arc::new(ResumeJournal::new(
            journal_dir,
            config.journal_progress_delta_bytes,
            config.journal_progress_interval,
            config.journal_completed_retention,
            config.journal_cancelled_retention,
        ));
        journal.ensure_directory().await?;
        let transfers = Arc::new(TransferEngine::new(
            pool.clone(),
            memory.clone(),
            events.clone(),
            journal.clone(),
            &config,
        ));
        let latency = LatencyProber::new(
            pool.clone(),
            events.clone(),
            config.latency_probe_interval,
            config.latency_window_size,
        );
        let catalog = Arc::new(Catalog::new());

        let resumable: HashMap<String, TransferRecord> = journal
            .load_resumable()
            .await?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        let engine = Arc::new(Self {
            config,
            events,
            memory,
            hosts,
            auth,
            pool,
            reconnect,
            streams,
            transfers,
            journal,
            latency,
            catalog,
            tabs: Mutex::new(HashMap::new()),
            resumable: Mutex::new(resumable),
        });

        let callback_engine = engine.clone();
        engine
            .streams
            .set_on_closed(Arc::new(move |tab_id, process_id, intentional| {
                let engine = callback_engine.clone();
                tokio::spawn(async move {
                    engine.on_stream_closed(tab_id, process_id, intentional).await;
                });
            }))
            .await;

        Ok(engine)
    }

    /// Runs the shared teardown sequence for a shell stream ending, whether
    /// the close was user-initiated or a transport drop: cancels the tab's
    /// SFTP transfers, unregisters its latency probe, releases (or, for a
    /// transient drop, reserves-for-reconnect) the backing `PooledClient`.
    async fn on_stream_closed(&self, tab_id: String, _process_id: u64, intentional: bool) {
        self.transfers.cancel_all_for_tab(&tab_id).await;
        self.latency.unregister(&tab_id).await;

        let tab_state = self.tabs.lock().expect("tabs mutex poisoned").remove(&tab_id);
        let Some(tab_state) = tab_state else { return };

        self.pool.release(&tab_state.key, &tab_id, intentional);

        if !intentional {
            debug!("engine: tab {tab_id} dropped transiently, handing off to reconnection manager");
            self.reconnect
                .clone()
                .notify_transient_close(tab_state.spec, tab_id)
                .await;
        }
    }

    /// Opens an SSH shell session for `spec` under `tab_id`. Acquires (or
    /// reuses) the pooled client via the Connection Pool, then opens a
    /// shell stream over it via the Stream Multiplexer. Returns the new
    /// process id.
    pub async fn start_ssh(self: &Arc<Self>, spec: ConnectionSpec, tab_id: String) -> Result<u64> {
        self.start(spec, tab_id, Protocol::Ssh).await
    }

    /// Opens a Telnet NVT session for `spec` under `tab_id`. See
    /// [`Engine::start_ssh`].
    pub async fn start_telnet(self: &Arc<Self>, spec: ConnectionSpec, tab_id: String) -> Result<u64> {
        self.start(spec, tab_id, Protocol::Telnet).await
    }

    async fn start(self: &Arc<Self>, mut spec: ConnectionSpec, tab_id: String, protocol: Protocol) -> Result<u64> {
        spec.protocol = protocol;
        if spec.port == 0 {
            spec.port = protocol.default_port();
        }
        let client = self.pool.acquire(&spec, &tab_id).await?;
        let key = client.key.clone();
        let process_id = self.streams.open(client, tab_id.clone()).await?;

        self.tabs.lock().expect("tabs mutex poisoned").insert(
            tab_id.clone(),
            TabState {
                key: key.clone(),
                spec: spec.clone(),
                process_id,
            },
        );

        if matches!(protocol, Protocol::Ssh) {
            self.latency.register(tab_id, key, spec.host, spec.port).await;
        }

        Ok(process_id)
    }

    /// Writes input bytes to a shell stream.
    pub async fn write_input(&self, process_id: u64, data: &[u8]) -> Result<()> {
        self.streams.write_input(process_id, data).await
    }

    /// Issues an SSH window-change request for a shell stream. A no-op on
    /// Telnet streams.
    pub async fn resize(&self, process_id: u64, cols: u32, rows: u32) -> Result<()> {
        self.streams.resize(process_id, cols, rows).await
    }

    /// Closes a shell stream. Equivalent to a user-initiated tab close: the
    /// backing `PooledClient` is released intentionally once its refcount
    /// reaches zero, and dependent transfers are cancelled.
    pub async fn close_session(&self, process_id: u64) -> Result<()> {
        self.streams.close(process_id, true).await
    }

    /// Delivers a UI-transport `ssh:auth-response` to the orchestrator.
    pub fn submit_auth_response(&self, request_id: &str, response: crate::auth::AuthResponse) -> Result<()> {
        self.auth.submit_response(request_id, response)
    }

    /// Replaces the whole connection catalog tree, e.g. after loading it
    /// from disk at startup.
    pub fn load_catalog(&self, tree: Vec<CatalogNode>) {
        self.catalog.load(tree);
        self.events.publish(EngineEvent::ConnectionsChanged);
    }

    /// Snapshot of the current catalog tree.
    pub fn catalog_tree(&self) -> Vec<CatalogNode> {
        self.catalog.tree()
    }

    /// Updates only the credential triplet of a cataloged connection.
    pub fn update_connection_credentials(&self, connection_id: &str, credential: Credential) -> Result<bool> {
        let changed = self.catalog.update_credentials(connection_id, credential)?;
        if changed {
            self.events.publish(EngineEvent::ConnectionsChanged);
        }
        Ok(changed)
    }

    /// Enqueues a new SFTP transfer; returns its deterministic transfer id.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_transfer(
        self: &Arc<Self>,
        kind: TransferKind,
        local_path: String,
        remote_path: String,
        tab_id: String,
        enable_checksum: bool,
        expected_checksum: Option<String>,
    ) -> Result<String> {
        let key = self
            .tabs
            .lock()
            .expect("tabs mutex poisoned")
            .get(&tab_id)
            .map(|state| state.key.clone())
            .ok_or_else(|| EngineError::NotFound(format!("no active session for tab {tab_id}")))?;

        self.transfers
            .submit(kind, local_path, remote_path, tab_id, key, enable_checksum, expected_checksum)
            .await
    }

    /// Lists transfers recovered from the Resume Journal at engine startup
    /// that have not yet been resumed.
    pub fn resumable_transfers(&self) -> Vec<TransferRecord> {
        self.resumable.lock().expect("resumable mutex poisoned").values().cloned().collect()
    }

    /// Resumes a journaled transfer under a freshly (re-)established tab
    /// session, continuing from its last persisted `transferred_bytes`.
    pub async fn resume_transfer(&self, transfer_id: &str, tab_id: &str) -> Result<()> {
        let record = self
            .resumable
            .lock()
            .expect("resumable mutex poisoned")
            .remove(transfer_id)
            .ok_or_else(|| EngineError::NotFound(format!("resumable transfer {transfer_id}")))?;

        let has_tab = self.tabs.lock().expect("tabs mutex poisoned").contains_key(tab_id);
        if !has_tab {
            self.resumable
                .lock()
                .expect("resumable mutex poisoned")
                .insert(transfer_id.to_string(), record);
            return Err(EngineError::NotFound(format!("no active session for tab {tab_id}")));
        }

        self.transfers.resume_from_journal(record).await;
        Ok(())
    }

    pub async fn pause_transfer(&self, transfer_id: &str) -> Result<()> {
        self.transfers.pause(transfer_id).await
    }

    pub async fn resume_paused_transfer(&self, transfer_id: &str) -> Result<()> {
        self.transfers.resume(transfer_id).await
    }

    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<()> {
        self.transfers.cancel(transfer_id).await
    }

    pub async fn transfer_snapshot(&self, transfer_id: &str) -> Result<TransferRecord> {
        self.transfers.snapshot(transfer_id).await
    }

    /// Deletes a remote file reachable from `tab_id`'s pooled client.
    /// Rejects root-path targets synchronously (spec.md §8 S6) before any
    /// SFTP call is issued.
    pub async fn delete_remote_path(&self, tab_id: &str, path: &str) -> Result<()> {
        let client = self.client_for_tab(tab_id)?;
        crate::transfer::remove_remote_path(&client, path).await
    }

    /// Renames/moves a remote path reachable from `tab_id`'s pooled client.
    pub async fn rename_remote_path(&self, tab_id: &str, from: &str, to: &str) -> Result<()> {
        let client = self.client_for_tab(tab_id)?;
        crate::transfer::rename_remote_path(&client, from, to).await
    }

    fn client_for_tab(&self, tab_id: &str) -> Result<Arc<crate::pool::PooledClient>> {
        let key = self
            .tabs
            .lock()
            .expect("tabs mutex poisoned")
            .get(tab_id)
            .map(|state| state.key.clone())
            .ok_or_else(|| EngineError::NotFound(format!("no active session for tab {tab_id}")))?;
        self.pool
            .get(&key)
            .ok_or_else(|| EngineError::NotFound(format!("no pooled client for tab {tab_id}")))
    }

    /// Enqueues an immediate out-of-schedule latency probe for a tab.
    pub async fn probe_latency_now(&self, tab_id: &str) {
        self.latency.probe_now(tab_id).await;
    }

    /// Subscribes to every event the engine emits toward the UI transport.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// The resolved configuration this engine was constructed with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Direct access to the Memory Pool, for host applications that need to
    /// account for memory usage outside an SFTP transfer (e.g. a clipboard
    /// or screen-capture buffer sharing the same pool).
    pub fn memory_pool(&self) -> &Arc<MemoryPool> {
        &self.memory
    }

    /// Direct access to the Known-Hosts Cache, e.g. for an explicit
    /// "forget host" UI action.
    pub fn known_hosts(&self) -> &Arc<KnownHostsCache> {
        &self.hosts
    }

    /// Closes every live stream intentionally, which in turn releases every
    /// pooled client and cancels every in-flight transfer via the
    /// `on_closed` callback. Background probe/reconnect loops are detached
    /// tasks that exit on their own once they find nothing left to act on;
    /// this engine instance should not be used after `shutdown` returns.
    pub async fn shutdown(&self) {
        let process_ids: Vec<u64> = self
            .tabs
            .lock()
            .expect("tabs mutex poisoned")
            .values()
            .map(|state| state.process_id)
            .collect();
        for process_id in process_ids {
            let _ = self.streams.close(process_id, true).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_engine() -> Arc<Engine> {
        let dir = tempfile::tempdir().unwrap();
        Engine::new(EngineConfig::default(), dir.path().to_path_buf())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn construction_and_shutdown_is_clean() {
        let engine = test_engine().await;
        assert_eq!(engine.resumable_transfers().len(), 0);
    }

    #[tokio::test]
    async fn write_input_without_a_session_is_not_found() {
        let engine = test_engine().await;
        let err = engine.write_input(999, b"ls\n").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn start_transfer_without_an_active_tab_is_rejected() {
        let engine = test_engine().await;
        let err = engine
            .start_transfer(
                TransferKind::Upload,
                "/tmp/a".to_string(),
                "/remote/a".to_string(),
                "tab1".to_string(),
                false,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn resume_transfer_without_an_active_tab_is_rejected_and_keeps_the_record() {
        use crate::transfer::TransferState;

        let engine = test_engine().await;
        let record = TransferRecord {
            id: "abc".to_string(),
            kind: TransferKind::Upload,
            local_path: "/local".to_string(),
            remote_path: "/remote".to_string(),
            tab_id: "tab1".to_string(),
            connection_key: "key".to_string(),
            total_bytes: 100,
            transferred_bytes: 50,
            chunk_size: 32 * 1024,
            state: TransferState::Paused,
            retry_count: 0,
            enable_checksum: false,
            expected_checksum: None,
            checksum: None,
            error: None,
            created_at_ms: 0,
            updated_at_ms: 0,
            chunk_ledger: Default::default(),
        };
        {
            let mut resumable = engine.resumable.lock().unwrap();
            resumable.insert("abc".to_string(), record);
        }
        let err = engine.resume_transfer("abc", "tab1").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert_eq!(engine.resumable_transfers().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_with_no_live_sessions_is_a_no_op() {
        let engine = test_engine().await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn catalog_roundtrips_through_the_engine() {
        let engine = test_engine().await;
        engine.load_catalog(vec![CatalogNode::Connection {
            spec: ConnectionSpec {
                id: "a".to_string(),
                name: "demo".to_string(),
                protocol: Protocol::Ssh,
                host: "203.0.113.10".to_string(),
                port: 22,
                username: Some("demo".to_string()),
                credential: Credential::default(),
                auth_mode: crate::catalog::AuthMode::Password,
                proxy: None,
                keep_alive_interval_secs: None,
                security_level: Default::default(),
            },
        }]);
        assert_eq!(engine.catalog_tree().len(), 1);
    }
}
