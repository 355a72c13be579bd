//! Connection Pool (C5): keyed pool of SSH and Telnet clients with tab
//! reference counting and single-flight establishment coalescing.
//!
//! The cache-hit/cache-miss/worker-spawn shape is grounded on the teacher's
//! `SshConnectionManager::get_with_security_and_recording`
//! (`session/manager.rs`), generalized from a `moka` idle-eviction cache
//! (appropriate for the teacher's "device command" connections, which are
//! harmless to silently evict) to an explicit `HashMap` guarded by reference
//! counts, since this engine's invariant (a) forbids releasing a client
//! while any tab still holds it, which an idle-TTL cache cannot express.

pub mod reconnect;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::debug;
use russh::client::{Config as SshClientConfig, Handle as SshHandle};
use russh::keys::PublicKey;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock, broadcast};

use crate::auth::{AuthOrchestrator, AuthOutcome};
use crate::catalog::{ConnectionKey, ConnectionSpec, Protocol};
use crate::error::{EngineError, Result};
use crate::events::{ConnectionStatus, EngineEvent, EventBus};
use crate::hosts::{HostCheckResult, KnownHostsCache, fingerprint_of};
use crate::proxy::dial_proxy;

pub use reconnect::{ReconnectState, ReconnectionManager};

/// Host key handler for a single connect attempt. Accepts every key at the
/// transport level (so the handshake can complete and yield the key bytes)
/// and stashes the observed fingerprint for the pool to check against
/// [`KnownHostsCache`] immediately afterward.
struct ClientHandler {
    observed: Arc<std::sync::Mutex<Option<String>>>,
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fp = fingerprint_of(server_public_key);
        *self.observed.lock().expect("fingerprint cell poisoned") = Some(fp);
        Ok(true)
    }
}

/// The established transport backing a [`PooledClient`].
enum ClientTransport {
    Ssh(Arc<SshHandle<ClientHandler>>),
    Telnet(Arc<AsyncMutex<TcpStream>>),
}

/// A shared network client keyed by connection parameters, referenced by
/// Sessions via tab id.
pub struct PooledClient {
    pub key: ConnectionKey,
    pub protocol: Protocol,
    transport: RwLock<ClientTransport>,
    ready: AtomicBool,
    refs: std::sync::Mutex<HashSet<String>>,
    last_used: std::sync::Mutex<Instant>,
    fingerprint: std::sync::Mutex<Option<String>>,
    reconnect_state: std::sync::Mutex<ReconnectState>,
    spec: std::sync::Mutex<ConnectionSpec>,
    resolved_username: std::sync::Mutex<Option<String>>,
    intentional_close: AtomicBool,
    pub reconnect_notify: Notify,
}

impl PooledClient {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn refcount(&self) -> usize {
        self.refs.lock().expect("refs mutex poisoned").len()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        *self.reconnect_state.lock().expect("reconnect state poisoned")
    }

    fn set_reconnect_state(&self, state: ReconnectState) {
        *self.reconnect_state.lock().expect("reconnect state poisoned") = state;
    }

    pub fn spec(&self) -> ConnectionSpec {
        self.spec.lock().expect("spec mutex poisoned").clone()
    }

    async fn ssh_handle(&self) -> Result<Arc<SshHandle<ClientHandler>>> {
        match &*self.transport.read().await {
            ClientTransport::Ssh(handle) => Ok(handle.clone()),
            ClientTransport::Telnet(_) => Err(EngineError::InvalidOperation(
                "not an SSH client".to_string(),
            )),
        }
    }

    async fn telnet_stream(&self) -> Result<Arc<AsyncMutex<TcpStream>>> {
        match &*self.transport.read().await {
            ClientTransport::Telnet(stream) => Ok(stream.clone()),
            ClientTransport::Ssh(_) => Err(EngineError::InvalidOperation(
                "not a telnet client".to_string(),
            )),
        }
    }

    /// Opens a fresh SSH channel on this client's transport, for the Stream
    /// Multiplexer (a `shell` channel) or the SFTP Engine (a subsystem
    /// channel). Errors with [`EngineError::InvalidOperation`] on a telnet
    /// client.
    pub(crate) async fn open_ssh_channel(&self) -> Result<russh::Channel<russh::client::Msg>> {
        let handle = self.ssh_handle().await?;
        handle.channel_open_session().await.map_err(EngineError::from)
    }

    /// Hands back the raw telnet `TcpStream` for the Stream Multiplexer's
    /// NVT loop. Errors with [`EngineError::InvalidOperation`] on an SSH
    /// client.
    pub(crate) async fn telnet_handle(&self) -> Result<Arc<AsyncMutex<TcpStream>>> {
        self.telnet_stream().await
    }

    /// `true` once the intentional-close flag has been set by a `release`
    /// with `intentional = true`; the Reconnection Manager must not schedule
    /// further attempts for such a client.
    pub(crate) fn is_intentionally_closed(&self) -> bool {
        self.intentional_close.load(Ordering::Acquire)
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.fingerprint.lock().expect("fingerprint mutex poisoned").clone()
    }

    pub fn resolved_username(&self) -> Option<String> {
        self.resolved_username
            .lock()
            .expect("resolved username mutex poisoned")
            .clone()
    }
}

/// Keyed pool of SSH/Telnet clients. Shared process-wide via `Arc`, per the
/// design spec's guidance to express former singletons as explicit handles.
pub struct ConnectionPool {
    clients: std::sync::Mutex<HashMap<ConnectionKey, Arc<PooledClient>>>,
    in_flight: std::sync::Mutex<HashMap<ConnectionKey, broadcast::Sender<std::result::Result<(), String>>>>,
    hosts: Arc<KnownHostsCache>,
    auth: Arc<AuthOrchestrator>,
    events: EventBus,
    top_connections: std::sync::Mutex<VecDeque<ConnectionKey>>,
    top_limit: usize,
    ssh_ready_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(
        hosts: Arc<KnownHostsCache>,
        auth: Arc<AuthOrchestrator>,
        events: EventBus,
        top_limit: usize,
        ssh_ready_timeout: Duration,
    ) -> Self {
        Self {
            clients: std::sync::Mutex::new(HashMap::new()),
            in_flight: std::sync::Mutex::new(HashMap::new()),
            hosts,
            auth,
            events,
            top_connections: std::sync::Mutex::new(VecDeque::new()),
            top_limit,
            ssh_ready_timeout,
        }
    }

    /// Returns a ready client for `spec`, establishing one if needed.
    /// Concurrent acquires for the same key coalesce onto a single in-flight
    /// establishment; the first to fail fails all waiters.
    pub async fn acquire(&self, spec: &ConnectionSpec, tab_id: &str) -> Result<Arc<PooledClient>> {
        let key = spec.key();
        loop {
            if let Some(client) = self.clients.lock().expect("clients mutex poisoned").get(&key) {
                if client.is_ready() {
                    client
                        .refs
                        .lock()
                        .expect("refs mutex poisoned")
                        .insert(tab_id.to_string());
                    *client.last_used.lock().expect("last_used mutex poisoned") = Instant::now();
                    let client = client.clone();
                    self.note_top_connection(&key);
                    return Ok(client);
                }
            }

            let maybe_rx = {
                let in_flight = self.in_flight.lock().expect("in_flight mutex poisoned");
                in_flight.get(&key).map(|tx| tx.subscribe())
            };

            if let Some(mut rx) = maybe_rx {
                match rx.recv().await {
                    Ok(Ok(())) => continue,
                    Ok(Err(message)) => return Err(EngineError::TransientIO(message)),
                    Err(_) => continue,
                }
            }

            let (tx, _rx) = broadcast::channel(1);
            {
                let mut in_flight = self.in_flight.lock().expect("in_flight mutex poisoned");
                if in_flight.contains_key(&key) {
                    continue;
                }
                in_flight.insert(key.clone(), tx.clone());
            }

            let result = self.establish(spec.clone(), tab_id.to_string()).await;

            self.in_flight
                .lock()
                .expect("in_flight mutex poisoned")
                .remove(&key);

            match result {
                Ok(client) => {
                    let _ = tx.send(Ok(()));
                    self.clients
                        .lock()
                        .expect("clients mutex poisoned")
                        .insert(key.clone(), client.clone());
                    self.note_top_connection(&key);
                    return Ok(client);
                }
                Err(err) => {
                    let _ = tx.send(Err(err.to_string()));
                    return Err(err);
                }
            }
        }
    }

    fn note_top_connection(&self, key: &ConnectionKey) {
        let mut top = self.top_connections.lock().expect("top connections poisoned");
        top.retain(|existing| existing != key);
        top.push_front(key.clone());
        while top.len() > self.top_limit {
            top.pop_back();
        }
        let ids = top.iter().map(|k| k.as_str().to_string()).collect();
        drop(top);
        self.events
            .publish(EngineEvent::TopConnectionsChanged { connection_ids: ids });
    }

    /// Removes `tab_id` from a client's reference set. The client is only
    /// torn down when references are empty AND `intentional` is true;
    /// transient drops keep it reserved for reconnection.
    pub fn release(&self, key: &ConnectionKey, tab_id: &str, intentional: bool) {
        let client = {
            let clients = self.clients.lock().expect("clients mutex poisoned");
            clients.get(key).cloned()
        };
        let Some(client) = client else { return };

        client.refs.lock().expect("refs mutex poisoned").remove(tab_id);
        if intentional {
            client.intentional_close.store(true, Ordering::Release);
        }

        if client.refcount() == 0 && client.intentional_close.load(Ordering::Acquire) {
            self.clients.lock().expect("clients mutex poisoned").remove(key);
            debug!("pool: client for {} torn down (refcount 0, intentional)", key.as_str());
        }
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<PooledClient>> {
        self.clients.lock().expect("clients mutex poisoned").get(key).cloned()
    }

    /// Snapshot of every currently pooled client, for callers (the SFTP
    /// Transfer Engine) that need to look one up by its string key without
    /// reconstructing a [`ConnectionKey`] from its parts.
    pub fn clients_snapshot(&self) -> Vec<Arc<PooledClient>> {
        self.clients.lock().expect("clients mutex poisoned").values().cloned().collect()
    }

    /// Re-establishes the transport for an already-pooled client in place,
    /// preserving its identity (and tab refcounts) so sessions holding the
    /// `Arc<PooledClient>` keep working once this returns. Called by the
    /// [`ReconnectionManager`] on each backoff attempt.
    pub async fn reestablish(&self, spec: &ConnectionSpec) -> Result<()> {
        let key = spec.key();
        let existing = self
            .get(&key)
            .ok_or_else(|| EngineError::NotFound(format!("pooled client {}", key.as_str())))?;

        let fresh = match spec.protocol {
            Protocol::Ssh => self.establish_ssh(spec, &spec.id).await?,
            Protocol::Telnet => self.establish_telnet(spec, &spec.id).await?,
        };
        let fresh = Arc::try_unwrap(fresh).unwrap_or_else(|arc| {
            panic!(
                "freshly established client for {} unexpectedly shared",
                arc.key.as_str()
            )
        });

        *existing.transport.write().await = fresh.transport.into_inner();
        existing.ready.store(true, Ordering::Release);
        existing.intentional_close.store(false, Ordering::Release);
        *existing.fingerprint.lock().expect("fingerprint mutex poisoned") =
            fresh.fingerprint.into_inner().expect("fingerprint mutex poisoned");
        *existing.spec.lock().expect("spec mutex poisoned") =
            fresh.spec.into_inner().expect("spec mutex poisoned");
        *existing
            .resolved_username
            .lock()
            .expect("resolved username mutex poisoned") =
            fresh.resolved_username.into_inner().expect("resolved username mutex poisoned");
        existing.reconnect_notify.notify_waiters();
        Ok(())
    }

    async fn establish(&self, spec: ConnectionSpec, tab_id: String) -> Result<Arc<PooledClient>> {
        self.events.publish(EngineEvent::TabConnectionStatus {
            tab_id: tab_id.clone(),
            status: ConnectionStatus::Connecting,
            quality: None,
            protocol: Some(format!("{:?}", spec.protocol)),
        });

        let client = match spec.protocol {
            Protocol::Ssh => self.establish_ssh(&spec, &tab_id).await,
            Protocol::Telnet => self.establish_telnet(&spec, &tab_id).await,
        };

        match &client {
            Ok(_) => self.events.publish(EngineEvent::TabConnectionStatus {
                tab_id: tab_id.clone(),
                status: ConnectionStatus::Connected,
                quality: None,
                protocol: Some(format!("{:?}", spec.protocol)),
            }),
            Err(_) => self.events.publish(EngineEvent::TabConnectionStatus {
                tab_id: tab_id.clone(),
                status: ConnectionStatus::Error,
                quality: None,
                protocol: Some(format!("{:?}", spec.protocol)),
            }),
        }

        client
    }

    async fn establish_ssh(&self, spec: &ConnectionSpec, tab_id: &str) -> Result<Arc<PooledClient>> {
        let ssh_config = Arc::new(SshClientConfig {
            preferred: spec.security_level.preferred(),
            inactivity_timeout: Some(self.ssh_ready_timeout),
            ..Default::default()
        });

        let observed = Arc::new(std::sync::Mutex::new(None));
        let handler = ClientHandler {
            observed: observed.clone(),
        };

        let connect_fut = async {
            if let Some(proxy) = &spec.proxy {
                let stream = dial_proxy(proxy, &spec.host, spec.port).await?;
                russh::client::connect_stream(ssh_config, stream, handler)
                    .await
                    .map_err(EngineError::from)
            } else {
                russh::client::connect(ssh_config, (spec.host.as_str(), spec.port), handler)
                    .await
                    .map_err(EngineError::from)
            }
        };

        let mut session = tokio::time::timeout(self.ssh_ready_timeout, connect_fut)
            .await
            .map_err(|_| EngineError::Timeout(format!("SSH connect to {}:{}", spec.host, spec.port)))??;

        let fingerprint = observed.lock().expect("fingerprint cell poisoned").clone();
        if let Some(fingerprint) = fingerprint.clone() {
            let check = self.hosts.check(&spec.host, spec.port, &fingerprint);
            if let HostCheckResult::Changed(previous) = check {
                // Route through the Auth Orchestrator for explicit user
                // approval rather than failing synchronously; only a
                // rejected/cancelled prompt aborts the connection.
                if self
                    .auth
                    .confirm_host_key(tab_id, &spec.host, spec.port, &fingerprint)
                    .await
                    .is_err()
                {
                    return Err(EngineError::HostKeyChanged {
                        host: spec.host.clone(),
                        port: spec.port,
                        previous,
                    });
                }
            }
        }

        let username = spec.username.clone();
        let password = spec.credential.password.clone();
        let key_path = spec.credential.private_key_path.clone();

        let outcome: AuthOutcome = self
            .auth
            .authenticate(
                tab_id,
                &spec.host,
                spec.port,
                username,
                password,
                key_path,
                |user, password, key_path| {
                    let session = &mut session;
                    async move {
                        let result = if let Some(password) = password {
                            session.authenticate_password(&user, &password).await
                        } else if let Some(path) = key_path {
                            let key_pair = russh::keys::load_secret_key(&path, None)
                                .map_err(|e| e.to_string())?;
                            session
                                .authenticate_publickey(
                                    &user,
                                    russh::keys::PrivateKeyWithHashAlg::new(
                                        Arc::new(key_pair),
                                        None,
                                    ),
                                )
                                .await
                        } else {
                            return Err("no password or private key supplied".to_string());
                        };
                        match result {
                            Ok(auth_result) if auth_result.success() => Ok(()),
                            Ok(_) => Err("permission denied".to_string()),
                            Err(err) => Err(err.to_string()),
                        }
                    }
                },
            )
            .await?;

        if let Some(fingerprint) = &fingerprint {
            self.hosts.remember(&spec.host, spec.port, fingerprint.clone());
        }

        let mut resolved_spec = spec.clone();
        resolved_spec.username = Some(outcome.username.clone());

        Ok(Arc::new(PooledClient {
            key: spec.key(),
            protocol: Protocol::Ssh,
            transport: RwLock::new(ClientTransport::Ssh(Arc::new(session))),
            ready: AtomicBool::new(true),
            refs: std::sync::Mutex::new(HashSet::from([tab_id.to_string()])),
            last_used: std::sync::Mutex::new(Instant::now()),
            fingerprint: std::sync::Mutex::new(observed.lock().expect("fingerprint cell poisoned").clone()),
            reconnect_state: std::sync::Mutex::new(ReconnectState::Idle),
            spec: std::sync::Mutex::new(resolved_spec),
            resolved_username: std::sync::Mutex::new(Some(outcome.username)),
            intentional_close: AtomicBool::new(false),
            reconnect_notify: Notify::new(),
        }))
    }

    async fn establish_telnet(&self, spec: &ConnectionSpec, tab_id: &str) -> Result<Arc<PooledClient>> {
        let stream = if let Some(proxy) = &spec.proxy {
            dial_proxy(proxy, &spec.host, spec.port).await?
        } else {
            tokio::time::timeout(
                self.ssh_ready_timeout,
                TcpStream::connect((spec.host.as_str(), spec.port)),
            )
            .await
            .map_err(|_| EngineError::Timeout(format!("telnet connect to {}:{}", spec.host, spec.port)))??
        };

        Ok(Arc::new(PooledClient {
            key: spec.key(),
            protocol: Protocol::Telnet,
            transport: RwLock::new(ClientTransport::Telnet(Arc::new(AsyncMutex::new(stream)))),
            ready: AtomicBool::new(true),
            refs: std::sync::Mutex::new(HashSet::from([tab_id.to_string()])),
            last_used: std::sync::Mutex::new(Instant::now()),
            fingerprint: std::sync::Mutex::new(None),
            reconnect_state: std::sync::Mutex::new(ReconnectState::Idle),
            spec: std::sync::Mutex::new(spec.clone()),
            resolved_username: std::sync::Mutex::new(None),
            intentional_close: AtomicBool::new(false),
            reconnect_notify: Notify::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthOrchestrator;
    use std::time::Duration;

    fn test_pool() -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(KnownHostsCache::new()),
            Arc::new(AuthOrchestrator::new(
                EventBus::new(16),
                Duration::from_secs(1),
                3,
            )),
            EventBus::new(16),
            2,
            Duration::from_secs(1),
        )
    }

    fn key(host: &str) -> ConnectionKey {
        ConnectionKey::from_parts(Protocol::Ssh, host, 22, Some("demo"), None)
    }

    #[test]
    fn top_connections_keeps_most_recent_first_and_truncates() {
        let pool = test_pool();
        pool.note_top_connection(&key("a"));
        pool.note_top_connection(&key("b"));
        pool.note_top_connection(&key("c"));
        let top = pool.top_connections.lock().expect("top connections poisoned");
        assert_eq!(top.len(), 2);
        assert_eq!(top[0], key("c"));
        assert_eq!(top[1], key("b"));
    }

    #[test]
    fn renoting_an_existing_connection_moves_it_to_front_without_duplicating() {
        let pool = test_pool();
        pool.note_top_connection(&key("a"));
        pool.note_top_connection(&key("b"));
        pool.note_top_connection(&key("a"));
        let top = pool.top_connections.lock().expect("top connections poisoned");
        assert_eq!(top.len(), 2);
        assert_eq!(top[0], key("a"));
        assert_eq!(top[1], key("b"));
    }

    #[test]
    fn release_without_a_known_client_is_a_no_op() {
        let pool = test_pool();
        pool.release(&key("ghost"), "tab1", true);
    }
}
