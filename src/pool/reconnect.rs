//! Reconnection Manager (C6): exponential-backoff recovery for a
//! [`super::PooledClient`] whose transport dropped without an intentional
//! close.
//!
//! Grounded on the teacher's cache-invalidate-then-recreate sequence in
//! `session/manager.rs::get_with_security_and_recording` (detect a dead
//! cached connection, tear down, reconnect) generalized from "next caller
//! pays the reconnect cost" into a background attempt loop per spec.md §4.6,
//! since a transient drop must keep the `PooledClient` reserved rather than
//! evicting it the way the teacher's `moka` cache would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Mutex;

use crate::catalog::{ConnectionKey, ConnectionSpec};
use crate::events::{ConnectionStatus, EngineEvent, EventBus};

use super::ConnectionPool;

/// Reconnection state of a [`super::PooledClient`]. Transitions are monotone
/// within one attempt cycle: `idle -> pending -> reconnecting -> {idle, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    Pending,
    Reconnecting,
    Failed,
}

/// Drives the backoff loop for keys whose client dropped transiently.
/// Concurrent triggers for the same key coalesce onto the single in-flight
/// attempt loop already running for it.
pub struct ReconnectionManager {
    pool: Arc<ConnectionPool>,
    events: EventBus,
    initial_backoff: Duration,
    max_backoff: Duration,
    window: Duration,
    inflight: Mutex<HashMap<ConnectionKey, ()>>,
}

impl ReconnectionManager {
    pub fn new(
        pool: Arc<ConnectionPool>,
        events: EventBus,
        initial_backoff: Duration,
        max_backoff: Duration,
        window: Duration,
    ) -> Self {
        Self {
            pool,
            events,
            initial_backoff,
            max_backoff,
            window,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Called when a shell/telnet stream closes without the intentional-close
    /// flag set. Schedules backoff attempts (250 ms × 2ⁿ, capped at 10 s) up
    /// to a total window of 60 s. Any acquire during `pending|reconnecting`
    /// should await `client.reconnect_notify` rather than starting a second
    /// parallel attempt; this method itself is idempotent per key.
    pub async fn notify_transient_close(self: &Arc<Self>, spec: ConnectionSpec, tab_id: String) {
        let key = spec.key();
        {
            let mut inflight = self.inflight.lock().await;
            if inflight.contains_key(&key) {
                debug!("reconnect: attempt already in flight for {}", key.as_str());
                return;
            }
            inflight.insert(key.clone(), ());
        }

        let Some(client) = self.pool.get(&key) else {
            self.inflight.lock().await.remove(&key);
            return;
        };
        if client.is_intentionally_closed() {
            self.inflight.lock().await.remove(&key);
            return;
        }

        client.set_reconnect_state(ReconnectState::Pending);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_backoff_loop(spec, tab_id).await;
        });
    }

    async fn run_backoff_loop(self: Arc<Self>, spec: ConnectionSpec, tab_id: String) {
        let key = spec.key();
        let deadline = tokio::time::Instant::now() + self.window;
        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;

        loop {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            attempt += 1;

            let Some(client) = self.pool.get(&key) else {
                break;
            };
            client.set_reconnect_state(ReconnectState::Reconnecting);
            debug!(
                "reconnect: attempt {attempt} for {} (backoff was {:?})",
                key.as_str(),
                backoff
            );

            match self.pool.reestablish(&spec).await {
                Ok(()) => {
                    client.set_reconnect_state(ReconnectState::Idle);
                    self.events.publish(EngineEvent::TabConnectionStatus {
                        tab_id: tab_id.clone(),
                        status: ConnectionStatus::Connected,
                        quality: None,
                        protocol: Some(format!("{:?}", spec.protocol)),
                    });
                    debug!("reconnect: {} recovered on attempt {attempt}", key.as_str());
                    self.inflight.lock().await.remove(&key);
                    return;
                }
                Err(err) => {
                    warn!("reconnect: attempt {attempt} for {} failed: {err}", key.as_str());
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let sleep_for = backoff.min(remaining);
            if sleep_for.is_zero() {
                break;
            }
            tokio::time::sleep(sleep_for).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }

        if let Some(client) = self.pool.get(&key) {
            client.set_reconnect_state(ReconnectState::Failed);
        }
        self.events.publish(EngineEvent::TabConnectionStatus {
            tab_id,
            status: ConnectionStatus::Offline,
            quality: None,
            protocol: Some(format!("{:?}", spec.protocol)),
        });
        warn!("reconnect: exhausted backoff window for {}", key.as_str());
        self.inflight.lock().await.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthOrchestrator;
    use crate::hosts::KnownHostsCache;

    fn test_pool() -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            Arc::new(KnownHostsCache::new()),
            Arc::new(AuthOrchestrator::new(EventBus::new(16), Duration::from_secs(1), 3)),
            EventBus::new(16),
            5,
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn notify_on_unknown_key_is_a_no_op() {
        let pool = test_pool();
        let manager = Arc::new(ReconnectionManager::new(
            pool,
            EventBus::new(16),
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_millis(100),
        ));
        let spec = crate::catalog::ConnectionSpec {
            id: "a".to_string(),
            name: "a".to_string(),
            protocol: crate::catalog::Protocol::Ssh,
            host: "203.0.113.10".to_string(),
            port: 22,
            username: Some("demo".to_string()),
            credential: crate::catalog::Credential::default(),
            auth_mode: crate::catalog::AuthMode::Password,
            proxy: None,
            keep_alive_interval_secs: None,
            security_level: Default::default(),
        };
        manager.notify_transient_close(spec, "tab1".to_string()).await;
    }
}
