//! Known-Hosts Cache (C3): in-memory host fingerprint tracking with change
//! detection.
//!
//! `russh` verifies host keys through a `client::Handler::check_server_key`
//! callback rather than the `ServerCheckMethod` enum the teacher's
//! `async-ssh2-tokio` wrapper exposed (`session/security.rs`); this module
//! is the policy object that callback consults, gating connection
//! establishment on the Auth Orchestrator the way `ConnectionSecurityOptions`
//! gated algorithm negotiation.

use std::collections::HashMap;
use std::sync::Mutex;

use russh::keys::PublicKey;
use sha1::{Digest, Sha1};

/// Formats a public key as a colon-separated hex SHA-1 digest, e.g.
/// `aa:bb:cc:...`.
pub fn fingerprint_of(key: &PublicKey) -> String {
    let encoded = key.to_bytes().unwrap_or_default();
    let digest = Sha1::digest(&encoded);
    digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Result of checking an incoming fingerprint against the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCheckResult {
    /// No fingerprint recorded yet for this host/port.
    Unknown,
    /// Matches the recorded fingerprint.
    Match,
    /// Differs from the recorded fingerprint; carries the previous value.
    Changed(String),
}

/// Process-wide known-hosts cache, keyed by (host, port).
#[derive(Default)]
pub struct KnownHostsCache {
    entries: Mutex<HashMap<(String, u16), String>>,
}

impl KnownHostsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks `incoming` against any previously remembered fingerprint.
    pub fn check(&self, host: &str, port: u16, incoming: &str) -> HostCheckResult {
        let entries = self.entries.lock().expect("known-hosts mutex poisoned");
        match entries.get(&(host.to_string(), port)) {
            None => HostCheckResult::Unknown,
            Some(existing) if existing == incoming => HostCheckResult::Match,
            Some(existing) => HostCheckResult::Changed(existing.clone()),
        }
    }

    /// Records a fingerprint as the accepted one for (host, port),
    /// overwriting any previous value. Called after the user approves a
    /// first-seen or changed key via the Auth Orchestrator.
    pub fn remember(&self, host: &str, port: u16, fingerprint: String) {
        let mut entries = self.entries.lock().expect("known-hosts mutex poisoned");
        entries.insert((host.to_string(), port), fingerprint);
    }

    /// Removes any recorded fingerprint, e.g. after an explicit "forget host".
    pub fn forget(&self, host: &str, port: u16) {
        let mut entries = self.entries.lock().expect("known-hosts mutex poisoned");
        entries.remove(&(host.to_string(), port));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_host_returns_unknown() {
        let cache = KnownHostsCache::new();
        assert_eq!(
            cache.check("example.com", 22, "aa:bb"),
            HostCheckResult::Unknown
        );
    }

    #[test]
    fn remembered_host_matches_same_fingerprint() {
        let cache = KnownHostsCache::new();
        cache.remember("example.com", 22, "aa:bb".to_string());
        assert_eq!(
            cache.check("example.com", 22, "aa:bb"),
            HostCheckResult::Match
        );
    }

    #[test]
    fn changed_fingerprint_is_detected() {
        let cache = KnownHostsCache::new();
        cache.remember("example.com", 22, "aa:bb".to_string());
        assert_eq!(
            cache.check("example.com", 22, "cc:dd"),
            HostCheckResult::Changed("aa:bb".to_string())
        );
    }

    #[test]
    fn forget_clears_the_entry() {
        let cache = KnownHostsCache::new();
        cache.remember("example.com", 22, "aa:bb".to_string());
        cache.forget("example.com", 22);
        assert_eq!(
            cache.check("example.com", 22, "aa:bb"),
            HostCheckResult::Unknown
        );
    }
}
