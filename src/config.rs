//! SSH algorithm preference tables and top-level engine configuration.
//!
//! The algorithm tables mirror three compatibility tiers — strict modern
//! algorithms, a balanced default, and a maximum-compatibility legacy tier for
//! older SSH servers — selected per connection via [`crate::security::SecurityLevel`].
//! `EngineConfig` collects every tunable named explicitly in the design spec so
//! none of it hides as a magic number deep in a component.

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};
use std::time::Duration;

/// Modern, strict key exchange algorithms only.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G18_SHA512,
];

/// Modern AEAD ciphers only.
pub static SECURE_CIPHERS: &[cipher::Name] =
    &[cipher::AES_256_GCM, cipher::CHACHA20_POLY1305, cipher::AES_256_CTR];

/// Modern MAC algorithms, ETM variants preferred.
pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[mac::HMAC_SHA256_ETM, mac::HMAC_SHA512_ETM];

/// Modern host key algorithms only.
pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
];

/// Good security with broader compatibility: adds CBC ciphers and plain HMAC.
pub const BALANCED_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G14_SHA256,
    kex::DH_G16_SHA512,
    kex::DH_G18_SHA512,
    kex::DH_GEX_SHA256,
];

pub static BALANCED_CIPHERS: &[cipher::Name] = &[
    cipher::AES_256_GCM,
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
];

pub const BALANCED_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
];

pub const BALANCED_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa { hash: None },
];

/// Maximum compatibility for legacy network gear: every algorithm `russh`
/// exposes, including deprecated ones.
pub const LEGACY_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA1,
    kex::DH_GEX_SHA256,
    kex::DH_G1_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G15_SHA512,
    kex::DH_G16_SHA512,
    kex::DH_G17_SHA512,
    kex::DH_G18_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
];

pub static LEGACY_CIPHERS: &[cipher::Name] = &[
    cipher::NONE,
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_256_GCM,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
    cipher::CHACHA20_POLY1305,
];

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::NONE,
    mac::HMAC_SHA1,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
];

pub const LEGACY_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Dsa,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Ed25519,
    Algorithm::Rsa { hash: None },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::SkEcdsaSha2NistP256,
    Algorithm::SkEd25519,
];

/// Compression preference shared across all security levels: the engine
/// never needs compression for interactive shells, but accepts it if a
/// legacy server insists.
pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] =
    &[compression::NONE, compression::ZLIB, compression::ZLIB_LEGACY];

/// One memory pool size class: `block_size` bytes, `initial_count` blocks
/// pre-allocated at startup, grown up to `initial_count * hard_cap_multiplier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolClassConfig {
    pub block_size: usize,
    pub initial_count: usize,
    pub hard_cap_multiplier: usize,
}

/// Top-level engine configuration. `EngineConfig::default()` reproduces every
/// default named in the design spec.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // --- Memory Pool (C1) ---
    pub pool_classes: Vec<PoolClassConfig>,
    pub pool_global_ceiling_bytes: usize,
    pub pool_reclaim_age: Duration,
    pub pool_fragmentation_shrink_ratio: f64,
    pub pool_shrink_target_ratio: f64,
    pub pool_gc_trigger_ratio: f64,

    // --- Backpressure Controller (C2) ---
    pub backpressure_initial_credit: usize,
    pub backpressure_max_credit: usize,
    pub backpressure_throttle_ratio: f64,

    // --- Connection Pool / Reconnection Manager (C5/C6) ---
    pub top_connections_limit: usize,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub reconnect_window: Duration,

    // --- Stream Multiplexer (C7) ---
    pub shell_ingress_hard_cap_bytes: usize,
    pub shell_ingress_pause_threshold_bytes: usize,
    pub shell_pause_duration: Duration,
    pub shell_initial_cols: u32,
    pub shell_initial_rows: u32,

    // --- Latency Prober (C8) ---
    pub latency_probe_interval: Duration,
    pub latency_window_size: usize,

    // --- SFTP Transfer Engine (C9) ---
    pub max_concurrent_transfers: usize,
    pub transfer_retry_limit: u32,
    pub transfer_chunk_preallocate: usize,

    // --- Resume Journal (C10) ---
    pub journal_progress_delta_bytes: u64,
    pub journal_progress_interval: Duration,
    pub journal_completed_retention: Duration,
    pub journal_cancelled_retention: Duration,
    pub journal_ledger_capacity: usize,

    // --- Auth Orchestrator (C4) ---
    pub auth_timeout: Duration,
    pub auth_max_retries: u32,

    // --- Connection establishment timeouts ---
    pub ssh_ready_timeout: Duration,
    pub chunk_io_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_classes: vec![
                PoolClassConfig {
                    block_size: 4 * 1024,
                    initial_count: 100,
                    hard_cap_multiplier: 3,
                },
                PoolClassConfig {
                    block_size: 64 * 1024,
                    initial_count: 50,
                    hard_cap_multiplier: 3,
                },
                PoolClassConfig {
                    block_size: 1024 * 1024,
                    initial_count: 20,
                    hard_cap_multiplier: 3,
                },
                PoolClassConfig {
                    block_size: 8 * 1024 * 1024,
                    initial_count: 5,
                    hard_cap_multiplier: 3,
                },
            ],
            pool_global_ceiling_bytes: 512 * 1024 * 1024,
            pool_reclaim_age: Duration::from_secs(5 * 60),
            pool_fragmentation_shrink_ratio: 0.7,
            pool_shrink_target_ratio: 0.2,
            pool_gc_trigger_ratio: 0.8,

            backpressure_initial_credit: 256 * 1024,
            backpressure_max_credit: 1024 * 1024,
            backpressure_throttle_ratio: 0.75,

            top_connections_limit: 5,
            reconnect_initial_backoff: Duration::from_millis(250),
            reconnect_max_backoff: Duration::from_secs(10),
            reconnect_window: Duration::from_secs(60),

            shell_ingress_hard_cap_bytes: 10 * 1024 * 1024,
            shell_ingress_pause_threshold_bytes: 1024 * 1024,
            shell_pause_duration: Duration::from_millis(100),
            shell_initial_cols: 120,
            shell_initial_rows: 30,

            latency_probe_interval: Duration::from_secs(30),
            latency_window_size: 10,

            max_concurrent_transfers: 5,
            transfer_retry_limit: 3,
            transfer_chunk_preallocate: 3,

            journal_progress_delta_bytes: 1024 * 1024,
            journal_progress_interval: Duration::from_secs(5),
            journal_completed_retention: Duration::from_secs(24 * 60 * 60),
            journal_cancelled_retention: Duration::from_secs(5),
            journal_ledger_capacity: 500,

            auth_timeout: Duration::from_secs(5 * 60),
            auth_max_retries: 3,

            ssh_ready_timeout: Duration::from_secs(60),
            chunk_io_timeout: Duration::from_secs(60),
        }
    }
}

/// Chooses an SFTP chunk size from total transfer size, per spec.md §4.9 step 2.
pub fn chunk_size_for(total_bytes: u64) -> usize {
    const MIB: u64 = 1024 * 1024;
    if total_bytes < MIB {
        32 * 1024
    } else if total_bytes < 100 * MIB {
        128 * 1024
    } else {
        512 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_boundaries() {
        assert_eq!(chunk_size_for(0), 32 * 1024);
        assert_eq!(chunk_size_for(1024 * 1024 - 1), 32 * 1024);
        assert_eq!(chunk_size_for(1024 * 1024), 128 * 1024);
        assert_eq!(chunk_size_for(99 * 1024 * 1024), 128 * 1024);
        assert_eq!(chunk_size_for(100 * 1024 * 1024), 512 * 1024);
        assert_eq!(chunk_size_for(1024 * 1024 * 1024), 512 * 1024);
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.pool_classes.len(), 4);
        assert_eq!(cfg.pool_global_ceiling_bytes, 512 * 1024 * 1024);
        assert_eq!(cfg.backpressure_initial_credit, 256 * 1024);
        assert_eq!(cfg.backpressure_max_credit, 1024 * 1024);
        assert_eq!(cfg.max_concurrent_transfers, 5);
        assert_eq!(cfg.top_connections_limit, 5);
        assert_eq!(cfg.reconnect_max_backoff, Duration::from_secs(10));
        assert_eq!(cfg.reconnect_window, Duration::from_secs(60));
    }
}
