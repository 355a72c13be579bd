//! # termharbor-core - Session & Transfer Engine
//!
//! `termharbor_core` is a Rust library backing a terminal host application:
//! it multiplexes SSH and Telnet shell sessions and SFTP file transfers over
//! a shared pool of network connections, with reconnection, latency
//! probing, and resumable transfers built in. The [`engine::Engine`] façade
//! is the single entry point a UI transport drives.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use termharbor_core::catalog::{AuthMode, ConnectionSpec, Credential, Protocol};
//! use termharbor_core::config::EngineConfig;
//! use termharbor_core::engine::Engine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(EngineConfig::default(), "/tmp/termharbor".into()).await?;
//!
//!     let spec = ConnectionSpec {
//!         id: "router-1".to_string(),
//!         name: "Core router".to_string(),
//!         protocol: Protocol::Ssh,
//!         host: "192.168.1.1".to_string(),
//!         port: 22,
//!         username: Some("admin".to_string()),
//!         credential: Credential {
//!             password: Some("password".to_string()),
//!             private_key_path: None,
//!         },
//!         auth_mode: AuthMode::Password,
//!         proxy: None,
//!         keep_alive_interval_secs: None,
//!         security_level: Default::default(),
//!     };
//!
//!     let process_id = engine.start_ssh(spec, "tab-1".to_string()).await?;
//!     engine.write_input(process_id, b"show version\n").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`engine::Engine`] - the façade wiring every component together
//! - [`pool::ConnectionPool`] / [`pool::ReconnectionManager`] - pooled SSH/Telnet clients with backoff recovery
//! - [`stream`] - per-process shell stream multiplexing and UTF-8 framing
//! - [`transfer::TransferEngine`] - resumable, chunked SFTP transfers
//! - [`auth::AuthOrchestrator`] - interactive credential/host-key handshakes
//! - [`catalog::Catalog`] - the persisted connection tree
//! - [`events::EventBus`] - typed events toward the UI transport
//! - [`error::EngineError`] - the error taxonomy every fallible operation returns

pub mod auth;
pub mod backpressure;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hosts;
pub mod latency;
pub mod memory;
pub mod pool;
pub mod proxy;
pub mod security;
pub mod stream;
pub mod transfer;

pub use engine::Engine;
pub use error::{EngineError, Result};
