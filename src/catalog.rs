//! Connection catalog: `ConnectionSpec`/`ConnectionKey` data model and the
//! persisted grouping tree described in the design spec's external
//! interfaces section.
//!
//! `ConnectionSpec` is immutable except through [`Catalog::update_credentials`],
//! which mirrors the teacher's `matches_connection_params`/
//! `calculate_password_hash` pair (`session/client.rs`) so a credential
//! update that doesn't actually change anything is a no-op rather than
//! forcing a fresh Auth Orchestrator run.

use std::collections::HashMap;
use std::sync::Mutex;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::security::SecurityLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Ssh,
    Telnet,
}

impl Protocol {
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Ssh => 22,
            Protocol::Telnet => 23,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Password,
    PublicKey,
    Interactive,
}

/// The credential triplet: at most one of a password or a private key path,
/// mutable only through `update_credentials`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Credential {
    pub password: Option<String>,
    pub private_key_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Http,
    Socks,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProxySpec {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// User-supplied connection intent. Immutable except through
/// [`Catalog::update_credentials`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionSpec {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub credential: Credential,
    pub auth_mode: AuthMode,
    pub proxy: Option<ProxySpec>,
    pub keep_alive_interval_secs: Option<u64>,
    #[serde(default)]
    pub security_level: SecurityLevel,
}

impl ConnectionSpec {
    /// Deterministic fingerprint shared by any spec with the same
    /// {protocol, host, port, username, proxy}; specs sharing a key share a
    /// pooled client.
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::from_parts(
            self.protocol,
            &self.host,
            self.port,
            self.username.as_deref(),
            self.proxy.as_ref(),
        )
    }
}

/// Deterministic identity of a pooled client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn from_parts(
        protocol: Protocol,
        host: &str,
        port: u16,
        username: Option<&str>,
        proxy: Option<&ProxySpec>,
    ) -> Self {
        let proxy_part = proxy
            .map(|p| format!("{:?}:{}:{}", p.kind, p.host, p.port))
            .unwrap_or_default();
        Self(format!(
            "{:?}|{}|{}|{}|{}",
            protocol,
            host,
            port,
            username.unwrap_or(""),
            proxy_part
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A node in the persisted connection catalog tree. Either a leaf connection
/// or a group of nodes, to arbitrary depth.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CatalogNode {
    Connection {
        #[serde(flatten)]
        spec: ConnectionSpec,
    },
    Group {
        id: String,
        name: String,
        items: Vec<CatalogNode>,
    },
}

fn hash_credential(credential: &Credential) -> [u8; 32] {
    let mut hasher = Sha256::new();
    if let Some(password) = &credential.password {
        hasher.update(b"password:");
        hasher.update(password.as_bytes());
    }
    if let Some(path) = &credential.private_key_path {
        hasher.update(b"key:");
        hasher.update(path.as_bytes());
    }
    hasher.finalize().into()
}

/// Owns the catalog tree and the flat id→spec index used for fast lookups
/// and credential updates.
pub struct Catalog {
    tree: Mutex<Vec<CatalogNode>>,
    specs: Mutex<HashMap<String, ConnectionSpec>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(Vec::new()),
            specs: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the whole catalog tree, e.g. after loading from disk, and
    /// rebuilds the flat index.
    pub fn load(&self, tree: Vec<CatalogNode>) {
        let mut index = HashMap::new();
        index_tree(&tree, &mut index);
        *self.tree.lock().expect("catalog mutex poisoned") = tree;
        *self.specs.lock().expect("catalog mutex poisoned") = index;
    }

    /// Snapshot of the current catalog tree.
    pub fn tree(&self) -> Vec<CatalogNode> {
        self.tree.lock().expect("catalog mutex poisoned").clone()
    }

    pub fn get(&self, id: &str) -> Option<ConnectionSpec> {
        self.specs
            .lock()
            .expect("catalog mutex poisoned")
            .get(id)
            .cloned()
    }

    /// Updates only the credential triplet of a connection. Returns `true`
    /// if the credential actually changed (a no-op update returns `false`
    /// and skips re-running the Auth Orchestrator).
    pub fn update_credentials(&self, id: &str, new_credential: Credential) -> Result<bool> {
        let mut specs = self.specs.lock().expect("catalog mutex poisoned");
        let spec = specs
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("connection {id}")))?;

        if hash_credential(&spec.credential) == hash_credential(&new_credential) {
            return Ok(false);
        }
        spec.credential = new_credential;

        let mut tree = self.tree.lock().expect("catalog mutex poisoned");
        update_tree_credential(&mut tree, id, &specs[id].credential);
        Ok(true)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

fn index_tree(nodes: &[CatalogNode], index: &mut HashMap<String, ConnectionSpec>) {
    for node in nodes {
        match node {
            CatalogNode::Connection { spec } => {
                index.insert(spec.id.clone(), spec.clone());
            }
            CatalogNode::Group { items, .. } => index_tree(items, index),
        }
    }
}

fn update_tree_credential(nodes: &mut [CatalogNode], id: &str, credential: &Credential) {
    for node in nodes.iter_mut() {
        match node {
            CatalogNode::Connection { spec } if spec.id == id => {
                spec.credential = credential.clone();
                return;
            }
            CatalogNode::Connection { .. } => {}
            CatalogNode::Group { items, .. } => update_tree_credential(items, id, credential),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec(id: &str) -> ConnectionSpec {
        ConnectionSpec {
            id: id.to_string(),
            name: "demo".to_string(),
            protocol: Protocol::Ssh,
            host: "203.0.113.10".to_string(),
            port: 22,
            username: Some("demo".to_string()),
            credential: Credential {
                password: Some("wrong".to_string()),
                private_key_path: None,
            },
            auth_mode: AuthMode::Password,
            proxy: None,
            keep_alive_interval_secs: None,
            security_level: SecurityLevel::default(),
        }
    }

    #[test]
    fn matching_specs_share_a_connection_key() {
        let a = sample_spec("a");
        let mut b = sample_spec("b");
        b.credential.password = Some("different".to_string());
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn update_credentials_is_idempotent_for_same_password() {
        let catalog = Catalog::new();
        catalog.load(vec![CatalogNode::Connection {
            spec: sample_spec("a"),
        }]);
        let changed = catalog
            .update_credentials(
                "a",
                Credential {
                    password: Some("wrong".to_string()),
                    private_key_path: None,
                },
            )
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn update_credentials_applies_a_real_change() {
        let catalog = Catalog::new();
        catalog.load(vec![CatalogNode::Connection {
            spec: sample_spec("a"),
        }]);
        let changed = catalog
            .update_credentials(
                "a",
                Credential {
                    password: Some("correct".to_string()),
                    private_key_path: None,
                },
            )
            .unwrap();
        assert!(changed);
        assert_eq!(
            catalog.get("a").unwrap().credential.password.as_deref(),
            Some("correct")
        );
    }

    #[test]
    fn update_credentials_on_unknown_id_is_not_found() {
        let catalog = Catalog::new();
        let result = catalog.update_credentials(
            "missing",
            Credential {
                password: None,
                private_key_path: None,
            },
        );
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[test]
    fn groups_nest_to_arbitrary_depth() {
        let catalog = Catalog::new();
        catalog.load(vec![CatalogNode::Group {
            id: "g1".to_string(),
            name: "Prod".to_string(),
            items: vec![CatalogNode::Group {
                id: "g2".to_string(),
                name: "EU".to_string(),
                items: vec![CatalogNode::Connection {
                    spec: sample_spec("nested"),
                }],
            }],
        }]);
        assert!(catalog.get("nested").is_some());
    }
}
