//! Lookup seam for server and node records.
//!
//! The control plane does not own the fleet database. Deployments plug in a
//! `Directory` implementation backed by whatever store holds server and node
//! metadata; `MemoryDirectory` covers tests and standalone runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backup::StorageMode;

/// A provisioned server instance living on some node.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub id: i64,
    pub uuid: Uuid,
    pub node_id: Uuid,
    pub name: String,
    /// Per-server storage mode override; `None` falls back to the global mode.
    pub backup_mode: Option<StorageMode>,
    /// Per-server storage backend settings. Credential fields may be stored
    /// as `v1:` envelopes.
    pub storage: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: Uuid,
    pub name: String,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn server_by_uuid(&self, uuid: Uuid) -> anyhow::Result<Option<ServerRecord>>;

    async fn node(&self, id: Uuid) -> anyhow::Result<Option<NodeRecord>>;

    /// Whether the given operator may act on the given server.
    async fn can_access(&self, user_id: &str, server_uuid: Uuid) -> anyhow::Result<bool>;
}

/// In-memory directory for tests and single-binary deployments.
#[derive(Default)]
pub struct MemoryDirectory {
    servers: RwLock<HashMap<Uuid, ServerRecord>>,
    nodes: RwLock<HashMap<Uuid, NodeRecord>>,
    grants: RwLock<HashSet<(String, Uuid)>>,
    permissive: bool,
}

impl MemoryDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A directory that grants every operator access to every server.
    pub fn permissive() -> Arc<Self> {
        Arc::new(Self {
            permissive: true,
            ..Self::default()
        })
    }

    pub async fn insert_server(&self, server: ServerRecord) {
        self.servers.write().await.insert(server.uuid, server);
    }

    pub async fn insert_node(&self, node: NodeRecord) {
        self.nodes.write().await.insert(node.id, node);
    }

    pub async fn grant(&self, user_id: &str, server_uuid: Uuid) {
        self.grants
            .write()
            .await
            .insert((user_id.to_string(), server_uuid));
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn server_by_uuid(&self, uuid: Uuid) -> anyhow::Result<Option<ServerRecord>> {
        Ok(self.servers.read().await.get(&uuid).cloned())
    }

    async fn node(&self, id: Uuid) -> anyhow::Result<Option<NodeRecord>> {
        Ok(self.nodes.read().await.get(&id).cloned())
    }

    async fn can_access(&self, user_id: &str, server_uuid: Uuid) -> anyhow::Result<bool> {
        if self.permissive {
            return Ok(true);
        }
        Ok(self
            .grants
            .read()
            .await
            .contains(&(user_id.to_string(), server_uuid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_scope_access_per_server() {
        let dir = MemoryDirectory::new();
        let server = Uuid::new_v4();
        let other = Uuid::new_v4();
        dir.grant("alice", server).await;

        assert!(dir.can_access("alice", server).await.unwrap());
        assert!(!dir.can_access("alice", other).await.unwrap());
        assert!(!dir.can_access("bob", server).await.unwrap());
    }

    #[tokio::test]
    async fn permissive_directory_grants_everything() {
        let dir = MemoryDirectory::permissive();
        assert!(dir.can_access("anyone", Uuid::new_v4()).await.unwrap());
    }
}
