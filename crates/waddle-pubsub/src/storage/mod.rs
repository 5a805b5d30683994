//! PubSub persistence gateway.
//!
//! The engine writes through [`PubSubStorage`] asynchronously (see
//! [`PersistenceQueue`]) and reads through it when a service starts.
//! Failures are reported as [`StorageError`] and never surface as engine
//! errors for mutations that already happened in memory.

mod memory;
mod queue;

pub use memory::InMemoryPubSubStorage;
pub use queue::{PersistenceQueue, StorageOp};

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::affiliation::NodeAffiliate;
use crate::id::{ItemId, NodeId, ServiceId};
use crate::item::PublishedItem;
use crate::node::{NodeConfig, NodeType};
use crate::subscription::NodeSubscription;

/// Errors that can occur during PubSub storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Stored representation of a node's own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub node_type: NodeType,
    pub creator: BareJid,
    pub config: NodeConfig,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A node as loaded at startup, with its affiliations and subscriptions.
#[derive(Debug, Clone)]
pub struct StoredNode {
    pub record: NodeRecord,
    pub affiliates: Vec<NodeAffiliate>,
    pub subscriptions: Vec<NodeSubscription>,
}

/// Storage trait for PubSub nodes, memberships and items.
///
/// Methods may be called from any task. Implementations are responsible
/// for their own serialization and transactionality.
#[async_trait]
pub trait PubSubStorage: Send + Sync + 'static {
    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Store a new node.
    async fn create_node(&self, node: &NodeRecord) -> Result<(), StorageError>;

    /// Update a node's own fields.
    async fn update_node(&self, node: &NodeRecord) -> Result<(), StorageError>;

    /// Remove a node together with its affiliations, subscriptions and items.
    async fn remove_node(&self, node: &NodeId) -> Result<(), StorageError>;

    /// Load every node of a service.
    async fn load_nodes(&self, service: &ServiceId) -> Result<Vec<StoredNode>, StorageError>;

    /// Load one node.
    async fn load_node(&self, node: &NodeId) -> Result<Option<StoredNode>, StorageError>;

    // ------------------------------------------------------------------
    // Affiliations, keyed by (node, JID)
    // ------------------------------------------------------------------

    async fn create_affiliation(
        &self,
        node: &NodeId,
        affiliate: &NodeAffiliate,
    ) -> Result<(), StorageError>;

    async fn update_affiliation(
        &self,
        node: &NodeId,
        affiliate: &NodeAffiliate,
    ) -> Result<(), StorageError>;

    async fn remove_affiliation(&self, node: &NodeId, jid: &Jid) -> Result<(), StorageError>;

    // ------------------------------------------------------------------
    // Subscriptions, keyed by (node, JID, subid)
    // ------------------------------------------------------------------

    async fn create_subscription(&self, subscription: &NodeSubscription)
        -> Result<(), StorageError>;

    async fn update_subscription(&self, subscription: &NodeSubscription)
        -> Result<(), StorageError>;

    async fn remove_subscription(&self, subscription: &NodeSubscription)
        -> Result<(), StorageError>;

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    /// Insert or overwrite an item by its identifier.
    async fn save_item(&self, item: &PublishedItem) -> Result<(), StorageError>;

    /// Remove an item. Removing a missing item is not an error.
    async fn remove_item(&self, item: &ItemId) -> Result<(), StorageError>;

    /// The `max_items` most recent items of a leaf (0 = all), oldest first.
    async fn get_items(
        &self,
        node: &NodeId,
        max_items: u32,
    ) -> Result<Vec<PublishedItem>, StorageError>;

    /// The most recently published item of a leaf.
    async fn get_last_item(&self, node: &NodeId) -> Result<Option<PublishedItem>, StorageError>;

    /// One item by identifier.
    async fn get_item(&self, item: &ItemId) -> Result<Option<PublishedItem>, StorageError>;

    /// Remove every item of a leaf.
    async fn purge_node(&self, node: &NodeId) -> Result<(), StorageError>;

    /// Apply a batch of item writes.
    ///
    /// Deletes are applied before adds, and an item present in both lists
    /// is not added.
    async fn bulk_items(
        &self,
        add: &[PublishedItem],
        delete: &[ItemId],
    ) -> Result<(), StorageError> {
        for id in delete {
            self.remove_item(id).await?;
        }

        let deleted: HashSet<&ItemId> = delete.iter().collect();
        for item in add.iter().filter(|i| !deleted.contains(&i.id)) {
            self.save_item(item).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Default node configurations, keyed by (service, node type)
    // ------------------------------------------------------------------

    async fn create_default_config(
        &self,
        service: &ServiceId,
        node_type: NodeType,
        config: &NodeConfig,
    ) -> Result<(), StorageError>;

    async fn update_default_config(
        &self,
        service: &ServiceId,
        node_type: NodeType,
        config: &NodeConfig,
    ) -> Result<(), StorageError>;

    async fn load_default_config(
        &self,
        service: &ServiceId,
        node_type: NodeType,
    ) -> Result<Option<NodeConfig>, StorageError>;
}
