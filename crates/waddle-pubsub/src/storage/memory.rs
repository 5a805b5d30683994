//! In-memory implementation of PubSub storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use jid::Jid;

use super::{NodeRecord, PubSubStorage, StorageError, StoredNode};
use crate::affiliation::NodeAffiliate;
use crate::id::{ItemId, NodeId, ServiceId};
use crate::item::PublishedItem;
use crate::node::{NodeConfig, NodeType};
use crate::subscription::NodeSubscription;

/// In-memory implementation of PubSub storage.
///
/// Uses DashMap for thread-safe concurrent access. Suitable for development,
/// tests and single-node deployments without durability requirements.
#[derive(Default)]
pub struct InMemoryPubSubStorage {
    /// Map of node id -> node record
    nodes: DashMap<NodeId, NodeRecord>,
    /// Map of node id -> JID -> affiliation
    affiliations: DashMap<NodeId, HashMap<Jid, NodeAffiliate>>,
    /// Map of node id -> subid -> subscription
    subscriptions: DashMap<NodeId, HashMap<String, NodeSubscription>>,
    /// Map of node id -> items, oldest first
    items: DashMap<NodeId, Vec<PublishedItem>>,
    /// Map of (service, node type) -> default configuration as JSON
    defaults: DashMap<(ServiceId, NodeType), String>,
    /// When set, every call fails with a backend error.
    failing: AtomicBool,
}

impl InMemoryPubSubStorage {
    /// Create a new in-memory PubSub storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of stored nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Ids of the stored items of a node, oldest first.
    pub fn item_ids(&self, node: &NodeId) -> Vec<String> {
        self.items
            .get(node)
            .map(|items| items.iter().map(|i| i.item_id().to_string()).collect())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("storage unavailable".to_string()));
        }
        Ok(())
    }

    fn stored_node(&self, record: NodeRecord) -> StoredNode {
        let affiliates = self
            .affiliations
            .get(&record.id)
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default();
        let subscriptions = self
            .subscriptions
            .get(&record.id)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();

        StoredNode {
            record,
            affiliates,
            subscriptions,
        }
    }
}

#[async_trait]
impl PubSubStorage for InMemoryPubSubStorage {
    async fn create_node(&self, node: &NodeRecord) -> Result<(), StorageError> {
        self.check()?;
        self.nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn update_node(&self, node: &NodeRecord) -> Result<(), StorageError> {
        self.check()?;
        let mut existing = self
            .nodes
            .get_mut(&node.id)
            .ok_or_else(|| StorageError::NotFound(node.id.to_string()))?;
        *existing = node.clone();
        Ok(())
    }

    async fn remove_node(&self, node: &NodeId) -> Result<(), StorageError> {
        self.check()?;
        self.nodes.remove(node);
        self.affiliations.remove(node);
        self.subscriptions.remove(node);
        self.items.remove(node);
        Ok(())
    }

    async fn load_nodes(&self, service: &ServiceId) -> Result<Vec<StoredNode>, StorageError> {
        self.check()?;
        let records: Vec<NodeRecord> = self
            .nodes
            .iter()
            .filter(|entry| service.owns(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();

        Ok(records
            .into_iter()
            .map(|record| self.stored_node(record))
            .collect())
    }

    async fn load_node(&self, node: &NodeId) -> Result<Option<StoredNode>, StorageError> {
        self.check()?;
        let record = self.nodes.get(node).map(|r| r.value().clone());
        Ok(record.map(|record| self.stored_node(record)))
    }

    async fn create_affiliation(
        &self,
        node: &NodeId,
        affiliate: &NodeAffiliate,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.affiliations
            .entry(node.clone())
            .or_default()
            .insert(affiliate.jid.clone(), affiliate.clone());
        Ok(())
    }

    async fn update_affiliation(
        &self,
        node: &NodeId,
        affiliate: &NodeAffiliate,
    ) -> Result<(), StorageError> {
        self.create_affiliation(node, affiliate).await
    }

    async fn remove_affiliation(&self, node: &NodeId, jid: &Jid) -> Result<(), StorageError> {
        self.check()?;
        if let Some(mut affiliates) = self.affiliations.get_mut(node) {
            affiliates.remove(jid);
        }
        Ok(())
    }

    async fn create_subscription(
        &self,
        subscription: &NodeSubscription,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.subscriptions
            .entry(subscription.node.clone())
            .or_default()
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn update_subscription(
        &self,
        subscription: &NodeSubscription,
    ) -> Result<(), StorageError> {
        self.create_subscription(subscription).await
    }

    async fn remove_subscription(
        &self,
        subscription: &NodeSubscription,
    ) -> Result<(), StorageError> {
        self.check()?;
        if let Some(mut subscriptions) = self.subscriptions.get_mut(&subscription.node) {
            subscriptions.remove(&subscription.id);
        }
        Ok(())
    }

    async fn save_item(&self, item: &PublishedItem) -> Result<(), StorageError> {
        self.check()?;
        let mut items = self.items.entry(item.node().clone()).or_default();

        // An overwrite becomes the most recent item.
        items.retain(|i| i.item_id() != item.item_id());
        items.push(item.clone());
        Ok(())
    }

    async fn remove_item(&self, item: &ItemId) -> Result<(), StorageError> {
        self.check()?;
        if let Some(mut items) = self.items.get_mut(item.node()) {
            items.retain(|i| i.item_id() != item.item_id());
        }
        Ok(())
    }

    async fn get_items(
        &self,
        node: &NodeId,
        max_items: u32,
    ) -> Result<Vec<PublishedItem>, StorageError> {
        self.check()?;
        let items = match self.items.get(node) {
            Some(items) => items,
            None => return Ok(Vec::new()),
        };

        // Return the most recent items
        let max = max_items as usize;
        let skip = if max > 0 { items.len().saturating_sub(max) } else { 0 };
        Ok(items.iter().skip(skip).cloned().collect())
    }

    async fn get_last_item(&self, node: &NodeId) -> Result<Option<PublishedItem>, StorageError> {
        self.check()?;
        Ok(self.items.get(node).and_then(|items| items.last().cloned()))
    }

    async fn get_item(&self, item: &ItemId) -> Result<Option<PublishedItem>, StorageError> {
        self.check()?;
        Ok(self.items.get(item.node()).and_then(|items| {
            items
                .iter()
                .find(|i| i.item_id() == item.item_id())
                .cloned()
        }))
    }

    async fn purge_node(&self, node: &NodeId) -> Result<(), StorageError> {
        self.check()?;
        if let Some(mut items) = self.items.get_mut(node) {
            items.clear();
        }
        Ok(())
    }

    async fn create_default_config(
        &self,
        service: &ServiceId,
        node_type: NodeType,
        config: &NodeConfig,
    ) -> Result<(), StorageError> {
        self.check()?;
        let json = serde_json::to_string(config)?;
        self.defaults.insert((service.clone(), node_type), json);
        Ok(())
    }

    async fn update_default_config(
        &self,
        service: &ServiceId,
        node_type: NodeType,
        config: &NodeConfig,
    ) -> Result<(), StorageError> {
        self.create_default_config(service, node_type, config).await
    }

    async fn load_default_config(
        &self,
        service: &ServiceId,
        node_type: NodeType,
    ) -> Result<Option<NodeConfig>, StorageError> {
        self.check()?;
        let json = self
            .defaults
            .get(&(service.clone(), node_type))
            .map(|c| c.value().clone());
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affiliation::Affiliation;
    use chrono::Utc;

    fn node_id() -> NodeId {
        ServiceId::new("pubsub.example.com").node("news")
    }

    fn item(id: &str) -> PublishedItem {
        PublishedItem::new(
            node_id().item(id),
            "alice@example.com".parse().expect("valid jid"),
            None,
        )
    }

    fn record() -> NodeRecord {
        NodeRecord {
            id: node_id(),
            parent: None,
            node_type: NodeType::Leaf,
            creator: "alice@example.com".parse().expect("valid jid"),
            config: NodeConfig::leaf_default(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_bulk_delete_wins() {
        let storage = InMemoryPubSubStorage::new();
        let a = item("A");
        let b = item("B");

        storage
            .bulk_items(&[a.clone(), b.clone()], &[b.id.clone()])
            .await
            .expect("should succeed");
        assert_eq!(storage.item_ids(&node_id()), vec!["A"]);

        // B was stored before the batch: still deleted and not re-added
        let storage = InMemoryPubSubStorage::new();
        storage.save_item(&b).await.expect("should save");
        storage
            .bulk_items(&[b.clone(), a.clone()], &[b.id.clone()])
            .await
            .expect("should succeed");
        assert_eq!(storage.item_ids(&node_id()), vec!["A"]);
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let storage = InMemoryPubSubStorage::new();
        storage.save_item(&item("1")).await.expect("should save");
        storage.save_item(&item("2")).await.expect("should save");
        storage.save_item(&item("1")).await.expect("should save");

        assert_eq!(storage.item_ids(&node_id()), vec!["2", "1"]);
        let last = storage
            .get_last_item(&node_id())
            .await
            .expect("should succeed")
            .expect("last item");
        assert_eq!(last.item_id(), "1");

        let recent = storage.get_items(&node_id(), 1).await.expect("should succeed");
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn test_load_node_with_memberships() {
        let storage = InMemoryPubSubStorage::new();
        storage.create_node(&record()).await.expect("should create");

        let owner: Jid = "alice@example.com".parse().expect("valid jid");
        storage
            .create_affiliation(&node_id(), &NodeAffiliate::new(owner.clone(), Affiliation::Owner))
            .await
            .expect("should create");

        let nodes = storage
            .load_nodes(&ServiceId::new("pubsub.example.com"))
            .await
            .expect("should load");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].affiliates.len(), 1);

        let other = storage
            .load_nodes(&ServiceId::new("other.example.com"))
            .await
            .expect("should load");
        assert!(other.is_empty());

        storage.remove_node(&node_id()).await.expect("should remove");
        assert!(storage.load_node(&node_id()).await.expect("should load").is_none());
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let storage = InMemoryPubSubStorage::new();
        storage.set_failing(true);
        assert!(storage.save_item(&item("1")).await.is_err());

        storage.set_failing(false);
        assert!(storage.save_item(&item("1")).await.is_ok());
    }
}
