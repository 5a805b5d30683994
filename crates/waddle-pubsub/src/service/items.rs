//! Publishing, retraction, purge and item retrieval.

use std::slice;

use jid::Jid;
use minidom::Element;
use tracing::{debug, info, instrument};

use super::{CreateNode, PubSubService, ServiceKind};
use crate::access;
use crate::error::{BadRequestReason, ConflictReason, ForbiddenReason, PubSubError};
use crate::id::NodeId;
use crate::item::PublishedItem;
use crate::metrics;
use crate::node::{NodeHandle, NodeType};
use crate::pep;
use crate::stanzas;
use crate::storage::StorageOp;
use crate::subscription::SubscriptionType;

/// The `<item/>` of a publish request.
#[derive(Debug, Clone, Default)]
pub struct PublishItem {
    /// Client-chosen id. Generated when absent or empty.
    pub id: Option<String>,
    pub payload: Option<Element>,
}

impl PublishItem {
    pub fn new(id: impl Into<String>, payload: Element) -> Self {
        Self {
            id: Some(id.into()),
            payload: Some(payload),
        }
    }

    /// An item with a payload and a service-generated id.
    pub fn with_payload(payload: Element) -> Self {
        Self {
            id: None,
            payload: Some(payload),
        }
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// The stored item. `None` for a transient publish.
    pub item: Option<PublishedItem>,
    /// Whether the publish auto-created the node.
    pub node_created: bool,
}

impl PubSubService {
    /// Publish to a leaf node.
    ///
    /// The item is appended to the in-memory history, evicting the oldest
    /// items beyond `max_items`, and the write is queued for persistence.
    /// Listeners and subscribers are notified before the call returns.
    /// On a PEP service a missing node is created for the owner.
    #[instrument(skip(self, item), fields(service = %self.id, node = %node_id, publisher = %publisher))]
    pub async fn publish(
        &self,
        publisher: &Jid,
        node_id: &NodeId,
        item: Option<PublishItem>,
    ) -> Result<PublishOutcome, PubSubError> {
        let _running = self.enter().await?;

        let (handle, node_created) = match self.node(node_id) {
            Some(handle) => (handle, false),
            None => (self.auto_create_pep_node(publisher, node_id).await?, true),
        };

        let parent = {
            let node = handle.read().await;
            if node.is_deleted() {
                return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
            }
            node.parent.clone()
        };
        let ancestors = self
            .ancestor_subscriptions(parent, SubscriptionType::Items)
            .await;

        let mut node = handle.write().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }
        if node.is_collection() {
            return Err(PubSubError::FeatureNotImplemented("publish"));
        }
        if !access::can_publish(&node, publisher) {
            return Err(PubSubError::forbidden());
        }

        let item_required = node.is_item_required();
        let item = match (item, item_required) {
            (None, true) => return Err(PubSubError::BadRequest(BadRequestReason::ItemRequired)),
            (Some(_), false) => {
                return Err(PubSubError::BadRequest(BadRequestReason::ItemForbidden))
            }
            (None, false) => None,
            (Some(item), true) => Some(item),
        };

        let Some(item) = item else {
            let deliveries = self.plan_items(&node, &ancestors, &[]);
            self.send_deliveries(node_id, deliveries, "transient", |d| {
                stanzas::build_transient_event(&self.address, node_id, &self.header_subids(&node, d))
            });
            debug!("Published transient event");
            return Ok(PublishOutcome {
                item: None,
                node_created,
            });
        };

        if node.config.deliver_payloads && item.payload.is_none() {
            return Err(PubSubError::BadRequest(BadRequestReason::PayloadRequired));
        }

        let item_id = item
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(PublishedItem::generate_id);
        let published = PublishedItem::new(node_id.item(item_id), publisher.clone(), item.payload);

        let max_payload_size = node.config.max_payload_size as usize;
        if max_payload_size > 0 && published.payload_size() > max_payload_size {
            return Err(PubSubError::BadRequest(BadRequestReason::PayloadTooBig));
        }

        let max_items = node.config.max_items;
        let reject_duplicates = node.config.reject_duplicate_ids;
        let evicted = match node.items_mut() {
            Some(history) => history.push(published.clone(), max_items, reject_duplicates)?,
            None => return Err(PubSubError::FeatureNotImplemented("publish")),
        };
        node.touch();

        self.persist(StorageOp::SaveItem(published.clone()));
        for old in &evicted {
            self.persist(StorageOp::RemoveItem(old.id.clone()));
        }

        metrics::record_items_published(1);
        self.ctx
            .listeners
            .items_published(node_id, slice::from_ref(&published));
        if !evicted.is_empty() {
            metrics::record_items_retracted(evicted.len(), "evicted");
            self.ctx.listeners.items_deleted(node_id, &evicted);
        }

        let deliveries = self.plan_items(&node, &ancestors, slice::from_ref(&published));
        let include_payload = node.config.deliver_payloads;
        self.send_deliveries(node_id, deliveries, "items", |d| {
            stanzas::build_items_event(
                &self.address,
                node_id,
                &d.items,
                include_payload,
                &self.header_subids(&node, d),
            )
        });

        debug!(item = published.item_id(), evicted = evicted.len(), "Published item");
        Ok(PublishOutcome {
            item: Some(published),
            node_created,
        })
    }

    async fn auto_create_pep_node(
        &self,
        publisher: &Jid,
        node_id: &NodeId,
    ) -> Result<NodeHandle, PubSubError> {
        let is_owner = match &self.kind {
            ServiceKind::Pep { owner } => publisher.to_bare() == *owner,
            ServiceKind::Domain => false,
        };
        if !is_owner || !self.id.owns(node_id) {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }

        let request = CreateNode {
            node: Some(node_id.node_id().to_string()),
            node_type: NodeType::Leaf,
            parent: None,
            config: Some(pep::pep_node_config(node_id.node_id())),
        };
        match self.create_node_inner(publisher, request).await {
            Ok(_) => info!(
                node = %node_id,
                well_known = pep::is_well_known_node(node_id.node_id()),
                "Auto-created PEP node"
            ),
            // Lost a race with a concurrent first publish.
            Err(PubSubError::Conflict(ConflictReason::NodeExists)) => {}
            Err(e) => return Err(e),
        }
        self.handle(node_id)
    }

    /// Remove an item. Allowed for the item's publisher and node admins.
    ///
    /// `notify` overrides the node's `notify_retract` setting.
    #[instrument(skip(self), fields(service = %self.id, node = %node_id, requester = %requester))]
    pub async fn retract(
        &self,
        requester: &Jid,
        node_id: &NodeId,
        item_id: &str,
        notify: Option<bool>,
    ) -> Result<PublishedItem, PubSubError> {
        let _running = self.enter().await?;
        let handle = self.handle(node_id)?;

        let parent = {
            let node = handle.read().await;
            if node.is_deleted() {
                return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
            }
            node.parent.clone()
        };
        let ancestors = self
            .ancestor_subscriptions(parent, SubscriptionType::Items)
            .await;

        let mut node = handle.write().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }
        if node.is_collection() {
            return Err(PubSubError::FeatureNotImplemented("retract-items"));
        }

        let item = node
            .items()
            .and_then(|items| items.get(item_id))
            .cloned()
            .ok_or_else(|| PubSubError::ItemNotFound(item_id.to_string()))?;
        let is_publisher = item.publisher.to_bare() == requester.to_bare();
        if !is_publisher && !self.node_admin(&node, requester) {
            return Err(PubSubError::Forbidden(ForbiddenReason::NotItemPublisher));
        }

        if let Some(items) = node.items_mut() {
            items.remove(item_id);
        }
        node.touch();

        self.persist(StorageOp::RemoveItem(item.id.clone()));
        metrics::record_items_retracted(1, "retracted");
        self.ctx
            .listeners
            .items_deleted(node_id, slice::from_ref(&item));

        if notify.unwrap_or(node.config.notify_retract) {
            let deliveries = self.plan_events(&node, &ancestors);
            self.send_deliveries(node_id, deliveries, "retract", |_| {
                stanzas::build_retract_event(&self.address, node_id, &[item_id])
            });
        }

        debug!(item = item_id, "Retracted item");
        Ok(item)
    }

    /// Remove every item of a leaf. Node admins only.
    #[instrument(skip(self), fields(service = %self.id, node = %node_id, requester = %requester))]
    pub async fn purge(&self, requester: &Jid, node_id: &NodeId) -> Result<(), PubSubError> {
        let _running = self.enter().await?;
        let handle = self.handle(node_id)?;
        let mut node = handle.write().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }
        if !self.node_admin(&node, requester) {
            return Err(PubSubError::forbidden());
        }

        let removed = match node.items_mut() {
            Some(items) => items.clear(),
            None => return Err(PubSubError::FeatureNotImplemented("purge-nodes")),
        };
        node.touch();

        self.persist(StorageOp::PurgeNode(node_id.clone()));
        if !removed.is_empty() {
            metrics::record_items_retracted(removed.len(), "purged");
            self.ctx.listeners.items_deleted(node_id, &removed);
        }

        let deliveries = self.plan_events(&node, &[]);
        self.send_deliveries(node_id, deliveries, "purge", |_| {
            stanzas::build_purge_event(&self.address, node_id)
        });

        info!(purged = removed.len(), "Purged pubsub node");
        Ok(())
    }

    /// Items of a leaf, oldest first, limited to the `max` most recent.
    pub async fn items(
        &self,
        requester: &Jid,
        node_id: &NodeId,
        max: Option<usize>,
    ) -> Result<Vec<PublishedItem>, PubSubError> {
        let handle = self.handle(node_id)?;
        let node = handle.read().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }
        let Some(items) = node.items() else {
            return Err(PubSubError::FeatureNotImplemented("retrieve-items"));
        };

        let is_admin = self.node_admin(&node, requester);
        access::check_retrieve(&node, requester, is_admin, self.ctx.roster.as_ref()).await?;
        Ok(items.recent(max))
    }

    /// One item of a leaf.
    pub async fn item(
        &self,
        requester: &Jid,
        node_id: &NodeId,
        item_id: &str,
    ) -> Result<PublishedItem, PubSubError> {
        let handle = self.handle(node_id)?;
        let node = handle.read().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }
        let Some(items) = node.items() else {
            return Err(PubSubError::FeatureNotImplemented("retrieve-items"));
        };

        let is_admin = self.node_admin(&node, requester);
        access::check_retrieve(&node, requester, is_admin, self.ctx.roster.as_ref()).await?;
        items
            .get(item_id)
            .cloned()
            .ok_or_else(|| PubSubError::ItemNotFound(item_id.to_string()))
    }

    /// The most recently published item of a leaf, without access checks.
    pub async fn last_published_item(
        &self,
        node_id: &NodeId,
    ) -> Result<Option<PublishedItem>, PubSubError> {
        let handle = self.handle(node_id)?;
        let node = handle.read().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }
        Ok(node.items().and_then(|items| items.last()).cloned())
    }
}
