//! Node creation, configuration and deletion.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use jid::Jid;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::PubSubService;
use crate::config::DeletePolicy;
use crate::dispatch::DeliveryPlan;
use crate::error::{BadRequestReason, ConflictReason, ForbiddenReason, PubSubError};
use crate::id::NodeId;
use crate::metrics;
use crate::node::{Node, NodeConfig, NodeType};
use crate::stanzas;
use crate::storage::StorageOp;
use crate::subscription::SubscriptionType;

/// A node creation request.
#[derive(Debug, Clone)]
pub struct CreateNode {
    /// Node id. `None` requests an instant node with a generated id.
    pub node: Option<String>,
    pub node_type: NodeType,
    /// Parent collection. `None` places the node under the root collection.
    pub parent: Option<String>,
    /// Initial configuration. `None` uses the service default for the type.
    pub config: Option<NodeConfig>,
}

impl CreateNode {
    pub fn leaf(node: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
            node_type: NodeType::Leaf,
            parent: None,
            config: None,
        }
    }

    pub fn collection(node: impl Into<String>) -> Self {
        Self {
            node: Some(node.into()),
            node_type: NodeType::Collection,
            parent: None,
            config: None,
        }
    }

    /// A leaf whose id the service generates.
    pub fn instant() -> Self {
        Self {
            node: None,
            node_type: NodeType::Leaf,
            parent: None,
            config: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = Some(config);
        self
    }
}

impl PubSubService {
    /// Create a node. The creator becomes its owner.
    ///
    /// Creating a node below a collection other than the root requires
    /// administering that collection.
    #[instrument(skip(self, request), fields(service = %self.id, creator = %creator))]
    pub async fn create_node(
        &self,
        creator: &Jid,
        request: CreateNode,
    ) -> Result<NodeId, PubSubError> {
        let _running = self.enter().await?;
        self.create_node_inner(creator, request).await
    }

    /// Node creation for callers already inside a mutation.
    pub(super) async fn create_node_inner(
        &self,
        creator: &Jid,
        request: CreateNode,
    ) -> Result<NodeId, PubSubError> {
        if !self.can_create_node(creator) {
            return Err(PubSubError::Forbidden(ForbiddenReason::CreationRestricted));
        }

        let name = match request.node {
            Some(name) if name.is_empty() => {
                return Err(PubSubError::BadRequest(BadRequestReason::NodeIdRequired))
            }
            Some(name) => name,
            None => Uuid::new_v4().to_string(),
        };
        let id = self.id.node(name);
        if self.nodes.contains_key(&id) {
            return Err(PubSubError::Conflict(ConflictReason::NodeExists));
        }
        if request.node_type == NodeType::Collection && !self.collections_enabled {
            return Err(PubSubError::FeatureNotImplemented("collections"));
        }

        let mut config = request
            .config
            .unwrap_or_else(|| self.default_config(request.node_type));
        config.validate()?;
        if !self.multiple_subscriptions {
            config.multiple_subscriptions = false;
        }

        let parent = if self.collections_enabled {
            let parent_id = match request.parent {
                Some(parent) => self.id.node(parent),
                None => self.id.root(),
            };
            let handle = self.handle(&parent_id)?;
            {
                let parent = handle.read().await;
                if parent.is_deleted() {
                    return Err(PubSubError::NodeNotFound(parent_id.node_id().to_string()));
                }
                if !parent.is_collection() {
                    return Err(PubSubError::BadRequest(BadRequestReason::InvalidParent));
                }
                if !parent_id.is_root() && !self.node_admin(&parent, creator) {
                    return Err(PubSubError::forbidden());
                }
            }
            Some((parent_id, handle))
        } else {
            if request.parent.is_some() {
                return Err(PubSubError::FeatureNotImplemented("collections"));
            }
            None
        };

        let parent_id = parent.as_ref().map(|(id, _)| id.clone());
        let node = match request.node_type {
            NodeType::Leaf => Node::new_leaf(id.clone(), parent_id, creator.to_bare(), config),
            NodeType::Collection => {
                Node::new_collection(id.clone(), parent_id, creator.to_bare(), config)
            }
        };

        match self.nodes.entry(id.clone()) {
            Entry::Occupied(_) => return Err(PubSubError::Conflict(ConflictReason::NodeExists)),
            Entry::Vacant(slot) => {
                // Enqueued before the node becomes visible, so its creation is
                // persisted ahead of any later change to it.
                self.persist_new_node(&node);
                slot.insert(Arc::new(RwLock::new(node)));
            }
        }

        if let Some((parent_id, handle)) = &parent {
            let mut parent = handle.write().await;
            let linked = if parent.is_deleted() {
                Err(PubSubError::NodeNotFound(parent_id.node_id().to_string()))
            } else {
                parent.add_child(id.clone())
            };
            if let Err(e) = linked {
                drop(parent);
                self.nodes.remove(&id);
                self.persist(StorageOp::RemoveNode(id.clone()));
                return Err(e);
            }
        }

        self.record_node_count();
        info!(node = %id, node_type = %request.node_type, "Created pubsub node");

        if let Some((parent_id, _)) = parent {
            self.notify_child_created(parent_id, &id).await;
        }
        Ok(id)
    }

    /// Tell `nodes` subscribers of the ancestors about a new child.
    async fn notify_child_created(&self, parent: NodeId, child: &NodeId) {
        let ancestors = self
            .ancestor_subscriptions(Some(parent.clone()), SubscriptionType::Nodes)
            .await;

        let now = Utc::now();
        let mut plan = DeliveryPlan::new();
        for ancestor in &ancestors {
            plan.add_subscriptions(
                &ancestor.subscriptions,
                ancestor.presence_based_delivery,
                &self.presence,
                now,
            );
        }

        self.send_deliveries(child, plan.into_deliveries(), "child_created", |_| {
            stanzas::build_child_node_event(&self.address, &parent, child)
        });
    }

    /// Replace a node's configuration. Node admins only.
    ///
    /// A stricter access model cancels subscriptions that no longer
    /// qualify. A lower `max_items` evicts the oldest items.
    #[instrument(skip(self, config), fields(service = %self.id, node = %node_id))]
    pub async fn configure_node(
        &self,
        requester: &Jid,
        node_id: &NodeId,
        config: NodeConfig,
    ) -> Result<(), PubSubError> {
        let _running = self.enter().await?;
        config.validate()?;

        let handle = self.handle(node_id)?;
        let mut node = handle.write().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }
        if !self.node_admin(&node, requester) {
            return Err(PubSubError::forbidden());
        }

        let mut config = config.normalized(node.node_type());
        if !self.multiple_subscriptions {
            config.multiple_subscriptions = false;
        }

        let before = node.presence_interest();
        let tightened = node.config.access_model.is_tightened_by(config.access_model)
            || node.config.roster_groups_allowed != config.roster_groups_allowed;
        node.config = config;
        node.touch();

        if tightened {
            let cancelled = self.revoke_unqualified(&mut node).await;
            if cancelled > 0 {
                info!(cancelled, "Cancelled subscriptions after access model change");
            }
        }

        let max_items = node.config.max_items;
        let evicted = node
            .items_mut()
            .map(|items| items.trim(max_items))
            .unwrap_or_default();
        if !evicted.is_empty() {
            for item in &evicted {
                self.persist(StorageOp::RemoveItem(item.id.clone()));
            }
            metrics::record_items_retracted(evicted.len(), "evicted");
            self.ctx.listeners.items_deleted(node_id, &evicted);
        }

        self.persist(StorageOp::UpdateNode(node.record()));
        self.sync_presence_interest(node_id, &before, &node.presence_interest());

        if node.config.notify_config {
            let deliveries = self.plan_events(&node, &[]);
            self.send_deliveries(node_id, deliveries, "configuration", |_| {
                stanzas::build_configuration_event(&self.address, node_id)
            });
        }

        info!(evicted = evicted.len(), "Configured pubsub node");
        Ok(())
    }

    /// Current configuration of a node. Node admins only.
    pub async fn node_config(
        &self,
        requester: &Jid,
        node_id: &NodeId,
    ) -> Result<NodeConfig, PubSubError> {
        let handle = self.handle(node_id)?;
        let node = handle.read().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }
        if !self.node_admin(&node, requester) {
            return Err(PubSubError::forbidden());
        }
        Ok(node.config.clone())
    }

    /// Delete a node and, for a collection, all of its descendants.
    ///
    /// Under [`DeletePolicy::Reject`] a collection whose descendants hold
    /// items cannot be deleted. A leaf's own items are always deleted.
    #[instrument(skip(self), fields(service = %self.id, node = %node_id))]
    pub async fn delete_node(&self, requester: &Jid, node_id: &NodeId) -> Result<(), PubSubError> {
        let _running = self.enter().await?;
        if node_id.is_root() {
            return Err(PubSubError::NotAllowed(
                "the root collection cannot be deleted".to_string(),
            ));
        }

        let handle = self.handle(node_id)?;
        let parent = {
            let node = handle.read().await;
            if node.is_deleted() {
                return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
            }
            if !self.node_admin(&node, requester) {
                return Err(PubSubError::forbidden());
            }
            node.parent.clone()
        };

        if self.delete_policy == DeletePolicy::Reject && self.descendants_hold_items(node_id).await {
            return Err(PubSubError::Conflict(ConflictReason::NodeNotEmpty));
        }

        let subtree = self.mark_subtree(node_id).await?;
        if subtree.is_empty() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }

        for id in subtree.iter().rev() {
            self.finalize_deleted(id).await;
        }

        if let Some(parent) = parent {
            if let Some(handle) = self.node(&parent) {
                handle.write().await.remove_child(node_id);
            }
        }

        self.record_node_count();
        info!(deleted = subtree.len(), "Deleted pubsub node");
        Ok(())
    }

    /// Mark the node and its descendants deleted, top-down, each under its
    /// own lock. A marked collection accepts no new children, so the walk
    /// sees the whole subtree.
    ///
    /// Under [`DeletePolicy::Reject`] a descendant that holds items when
    /// its lock is taken undoes the marks made so far.
    async fn mark_subtree(&self, node_id: &NodeId) -> Result<Vec<NodeId>, PubSubError> {
        let mut subtree = Vec::new();
        let mut queue = VecDeque::from([node_id.clone()]);
        while let Some(id) = queue.pop_front() {
            let Some(handle) = self.node(&id) else {
                continue;
            };
            let mut node = handle.write().await;
            if node.is_deleted() {
                continue;
            }
            if self.delete_policy == DeletePolicy::Reject && id != *node_id && node.has_items() {
                drop(node);
                debug!(node = %id, "Descendant received items during delete");
                self.unmark_subtree(&subtree).await;
                return Err(PubSubError::Conflict(ConflictReason::NodeNotEmpty));
            }
            node.mark_deleted();
            queue.extend(node.children().iter().cloned());
            subtree.push(id);
        }
        Ok(subtree)
    }

    async fn unmark_subtree(&self, subtree: &[NodeId]) {
        for id in subtree {
            if let Some(handle) = self.node(id) {
                handle.write().await.unmark_deleted();
            }
        }
    }

    async fn descendants_hold_items(&self, node_id: &NodeId) -> bool {
        let mut queue = VecDeque::from([node_id.clone()]);
        while let Some(id) = queue.pop_front() {
            let Some(handle) = self.node(&id) else {
                continue;
            };
            let node = handle.read().await;
            if id != *node_id && node.has_items() {
                return true;
            }
            queue.extend(node.children().iter().cloned());
        }
        false
    }

    /// Drop a node marked as deleted: its items, subscribers and storage.
    async fn finalize_deleted(&self, id: &NodeId) {
        let Some(handle) = self.node(id) else {
            warn!(node = %id, "Deleted node vanished before cleanup");
            return;
        };

        {
            let mut node = handle.write().await;
            let removed = node
                .items_mut()
                .map(|items| items.clear())
                .unwrap_or_default();
            if !removed.is_empty() {
                metrics::record_items_retracted(removed.len(), "deleted");
                self.ctx.listeners.items_deleted(id, &removed);
            }

            if node.config.notify_delete {
                let deliveries = self.plan_events(&node, &[]);
                self.send_deliveries(id, deliveries, "delete", |_| {
                    stanzas::build_delete_event(&self.address, id)
                });
            }
        }

        self.release_node_presence(id);
        self.nodes.remove(id);
        self.persist(StorageOp::RemoveNode(id.clone()));
        debug!(node = %id, "Removed pubsub node");
    }
}
