//! A pub/sub service: one domain-level service or one user's PEP service.
//!
//! The service owns its node hierarchy. Nodes live in a [`DashMap`] keyed
//! by [`NodeId`], each behind its own `tokio::sync::RwLock`, so operations
//! on different nodes never contend. An operation holds at most one node
//! lock at a time and never holds a map guard across an `.await`.
//!
//! Operations are split by concern:
//! - `nodes`: create, configure and delete nodes
//! - `items`: publish, retract, purge and retrieve items
//! - `subscriptions`: the subscription and affiliation lifecycles

mod items;
mod nodes;
mod subscriptions;

pub use items::{PublishItem, PublishOutcome};
pub use nodes::CreateNode;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use jid::{BareJid, Jid};
use minidom::Element;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, instrument, warn};

use crate::affiliation::Affiliation;
use crate::config::{DeletePolicy, PubSubConfig};
use crate::dispatch::{can_send_events, Delivery, DeliveryPlan, ListenerRegistry};
use crate::error::PubSubError;
use crate::id::{NodeId, ServiceId};
use crate::item::{ItemHistory, PublishedItem};
use crate::metrics;
use crate::node::{Node, NodeConfig, NodeHandle, NodeType, SendLastPublishedItem};
use crate::presence::{PresenceTracker, Show};
use crate::roster::RosterLookup;
use crate::sender::StanzaSender;
use crate::stanzas;
use crate::storage::{PersistenceQueue, PubSubStorage, StorageOp};
use crate::subscription::{NodeSubscription, SubscriptionType};

/// Collaborators shared by every service of a registry.
#[derive(Clone)]
pub struct PubSubContext {
    pub listeners: Arc<ListenerRegistry>,
    pub persistence: Arc<PersistenceQueue>,
    pub storage: Arc<dyn PubSubStorage>,
    pub sender: Arc<dyn StanzaSender>,
    pub roster: Arc<dyn RosterLookup>,
    pub in_flight: Arc<InFlight>,
}

/// Mutations currently running on any service of a registry.
///
/// Each mutation holds a read guard for its whole body. Listeners must not
/// call back into a mutating operation, or a pending drain deadlocks them.
#[derive(Debug, Default)]
pub struct InFlight {
    lock: RwLock<()>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until every admitted mutation has returned.
    ///
    /// Services must reject new mutations before this is called.
    pub async fn drain(&self) {
        let _idle = self.lock.write().await;
    }
}

impl std::fmt::Debug for PubSubContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubContext")
            .field("listeners", &self.listeners)
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

/// Which kind of service this is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    /// A standalone service such as `pubsub.waddle.social`.
    Domain,
    /// A user's personal eventing service, addressed by their bare JID.
    Pep { owner: BareJid },
}

/// Per-service policy.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub sysadmins: Vec<BareJid>,
    pub allowed_creators: Vec<BareJid>,
    pub restrict_creation: bool,
    pub collections_enabled: bool,
    pub multiple_subscriptions: bool,
    pub delete_policy: DeletePolicy,
}

impl ServiceSettings {
    /// Settings of the domain-level service.
    pub fn from_config(config: &PubSubConfig) -> Self {
        Self {
            sysadmins: config.sysadmins.clone(),
            allowed_creators: config.allowed_creators.clone(),
            restrict_creation: config.restrict_creation,
            collections_enabled: config.collections_enabled,
            multiple_subscriptions: config.multiple_subscriptions,
            delete_policy: config.delete_policy,
        }
    }

    /// Settings of a PEP service. The owner administers every node and is
    /// the only one allowed to create nodes. PEP services are flat.
    pub fn pep(owner: &BareJid, config: &PubSubConfig) -> Self {
        let mut sysadmins = config.sysadmins.clone();
        sysadmins.push(owner.clone());
        Self {
            sysadmins,
            allowed_creators: vec![owner.clone()],
            restrict_creation: true,
            collections_enabled: false,
            multiple_subscriptions: false,
            delete_policy: config.delete_policy,
        }
    }
}

/// Subscriptions of one ancestor collection that apply to a descendant.
#[derive(Debug, Clone)]
pub(crate) struct AncestorSubscriptions {
    pub subscriptions: Vec<NodeSubscription>,
    pub presence_based_delivery: bool,
}

/// A pub/sub service and its node hierarchy.
pub struct PubSubService {
    id: ServiceId,
    address: Jid,
    kind: ServiceKind,
    sysadmins: DashSet<BareJid>,
    allowed_creators: DashSet<BareJid>,
    restrict_creation: bool,
    collections_enabled: bool,
    multiple_subscriptions: bool,
    delete_policy: DeletePolicy,
    defaults: DashMap<NodeType, NodeConfig>,
    nodes: DashMap<NodeId, NodeHandle>,
    presence: PresenceTracker,
    ctx: PubSubContext,
    shutting_down: AtomicBool,
}

impl PubSubService {
    /// Create an empty service. Call [`PubSubService::load`] to restore
    /// persisted state.
    pub fn new(
        id: ServiceId,
        address: Jid,
        kind: ServiceKind,
        settings: ServiceSettings,
        ctx: PubSubContext,
    ) -> Self {
        Self {
            id,
            address,
            kind,
            sysadmins: settings.sysadmins.into_iter().collect(),
            allowed_creators: settings.allowed_creators.into_iter().collect(),
            restrict_creation: settings.restrict_creation,
            collections_enabled: settings.collections_enabled,
            multiple_subscriptions: settings.multiple_subscriptions,
            delete_policy: settings.delete_policy,
            defaults: DashMap::new(),
            nodes: DashMap::new(),
            presence: PresenceTracker::new(),
            ctx,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// The JID notifications are sent from.
    pub fn address(&self) -> &Jid {
        &self.address
    }

    pub fn kind(&self) -> &ServiceKind {
        &self.kind
    }

    pub fn is_pep(&self) -> bool {
        matches!(self.kind, ServiceKind::Pep { .. })
    }

    pub fn collections_enabled(&self) -> bool {
        self.collections_enabled
    }

    pub fn delete_policy(&self) -> DeletePolicy {
        self.delete_policy
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Restore default configurations, nodes and leaf items from storage.
    ///
    /// Creates the root collection when collections are enabled and it has
    /// never been persisted.
    #[instrument(skip(self), fields(service = %self.id))]
    pub async fn load(&self) -> Result<(), PubSubError> {
        for node_type in [NodeType::Leaf, NodeType::Collection] {
            if let Some(config) = self
                .ctx
                .storage
                .load_default_config(&self.id, node_type)
                .await?
            {
                self.defaults.insert(node_type, config);
            }
        }

        let mut stored = self.ctx.storage.load_nodes(&self.id).await?;
        stored.sort_by_key(|s| s.record.created_at);

        let mut loaded = Vec::with_capacity(stored.len());
        for record in stored {
            let mut node = Node::from_stored(record);
            if node.is_leaf() {
                let items = self
                    .ctx
                    .storage
                    .get_items(&node.id, node.config.max_items)
                    .await?;
                if let Some(history) = node.items_mut() {
                    *history = ItemHistory::from_items(items);
                }
            }
            loaded.push(node);
        }

        let links: Vec<(NodeId, NodeId)> = loaded
            .iter()
            .filter_map(|n| n.parent.clone().map(|parent| (parent, n.id.clone())))
            .collect();
        for (parent, child) in links {
            match loaded.iter_mut().find(|n| n.id == parent) {
                Some(node) => {
                    if let Err(e) = node.add_child(child.clone()) {
                        warn!(parent = %parent, child = %child, error = %e, "Stored node has a leaf parent");
                    }
                }
                None => warn!(parent = %parent, child = %child, "Parent of stored node is missing"),
            }
        }

        for node in loaded {
            for user in node.presence_interest() {
                self.presence_subscription_required(&node.id, &user);
            }
            self.nodes
                .insert(node.id.clone(), Arc::new(RwLock::new(node)));
        }

        if self.collections_enabled && !self.nodes.contains_key(&self.id.root()) {
            let root = Node::new_collection(
                self.id.root(),
                None,
                self.address.to_bare(),
                self.default_config(NodeType::Collection),
            );
            self.persist_new_node(&root);
            self.nodes.insert(root.id.clone(), Arc::new(RwLock::new(root)));
            debug!("Created root collection");
        }

        metrics::record_node_count(self.nodes.len(), self.id.as_str());
        info!(nodes = self.nodes.len(), "Loaded pubsub service");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Authorization
    // ------------------------------------------------------------------

    /// Whether the JID (bare-compared) is a service administrator.
    pub fn is_sysadmin(&self, jid: &Jid) -> bool {
        self.sysadmins.contains(&jid.to_bare())
    }

    pub fn add_sysadmin(&self, jid: BareJid) {
        self.sysadmins.insert(jid);
    }

    pub fn remove_sysadmin(&self, jid: &BareJid) -> bool {
        self.sysadmins.remove(jid).is_some()
    }

    /// Whether the JID may create nodes on this service.
    pub fn can_create_node(&self, jid: &Jid) -> bool {
        if self.is_sysadmin(jid) {
            return true;
        }
        !self.restrict_creation || self.allowed_creators.contains(&jid.to_bare())
    }

    /// Whether the JID administers the node: an owner affiliate or a
    /// service sysadmin, compared by bare JID.
    pub async fn is_admin(&self, node: &NodeId, jid: &Jid) -> Result<bool, PubSubError> {
        let handle = self.handle(node)?;
        let node = handle.read().await;
        Ok(self.node_admin(&node, jid))
    }

    pub(crate) fn node_admin(&self, node: &Node, jid: &Jid) -> bool {
        node.is_owner(jid) || self.is_sysadmin(jid)
    }

    // ------------------------------------------------------------------
    // Node lookup
    // ------------------------------------------------------------------

    /// Identifier of the root collection, if the service has one.
    pub fn root_id(&self) -> Option<NodeId> {
        self.collections_enabled.then(|| self.id.root())
    }

    pub fn node(&self, node: &NodeId) -> Option<NodeHandle> {
        self.nodes.get(node).map(|n| n.value().clone())
    }

    pub fn contains_node(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All node identifiers, sorted.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|n| n.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Children of a collection, in creation order.
    pub async fn children(&self, node: &NodeId) -> Result<Vec<NodeId>, PubSubError> {
        let handle = self.handle(node)?;
        let node = handle.read().await;
        Ok(node.children().to_vec())
    }

    pub(crate) fn handle(&self, node: &NodeId) -> Result<NodeHandle, PubSubError> {
        self.node(node)
            .ok_or_else(|| PubSubError::NodeNotFound(node.node_id().to_string()))
    }

    /// Admit a mutation. The returned guard keeps shutdown waiting until
    /// the mutation has queued all of its storage writes.
    pub(crate) async fn enter(&self) -> Result<RwLockReadGuard<'_, ()>, PubSubError> {
        let guard = self.ctx.in_flight.lock.read().await;
        if self.is_shutting_down() {
            return Err(PubSubError::ShuttingDown);
        }
        Ok(guard)
    }

    // ------------------------------------------------------------------
    // Default configuration
    // ------------------------------------------------------------------

    /// Configuration new nodes of the given type start from.
    pub fn default_config(&self, node_type: NodeType) -> NodeConfig {
        if let Some(config) = self.defaults.get(&node_type) {
            return config.value().clone();
        }
        match (&self.kind, node_type) {
            (ServiceKind::Pep { .. }, NodeType::Leaf) => NodeConfig::pep_default(),
            _ => NodeConfig::default_for(node_type),
        }
    }

    /// Replace the default configuration for a node type. Sysadmins only.
    #[instrument(skip(self, config), fields(service = %self.id, node_type = %node_type))]
    pub fn set_default_config(
        &self,
        requester: &Jid,
        node_type: NodeType,
        config: NodeConfig,
    ) -> Result<(), PubSubError> {
        // Fails only while a shutdown is draining.
        let _running = self
            .ctx
            .in_flight
            .lock
            .try_read()
            .map_err(|_| PubSubError::ShuttingDown)?;
        if self.is_shutting_down() {
            return Err(PubSubError::ShuttingDown);
        }
        if !self.is_sysadmin(requester) {
            return Err(PubSubError::forbidden());
        }
        config.validate()?;

        let config = config.normalized(node_type);
        let previous = self.defaults.insert(node_type, config.clone());
        let op = match previous {
            Some(_) => StorageOp::UpdateDefaultConfig(self.id.clone(), node_type, config),
            None => StorageOp::CreateDefaultConfig(self.id.clone(), node_type, config),
        };
        self.ctx.persistence.enqueue(op);
        info!("Updated default node configuration");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Record that a node needs the user's presence. Sends a presence
    /// subscription when this is the first such node.
    pub fn presence_subscription_required(&self, node: &NodeId, user: &BareJid) {
        if self.presence.require(node, user) {
            let to: Jid = user.clone().into();
            self.ctx.sender.send(stanzas::build_presence_subscription(
                &self.address,
                &to,
                "subscribe",
            ));
        }
    }

    /// Record that a node no longer needs the user's presence. Sends an
    /// unsubscription once no node needs it.
    pub fn presence_subscription_not_required(&self, node: &NodeId, user: &BareJid) {
        if self.presence.release(node, user) {
            self.send_presence_unsubscription(user);
        }
    }

    fn send_presence_unsubscription(&self, user: &BareJid) {
        let to: Jid = user.clone().into();
        self.ctx.sender.send(stanzas::build_presence_subscription(
            &self.address,
            &to,
            "unsubscribe",
        ));
    }

    /// Bring presence interest in line with a node's new interest set.
    pub(crate) fn sync_presence_interest(
        &self,
        node: &NodeId,
        before: &HashSet<BareJid>,
        after: &HashSet<BareJid>,
    ) {
        for user in after.difference(before) {
            self.presence_subscription_required(node, user);
        }
        for user in before.difference(after) {
            self.presence_subscription_not_required(node, user);
        }
    }

    pub(crate) fn release_node_presence(&self, node: &NodeId) {
        for user in self.presence.release_node(node) {
            self.send_presence_unsubscription(&user);
        }
    }

    /// Apply a presence change of a tracked user. `None` means the resource
    /// went offline.
    ///
    /// A resource coming online receives the last item of every leaf whose
    /// policy is to send it on presence.
    #[instrument(skip(self), fields(service = %self.id, jid = %full_jid))]
    pub async fn presence_changed(&self, full_jid: &Jid, show: Option<Show>) {
        let bare = full_jid.to_bare();
        if !self.presence.is_tracked(&bare) {
            return;
        }

        let was_online = full_jid.resource().is_some() && self.presence.is_online(full_jid);
        self.presence.update(full_jid, show);

        if show.is_some() && !was_online && full_jid.resource().is_some() {
            self.send_last_items_on_presence(full_jid, &bare).await;
        }
    }

    async fn send_last_items_on_presence(&self, full_jid: &Jid, bare: &BareJid) {
        let handles: Vec<NodeHandle> = self.nodes.iter().map(|n| n.value().clone()).collect();
        let now = Utc::now();

        for handle in handles {
            let node = handle.read().await;
            if node.is_deleted()
                || !node.is_leaf()
                || node.config.send_last_published_item != SendLastPublishedItem::OnSubAndPresence
            {
                continue;
            }
            let Some(last) = node.items().and_then(|items| items.last()) else {
                continue;
            };

            let subids: Vec<String> = node
                .subscriptions_of(bare)
                .into_iter()
                .filter(|s| {
                    can_send_events(s, node.config.presence_based_delivery, &self.presence, now)
                        && s.matches_item(last)
                })
                .map(|s| s.id.clone())
                .collect();
            if subids.is_empty() {
                continue;
            }

            let subids = if node.config.multiple_subscriptions {
                subids
            } else {
                Vec::new()
            };
            let message = stanzas::build_items_event(
                &self.address,
                &node.id,
                std::slice::from_ref(last),
                node.config.deliver_payloads,
                &subids,
            );
            self.ctx.sender.send_notification(&node.id, message, full_jid);
            metrics::record_notifications_sent(1, "last_item");
        }
    }

    // ------------------------------------------------------------------
    // Event plumbing
    // ------------------------------------------------------------------

    /// Snapshot the subscriptions of the ancestors of a node that apply to
    /// it, nearest ancestor first. Each ancestor is read-locked in turn, so
    /// callers must not hold a node lock.
    pub(crate) async fn ancestor_subscriptions(
        &self,
        parent: Option<NodeId>,
        subscription_type: SubscriptionType,
    ) -> Vec<AncestorSubscriptions> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut current = parent;
        let mut distance = 1u32;

        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                warn!(node = %id, "Cycle in node hierarchy");
                break;
            }
            let Some(handle) = self.node(&id) else {
                break;
            };
            let node = handle.read().await;
            let subscriptions = node
                .subscriptions()
                .filter(|s| {
                    s.options.subscription_type == subscription_type
                        && s.options.covers_depth(distance)
                })
                .cloned()
                .collect();
            result.push(AncestorSubscriptions {
                subscriptions,
                presence_based_delivery: node.config.presence_based_delivery,
            });
            current = node.parent.clone();
            distance += 1;
        }
        result
    }

    /// Recipients of a non-item event on the node.
    pub(crate) fn plan_events(&self, node: &Node, ancestors: &[AncestorSubscriptions]) -> Vec<Delivery> {
        let now = Utc::now();
        let mut plan = DeliveryPlan::new();
        plan.add_subscriptions(
            node.subscriptions(),
            node.config.presence_based_delivery,
            &self.presence,
            now,
        );
        for ancestor in ancestors {
            plan.add_subscriptions(
                &ancestor.subscriptions,
                ancestor.presence_based_delivery,
                &self.presence,
                now,
            );
        }
        plan.into_deliveries()
    }

    /// Recipients of published items, filtered per subscription.
    pub(crate) fn plan_items(
        &self,
        node: &Node,
        ancestors: &[AncestorSubscriptions],
        items: &[PublishedItem],
    ) -> Vec<Delivery> {
        let now = Utc::now();
        let mut plan = DeliveryPlan::new();
        plan.add_item_subscriptions(
            node.subscriptions(),
            items,
            node.config.presence_based_delivery,
            &self.presence,
            now,
        );
        for ancestor in ancestors {
            plan.add_item_subscriptions(
                &ancestor.subscriptions,
                items,
                ancestor.presence_based_delivery,
                &self.presence,
                now,
            );
        }
        plan.into_deliveries()
    }

    /// Build and send one notification per delivery.
    pub(crate) fn send_deliveries<F>(
        &self,
        node: &NodeId,
        deliveries: Vec<Delivery>,
        event: &'static str,
        build: F,
    ) where
        F: Fn(&Delivery) -> Element,
    {
        if deliveries.is_empty() {
            return;
        }
        let count = deliveries.len();
        for delivery in &deliveries {
            let message = build(delivery);
            self.ctx
                .sender
                .send_notification(node, message, &delivery.jid);
        }
        metrics::record_notifications_sent(count, event);
        debug!(node = %node, recipients = count, event, "Sent pubsub notifications");
    }

    /// Subscription ids to put in notification headers.
    pub(crate) fn header_subids(&self, node: &Node, delivery: &Delivery) -> Vec<String> {
        if node.config.multiple_subscriptions {
            delivery.subids.clone()
        } else {
            Vec::new()
        }
    }

    pub(crate) fn persist(&self, op: StorageOp) {
        self.ctx.persistence.enqueue(op);
    }

    pub(crate) fn persist_new_node(&self, node: &Node) {
        self.persist(StorageOp::CreateNode(node.record()));
        for affiliate in node.affiliates() {
            if affiliate.affiliation != Affiliation::None {
                self.persist(StorageOp::CreateAffiliation(
                    node.id.clone(),
                    affiliate.clone(),
                ));
            }
        }
    }

    pub(crate) fn record_node_count(&self) {
        metrics::record_node_count(self.nodes.len(), self.id.as_str());
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Reject further mutations. Mutations already admitted run to
    /// completion; see [`InFlight::drain`].
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!(service = %self.id, "Pubsub service shutting down");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PubSubService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubService")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}
