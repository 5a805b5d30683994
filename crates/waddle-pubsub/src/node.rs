//! Pub/sub nodes and their configuration.
//!
//! A node is either a collection, holding an ordered set of child node
//! identifiers, or a leaf, holding the item history. Both variants share
//! the identifier, configuration, affiliates and subscriptions.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use serde::{Deserialize, Serialize};

use crate::affiliation::{Affiliation, NodeAffiliate};
use crate::error::{BadRequestReason, PubSubError};
use crate::id::NodeId;
use crate::item::ItemHistory;
use crate::storage::{NodeRecord, StoredNode};
use crate::subscription::{NodeSubscription, SubscriptionState};

/// Shared handle to a node. All mutation goes through the write lock.
pub type NodeHandle = Arc<tokio::sync::RwLock<Node>>;

/// Access model for a PubSub node.
///
/// Determines who can subscribe to and retrieve items from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccessModel {
    /// Anyone can subscribe and retrieve items.
    Open,
    /// Only entities subscribed to an owner's presence can access.
    /// This is the default for PEP nodes.
    #[default]
    Presence,
    /// Only entities in specific roster groups can access.
    Roster,
    /// Subscriptions need owner approval.
    Authorize,
    /// Only explicitly whitelisted JIDs can access.
    Whitelist,
}

impl AccessModel {
    /// Parse an access model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AccessModel::Open),
            "presence" => Some(AccessModel::Presence),
            "roster" => Some(AccessModel::Roster),
            "authorize" => Some(AccessModel::Authorize),
            "whitelist" => Some(AccessModel::Whitelist),
            _ => None,
        }
    }

    /// Relative strictness, used to detect a tightened access model.
    fn strictness(&self) -> u8 {
        match self {
            AccessModel::Open => 0,
            AccessModel::Presence => 1,
            AccessModel::Roster => 2,
            AccessModel::Authorize => 3,
            AccessModel::Whitelist => 4,
        }
    }

    /// Whether switching from `self` to `other` may disqualify subscribers.
    pub fn is_tightened_by(&self, other: AccessModel) -> bool {
        other != *self && other.strictness() > self.strictness()
    }
}

impl fmt::Display for AccessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessModel::Open => "open",
            AccessModel::Presence => "presence",
            AccessModel::Roster => "roster",
            AccessModel::Authorize => "authorize",
            AccessModel::Whitelist => "whitelist",
        };
        write!(f, "{}", s)
    }
}

/// Publish model for a PubSub node.
///
/// Determines who can publish to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PublishModel {
    /// Only owners and publishers can publish.
    #[default]
    Publishers,
    /// Subscribers can publish too.
    Subscribers,
    /// Anyone can publish.
    Open,
}

impl PublishModel {
    /// Parse a publish model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "publishers" => Some(PublishModel::Publishers),
            "subscribers" => Some(PublishModel::Subscribers),
            "open" => Some(PublishModel::Open),
            _ => None,
        }
    }
}

impl fmt::Display for PublishModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublishModel::Publishers => "publishers",
            PublishModel::Subscribers => "subscribers",
            PublishModel::Open => "open",
        };
        write!(f, "{}", s)
    }
}

/// When to send the last published item to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SendLastPublishedItem {
    /// Never send last item automatically.
    Never,
    /// Send on subscription only.
    OnSub,
    /// Send on subscription and when contact comes online (PEP default).
    #[default]
    OnSubAndPresence,
}

impl SendLastPublishedItem {
    /// Parse from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "never" => Some(SendLastPublishedItem::Never),
            "on_sub" => Some(SendLastPublishedItem::OnSub),
            "on_sub_and_presence" => Some(SendLastPublishedItem::OnSubAndPresence),
            _ => None,
        }
    }

    /// Whether the last item goes out when a subscription becomes active.
    pub fn on_subscribe(&self) -> bool {
        !matches!(self, SendLastPublishedItem::Never)
    }
}

impl fmt::Display for SendLastPublishedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendLastPublishedItem::Never => "never",
            SendLastPublishedItem::OnSub => "on_sub",
            SendLastPublishedItem::OnSubAndPresence => "on_sub_and_presence",
        };
        write!(f, "{}", s)
    }
}

/// Leaf or collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Leaf,
    Collection,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Leaf => "leaf",
            NodeType::Collection => "collection",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a PubSub node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human readable node title.
    pub title: Option<String>,
    /// Access model (who can subscribe/retrieve).
    pub access_model: AccessModel,
    /// Publish model (who can publish).
    pub publish_model: PublishModel,
    /// Maximum number of items to keep (0 = unlimited).
    pub max_items: u32,
    /// Maximum payload size in bytes (0 = unlimited).
    pub max_payload_size: u32,
    /// Whether to persist items across server restarts.
    pub persist_items: bool,
    /// Whether to deliver payloads in notifications.
    pub deliver_payloads: bool,
    /// Whether to notify subscribers of configuration changes.
    pub notify_config: bool,
    /// Whether to notify on item retraction.
    pub notify_retract: bool,
    /// Whether to notify on node deletion.
    pub notify_delete: bool,
    /// Deliver notifications only to online subscribers.
    pub presence_based_delivery: bool,
    /// Whether subscriptions are accepted at all.
    pub subscription_enabled: bool,
    /// Subscribers must submit options before delivery starts.
    pub subscription_config_required: bool,
    /// Reject client-supplied item ids that already exist.
    pub reject_duplicate_ids: bool,
    /// Roster groups granted access under the roster access model.
    pub roster_groups_allowed: Vec<String>,
    /// Allow several subscriptions per subscriber JID.
    pub multiple_subscriptions: bool,
    /// Whether to send last published item on subscription.
    pub send_last_published_item: SendLastPublishedItem,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::leaf_default()
    }
}

impl NodeConfig {
    /// Default configuration for PEP nodes (XEP-0163).
    ///
    /// - Access model: presence (roster-based)
    /// - Max items: 1 (only latest item kept)
    /// - Persist items: true
    /// - Deliver payloads: true
    pub fn pep_default() -> Self {
        Self {
            access_model: AccessModel::Presence,
            max_items: 1,
            send_last_published_item: SendLastPublishedItem::OnSubAndPresence,
            ..Self::leaf_default()
        }
    }

    /// Configuration for a public node (anyone can subscribe).
    pub fn public() -> Self {
        Self {
            access_model: AccessModel::Open,
            max_items: 10,
            ..Self::leaf_default()
        }
    }

    /// Configuration for a whitelist-only node.
    pub fn whitelist() -> Self {
        Self {
            access_model: AccessModel::Whitelist,
            max_items: 10,
            ..Self::leaf_default()
        }
    }

    /// Service default for leaf nodes.
    pub fn leaf_default() -> Self {
        Self {
            title: None,
            access_model: AccessModel::Open,
            publish_model: PublishModel::Publishers,
            max_items: 10,
            max_payload_size: 5120,
            persist_items: true,
            deliver_payloads: true,
            notify_config: false,
            notify_retract: true,
            notify_delete: true,
            presence_based_delivery: false,
            subscription_enabled: true,
            subscription_config_required: false,
            reject_duplicate_ids: false,
            roster_groups_allowed: Vec::new(),
            multiple_subscriptions: false,
            send_last_published_item: SendLastPublishedItem::OnSub,
        }
    }

    /// Service default for collection nodes.
    pub fn collection_default() -> Self {
        Self {
            max_items: 0,
            max_payload_size: 0,
            persist_items: false,
            deliver_payloads: false,
            send_last_published_item: SendLastPublishedItem::Never,
            ..Self::leaf_default()
        }
    }

    /// Service default for the given node type.
    pub fn default_for(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Leaf => Self::leaf_default(),
            NodeType::Collection => Self::collection_default(),
        }
    }

    /// Apply derived settings. A leaf that does not persist items still
    /// retains its last item.
    pub fn normalized(mut self, node_type: NodeType) -> Self {
        if node_type == NodeType::Leaf && !self.persist_items {
            self.max_items = 1;
        }
        self
    }

    /// Check option combinations that can never work.
    pub fn validate(&self) -> Result<(), PubSubError> {
        if self.access_model == AccessModel::Roster && self.roster_groups_allowed.is_empty() {
            return Err(PubSubError::BadRequest(BadRequestReason::InvalidOptions(
                "roster access model requires at least one roster group".to_string(),
            )));
        }
        Ok(())
    }
}

/// Variant-specific node state.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Ordered child node identifiers.
    Collection { children: Vec<NodeId> },
    /// Item history, oldest first.
    Leaf { items: ItemHistory },
}

/// A pub/sub node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    /// Parent collection, `None` for the root and for flat services.
    pub parent: Option<NodeId>,
    pub creator: BareJid,
    pub config: NodeConfig,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub kind: NodeKind,
    affiliates: HashMap<Jid, NodeAffiliate>,
    subscriptions: HashMap<String, NodeSubscription>,
    deleted: bool,
}

impl Node {
    /// Create a leaf node. The creator becomes its owner.
    pub fn new_leaf(id: NodeId, parent: Option<NodeId>, creator: BareJid, config: NodeConfig) -> Self {
        Self::new(
            id,
            parent,
            creator,
            config.normalized(NodeType::Leaf),
            NodeKind::Leaf {
                items: ItemHistory::new(),
            },
        )
    }

    /// Create a collection node. The creator becomes its owner.
    pub fn new_collection(
        id: NodeId,
        parent: Option<NodeId>,
        creator: BareJid,
        config: NodeConfig,
    ) -> Self {
        Self::new(
            id,
            parent,
            creator,
            config,
            NodeKind::Collection {
                children: Vec::new(),
            },
        )
    }

    fn new(
        id: NodeId,
        parent: Option<NodeId>,
        creator: BareJid,
        config: NodeConfig,
        kind: NodeKind,
    ) -> Self {
        let now = Utc::now();
        let mut node = Self {
            id,
            parent,
            creator: creator.clone(),
            config,
            created_at: now,
            modified_at: now,
            kind,
            affiliates: HashMap::new(),
            subscriptions: HashMap::new(),
            deleted: false,
        };
        node.set_affiliation(creator.into(), Affiliation::Owner);
        node
    }

    /// Rebuild a node from storage. Items of leaves are loaded separately.
    pub fn from_stored(stored: StoredNode) -> Self {
        let StoredNode {
            record,
            affiliates,
            subscriptions,
        } = stored;

        let kind = match record.node_type {
            NodeType::Leaf => NodeKind::Leaf {
                items: ItemHistory::new(),
            },
            NodeType::Collection => NodeKind::Collection {
                children: Vec::new(),
            },
        };

        Self {
            id: record.id,
            parent: record.parent,
            creator: record.creator,
            config: record.config,
            created_at: record.created_at,
            modified_at: record.modified_at,
            kind,
            affiliates: affiliates
                .into_iter()
                .map(|a| (a.jid.clone(), a))
                .collect(),
            subscriptions: subscriptions
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect(),
            deleted: false,
        }
    }

    /// The persisted form of the node's own fields.
    pub fn record(&self) -> NodeRecord {
        NodeRecord {
            id: self.id.clone(),
            parent: self.parent.clone(),
            node_type: self.node_type(),
            creator: self.creator.clone(),
            config: self.config.clone(),
            created_at: self.created_at,
            modified_at: self.modified_at,
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Leaf { .. } => NodeType::Leaf,
            NodeKind::Collection { .. } => NodeType::Collection,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.node_type() == NodeType::Leaf
    }

    pub fn is_collection(&self) -> bool {
        self.node_type() == NodeType::Collection
    }

    /// Whether the node has been removed from its service.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    pub(crate) fn unmark_deleted(&mut self) {
        self.deleted = false;
    }

    pub(crate) fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    // ------------------------------------------------------------------
    // Hierarchy
    // ------------------------------------------------------------------

    /// Child node ids. Always empty for leaves.
    pub fn children(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Collection { children } => children,
            NodeKind::Leaf { .. } => &[],
        }
    }

    pub(crate) fn add_child(&mut self, child: NodeId) -> Result<(), PubSubError> {
        match &mut self.kind {
            NodeKind::Collection { children } => {
                if !children.contains(&child) {
                    children.push(child);
                }
                Ok(())
            }
            NodeKind::Leaf { .. } => Err(PubSubError::BadRequest(BadRequestReason::InvalidParent)),
        }
    }

    pub(crate) fn remove_child(&mut self, child: &NodeId) {
        if let NodeKind::Collection { children } = &mut self.kind {
            children.retain(|c| c != child);
        }
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    /// Item history of a leaf.
    pub fn items(&self) -> Option<&ItemHistory> {
        match &self.kind {
            NodeKind::Leaf { items } => Some(items),
            NodeKind::Collection { .. } => None,
        }
    }

    pub(crate) fn items_mut(&mut self) -> Option<&mut ItemHistory> {
        match &mut self.kind {
            NodeKind::Leaf { items } => Some(items),
            NodeKind::Collection { .. } => None,
        }
    }

    /// Whether publish requests must carry an item element.
    pub fn is_item_required(&self) -> bool {
        self.config.persist_items || self.config.deliver_payloads
    }

    /// Whether the leaf holds any item.
    pub fn has_items(&self) -> bool {
        self.items().map(|items| !items.is_empty()).unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Affiliations
    // ------------------------------------------------------------------

    /// The affiliation of a JID: an exact record first, then the bare JID's.
    pub fn affiliation_of(&self, jid: &Jid) -> Affiliation {
        if let Some(affiliate) = self.affiliates.get(jid) {
            return affiliate.affiliation;
        }
        let bare: Jid = jid.to_bare().into();
        self.affiliates
            .get(&bare)
            .map(|a| a.affiliation)
            .unwrap_or_default()
    }

    /// The exact affiliation record of a JID.
    pub fn affiliate(&self, jid: &Jid) -> Option<&NodeAffiliate> {
        self.affiliates.get(jid)
    }

    pub fn affiliates(&self) -> impl Iterator<Item = &NodeAffiliate> {
        self.affiliates.values()
    }

    /// JIDs affiliated as owner.
    pub fn owners(&self) -> Vec<Jid> {
        self.affiliates
            .values()
            .filter(|a| a.affiliation == Affiliation::Owner)
            .map(|a| a.jid.clone())
            .collect()
    }

    /// Whether the JID, bare-compared, is an owner affiliate.
    pub fn is_owner(&self, jid: &Jid) -> bool {
        let bare = jid.to_bare();
        self.affiliates
            .values()
            .any(|a| a.affiliation == Affiliation::Owner && a.jid.to_bare() == bare)
    }

    /// Insert or replace an affiliation record. Returns the previous one.
    pub(crate) fn set_affiliation(
        &mut self,
        jid: Jid,
        affiliation: Affiliation,
    ) -> Option<NodeAffiliate> {
        self.affiliates
            .insert(jid.clone(), NodeAffiliate::new(jid, affiliation))
    }

    pub(crate) fn remove_affiliation(&mut self, jid: &Jid) -> Option<NodeAffiliate> {
        self.affiliates.remove(jid)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub fn subscriptions(&self) -> impl Iterator<Item = &NodeSubscription> {
        self.subscriptions.values()
    }

    pub fn subscription(&self, subid: &str) -> Option<&NodeSubscription> {
        self.subscriptions.get(subid)
    }

    pub(crate) fn subscription_mut(&mut self, subid: &str) -> Option<&mut NodeSubscription> {
        self.subscriptions.get_mut(subid)
    }

    /// Subscriptions owned by the bare JID.
    pub fn subscriptions_of(&self, owner: &BareJid) -> Vec<&NodeSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.owner == *owner)
            .collect()
    }

    /// Subscriptions waiting for owner approval.
    pub fn pending_subscriptions(&self) -> Vec<&NodeSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.state == SubscriptionState::Pending)
            .collect()
    }

    pub(crate) fn insert_subscription(&mut self, subscription: NodeSubscription) {
        self.subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub(crate) fn remove_subscription(&mut self, subid: &str) -> Option<NodeSubscription> {
        self.subscriptions.remove(subid)
    }

    /// Users whose presence this node needs, for delivery filtering or for
    /// sending the last item when they come online.
    pub fn presence_interest(&self) -> HashSet<BareJid> {
        let node_wide = self.config.presence_based_delivery
            || (self.is_leaf()
                && self.config.send_last_published_item == SendLastPublishedItem::OnSubAndPresence);

        self.subscriptions
            .values()
            .filter(|s| s.state != SubscriptionState::None)
            .filter(|s| node_wide || s.options.filters_presence())
            .map(|s| s.owner.clone())
            .collect()
    }
}
