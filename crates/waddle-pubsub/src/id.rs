//! Unique identifiers for services, nodes and published items.
//!
//! These are the only keys used for lookup, storage and cross-references.
//! Persisted records and in-memory maps use the same values, so a node or an
//! item can always be resolved again through its owning service.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one pub/sub service: the domain-level service
/// (e.g. `pubsub.waddle.social`) or a user's PEP service (their bare JID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(String);

impl ServiceId {
    /// Create a service identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier of a node hosted by this service.
    pub fn node(&self, node_id: impl Into<String>) -> NodeId {
        NodeId::new(self.clone(), node_id)
    }

    /// Identifier of this service's unnamed root collection node.
    pub fn root(&self) -> NodeId {
        NodeId::new(self.clone(), "")
    }

    /// Check whether the node belongs to this service.
    pub fn owns(&self, node: &NodeId) -> bool {
        node.service == *self
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a node within a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    service: ServiceId,
    node: String,
}

impl NodeId {
    /// Create a node identifier.
    pub fn new(service: ServiceId, node: impl Into<String>) -> Self {
        Self {
            service,
            node: node.into(),
        }
    }

    /// The owning service.
    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    /// The node id within the service (empty for the root collection).
    pub fn node_id(&self) -> &str {
        &self.node
    }

    /// Whether this is the unnamed root collection node.
    pub fn is_root(&self) -> bool {
        self.node.is_empty()
    }

    /// Identifier of an item published to this node.
    pub fn item(&self, item_id: impl Into<String>) -> ItemId {
        ItemId {
            node: self.clone(),
            item: item_id.into(),
        }
    }

    /// Check whether the item belongs to this node.
    pub fn owns(&self, item: &ItemId) -> bool {
        item.node == *self
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.node)
    }
}

/// Identifies a published item within a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId {
    node: NodeId,
    item: String,
}

impl ItemId {
    /// The node the item was published to.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// The item id within the node.
    pub fn item_id(&self) -> &str {
        &self.item
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_structural_equality() {
        let a = ServiceId::new("pubsub.example.com").node("news");
        let b = NodeId::new(ServiceId::new("pubsub.example.com"), "news");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a.item("1"));
        assert!(set.contains(&b.item("1")));
        assert!(!set.contains(&b.item("2")));
    }

    #[test]
    fn test_ownership() {
        let service = ServiceId::new("pubsub.example.com");
        let other = ServiceId::new("user@example.com");
        let node = service.node("news");

        assert!(service.owns(&node));
        assert!(!other.owns(&node));
        assert!(node.owns(&node.item("x")));
        assert!(!service.node("sports").owns(&node.item("x")));
    }

    #[test]
    fn test_root_node() {
        let service = ServiceId::new("pubsub.example.com");
        assert!(service.root().is_root());
        assert!(!service.node("news").is_root());
        assert_eq!(service.node("news").to_string(), "pubsub.example.com/news");
    }
}
