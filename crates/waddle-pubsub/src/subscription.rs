//! Node subscriptions and their delivery options.
//!
//! A subscription moves through `None -> Pending -> Subscribed`, with
//! `Unconfigured` as a side branch when the node requires the subscriber to
//! submit options before delivery starts. Removed subscriptions are dropped
//! from memory entirely.

use std::fmt;

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use serde::{Deserialize, Serialize};

use crate::id::NodeId;
use crate::item::PublishedItem;
use crate::presence::Show;

/// Subscription state (XEP-0060 Section 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// Not subscribed.
    None,
    /// Waiting for an owner to approve.
    Pending,
    /// Receiving notifications.
    Subscribed,
    /// Waiting for the subscriber to submit options.
    Unconfigured,
}

impl SubscriptionState {
    /// The XEP-0060 attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::None => "none",
            SubscriptionState::Pending => "pending",
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Unconfigured => "unconfigured",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a collection subscription delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SubscriptionType {
    /// Item notifications from descendant leaves.
    #[default]
    Items,
    /// Notifications about descendant nodes.
    Nodes,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Items => "items",
            SubscriptionType::Nodes => "nodes",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "items" => Some(SubscriptionType::Items),
            "nodes" => Some(SubscriptionType::Nodes),
            _ => None,
        }
    }
}

/// Per-subscription delivery filters layered on top of node policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    /// Whether notifications are delivered at all.
    pub deliver: bool,
    /// Deliver only while the subscriber has one of these shows. Empty means any.
    pub presence_states: Vec<Show>,
    /// Deliver only items whose payload contains this keyword.
    pub keyword: Option<String>,
    /// Ignore items created before this instant.
    pub since: Option<DateTime<Utc>>,
    /// The subscription stops being active after this instant.
    pub expire: Option<DateTime<Utc>>,
    /// Collection subscriptions only.
    pub subscription_type: SubscriptionType,
    /// Collection subscriptions only: 1 for direct children, 0 for all descendants.
    pub depth: u32,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            deliver: true,
            presence_states: Vec::new(),
            keyword: None,
            since: None,
            expire: None,
            subscription_type: SubscriptionType::Items,
            depth: 1,
        }
    }
}

impl SubscriptionOptions {
    /// Whether the options filter delivery by the subscriber's presence.
    pub fn filters_presence(&self) -> bool {
        !self.presence_states.is_empty()
    }

    /// Whether a descendant at `distance` levels below the subscribed
    /// collection is in range.
    pub fn covers_depth(&self, distance: u32) -> bool {
        self.depth == 0 || distance <= self.depth
    }
}

/// A JID's registration to receive notifications from a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSubscription {
    /// Subscription id, unique within the node.
    pub id: String,
    /// The subscribed node.
    pub node: NodeId,
    /// The entity that owns the subscription.
    pub owner: BareJid,
    /// Where notifications are delivered (bare or full JID).
    pub jid: Jid,
    pub state: SubscriptionState,
    pub options: SubscriptionOptions,
}

impl NodeSubscription {
    /// Create a subscription with a fresh id.
    pub fn new(node: NodeId, owner: BareJid, jid: Jid, state: SubscriptionState) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            node,
            owner,
            jid,
            state,
            options: SubscriptionOptions::default(),
        }
    }

    /// Subscribed and not expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state == SubscriptionState::Subscribed
            && self.options.expire.map(|expire| now < expire).unwrap_or(true)
    }

    /// Waiting for owner approval.
    pub fn is_authorization_pending(&self) -> bool {
        self.state == SubscriptionState::Pending
    }

    /// Waiting for the subscriber to submit options.
    pub fn is_configuration_pending(&self) -> bool {
        self.state == SubscriptionState::Unconfigured
    }

    /// Whether the item passes this subscription's keyword and date filters.
    pub fn matches_item(&self, item: &PublishedItem) -> bool {
        if let Some(since) = self.options.since {
            if item.created_at < since {
                return false;
            }
        }

        match &self.options.keyword {
            Some(keyword) => item.contains_keyword(keyword),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ServiceId;
    use chrono::Duration;
    use minidom::Element;

    fn subscription(state: SubscriptionState) -> NodeSubscription {
        let node = ServiceId::new("pubsub.example.com").node("news");
        let owner: BareJid = "bob@example.com".parse().expect("valid jid");
        NodeSubscription::new(node, owner.clone(), owner.into(), state)
    }

    fn item(text: &str) -> PublishedItem {
        let node = ServiceId::new("pubsub.example.com").node("news");
        let payload = Element::builder("entry", "http://www.w3.org/2005/Atom")
            .append(text)
            .build();
        PublishedItem::new(
            node.item("1"),
            "alice@example.com".parse().expect("valid jid"),
            Some(payload),
        )
    }

    #[test]
    fn test_is_active() {
        let now = Utc::now();
        let mut sub = subscription(SubscriptionState::Subscribed);
        assert!(sub.is_active(now));

        sub.options.expire = Some(now - Duration::seconds(1));
        assert!(!sub.is_active(now));

        assert!(!subscription(SubscriptionState::Pending).is_active(now));
        assert!(!subscription(SubscriptionState::Unconfigured).is_active(now));
    }

    #[test]
    fn test_keyword_filter() {
        let mut sub = subscription(SubscriptionState::Subscribed);
        sub.options.keyword = Some("rust".to_string());

        assert!(sub.matches_item(&item("all about rust")));
        assert!(!sub.matches_item(&item("all about go")));
    }

    #[test]
    fn test_since_filter() {
        let mut sub = subscription(SubscriptionState::Subscribed);
        sub.options.since = Some(Utc::now() + Duration::hours(1));
        assert!(!sub.matches_item(&item("late")));
    }

    #[test]
    fn test_depth() {
        let mut options = SubscriptionOptions::default();
        assert!(options.covers_depth(1));
        assert!(!options.covers_depth(2));

        options.depth = 0;
        assert!(options.covers_depth(5));
    }

    #[test]
    fn test_unique_ids() {
        let a = subscription(SubscriptionState::Subscribed);
        let b = subscription(SubscriptionState::Subscribed);
        assert_ne!(a.id, b.id);
    }
}
