//! Presence bookkeeping for presence-filtered delivery.
//!
//! The engine never computes presence itself. The host feeds presence
//! changes in through [`PresenceTracker::update`], and only for users some
//! node asked to track via [`PresenceTracker::require`].

use std::collections::{HashMap, HashSet};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::{BareJid, Jid};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::id::NodeId;

/// User presence show status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Show {
    /// Available (default)
    #[default]
    Available,
    /// Away
    Away,
    /// Extended away
    Xa,
    /// Do not disturb
    Dnd,
    /// Free for chat
    Chat,
}

impl Show {
    /// The `pubsub#show-values` option value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Show::Available => "online",
            Show::Away => "away",
            Show::Xa => "xa",
            Show::Dnd => "dnd",
            Show::Chat => "chat",
        }
    }

    /// Parse a show value. Both `online` and `available` denote [`Show::Available`].
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "online" | "available" => Some(Show::Available),
            "away" => Some(Show::Away),
            "xa" => Some(Show::Xa),
            "dnd" => Some(Show::Dnd),
            "chat" => Some(Show::Chat),
            _ => None,
        }
    }
}

impl std::fmt::Display for Show {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-service presence state.
///
/// Holds the last known `show` per connected resource and a reference
/// count of nodes interested in each user's presence.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    /// bare JID -> full JID -> show
    presences: DashMap<BareJid, HashMap<Jid, Show>>,
    /// bare JID -> nodes that need the user's presence
    interest: DashMap<BareJid, HashSet<NodeId>>,
}

impl PresenceTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence change. `None` means the resource went offline.
    pub fn update(&self, full_jid: &Jid, show: Option<Show>) {
        let bare = full_jid.to_bare();
        match show {
            Some(show) => {
                self.presences
                    .entry(bare)
                    .or_default()
                    .insert(full_jid.clone(), show);
            }
            None => {
                let now_empty = match self.presences.get_mut(&bare) {
                    Some(mut resources) => {
                        resources.remove(full_jid);
                        resources.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.presences.remove_if(&bare, |_, resources| resources.is_empty());
                }
            }
        }
    }

    /// Show values of a subscriber.
    ///
    /// A bare JID yields the shows of all its connected resources; a full
    /// JID yields the show of that resource only.
    pub fn show_presences(&self, subscriber: &Jid) -> Vec<Show> {
        let Some(resources) = self.presences.get(&subscriber.to_bare()) else {
            return Vec::new();
        };

        if subscriber.resource().is_none() {
            resources.values().copied().collect()
        } else {
            resources.get(subscriber).copied().into_iter().collect()
        }
    }

    /// Whether any matching resource of the subscriber is online.
    pub fn is_online(&self, subscriber: &Jid) -> bool {
        !self.show_presences(subscriber).is_empty()
    }

    /// Register a node's interest in a user's presence.
    ///
    /// Returns `true` when this is the first interested node, meaning the
    /// service must subscribe to the user's presence.
    pub fn require(&self, node: &NodeId, user: &BareJid) -> bool {
        let mut nodes = self.interest.entry(user.clone()).or_default();
        let first = nodes.is_empty();
        nodes.insert(node.clone());
        if first {
            debug!(node = %node, user = %user, "Presence tracking started");
        }
        first
    }

    /// Drop a node's interest in a user's presence.
    ///
    /// Returns `true` when no interested node remains, meaning the service
    /// may unsubscribe from the user's presence.
    pub fn release(&self, node: &NodeId, user: &BareJid) -> bool {
        // Check and cleanup run under the same entry lock as `require`.
        let Entry::Occupied(mut entry) = self.interest.entry(user.clone()) else {
            return false;
        };
        if !entry.get_mut().remove(node) || !entry.get().is_empty() {
            return false;
        }

        entry.remove();
        self.presences.remove(user);
        debug!(node = %node, user = %user, "Presence tracking stopped");
        true
    }

    /// Drop all interest held by a node. Returns the users no longer tracked.
    pub fn release_node(&self, node: &NodeId) -> Vec<BareJid> {
        let users: Vec<BareJid> = self
            .interest
            .iter()
            .filter(|entry| entry.value().contains(node))
            .map(|entry| entry.key().clone())
            .collect();

        users
            .into_iter()
            .filter(|user| self.release(node, user))
            .collect()
    }

    /// Whether any node tracks the user's presence.
    pub fn is_tracked(&self, user: &BareJid) -> bool {
        self.interest
            .get(user)
            .map(|nodes| !nodes.is_empty())
            .unwrap_or(false)
    }

    /// Number of nodes tracking the user's presence.
    pub fn interest_count(&self, user: &BareJid) -> usize {
        self.interest.get(user).map(|nodes| nodes.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ServiceId;

    fn jid(s: &str) -> Jid {
        s.parse().expect("valid jid")
    }

    #[test]
    fn test_show_parse() {
        assert_eq!(Show::from_str("online"), Some(Show::Available));
        assert_eq!(Show::from_str("dnd"), Some(Show::Dnd));
        assert_eq!(Show::from_str("busy"), None);
        assert_eq!(Show::Available.to_string(), "online");
    }

    #[test]
    fn test_show_presences_bare_and_full() {
        let tracker = PresenceTracker::new();
        tracker.update(&jid("alice@example.com/phone"), Some(Show::Away));
        tracker.update(&jid("alice@example.com/desktop"), Some(Show::Chat));

        let mut all = tracker.show_presences(&jid("alice@example.com"));
        all.sort_by_key(|s| s.as_str());
        assert_eq!(all, vec![Show::Away, Show::Chat]);

        assert_eq!(
            tracker.show_presences(&jid("alice@example.com/phone")),
            vec![Show::Away]
        );
        assert!(tracker
            .show_presences(&jid("alice@example.com/tablet"))
            .is_empty());
    }

    #[test]
    fn test_departure() {
        let tracker = PresenceTracker::new();
        let phone = jid("alice@example.com/phone");
        tracker.update(&phone, Some(Show::Available));
        assert!(tracker.is_online(&jid("alice@example.com")));

        tracker.update(&phone, None);
        assert!(!tracker.is_online(&jid("alice@example.com")));
    }

    #[test]
    fn test_interest_refcount() {
        let tracker = PresenceTracker::new();
        let service = ServiceId::new("pubsub.example.com");
        let a = service.node("a");
        let b = service.node("b");
        let user: BareJid = "bob@example.com".parse().expect("valid jid");

        assert!(tracker.require(&a, &user));
        assert!(!tracker.require(&b, &user));
        assert!(!tracker.require(&a, &user));

        assert!(!tracker.release(&a, &user));
        assert!(tracker.is_tracked(&user));
        assert_eq!(tracker.interest_count(&user), 1);

        assert!(tracker.release(&b, &user));
        assert!(!tracker.is_tracked(&user));
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let tracker = PresenceTracker::new();
        let node = ServiceId::new("pubsub.example.com").node("a");
        let user: BareJid = "bob@example.com".parse().expect("valid jid");
        assert!(!tracker.release(&node, &user));
    }

    #[test]
    fn test_release_node() {
        let tracker = PresenceTracker::new();
        let service = ServiceId::new("pubsub.example.com");
        let a = service.node("a");
        let b = service.node("b");
        let bob: BareJid = "bob@example.com".parse().expect("valid jid");
        let carol: BareJid = "carol@example.com".parse().expect("valid jid");

        tracker.require(&a, &bob);
        tracker.require(&a, &carol);
        tracker.require(&b, &carol);

        let released = tracker.release_node(&a);
        assert_eq!(released, vec![bob.clone()]);
        assert!(!tracker.is_tracked(&bob));
        assert!(tracker.is_tracked(&carol));
    }

    #[test]
    fn test_release_keeps_presence_of_user_still_tracked() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let tracker = Arc::new(PresenceTracker::new());
        let service = ServiceId::new("pubsub.example.com");
        let churn = service.node("churn");
        let steady = service.node("steady");
        let user: BareJid = "bob@example.com".parse().expect("valid jid");
        let phone = jid("bob@example.com/phone");
        let done = Arc::new(AtomicBool::new(false));

        let worker = {
            let tracker = Arc::clone(&tracker);
            let user = user.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    tracker.require(&churn, &user);
                    tracker.release(&churn, &user);
                }
            })
        };

        let mut lost = 0;
        for _ in 0..20_000 {
            tracker.require(&steady, &user);
            tracker.update(&phone, Some(Show::Available));
            // The churning node can never drop the user while `steady` holds it.
            if !tracker.is_online(&phone) || !tracker.is_tracked(&user) {
                lost += 1;
            }
            tracker.release(&steady, &user);
        }

        done.store(true, Ordering::Relaxed);
        worker.join().expect("worker thread");
        assert_eq!(lost, 0);
    }
}
