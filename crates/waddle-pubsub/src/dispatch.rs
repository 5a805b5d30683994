//! Event dispatch: in-process listeners and subscriber recipient selection.
//!
//! Listeners registered with a [`ListenerRegistry`] are called synchronously
//! on the publishing or retracting task, once per node per mutation, with a
//! non-empty item list. A failing or panicking listener is logged and skipped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::Jid;
use tracing::{debug, error, warn};

use crate::id::NodeId;
use crate::item::PublishedItem;
use crate::metrics;
use crate::presence::PresenceTracker;
use crate::subscription::NodeSubscription;

/// Process-wide pub/sub event listener.
pub trait PubSubListener: Send + Sync + 'static {
    /// Items were published to a node.
    fn items_published(&self, node: &NodeId, items: &[PublishedItem]) -> anyhow::Result<()>;

    /// Items were removed from a node by retraction, eviction or purge.
    fn items_deleted(&self, node: &NodeId, items: &[PublishedItem]) -> anyhow::Result<()>;
}

/// Handle returned by [`ListenerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Registry of listeners, safe to modify while dispatching.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<ListenerId, Arc<dyn PubSubListener>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn add(&self, listener: Arc<dyn PubSubListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, listener);
        debug!(listener = id.0, "Registered pubsub listener");
        id
    }

    /// Unregister a listener. Returns whether it was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Notify listeners of published items. No-op for an empty list.
    pub fn items_published(&self, node: &NodeId, items: &[PublishedItem]) {
        if items.is_empty() {
            return;
        }
        self.dispatch(node, "items_published", |l| l.items_published(node, items));
    }

    /// Notify listeners of removed items. No-op for an empty list.
    pub fn items_deleted(&self, node: &NodeId, items: &[PublishedItem]) {
        if items.is_empty() {
            return;
        }
        self.dispatch(node, "items_deleted", |l| l.items_deleted(node, items));
    }

    fn dispatch<F>(&self, node: &NodeId, callback: &'static str, call: F)
    where
        F: Fn(&dyn PubSubListener) -> anyhow::Result<()>,
    {
        // Snapshot so listeners can (un)register from inside a callback.
        let mut snapshot: Vec<(ListenerId, Arc<dyn PubSubListener>)> = self
            .listeners
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        snapshot.sort_by_key(|(id, _)| *id);

        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(node = %node, listener = id.0, callback, error = %e, "Pubsub listener failed");
                    metrics::record_listener_failure(callback);
                }
                Err(_) => {
                    error!(node = %node, listener = id.0, callback, "Pubsub listener panicked");
                    metrics::record_listener_failure(callback);
                }
            }
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// One notification stanza to build and send.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Delivery address.
    pub jid: Jid,
    /// Ids of the recipient's subscriptions that matched.
    pub subids: Vec<String>,
    /// Items passing the recipient's filters. Empty for non-item events.
    pub items: Vec<PublishedItem>,
}

/// Whether a subscription should receive events right now.
///
/// Requires an active, delivering subscription; a subscriber with a show
/// filter must currently have one of those shows; presence-based delivery
/// requires the subscriber to be online.
pub fn can_send_events(
    subscription: &NodeSubscription,
    presence_based_delivery: bool,
    presence: &PresenceTracker,
    now: DateTime<Utc>,
) -> bool {
    if !subscription.is_active(now) || !subscription.options.deliver {
        return false;
    }

    if subscription.options.filters_presence() {
        let shows = presence.show_presences(&subscription.jid);
        if !shows
            .iter()
            .any(|s| subscription.options.presence_states.contains(s))
        {
            return false;
        }
    }

    if presence_based_delivery && !presence.is_online(&subscription.jid) {
        return false;
    }

    true
}

/// Recipients of one event, grouped by delivery address.
///
/// Subscriptions are added per node, since each node contributes its own
/// presence-based delivery setting.
#[derive(Debug, Default)]
pub struct DeliveryPlan {
    deliveries: Vec<Delivery>,
}

impl DeliveryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add eligible subscriptions for a non-item event.
    pub fn add_subscriptions<'a>(
        &mut self,
        subscriptions: impl IntoIterator<Item = &'a NodeSubscription>,
        presence_based_delivery: bool,
        presence: &PresenceTracker,
        now: DateTime<Utc>,
    ) {
        for sub in subscriptions {
            if can_send_events(sub, presence_based_delivery, presence, now) {
                self.entry(&sub.jid).subids.push(sub.id.clone());
            }
        }
    }

    /// Add eligible subscriptions for published items, applying each
    /// subscription's keyword and date filters.
    ///
    /// With an empty item list (transient publish) only the subscription
    /// state and presence filters apply.
    pub fn add_item_subscriptions<'a>(
        &mut self,
        subscriptions: impl IntoIterator<Item = &'a NodeSubscription>,
        items: &[PublishedItem],
        presence_based_delivery: bool,
        presence: &PresenceTracker,
        now: DateTime<Utc>,
    ) {
        for sub in subscriptions {
            if !can_send_events(sub, presence_based_delivery, presence, now) {
                continue;
            }

            let matching: Vec<&PublishedItem> =
                items.iter().filter(|i| sub.matches_item(i)).collect();
            if !items.is_empty() && matching.is_empty() {
                continue;
            }

            let delivery = self.entry(&sub.jid);
            delivery.subids.push(sub.id.clone());
            for item in matching {
                if !delivery.items.iter().any(|i| i.id == item.id) {
                    delivery.items.push(item.clone());
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    /// The planned deliveries, items in creation order.
    pub fn into_deliveries(mut self) -> Vec<Delivery> {
        for delivery in &mut self.deliveries {
            delivery.items.sort_by_key(|i| i.created_at);
        }
        self.deliveries
    }

    fn entry(&mut self, jid: &Jid) -> &mut Delivery {
        let pos = match self.deliveries.iter().position(|d| d.jid == *jid) {
            Some(pos) => pos,
            None => {
                self.deliveries.push(Delivery {
                    jid: jid.clone(),
                    subids: Vec::new(),
                    items: Vec::new(),
                });
                self.deliveries.len() - 1
            }
        };
        &mut self.deliveries[pos]
    }
}
