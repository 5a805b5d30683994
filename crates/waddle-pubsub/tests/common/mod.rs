//! Test utilities for pub/sub engine tests.
//!
//! Provides recording collaborators (stanza sender, listener, roster) and
//! a harness that starts a [`ServiceRegistry`] over in-memory storage.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jid::{BareJid, Jid};
use minidom::Element;
use tokio::sync::Notify;

use waddle_pubsub::{
    InMemoryPubSubStorage, NodeId, PubSubConfig, PubSubListener, PublishItem, PublishedItem,
    RosterLookup, ServiceRegistry, StanzaSender,
};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub const DOMAIN: &str = "pubsub.example.com";
pub const ADMIN: &str = "admin@example.com";

/// Initialize tracing once per test binary.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("waddle_pubsub=debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn jid(s: &str) -> Jid {
    s.parse().expect("valid jid")
}

pub fn bare(s: &str) -> BareJid {
    s.parse().expect("valid bare jid")
}

/// An Atom entry payload.
pub fn entry(text: &str) -> Element {
    Element::builder("entry", "http://www.w3.org/2005/Atom")
        .append(Element::builder("title", "http://www.w3.org/2005/Atom").append(text).build())
        .build()
}

pub fn item(id: &str, text: &str) -> PublishItem {
    PublishItem::new(id, entry(text))
}

/// Stanza sender that keeps everything it is handed.
#[derive(Default)]
pub struct RecordingSender {
    stanzas: Mutex<Vec<Element>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Element> {
        self.stanzas.lock().expect("sender lock").clone()
    }

    pub fn clear(&self) {
        self.stanzas.lock().expect("sender lock").clear();
    }

    /// Stanzas addressed to `to`.
    pub fn sent_to(&self, to: &str) -> Vec<Element> {
        self.sent()
            .into_iter()
            .filter(|s| s.attr("to") == Some(to))
            .collect()
    }

    /// Presence stanzas of the given type (`subscribe` / `unsubscribe`).
    pub fn presences(&self, kind: &str) -> Vec<Element> {
        self.sent()
            .into_iter()
            .filter(|s| s.name() == "presence" && s.attr("type") == Some(kind))
            .collect()
    }
}

impl StanzaSender for RecordingSender {
    fn send(&self, stanza: Element) {
        self.stanzas.lock().expect("sender lock").push(stanza);
    }
}

/// One listener callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemEvent {
    pub node: NodeId,
    pub item_ids: Vec<String>,
}

/// Listener that records every callback.
#[derive(Default)]
pub struct RecordingListener {
    published: Mutex<Vec<ItemEvent>>,
    deleted: Mutex<Vec<ItemEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<ItemEvent> {
        self.published.lock().expect("listener lock").clone()
    }

    pub fn deleted(&self) -> Vec<ItemEvent> {
        self.deleted.lock().expect("listener lock").clone()
    }
}

fn event(node: &NodeId, items: &[PublishedItem]) -> ItemEvent {
    ItemEvent {
        node: node.clone(),
        item_ids: items.iter().map(|i| i.item_id().to_string()).collect(),
    }
}

impl PubSubListener for RecordingListener {
    fn items_published(&self, node: &NodeId, items: &[PublishedItem]) -> anyhow::Result<()> {
        self.published
            .lock()
            .expect("listener lock")
            .push(event(node, items));
        Ok(())
    }

    fn items_deleted(&self, node: &NodeId, items: &[PublishedItem]) -> anyhow::Result<()> {
        self.deleted
            .lock()
            .expect("listener lock")
            .push(event(node, items));
        Ok(())
    }
}

/// Roster with fixed presence subscriptions and groups.
#[derive(Default)]
pub struct StaticRoster {
    subscribed: HashSet<(BareJid, BareJid)>,
    groups: HashMap<(BareJid, BareJid), Vec<String>>,
}

impl StaticRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// `contact` has a presence subscription to `owner`, optionally in groups.
    pub fn with_contact(mut self, owner: &str, contact: &str, groups: &[&str]) -> Self {
        let key = (bare(owner), bare(contact));
        self.subscribed.insert(key.clone());
        self.groups
            .insert(key, groups.iter().map(|g| g.to_string()).collect());
        self
    }
}

#[async_trait]
impl RosterLookup for StaticRoster {
    async fn is_subscribed(&self, owner: &BareJid, contact: &BareJid) -> bool {
        self.subscribed.contains(&(owner.clone(), contact.clone()))
    }

    async fn groups(&self, owner: &BareJid, contact: &BareJid) -> Vec<String> {
        self.groups
            .get(&(owner.clone(), contact.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

/// Roster whose presence lookups park until released. Every contact is
/// subscribed once released.
#[derive(Clone, Default)]
pub struct GatedRoster {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[async_trait]
impl RosterLookup for GatedRoster {
    async fn is_subscribed(&self, _owner: &BareJid, _contact: &BareJid) -> bool {
        self.entered.notify_one();
        self.release.notified().await;
        true
    }

    async fn groups(&self, _owner: &BareJid, _contact: &BareJid) -> Vec<String> {
        Vec::new()
    }
}

/// A running registry and its recording collaborators.
pub struct Harness {
    pub registry: ServiceRegistry,
    pub storage: Arc<InMemoryPubSubStorage>,
    pub sender: Arc<RecordingSender>,
    pub listener: Arc<RecordingListener>,
}

pub fn test_config() -> PubSubConfig {
    PubSubConfig {
        domain: DOMAIN.to_string(),
        sysadmins: vec![bare(ADMIN)],
        ..PubSubConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(test_config(), StaticRoster::new()).await
}

pub async fn harness_with(config: PubSubConfig, roster: StaticRoster) -> Harness {
    start(config, roster, Arc::new(InMemoryPubSubStorage::new())).await
}

/// Start a registry over existing storage, e.g. to test reloading.
pub async fn start(
    config: PubSubConfig,
    roster: impl RosterLookup,
    storage: Arc<InMemoryPubSubStorage>,
) -> Harness {
    init_tracing();

    let sender = Arc::new(RecordingSender::new());
    let listener = Arc::new(RecordingListener::new());
    let registry = ServiceRegistry::start(config, storage.clone(), sender.clone(), Arc::new(roster))
        .await
        .expect("start registry");
    registry.add_listener(listener.clone());

    Harness {
        registry,
        storage,
        sender,
        listener,
    }
}
