//! Published items and the bounded item history of leaf nodes.

use std::collections::VecDeque;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use jid::Jid;
use minidom::Element;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConflictReason, PubSubError};
use crate::id::{ItemId, NodeId};

/// One payload published to a leaf node.
///
/// The serialized payload is the stored form. The parsed element is built
/// at most once, either eagerly when the item is published or on first
/// access after the item was loaded from storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedItem {
    /// Service + node + item id.
    pub id: ItemId,
    pub publisher: Jid,
    pub created_at: DateTime<Utc>,
    payload_xml: Option<String>,
    #[serde(skip)]
    payload: OnceLock<Option<Element>>,
}

impl PublishedItem {
    /// Create an item from a freshly published payload.
    pub fn new(id: ItemId, publisher: Jid, payload: Option<Element>) -> Self {
        let payload_xml = payload.as_ref().map(String::from);
        let cell = OnceLock::new();
        let _ = cell.set(payload);
        Self {
            id,
            publisher,
            created_at: Utc::now(),
            payload_xml,
            payload: cell,
        }
    }

    /// Rebuild an item from its stored form. The payload is parsed lazily.
    pub fn from_stored(
        id: ItemId,
        publisher: Jid,
        created_at: DateTime<Utc>,
        payload_xml: Option<String>,
    ) -> Self {
        Self {
            id,
            publisher,
            created_at,
            payload_xml,
            payload: OnceLock::new(),
        }
    }

    /// Generate a time-ordered item id.
    pub fn generate_id() -> String {
        uuid::Uuid::now_v7().to_string()
    }

    /// The node the item belongs to.
    pub fn node(&self) -> &NodeId {
        self.id.node()
    }

    /// The item id within its node.
    pub fn item_id(&self) -> &str {
        self.id.item_id()
    }

    /// The serialized payload.
    pub fn payload_xml(&self) -> Option<&str> {
        self.payload_xml.as_deref()
    }

    /// The parsed payload. A payload that fails to parse is logged and
    /// treated as absent.
    pub fn payload(&self) -> Option<&Element> {
        self.payload
            .get_or_init(|| {
                let xml = self.payload_xml.as_ref()?;
                match xml.parse::<Element>() {
                    Ok(element) => Some(element),
                    Err(e) => {
                        warn!(item = %self.id, error = %e, "Failed to parse stored payload");
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Size of the serialized payload in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload_xml.as_ref().map(String::len).unwrap_or(0)
    }

    /// Whether the serialized payload contains the keyword.
    pub fn contains_keyword(&self, keyword: &str) -> bool {
        self.payload_xml
            .as_ref()
            .map(|xml| xml.contains(keyword))
            .unwrap_or(false)
    }
}

/// Ordered item history of a leaf node, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ItemHistory {
    items: VecDeque<PublishedItem>,
}

impl ItemHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a history from stored items, oldest first.
    pub fn from_items(items: impl IntoIterator<Item = PublishedItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PublishedItem> {
        self.items.iter()
    }

    /// Append an item and evict the oldest items beyond `max_items`
    /// (0 means unlimited).
    ///
    /// An item with an existing id replaces the old one and moves to the
    /// newest position, unless `reject_duplicates` is set. Returns the
    /// evicted items, oldest first.
    pub fn push(
        &mut self,
        item: PublishedItem,
        max_items: u32,
        reject_duplicates: bool,
    ) -> Result<Vec<PublishedItem>, PubSubError> {
        if let Some(pos) = self.position(item.item_id()) {
            if reject_duplicates {
                return Err(PubSubError::Conflict(ConflictReason::ItemExists));
            }
            self.items.remove(pos);
        }

        self.items.push_back(item);
        Ok(self.trim(max_items))
    }

    /// Evict the oldest items beyond `max_items` (0 means unlimited).
    pub fn trim(&mut self, max_items: u32) -> Vec<PublishedItem> {
        let max_items = max_items as usize;
        if max_items == 0 || self.items.len() <= max_items {
            return Vec::new();
        }
        let excess = self.items.len() - max_items;
        self.items.drain(..excess).collect()
    }

    pub fn get(&self, item_id: &str) -> Option<&PublishedItem> {
        self.items.iter().find(|i| i.item_id() == item_id)
    }

    pub fn remove(&mut self, item_id: &str) -> Option<PublishedItem> {
        let pos = self.position(item_id)?;
        self.items.remove(pos)
    }

    /// The most recently published item.
    pub fn last(&self) -> Option<&PublishedItem> {
        self.items.back()
    }

    /// The `max` most recent items (all when `None`), oldest first.
    pub fn recent(&self, max: Option<usize>) -> Vec<PublishedItem> {
        let skip = match max {
            Some(max) => self.items.len().saturating_sub(max),
            None => 0,
        };
        self.items.iter().skip(skip).cloned().collect()
    }

    /// Remove every item. Returns the removed items, oldest first.
    pub fn clear(&mut self) -> Vec<PublishedItem> {
        self.items.drain(..).collect()
    }

    fn position(&self, item_id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.item_id() == item_id)
    }
}
