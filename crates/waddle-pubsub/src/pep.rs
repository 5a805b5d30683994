//! XEP-0163: Personal Eventing Protocol (PEP) node defaults.
//!
//! PEP is a simplified profile of PubSub that uses the bare JID as the
//! service address. Nodes are created on first publish by the owner.

use crate::node::{AccessModel, NodeConfig};

const BOOKMARKS: &str = "urn:xmpp:bookmarks:1";
const MICROBLOG: &str = "urn:xmpp:microblog:0";
const OMEMO_PREFIX: &str = "eu.siacs.conversations.axolotl";

/// Nodes with an agreed meaning across clients.
const WELL_KNOWN_NODES: &[&str] = &[
    BOOKMARKS,
    "urn:xmpp:avatar:data",
    "urn:xmpp:avatar:metadata",
    "http://jabber.org/protocol/nick",
    "http://jabber.org/protocol/mood",
    "http://jabber.org/protocol/activity",
    "http://jabber.org/protocol/tune",
    "http://jabber.org/protocol/geoloc",
    MICROBLOG,
];

/// Whether clients agree on the meaning of a PEP node. OMEMO nodes carry
/// a device id suffix and match by prefix.
pub fn is_well_known_node(node: &str) -> bool {
    WELL_KNOWN_NODES.contains(&node) || node.starts_with(OMEMO_PREFIX)
}

/// Default access model for an auto-created PEP node.
pub fn default_access_model_for_node(node: &str) -> AccessModel {
    // Bookmarks are private to the owner
    if node == BOOKMARKS {
        return AccessModel::Whitelist;
    }

    // OMEMO device lists and bundles must be fetchable by anyone
    if node.starts_with(OMEMO_PREFIX) {
        return AccessModel::Open;
    }

    AccessModel::Presence
}

/// Configuration for an auto-created PEP node.
pub fn pep_node_config(node: &str) -> NodeConfig {
    let mut config = NodeConfig::pep_default();
    config.access_model = default_access_model_for_node(node);

    // Microblogs keep a history; other well-known nodes keep the latest item.
    if node == MICROBLOG {
        config.max_items = 0;
    }
    config
}
