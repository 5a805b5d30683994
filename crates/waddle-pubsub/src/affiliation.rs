//! Node affiliations (XEP-0060 Section 4.1).

use std::fmt;

use jid::Jid;
use serde::{Deserialize, Serialize};

/// A JID's administrative role on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Affiliation {
    /// Full control over the node.
    Owner,
    /// May publish and retract any item.
    Publisher,
    /// May publish but not subscribe or retrieve.
    PublishOnly,
    /// May subscribe and retrieve items.
    Member,
    /// No affiliation
    #[default]
    None,
    /// Banned from the node
    Outcast,
}

impl Affiliation {
    /// The XEP-0060 attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Affiliation::Owner => "owner",
            Affiliation::Publisher => "publisher",
            Affiliation::PublishOnly => "publish-only",
            Affiliation::Member => "member",
            Affiliation::None => "none",
            Affiliation::Outcast => "outcast",
        }
    }

    /// Parse an affiliation from its attribute value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Affiliation::Owner),
            "publisher" => Some(Affiliation::Publisher),
            "publish-only" => Some(Affiliation::PublishOnly),
            "member" => Some(Affiliation::Member),
            "none" => Some(Affiliation::None),
            "outcast" => Some(Affiliation::Outcast),
            _ => None,
        }
    }

    /// Whether the affiliation grants publishing regardless of publish model.
    pub fn can_publish(&self) -> bool {
        matches!(
            self,
            Affiliation::Owner | Affiliation::Publisher | Affiliation::PublishOnly
        )
    }

    /// Whether the affiliation bypasses the node's access model.
    pub fn bypasses_access_model(&self) -> bool {
        matches!(
            self,
            Affiliation::Owner
                | Affiliation::Publisher
                | Affiliation::PublishOnly
                | Affiliation::Member
        )
    }

    /// Whether the affiliation may retrieve items.
    pub fn can_retrieve(&self) -> bool {
        !matches!(self, Affiliation::PublishOnly | Affiliation::Outcast)
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binds a JID (bare or full) to an affiliation on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAffiliate {
    pub jid: Jid,
    pub affiliation: Affiliation,
}

impl NodeAffiliate {
    pub fn new(jid: Jid, affiliation: Affiliation) -> Self {
        Self { jid, affiliation }
    }
}
