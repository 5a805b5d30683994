//! Roster lookups consumed by the presence and roster access models.

use async_trait::async_trait;
use jid::BareJid;

/// Read access to node owners' rosters.
///
/// The engine does not maintain rosters; the host provides them.
#[async_trait]
pub trait RosterLookup: Send + Sync + 'static {
    /// Whether `contact` is subscribed to `owner`'s presence
    /// (roster subscription `from` or `both` on the owner's side).
    async fn is_subscribed(&self, owner: &BareJid, contact: &BareJid) -> bool;

    /// Roster groups `contact` belongs to in `owner`'s roster.
    async fn groups(&self, owner: &BareJid, contact: &BareJid) -> Vec<String>;
}

/// Lookup for deployments without rosters. Nobody is in any roster.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRoster;

#[async_trait]
impl RosterLookup for NoRoster {
    async fn is_subscribed(&self, _owner: &BareJid, _contact: &BareJid) -> bool {
        false
    }

    async fn groups(&self, _owner: &BareJid, _contact: &BareJid) -> Vec<String> {
        Vec::new()
    }
}
