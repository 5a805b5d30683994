//! Access model evaluation.
//!
//! Decides whether an entity may subscribe to, retrieve from or publish to
//! a node, given its affiliation, the node's access and publish models and
//! the owners' rosters.

use jid::{BareJid, Jid};

use crate::affiliation::Affiliation;
use crate::error::{ForbiddenReason, PubSubError};
use crate::node::{AccessModel, Node, PublishModel};
use crate::roster::RosterLookup;
use crate::subscription::SubscriptionState;

/// Outcome of a successful subscribe access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// The subscription may become active.
    Granted,
    /// An owner must approve the subscription first.
    AuthorizationRequired,
}

/// Check whether `subscriber` may subscribe to the node.
pub async fn check_subscribe(
    node: &Node,
    subscriber: &Jid,
    roster: &dyn RosterLookup,
) -> Result<AccessDecision, PubSubError> {
    match node.affiliation_of(subscriber) {
        Affiliation::Outcast => return Err(PubSubError::Forbidden(ForbiddenReason::Outcast)),
        Affiliation::PublishOnly => return Err(PubSubError::forbidden()),
        Affiliation::Owner | Affiliation::Publisher | Affiliation::Member => {
            return Ok(AccessDecision::Granted)
        }
        Affiliation::None => {}
    }

    match node.config.access_model {
        AccessModel::Open => Ok(AccessDecision::Granted),
        AccessModel::Authorize => Ok(AccessDecision::AuthorizationRequired),
        AccessModel::Whitelist => Err(PubSubError::Forbidden(ForbiddenReason::ClosedNode)),
        AccessModel::Presence | AccessModel::Roster => {
            check_roster_models(node, &subscriber.to_bare(), roster).await?;
            Ok(AccessDecision::Granted)
        }
    }
}

/// Check whether `requester` may retrieve the node's items.
///
/// `is_admin` covers owners and service sysadmins, who always pass.
pub async fn check_retrieve(
    node: &Node,
    requester: &Jid,
    is_admin: bool,
    roster: &dyn RosterLookup,
) -> Result<(), PubSubError> {
    if is_admin {
        return Ok(());
    }

    let affiliation = node.affiliation_of(requester);
    if affiliation == Affiliation::Outcast {
        return Err(PubSubError::Forbidden(ForbiddenReason::Outcast));
    }
    if !affiliation.can_retrieve() {
        return Err(PubSubError::forbidden());
    }
    if affiliation.bypasses_access_model() {
        return Ok(());
    }

    match node.config.access_model {
        AccessModel::Open => Ok(()),
        AccessModel::Whitelist => Err(PubSubError::Forbidden(ForbiddenReason::ClosedNode)),
        AccessModel::Authorize => {
            let bare = requester.to_bare();
            let approved = node
                .subscriptions_of(&bare)
                .iter()
                .any(|s| s.state == SubscriptionState::Subscribed);
            if approved {
                Ok(())
            } else {
                Err(PubSubError::Forbidden(ForbiddenReason::NotSubscribed))
            }
        }
        AccessModel::Presence | AccessModel::Roster => {
            check_roster_models(node, &requester.to_bare(), roster).await
        }
    }
}

/// Whether `publisher` may publish to the node.
pub fn can_publish(node: &Node, publisher: &Jid) -> bool {
    let affiliation = node.affiliation_of(publisher);
    if affiliation == Affiliation::Outcast {
        return false;
    }
    if affiliation.can_publish() {
        return true;
    }

    match node.config.publish_model {
        PublishModel::Open => true,
        PublishModel::Subscribers => node
            .subscriptions_of(&publisher.to_bare())
            .iter()
            .any(|s| s.state == SubscriptionState::Subscribed),
        PublishModel::Publishers => false,
    }
}

async fn check_roster_models(
    node: &Node,
    contact: &BareJid,
    roster: &dyn RosterLookup,
) -> Result<(), PubSubError> {
    let owners: Vec<BareJid> = node.owners().iter().map(|o| o.to_bare()).collect();

    match node.config.access_model {
        AccessModel::Presence => {
            for owner in &owners {
                if owner == contact || roster.is_subscribed(owner, contact).await {
                    return Ok(());
                }
            }
            Err(PubSubError::Forbidden(
                ForbiddenReason::PresenceSubscriptionRequired,
            ))
        }
        AccessModel::Roster => {
            let allowed = &node.config.roster_groups_allowed;
            for owner in &owners {
                if owner == contact {
                    return Ok(());
                }
                let groups = roster.groups(owner, contact).await;
                if groups.iter().any(|g| allowed.contains(g)) {
                    return Ok(());
                }
            }
            Err(PubSubError::Forbidden(ForbiddenReason::NotInRosterGroup))
        }
        _ => Ok(()),
    }
}
