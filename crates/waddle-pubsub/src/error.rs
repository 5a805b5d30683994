//! Error types for the pub/sub engine.
//!
//! Every public engine operation returns [`PubSubError`] for expected
//! conditions (authorization, not-found, validation). Each variant maps onto
//! an RFC 6120 stanza error and, where XEP-0060 defines one, an application
//! specific condition in the `pubsub#errors` namespace.

use std::fmt;

use minidom::Element;
use thiserror::Error;

use crate::stanzas::{NS_CLIENT, NS_PUBSUB_ERRORS, NS_STANZAS};
use crate::storage::StorageError;

/// Pub/sub engine errors.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The node does not exist.
    #[error("Node '{0}' does not exist")]
    NodeNotFound(String),

    /// The item does not exist.
    #[error("Item '{0}' does not exist")]
    ItemNotFound(String),

    /// The subscription does not exist.
    #[error("Subscription does not exist")]
    SubscriptionNotFound,

    /// The requester lacks the required affiliation or role.
    #[error("Forbidden: {0}")]
    Forbidden(ForbiddenReason),

    /// The request is malformed or misses a required value.
    #[error("Bad request: {0}")]
    BadRequest(BadRequestReason),

    /// The request collides with existing state.
    #[error("Conflict: {0}")]
    Conflict(ConflictReason),

    /// The node or service does not support the operation.
    #[error("Feature not implemented: {0}")]
    FeatureNotImplemented(&'static str),

    /// The operation is not allowed in the node's current state.
    #[error("Not allowed: {0}")]
    NotAllowed(String),

    /// The service no longer accepts mutations.
    #[error("Service is shutting down")]
    ShuttingDown,

    /// Loading state from storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The service could not be set up from its configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Why an authorization check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForbiddenReason {
    /// Affiliation does not grant the operation.
    InsufficientPrivileges,
    /// The requester is an outcast of the node.
    Outcast,
    /// Whitelist node and the requester is not on the whitelist.
    ClosedNode,
    /// Roster access model and the requester is in none of the allowed groups.
    NotInRosterGroup,
    /// Presence access model and the requester is not subscribed to an owner.
    PresenceSubscriptionRequired,
    /// Authorize access model and the requester has no approved subscription.
    NotSubscribed,
    /// A subscription request is already waiting for approval.
    PendingSubscription,
    /// The requester acts on behalf of another bare JID.
    JidMismatch,
    /// Only the publisher or a node admin may retract the item.
    NotItemPublisher,
    /// Node creation is restricted on this service.
    CreationRestricted,
}

impl fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InsufficientPrivileges => "insufficient privileges",
            Self::Outcast => "requester is an outcast",
            Self::ClosedNode => "node is closed",
            Self::NotInRosterGroup => "requester is not in an allowed roster group",
            Self::PresenceSubscriptionRequired => "presence subscription required",
            Self::NotSubscribed => "requester is not subscribed",
            Self::PendingSubscription => "subscription is pending",
            Self::JidMismatch => "JID does not match requester",
            Self::NotItemPublisher => "requester did not publish the item",
            Self::CreationRestricted => "node creation is restricted",
        };
        f.write_str(s)
    }
}

/// Why a request failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BadRequestReason {
    /// Exactly one node id is required.
    NodeIdRequired,
    /// The JID is malformed or not acceptable here.
    InvalidJid,
    /// The node requires an item element.
    ItemRequired,
    /// The node does not accept an item element.
    ItemForbidden,
    /// The node delivers payloads and the item has none.
    PayloadRequired,
    /// The payload exceeds the node's maximum payload size.
    PayloadTooBig,
    /// The requester has several subscriptions and must pick one.
    SubIdRequired,
    /// The subscription id does not match the subscriber.
    InvalidSubId,
    /// The parent node cannot contain children.
    InvalidParent,
    /// A configuration or option value is invalid.
    InvalidOptions(String),
}

impl fmt::Display for BadRequestReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeIdRequired => f.write_str("node id required"),
            Self::InvalidJid => f.write_str("invalid JID"),
            Self::ItemRequired => f.write_str("item required"),
            Self::ItemForbidden => f.write_str("item forbidden"),
            Self::PayloadRequired => f.write_str("payload required"),
            Self::PayloadTooBig => f.write_str("payload too big"),
            Self::SubIdRequired => f.write_str("subscription id required"),
            Self::InvalidSubId => f.write_str("invalid subscription id"),
            Self::InvalidParent => f.write_str("parent is not a collection node"),
            Self::InvalidOptions(msg) => write!(f, "invalid options: {}", msg),
        }
    }
}

/// What the request collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// A node with the requested id already exists.
    NodeExists,
    /// An item with the requested id already exists and overwrite is disabled.
    ItemExists,
    /// A descendant leaf still holds items.
    NodeNotEmpty,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NodeExists => "node already exists",
            Self::ItemExists => "item already exists",
            Self::NodeNotEmpty => "node is not empty",
        };
        f.write_str(s)
    }
}

impl PubSubError {
    /// Shorthand for an insufficient-privileges rejection.
    pub fn forbidden() -> Self {
        Self::Forbidden(ForbiddenReason::InsufficientPrivileges)
    }

    /// The RFC 6120 condition for this error.
    pub fn condition(&self) -> StanzaErrorCondition {
        match self {
            Self::NodeNotFound(_) | Self::ItemNotFound(_) => StanzaErrorCondition::ItemNotFound,
            Self::SubscriptionNotFound => StanzaErrorCondition::UnexpectedRequest,
            Self::Forbidden(reason) => match reason {
                ForbiddenReason::ClosedNode => StanzaErrorCondition::NotAllowed,
                ForbiddenReason::NotInRosterGroup
                | ForbiddenReason::PresenceSubscriptionRequired
                | ForbiddenReason::NotSubscribed
                | ForbiddenReason::PendingSubscription => StanzaErrorCondition::NotAuthorized,
                _ => StanzaErrorCondition::Forbidden,
            },
            Self::BadRequest(reason) => match reason {
                BadRequestReason::PayloadTooBig | BadRequestReason::InvalidSubId => {
                    StanzaErrorCondition::NotAcceptable
                }
                _ => StanzaErrorCondition::BadRequest,
            },
            Self::Conflict(_) => StanzaErrorCondition::Conflict,
            Self::FeatureNotImplemented(_) => StanzaErrorCondition::FeatureNotImplemented,
            Self::NotAllowed(_) => StanzaErrorCondition::NotAllowed,
            Self::ShuttingDown => StanzaErrorCondition::ServiceUnavailable,
            Self::Storage(_) | Self::Config(_) => StanzaErrorCondition::InternalServerError,
        }
    }

    /// The RFC 6120 error type for this error.
    pub fn error_type(&self) -> StanzaErrorType {
        match self.condition() {
            StanzaErrorCondition::Forbidden | StanzaErrorCondition::NotAuthorized => {
                StanzaErrorType::Auth
            }
            StanzaErrorCondition::BadRequest | StanzaErrorCondition::NotAcceptable => {
                StanzaErrorType::Modify
            }
            StanzaErrorCondition::InternalServerError => StanzaErrorType::Wait,
            _ => StanzaErrorType::Cancel,
        }
    }

    /// The XEP-0060 application condition, if one applies.
    pub fn pubsub_condition(&self) -> Option<&'static str> {
        match self {
            Self::SubscriptionNotFound => Some("not-subscribed"),
            Self::Forbidden(reason) => match reason {
                ForbiddenReason::ClosedNode => Some("closed-node"),
                ForbiddenReason::NotInRosterGroup => Some("not-in-roster-group"),
                ForbiddenReason::PresenceSubscriptionRequired => {
                    Some("presence-subscription-required")
                }
                ForbiddenReason::NotSubscribed => Some("not-subscribed"),
                ForbiddenReason::PendingSubscription => Some("pending-subscription"),
                _ => None,
            },
            Self::BadRequest(reason) => match reason {
                BadRequestReason::NodeIdRequired => Some("nodeid-required"),
                BadRequestReason::InvalidJid => Some("invalid-jid"),
                BadRequestReason::ItemRequired => Some("item-required"),
                BadRequestReason::ItemForbidden => Some("item-forbidden"),
                BadRequestReason::PayloadRequired => Some("payload-required"),
                BadRequestReason::PayloadTooBig => Some("payload-too-big"),
                BadRequestReason::SubIdRequired => Some("subid-required"),
                BadRequestReason::InvalidSubId => Some("invalid-subid"),
                _ => None,
            },
            Self::FeatureNotImplemented(_) => Some("unsupported"),
            _ => None,
        }
    }

    /// Whether the error reports a missing node, item or subscription.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NodeNotFound(_) | Self::ItemNotFound(_) | Self::SubscriptionNotFound
        )
    }

    /// Render the `<error/>` child of an IQ error response.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("error", NS_CLIENT)
            .attr("type", self.error_type().as_str())
            .append(Element::builder(self.condition().as_str(), NS_STANZAS).build());

        if let Some(app) = self.pubsub_condition() {
            let mut app_builder = Element::builder(app, NS_PUBSUB_ERRORS);
            if let Self::FeatureNotImplemented(feature) = self {
                app_builder = app_builder.attr("feature", *feature);
            }
            builder = builder.append(app_builder.build());
        }

        builder.build()
    }
}

/// The defined conditions [`PubSubError::condition`] can yield. Element
/// names follow RFC 6120.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorCondition {
    /// Validation failures.
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    /// Affiliation checks.
    Forbidden,
    /// Storage and configuration failures.
    InternalServerError,
    /// Missing nodes and items.
    ItemNotFound,
    /// Oversized payloads and foreign subscription ids.
    NotAcceptable,
    /// Closed nodes and state violations.
    NotAllowed,
    /// Access models that depend on the roster or an approval.
    NotAuthorized,
    /// The service is shutting down.
    ServiceUnavailable,
    /// Acting on a subscription that does not exist.
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::ServiceUnavailable => "service-unavailable",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }
}

impl fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `type` attribute of an error response: whether and how the
/// requester may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// After gaining an affiliation or roster entry.
    Auth,
    Cancel,
    /// After fixing the request.
    Modify,
    /// Later, once storage recovers.
    Wait,
}

impl StanzaErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
