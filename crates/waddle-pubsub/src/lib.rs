//! # waddle-pubsub
//!
//! XEP-0060 publish-subscribe engine for Waddle Social.
//!
//! The engine keeps every node of a service in memory and treats that
//! state as authoritative. Storage writes go through an asynchronous
//! write-behind queue, so a mutating call returns once memory is updated.
//!
//! ## Architecture
//!
//! - **ServiceRegistry**: the domain-level service plus one PEP service per user
//! - **PubSubService**: a node hierarchy with per-node `RwLock`s
//! - **Node**: a collection (children) or a leaf (item history)
//! - **ListenerRegistry**: in-process `items_published` / `items_deleted` callbacks
//! - **PersistenceQueue**: ordered, coalescing writer over a [`PubSubStorage`]
//!
//! ## XEP Support
//!
//! - XEP-0060 (Publish-Subscribe), including collection nodes (XEP-0248)
//! - XEP-0163 (Personal Eventing Protocol)

pub mod access;
pub mod affiliation;
pub mod config;
pub mod dispatch;
pub mod id;
pub mod item;
pub mod metrics;
pub mod node;
pub mod pep;
pub mod presence;
pub mod registry;
pub mod roster;
pub mod sender;
pub mod service;
pub mod stanzas;
pub mod storage;
pub mod subscription;

mod error;

pub use affiliation::{Affiliation, NodeAffiliate};
pub use config::{DeletePolicy, PubSubConfig};
pub use dispatch::{ListenerId, ListenerRegistry, PubSubListener};
pub use error::{
    BadRequestReason, ConflictReason, ForbiddenReason, PubSubError, StanzaErrorCondition,
    StanzaErrorType,
};
pub use id::{ItemId, NodeId, ServiceId};
pub use item::PublishedItem;
pub use node::{AccessModel, Node, NodeConfig, NodeType, PublishModel, SendLastPublishedItem};
pub use presence::Show;
pub use registry::ServiceRegistry;
pub use roster::{NoRoster, RosterLookup};
pub use sender::{ChannelSender, NullSender, StanzaSender};
pub use service::{CreateNode, PubSubService, PublishItem, PublishOutcome, ServiceKind};
pub use storage::{InMemoryPubSubStorage, PubSubStorage, StorageError};
pub use subscription::{NodeSubscription, SubscriptionOptions, SubscriptionState, SubscriptionType};
