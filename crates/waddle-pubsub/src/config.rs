//! Pub/sub service configuration.
//!
//! # Environment Variables
//!
//! - `WADDLE_PUBSUB_DOMAIN`: Address of the domain-level service. Default: `pubsub.localhost`
//! - `WADDLE_PUBSUB_SYSADMINS`: Comma-separated bare JIDs with full control over every node
//! - `WADDLE_PUBSUB_CREATORS`: Comma-separated bare JIDs allowed to create nodes
//! - `WADDLE_PUBSUB_RESTRICT_CREATION`: Only creators and sysadmins may create nodes. Default: `false`
//! - `WADDLE_PUBSUB_COLLECTIONS`: Enable the collection node hierarchy. Default: `true`
//! - `WADDLE_PUBSUB_MULTIPLE_SUBSCRIPTIONS`: Allow several subscriptions per JID. Default: `true`
//! - `WADDLE_PUBSUB_DELETE_POLICY`: `reject` or `purge` for non-empty collections. Default: `reject`
//! - `WADDLE_PUBSUB_PERSIST_BATCH`: Maximum storage operations per writer batch. Default: `100`

use std::fmt;

use jid::BareJid;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What deleting a collection whose descendants still hold items does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// Fail with a node-not-empty conflict.
    #[default]
    Reject,
    /// Purge and delete the descendants depth-first.
    Purge,
}

impl DeletePolicy {
    /// Parse a delete policy. Unknown values fall back to [`DeletePolicy::Reject`].
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "purge" | "cascade" => DeletePolicy::Purge,
            _ => DeletePolicy::Reject,
        }
    }
}

impl fmt::Display for DeletePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletePolicy::Reject => write!(f, "reject"),
            DeletePolicy::Purge => write!(f, "purge"),
        }
    }
}

/// Configuration shared by all pub/sub services of a server.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Address of the domain-level service (e.g. `pubsub.waddle.social`).
    pub domain: String,
    /// Service administrators.
    pub sysadmins: Vec<BareJid>,
    /// Entities allowed to create nodes when creation is restricted.
    pub allowed_creators: Vec<BareJid>,
    /// Whether node creation is limited to allowed creators and sysadmins.
    pub restrict_creation: bool,
    /// Whether the domain service keeps a collection hierarchy.
    pub collections_enabled: bool,
    /// Whether nodes may allow several subscriptions per JID.
    pub multiple_subscriptions: bool,
    /// Policy for deleting non-empty collections.
    pub delete_policy: DeletePolicy,
    /// Maximum storage operations the writer applies per batch.
    pub persist_batch_size: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            domain: "pubsub.localhost".to_string(),
            sysadmins: Vec::new(),
            allowed_creators: Vec::new(),
            restrict_creation: false,
            collections_enabled: true,
            multiple_subscriptions: true,
            delete_policy: DeletePolicy::default(),
            persist_batch_size: 100,
        }
    }
}

impl PubSubConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let domain = lookup("WADDLE_PUBSUB_DOMAIN").unwrap_or(defaults.domain);
        let sysadmins = lookup("WADDLE_PUBSUB_SYSADMINS")
            .map(|v| parse_jid_list("WADDLE_PUBSUB_SYSADMINS", &v))
            .unwrap_or_default();
        let allowed_creators = lookup("WADDLE_PUBSUB_CREATORS")
            .map(|v| parse_jid_list("WADDLE_PUBSUB_CREATORS", &v))
            .unwrap_or_default();
        let restrict_creation = lookup("WADDLE_PUBSUB_RESTRICT_CREATION")
            .map(|v| parse_bool(&v))
            .unwrap_or(defaults.restrict_creation);
        let collections_enabled = lookup("WADDLE_PUBSUB_COLLECTIONS")
            .map(|v| parse_bool(&v))
            .unwrap_or(defaults.collections_enabled);
        let multiple_subscriptions = lookup("WADDLE_PUBSUB_MULTIPLE_SUBSCRIPTIONS")
            .map(|v| parse_bool(&v))
            .unwrap_or(defaults.multiple_subscriptions);
        let delete_policy = lookup("WADDLE_PUBSUB_DELETE_POLICY")
            .map(|v| DeletePolicy::from_str(&v))
            .unwrap_or(defaults.delete_policy);
        let persist_batch_size = lookup("WADDLE_PUBSUB_PERSIST_BATCH")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.persist_batch_size);

        Self {
            domain,
            sysadmins,
            allowed_creators,
            restrict_creation,
            collections_enabled,
            multiple_subscriptions,
            delete_policy,
            persist_batch_size,
        }
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!("PubSub service: {}", self.domain);
        info!("PubSub sysadmins: {}", self.sysadmins.len());
        if self.restrict_creation {
            info!(
                "PubSub node creation: restricted ({} allowed creators)",
                self.allowed_creators.len()
            );
        } else {
            info!("PubSub node creation: open");
        }
        info!(
            "PubSub collections: {}",
            if self.collections_enabled { "enabled" } else { "disabled" }
        );
        info!(
            "PubSub multiple subscriptions: {}",
            if self.multiple_subscriptions { "enabled" } else { "disabled" }
        );
        info!("PubSub delete policy: {}", self.delete_policy);
        info!("PubSub persistence batch size: {}", self.persist_batch_size);
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_jid_list(var: &str, value: &str) -> Vec<BareJid> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<BareJid>() {
            Ok(jid) => Some(jid),
            Err(e) => {
                warn!(var, value = s, error = %e, "Ignoring invalid JID");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PubSubConfig::from_lookup(lookup(&[]));
        assert_eq!(config.domain, "pubsub.localhost");
        assert!(!config.restrict_creation);
        assert!(config.collections_enabled);
        assert_eq!(config.delete_policy, DeletePolicy::Reject);
        assert_eq!(config.persist_batch_size, 100);
    }

    #[test]
    fn test_from_lookup() {
        let config = PubSubConfig::from_lookup(lookup(&[
            ("WADDLE_PUBSUB_DOMAIN", "pubsub.waddle.social"),
            ("WADDLE_PUBSUB_SYSADMINS", "admin@waddle.social, @waddle.social, ops@waddle.social"),
            ("WADDLE_PUBSUB_RESTRICT_CREATION", "true"),
            ("WADDLE_PUBSUB_COLLECTIONS", "0"),
            ("WADDLE_PUBSUB_DELETE_POLICY", "PURGE"),
            ("WADDLE_PUBSUB_PERSIST_BATCH", "0"),
        ]));

        assert_eq!(config.domain, "pubsub.waddle.social");
        assert_eq!(config.sysadmins.len(), 2);
        assert!(config.restrict_creation);
        assert!(!config.collections_enabled);
        assert_eq!(config.delete_policy, DeletePolicy::Purge);
        assert_eq!(config.persist_batch_size, 100);
    }

    #[test]
    fn test_delete_policy_parse() {
        assert_eq!(DeletePolicy::from_str("purge"), DeletePolicy::Purge);
        assert_eq!(DeletePolicy::from_str("reject"), DeletePolicy::Reject);
        assert_eq!(DeletePolicy::from_str("whatever"), DeletePolicy::Reject);
    }
}
