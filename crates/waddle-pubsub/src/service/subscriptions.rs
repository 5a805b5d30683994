//! Subscription and affiliation lifecycles.
//!
//! A subscription moves `none -> pending -> subscribed`, with `unconfigured`
//! as a side branch while the subscriber still has to submit options. A
//! removed subscription is dropped outright; there are no tombstones.

use std::slice;

use chrono::Utc;
use jid::{BareJid, Jid};
use tracing::{debug, info, instrument, warn};

use super::PubSubService;
use crate::access::{self, AccessDecision};
use crate::affiliation::{Affiliation, NodeAffiliate};
use crate::dispatch::can_send_events;
use crate::error::{BadRequestReason, ForbiddenReason, PubSubError};
use crate::id::NodeId;
use crate::metrics;
use crate::node::{AccessModel, Node, NodeHandle};
use crate::stanzas;
use crate::storage::StorageOp;
use crate::subscription::{NodeSubscription, SubscriptionOptions, SubscriptionState};

impl PubSubService {
    /// Subscribe `subscriber` to a node on behalf of `requester`.
    ///
    /// Only the subscriber itself (bare-compared) or a node admin may
    /// request a subscription. Passing `options` completes configuration
    /// up front on nodes that require it.
    #[instrument(skip(self, options), fields(service = %self.id, node = %node_id, subscriber = %subscriber))]
    pub async fn subscribe(
        &self,
        requester: &Jid,
        node_id: &NodeId,
        subscriber: &Jid,
        options: Option<SubscriptionOptions>,
    ) -> Result<NodeSubscription, PubSubError> {
        let _running = self.enter().await?;
        let handle = self.handle(node_id)?;
        let mut node = handle.write().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }

        let is_admin = self.node_admin(&node, requester);
        if requester.to_bare() != subscriber.to_bare() && !is_admin {
            return Err(PubSubError::BadRequest(BadRequestReason::InvalidJid));
        }
        if !node.config.subscription_enabled {
            return Err(PubSubError::FeatureNotImplemented("subscribe"));
        }

        let owner = subscriber.to_bare();
        let existing = node.subscriptions_of(&owner);
        if existing.iter().any(|s| s.is_authorization_pending()) {
            return Err(PubSubError::Forbidden(ForbiddenReason::PendingSubscription));
        }
        if !node.config.multiple_subscriptions {
            if let Some(current) = existing.iter().find(|s| s.jid == *subscriber) {
                debug!(subid = %current.id, "Returning existing subscription");
                return Ok((*current).clone());
            }
        }

        let decision = access::check_subscribe(&node, subscriber, self.ctx.roster.as_ref()).await?;
        let state = if node.config.subscription_config_required && options.is_none() {
            SubscriptionState::Unconfigured
        } else if decision == AccessDecision::AuthorizationRequired && !is_admin {
            SubscriptionState::Pending
        } else {
            SubscriptionState::Subscribed
        };

        let before = node.presence_interest();
        let mut subscription =
            NodeSubscription::new(node_id.clone(), owner.clone(), subscriber.clone(), state);
        subscription.options = options.unwrap_or_default();

        let owner_jid: Jid = owner.into();
        if node.affiliate(subscriber).is_none() && node.affiliate(&owner_jid).is_none() {
            node.set_affiliation(owner_jid.clone(), Affiliation::None);
            self.persist(StorageOp::CreateAffiliation(
                node_id.clone(),
                NodeAffiliate::new(owner_jid, Affiliation::None),
            ));
        }

        node.insert_subscription(subscription.clone());
        self.persist(StorageOp::CreateSubscription(subscription.clone()));
        self.sync_presence_interest(node_id, &before, &node.presence_interest());

        match state {
            SubscriptionState::Pending => self.request_authorization(&node, &subscription),
            SubscriptionState::Subscribed => self.send_last_item(&node, &subscription),
            _ => {}
        }

        info!(subid = %subscription.id, state = %subscription.state, "Subscription created");
        Ok(subscription)
    }

    /// Approve or deny a pending subscription. Node admins only.
    ///
    /// Returns the subscription on approval and `None` on denial, in which
    /// case the record is removed.
    #[instrument(skip(self), fields(service = %self.id, node = %node_id, approver = %approver))]
    pub async fn approve_subscription(
        &self,
        approver: &Jid,
        node_id: &NodeId,
        subid: &str,
        approved: bool,
    ) -> Result<Option<NodeSubscription>, PubSubError> {
        let _running = self.enter().await?;
        let handle = self.handle(node_id)?;
        let mut node = handle.write().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }
        if !self.node_admin(&node, approver) {
            return Err(PubSubError::forbidden());
        }

        let pending = node
            .subscription(subid)
            .map(|s| s.is_authorization_pending())
            .ok_or(PubSubError::SubscriptionNotFound)?;
        if !pending {
            return Err(PubSubError::NotAllowed(
                "subscription is not pending".to_string(),
            ));
        }

        if approved {
            let subscription = self.activate(&mut node, subid);
            info!(subid, "Subscription approved");
            Ok(subscription)
        } else {
            let before = node.presence_interest();
            self.cancel_subscription(&mut node, subid, true);
            self.sync_presence_interest(node_id, &before, &node.presence_interest());
            info!(subid, "Subscription denied");
            Ok(None)
        }
    }

    /// Remove a subscription.
    ///
    /// Without a `subid` the subscriber must hold exactly one subscription
    /// on the node.
    #[instrument(skip(self), fields(service = %self.id, node = %node_id, subscriber = %subscriber))]
    pub async fn unsubscribe(
        &self,
        requester: &Jid,
        node_id: &NodeId,
        subscriber: &Jid,
        subid: Option<&str>,
    ) -> Result<(), PubSubError> {
        let _running = self.enter().await?;
        let handle = self.handle(node_id)?;
        let mut node = handle.write().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }
        if requester.to_bare() != subscriber.to_bare() && !self.node_admin(&node, requester) {
            return Err(PubSubError::Forbidden(ForbiddenReason::JidMismatch));
        }

        let subid = find_subscription(&node, subscriber, subid)?;
        let before = node.presence_interest();
        self.cancel_subscription(&mut node, &subid, false);
        self.sync_presence_interest(node_id, &before, &node.presence_interest());

        info!(subid = %subid, "Unsubscribed");
        Ok(())
    }

    /// Replace a subscription's options.
    ///
    /// Completes configuration of an unconfigured subscription, which then
    /// needs owner approval on `authorize` nodes or becomes active.
    #[instrument(skip(self, options), fields(service = %self.id, node = %node_id, subscriber = %subscriber))]
    pub async fn configure_subscription(
        &self,
        requester: &Jid,
        node_id: &NodeId,
        subscriber: &Jid,
        subid: Option<&str>,
        options: SubscriptionOptions,
    ) -> Result<NodeSubscription, PubSubError> {
        let _running = self.enter().await?;
        let handle = self.handle(node_id)?;
        let mut node = handle.write().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }
        let is_admin = self.node_admin(&node, requester);
        if requester.to_bare() != subscriber.to_bare() && !is_admin {
            return Err(PubSubError::Forbidden(ForbiddenReason::JidMismatch));
        }

        let subid = find_subscription(&node, subscriber, subid)?;
        let before = node.presence_interest();
        let authorize = node.config.access_model == AccessModel::Authorize && !is_admin;

        let Some(subscription) = node.subscription_mut(&subid) else {
            return Err(PubSubError::SubscriptionNotFound);
        };
        subscription.options = options;
        let was_unconfigured = subscription.is_configuration_pending();
        if was_unconfigured {
            subscription.state = if authorize {
                SubscriptionState::Pending
            } else {
                SubscriptionState::Subscribed
            };
        }
        let subscription = subscription.clone();

        self.persist(StorageOp::UpdateSubscription(subscription.clone()));
        self.sync_presence_interest(node_id, &before, &node.presence_interest());

        if was_unconfigured {
            match subscription.state {
                SubscriptionState::Pending => self.request_authorization(&node, &subscription),
                SubscriptionState::Subscribed => self.send_last_item(&node, &subscription),
                _ => {}
            }
        }

        debug!(subid = %subid, state = %subscription.state, "Subscription configured");
        Ok(subscription)
    }

    /// All subscriptions of a node. Node admins only.
    pub async fn subscriptions(
        &self,
        requester: &Jid,
        node_id: &NodeId,
    ) -> Result<Vec<NodeSubscription>, PubSubError> {
        let handle = self.admin_handle(requester, node_id).await?;
        let node = handle.read().await;
        Ok(node.subscriptions().cloned().collect())
    }

    /// Subscriptions awaiting approval on a node. Node admins only.
    pub async fn pending_subscriptions(
        &self,
        requester: &Jid,
        node_id: &NodeId,
    ) -> Result<Vec<NodeSubscription>, PubSubError> {
        let handle = self.admin_handle(requester, node_id).await?;
        let node = handle.read().await;
        Ok(node.pending_subscriptions().into_iter().cloned().collect())
    }

    /// Every subscription a user holds on this service.
    pub async fn user_subscriptions(&self, user: &BareJid) -> Vec<NodeSubscription> {
        let mut result = Vec::new();
        for handle in self.all_handles() {
            let node = handle.read().await;
            if node.is_deleted() {
                continue;
            }
            result.extend(node.subscriptions_of(user).into_iter().cloned());
        }
        result
    }

    /// Affiliations on a node. Node admins only.
    pub async fn affiliations(
        &self,
        requester: &Jid,
        node_id: &NodeId,
    ) -> Result<Vec<NodeAffiliate>, PubSubError> {
        let handle = self.admin_handle(requester, node_id).await?;
        let node = handle.read().await;
        Ok(node.affiliates().cloned().collect())
    }

    /// Every non-`none` affiliation a user holds on this service.
    pub async fn user_affiliations(&self, user: &BareJid) -> Vec<(NodeId, Affiliation)> {
        let mut result = Vec::new();
        for handle in self.all_handles() {
            let node = handle.read().await;
            if node.is_deleted() {
                continue;
            }
            result.extend(
                node.affiliates()
                    .filter(|a| a.affiliation != Affiliation::None && a.jid.to_bare() == *user)
                    .map(|a| (node.id.clone(), a.affiliation)),
            );
        }
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }

    /// Change a JID's affiliation. Node admins only.
    ///
    /// Promotion to owner approves the JID's pending subscriptions; outcasts
    /// lose their subscriptions. Setting `none` removes the record unless
    /// the JID still holds subscriptions on a non-whitelist node.
    #[instrument(skip(self), fields(service = %self.id, node = %node_id, jid = %jid, affiliation = %affiliation))]
    pub async fn set_affiliation(
        &self,
        requester: &Jid,
        node_id: &NodeId,
        jid: &Jid,
        affiliation: Affiliation,
    ) -> Result<(), PubSubError> {
        let _running = self.enter().await?;
        let handle = self.handle(node_id)?;
        let mut node = handle.write().await;
        if node.is_deleted() {
            return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
        }
        if !self.node_admin(&node, requester) {
            return Err(PubSubError::forbidden());
        }

        let previous = node.affiliate(jid).map(|a| a.affiliation);
        if previous == Some(Affiliation::Owner)
            && affiliation != Affiliation::Owner
            && node.owners().len() == 1
        {
            return Err(PubSubError::NotAllowed(
                "a node must keep at least one owner".to_string(),
            ));
        }

        let before = node.presence_interest();
        let bare = jid.to_bare();
        let held: Vec<String> = node
            .subscriptions_of(&bare)
            .iter()
            .map(|s| s.id.clone())
            .collect();

        match affiliation {
            Affiliation::None => {
                let keep = !held.is_empty() && node.config.access_model != AccessModel::Whitelist;
                if keep {
                    self.store_affiliation(&mut node, jid, affiliation, previous.is_some());
                } else {
                    for subid in &held {
                        self.cancel_subscription(&mut node, subid, true);
                    }
                    if node.remove_affiliation(jid).is_some() {
                        self.persist(StorageOp::RemoveAffiliation(node_id.clone(), jid.clone()));
                    }
                }
            }
            Affiliation::Outcast => {
                self.store_affiliation(&mut node, jid, affiliation, previous.is_some());
                for subid in &held {
                    self.cancel_subscription(&mut node, subid, true);
                }
            }
            Affiliation::Owner => {
                self.store_affiliation(&mut node, jid, affiliation, previous.is_some());
                let pending: Vec<String> = node
                    .subscriptions_of(&bare)
                    .iter()
                    .filter(|s| s.is_authorization_pending())
                    .map(|s| s.id.clone())
                    .collect();
                for subid in &pending {
                    self.activate(&mut node, subid);
                }
            }
            Affiliation::Publisher | Affiliation::PublishOnly | Affiliation::Member => {
                self.store_affiliation(&mut node, jid, affiliation, previous.is_some());
            }
        }

        node.touch();
        self.sync_presence_interest(node_id, &before, &node.presence_interest());
        info!(previous = ?previous, "Affiliation changed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers shared with node configuration
    // ------------------------------------------------------------------

    /// Cancel subscriptions that no longer pass the node's access model.
    /// Returns how many were cancelled.
    pub(crate) async fn revoke_unqualified(&self, node: &mut Node) -> usize {
        let subscriptions: Vec<NodeSubscription> = node.subscriptions().cloned().collect();
        let mut revoked = Vec::new();
        for subscription in &subscriptions {
            if let Err(e) =
                access::check_subscribe(node, &subscription.jid, self.ctx.roster.as_ref()).await
            {
                debug!(subid = %subscription.id, reason = %e, "Subscription no longer qualifies");
                revoked.push(subscription.id.clone());
            }
        }

        for subid in &revoked {
            self.cancel_subscription(node, subid, true);
        }
        revoked.len()
    }

    /// Remove a subscription from the node and storage, dropping the
    /// placeholder `none` affiliation once its owner holds no other
    /// subscription. Presence interest is left to the caller.
    pub(crate) fn cancel_subscription(
        &self,
        node: &mut Node,
        subid: &str,
        notify: bool,
    ) -> Option<NodeSubscription> {
        let mut subscription = node.remove_subscription(subid)?;
        self.persist(StorageOp::RemoveSubscription(subscription.clone()));

        let owner_jid: Jid = subscription.owner.clone().into();
        let placeholder = node
            .affiliate(&owner_jid)
            .map(|a| a.affiliation == Affiliation::None)
            .unwrap_or(false);
        if placeholder && node.subscriptions_of(&subscription.owner).is_empty() {
            node.remove_affiliation(&owner_jid);
            self.persist(StorageOp::RemoveAffiliation(node.id.clone(), owner_jid));
        }

        subscription.state = SubscriptionState::None;
        if notify {
            let message = stanzas::build_subscription_event(&self.address, &subscription);
            self.ctx
                .sender
                .send_notification(&node.id, message, &subscription.jid);
            metrics::record_notifications_sent(1, "subscription");
        }
        Some(subscription)
    }

    fn activate(&self, node: &mut Node, subid: &str) -> Option<NodeSubscription> {
        let subscription = {
            let subscription = node.subscription_mut(subid)?;
            subscription.state = SubscriptionState::Subscribed;
            subscription.clone()
        };
        self.persist(StorageOp::UpdateSubscription(subscription.clone()));

        let message = stanzas::build_subscription_event(&self.address, &subscription);
        self.ctx
            .sender
            .send_notification(&node.id, message, &subscription.jid);
        metrics::record_notifications_sent(1, "subscription");

        self.send_last_item(node, &subscription);
        Some(subscription)
    }

    fn store_affiliation(&self, node: &mut Node, jid: &Jid, affiliation: Affiliation, exists: bool) {
        node.set_affiliation(jid.clone(), affiliation);
        let affiliate = NodeAffiliate::new(jid.clone(), affiliation);
        let op = if exists {
            StorageOp::UpdateAffiliation(node.id.clone(), affiliate)
        } else {
            StorageOp::CreateAffiliation(node.id.clone(), affiliate)
        };
        self.persist(op);
    }

    /// Ask every owner to approve a pending subscription.
    fn request_authorization(&self, node: &Node, subscription: &NodeSubscription) {
        let owners = node.owners();
        if owners.is_empty() {
            warn!(node = %node.id, "Pending subscription on a node without owners");
            return;
        }
        for owner in &owners {
            let form = stanzas::build_authorization_request(&self.address, subscription);
            self.ctx.sender.send_notification(&node.id, form, owner);
        }
        metrics::record_notifications_sent(owners.len(), "authorization");
    }

    /// Send the node's last item to a new active subscription when the
    /// node's policy asks for it.
    fn send_last_item(&self, node: &Node, subscription: &NodeSubscription) {
        if !node.is_leaf() || !node.config.send_last_published_item.on_subscribe() {
            return;
        }
        let Some(last) = node.items().and_then(|items| items.last()) else {
            return;
        };
        if !can_send_events(
            subscription,
            node.config.presence_based_delivery,
            &self.presence,
            Utc::now(),
        ) || !subscription.matches_item(last)
        {
            return;
        }

        let subids = if node.config.multiple_subscriptions {
            vec![subscription.id.clone()]
        } else {
            Vec::new()
        };
        let message = stanzas::build_items_event(
            &self.address,
            &node.id,
            slice::from_ref(last),
            node.config.deliver_payloads,
            &subids,
        );
        self.ctx
            .sender
            .send_notification(&node.id, message, &subscription.jid);
        metrics::record_notifications_sent(1, "last_item");
    }

    async fn admin_handle(
        &self,
        requester: &Jid,
        node_id: &NodeId,
    ) -> Result<NodeHandle, PubSubError> {
        let handle = self.handle(node_id)?;
        {
            let node = handle.read().await;
            if node.is_deleted() {
                return Err(PubSubError::NodeNotFound(node_id.node_id().to_string()));
            }
            if !self.node_admin(&node, requester) {
                return Err(PubSubError::forbidden());
            }
        }
        Ok(handle)
    }

    fn all_handles(&self) -> Vec<NodeHandle> {
        self.nodes.iter().map(|n| n.value().clone()).collect()
    }
}

/// Resolve the subscription an unsubscribe or options request targets.
fn find_subscription(
    node: &Node,
    subscriber: &Jid,
    subid: Option<&str>,
) -> Result<String, PubSubError> {
    match subid {
        Some(subid) => {
            let subscription = node
                .subscription(subid)
                .ok_or(PubSubError::SubscriptionNotFound)?;
            if subscription.jid != *subscriber {
                return Err(PubSubError::BadRequest(BadRequestReason::InvalidSubId));
            }
            Ok(subid.to_string())
        }
        None => {
            let matching: Vec<&NodeSubscription> = node
                .subscriptions()
                .filter(|s| s.jid == *subscriber)
                .collect();
            match matching.as_slice() {
                [] => Err(PubSubError::SubscriptionNotFound),
                [only] => Ok(only.id.clone()),
                _ => Err(PubSubError::BadRequest(BadRequestReason::SubIdRequired)),
            }
        }
    }
}
