//! Engine-wide properties of the pub/sub service.
//!
//! Run with: `cargo test -p waddle-pubsub --test pubsub_properties`

mod common;

use common::{bare, harness, item, jid, ADMIN};

use waddle_pubsub::{
    AccessModel, Affiliation, CreateNode, NodeConfig, PubSubError, SubscriptionState,
};

#[tokio::test]
async fn test_is_admin_iff_owner_or_sysadmin() {
    let h = harness().await;
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");
    let node = service
        .create_node(&alice, CreateNode::leaf("news"))
        .await
        .expect("create");

    for (who, affiliation) in [
        ("publisher@example.com", Affiliation::Publisher),
        ("publish-only@example.com", Affiliation::PublishOnly),
        ("member@example.com", Affiliation::Member),
        ("outcast@example.com", Affiliation::Outcast),
    ] {
        service
            .set_affiliation(&alice, &node, &jid(who), affiliation)
            .await
            .expect("set affiliation");
    }

    let is_admin = |who: &'static str| {
        let service = service.clone();
        let node = node.clone();
        async move { service.is_admin(&node, &jid(who)).await.expect("node exists") }
    };

    assert!(is_admin("alice@example.com").await);
    assert!(is_admin("alice@example.com/phone").await);
    assert!(is_admin(ADMIN).await);
    assert!(is_admin("admin@example.com/desktop").await);
    assert!(!is_admin("publisher@example.com").await);
    assert!(!is_admin("publish-only@example.com").await);
    assert!(!is_admin("member@example.com").await);
    assert!(!is_admin("outcast@example.com").await);
    assert!(!is_admin("stranger@example.com").await);

    service
        .set_affiliation(&alice, &node, &jid("bob@example.com"), Affiliation::Owner)
        .await
        .expect("promote");
    assert!(is_admin("bob@example.com/laptop").await);
}

#[tokio::test]
async fn test_max_items_keeps_most_recent() {
    let h = harness().await;
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");
    let node = service
        .create_node(
            &alice,
            CreateNode::leaf("feed").with_config(NodeConfig {
                max_items: 3,
                ..NodeConfig::leaf_default()
            }),
        )
        .await
        .expect("create");

    for i in 1..=7 {
        service
            .publish(&alice, &node, Some(item(&i.to_string(), "entry")))
            .await
            .expect("publish");

        let held = service.items(&alice, &node, None).await.expect("items");
        assert!(held.len() <= 3);
    }

    let ids: Vec<String> = service
        .items(&alice, &node, None)
        .await
        .expect("items")
        .iter()
        .map(|i| i.item_id().to_string())
        .collect();
    assert_eq!(ids, vec!["5", "6", "7"]);

    // Evictions reach listeners oldest first, and storage.
    let evicted: Vec<String> = h
        .listener
        .deleted()
        .into_iter()
        .flat_map(|e| e.item_ids)
        .collect();
    assert_eq!(evicted, vec!["1", "2", "3", "4"]);

    h.registry.flush().await;
    assert_eq!(h.storage.item_ids(&node), vec!["5", "6", "7"]);
}

#[tokio::test]
async fn test_non_persistent_leaf_retains_last_item() {
    let h = harness().await;
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");
    let node = service
        .create_node(
            &alice,
            CreateNode::leaf("status").with_config(NodeConfig {
                persist_items: false,
                max_items: 20,
                ..NodeConfig::leaf_default()
            }),
        )
        .await
        .expect("create");

    for id in ["a", "b", "c"] {
        service
            .publish(&alice, &node, Some(item(id, id)))
            .await
            .expect("publish");
    }

    let last = service
        .last_published_item(&node)
        .await
        .expect("node")
        .expect("last item");
    assert_eq!(last.item_id(), "c");

    let held = service.items(&alice, &node, None).await.expect("items");
    assert_eq!(held.len(), 1);

    h.registry.flush().await;
    assert_eq!(h.storage.item_ids(&node), vec!["c"]);
}

#[tokio::test]
async fn test_publish_retract_fetch() {
    let h = harness().await;
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");
    let bob = jid("bob@example.com/phone");
    let node = service
        .create_node(&alice, CreateNode::leaf("news"))
        .await
        .expect("create");
    service
        .subscribe(&bob, &node, &bob, None)
        .await
        .expect("subscribe");

    service
        .publish(&alice, &node, Some(item("x", "hello")))
        .await
        .expect("publish");
    service
        .publish(&alice, &node, Some(item("y", "world")))
        .await
        .expect("publish");
    h.sender.clear();

    let retracted = service
        .retract(&alice, &node, "x", None)
        .await
        .expect("retract");
    assert_eq!(retracted.item_id(), "x");

    assert!(matches!(
        service.item(&alice, &node, "x").await,
        Err(PubSubError::ItemNotFound(id)) if id == "x"
    ));
    assert!(service.item(&alice, &node, "y").await.is_ok());

    let deleted = h.listener.deleted();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].node, node);
    assert_eq!(deleted[0].item_ids, vec!["x"]);

    let notifications = h.sender.sent_to("bob@example.com/phone");
    assert_eq!(notifications.len(), 1);
    let retract = notifications[0]
        .children()
        .flat_map(|event| event.children())
        .flat_map(|items| items.children())
        .find(|c| c.name() == "retract")
        .expect("retract element");
    assert_eq!(retract.attr("id"), Some("x"));

    assert!(matches!(
        service.retract(&alice, &node, "x", None).await,
        Err(PubSubError::ItemNotFound(_))
    ));
}

#[tokio::test]
async fn test_authorize_subscription_state_machine() {
    let h = harness().await;
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");
    let bob = jid("bob@example.com");
    let carol = jid("carol@example.com");
    let node = service
        .create_node(
            &alice,
            CreateNode::leaf("private").with_config(NodeConfig {
                access_model: AccessModel::Authorize,
                ..NodeConfig::leaf_default()
            }),
        )
        .await
        .expect("create");

    let pending = service
        .subscribe(&bob, &node, &bob, None)
        .await
        .expect("subscribe");
    assert_eq!(pending.state, SubscriptionState::Pending);

    // The owner is asked to decide.
    let requests = h.sender.sent_to("alice@example.com");
    assert_eq!(requests.len(), 1);
    assert!(requests[0].children().any(|c| c.name() == "x"));

    let approved = service
        .approve_subscription(&alice, &node, &pending.id, true)
        .await
        .expect("approve")
        .expect("subscription kept");
    assert_eq!(approved.state, SubscriptionState::Subscribed);
    assert_eq!(approved.id, pending.id);

    let pending = service
        .subscribe(&carol, &node, &carol, None)
        .await
        .expect("subscribe");
    assert_eq!(pending.state, SubscriptionState::Pending);

    // Only admins decide.
    assert!(matches!(
        service
            .approve_subscription(&bob, &node, &pending.id, true)
            .await,
        Err(PubSubError::Forbidden(_))
    ));

    let denied = service
        .approve_subscription(&alice, &node, &pending.id, false)
        .await
        .expect("deny");
    assert!(denied.is_none());

    assert!(matches!(
        service.unsubscribe(&carol, &node, &carol, None).await,
        Err(PubSubError::SubscriptionNotFound)
    ));

    let remaining = service.subscriptions(&alice, &node).await.expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].owner, bare("bob@example.com"));
}

#[tokio::test]
async fn test_presence_interest_is_reference_counted() {
    let h = harness().await;
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");
    let user = bare("bob@example.com");

    let first = service
        .create_node(&alice, CreateNode::leaf("one"))
        .await
        .expect("create");
    let second = service
        .create_node(&alice, CreateNode::leaf("two"))
        .await
        .expect("create");

    service.presence_subscription_required(&first, &user);
    service.presence_subscription_required(&second, &user);
    assert!(service.presence().is_tracked(&user));
    assert_eq!(h.sender.presences("subscribe").len(), 1);

    service.presence_subscription_not_required(&first, &user);
    assert!(service.presence().is_tracked(&user));
    assert!(h.sender.presences("unsubscribe").is_empty());

    // Releasing twice from the same node changes nothing.
    service.presence_subscription_not_required(&first, &user);
    assert!(service.presence().is_tracked(&user));

    service.presence_subscription_not_required(&second, &user);
    assert!(!service.presence().is_tracked(&user));
    assert_eq!(h.sender.presences("unsubscribe").len(), 1);
}

#[tokio::test]
async fn test_presence_interest_follows_subscriptions() {
    let h = harness().await;
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");
    let bob = jid("bob@example.com/phone");
    let config = NodeConfig {
        presence_based_delivery: true,
        ..NodeConfig::leaf_default()
    };

    let first = service
        .create_node(&alice, CreateNode::leaf("one").with_config(config.clone()))
        .await
        .expect("create");
    let second = service
        .create_node(&alice, CreateNode::leaf("two").with_config(config))
        .await
        .expect("create");

    service
        .subscribe(&bob, &first, &bob, None)
        .await
        .expect("subscribe");
    service
        .subscribe(&bob, &second, &bob, None)
        .await
        .expect("subscribe");
    assert_eq!(service.presence().interest_count(&bob.to_bare()), 2);
    assert_eq!(h.sender.presences("subscribe").len(), 1);

    service
        .unsubscribe(&bob, &first, &bob, None)
        .await
        .expect("unsubscribe");
    assert!(service.presence().is_tracked(&bob.to_bare()));

    service
        .delete_node(&alice, &second)
        .await
        .expect("delete");
    assert!(!service.presence().is_tracked(&bob.to_bare()));
    assert_eq!(h.sender.presences("unsubscribe").len(), 1);
}
