//! Node hierarchy, PEP and service lifecycle tests.
//!
//! Run with: `cargo test -p waddle-pubsub --test node_lifecycle`

mod common;

use std::sync::Arc;
use std::time::Duration;

use minidom::Element;
use tokio::time::timeout;

use common::{
    bare, harness, harness_with, item, jid, start, test_config, GatedRoster, StaticRoster,
    DEFAULT_TIMEOUT,
};
use waddle_pubsub::{
    AccessModel, ConflictReason, CreateNode, DeletePolicy, InMemoryPubSubStorage, NodeConfig,
    PubSubConfig, PubSubError, Show, SubscriptionOptions, SubscriptionState, SubscriptionType,
};

/// The `<items/>` (or other event payload) elements of event messages.
fn event_payloads(messages: &[Element]) -> Vec<Element> {
    messages
        .iter()
        .flat_map(|m| m.children())
        .filter(|c| c.name() == "event")
        .flat_map(|e| e.children())
        .cloned()
        .collect()
}

#[tokio::test]
async fn test_collection_subscribers_receive_descendant_items() {
    let h = harness().await;
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");
    let bob = jid("bob@example.com");
    let carol = jid("carol@example.com");
    let dave = jid("dave@example.com");

    let blog = service
        .create_node(&alice, CreateNode::collection("blog"))
        .await
        .expect("create collection");
    let posts = service
        .create_node(&alice, CreateNode::leaf("posts").with_parent("blog"))
        .await
        .expect("create leaf");
    let root = service.root_id().expect("root");

    service
        .subscribe(&bob, &blog, &bob, None)
        .await
        .expect("subscribe to collection");
    // Root with depth 1 covers `blog` only, depth 0 covers every descendant.
    service
        .subscribe(&carol, &root, &carol, Some(SubscriptionOptions::default()))
        .await
        .expect("subscribe to root");
    service
        .subscribe(
            &dave,
            &root,
            &dave,
            Some(SubscriptionOptions {
                depth: 0,
                ..SubscriptionOptions::default()
            }),
        )
        .await
        .expect("subscribe to root");

    service
        .publish(&alice, &posts, Some(item("1", "first post")))
        .await
        .expect("publish");

    for who in ["bob@example.com", "dave@example.com"] {
        let payloads = event_payloads(&h.sender.sent_to(who));
        assert_eq!(payloads.len(), 1, "{who} gets one notification");
        assert_eq!(payloads[0].name(), "items");
        assert_eq!(payloads[0].attr("node"), Some("posts"));
    }
    assert!(h.sender.sent_to("carol@example.com").is_empty());
}

#[tokio::test]
async fn test_nodes_subscribers_learn_about_children() {
    let h = harness().await;
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");
    let bob = jid("bob@example.com");
    let erin = jid("erin@example.com");

    let blog = service
        .create_node(&alice, CreateNode::collection("blog"))
        .await
        .expect("create collection");
    service
        .subscribe(&bob, &blog, &bob, None)
        .await
        .expect("items subscription");
    service
        .subscribe(
            &erin,
            &blog,
            &erin,
            Some(SubscriptionOptions {
                subscription_type: SubscriptionType::Nodes,
                ..SubscriptionOptions::default()
            }),
        )
        .await
        .expect("nodes subscription");

    service
        .create_node(&alice, CreateNode::leaf("drafts").with_parent("blog"))
        .await
        .expect("create child");

    let payloads = event_payloads(&h.sender.sent_to("erin@example.com"));
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].attr("node"), Some("blog"));
    let child = payloads[0].children().next().expect("child item");
    assert_eq!(child.attr("id"), Some("drafts"));

    assert!(h.sender.sent_to("bob@example.com").is_empty());
}

#[tokio::test]
async fn test_reject_policy_protects_collections_with_items() {
    let h = harness().await;
    assert_eq!(h.registry.config().delete_policy, DeletePolicy::Reject);
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");

    let blog = service
        .create_node(&alice, CreateNode::collection("blog"))
        .await
        .expect("create collection");
    let posts = service
        .create_node(&alice, CreateNode::leaf("posts").with_parent("blog"))
        .await
        .expect("create leaf");
    service
        .publish(&alice, &posts, Some(item("1", "post")))
        .await
        .expect("publish");

    assert!(matches!(
        service.delete_node(&alice, &blog).await,
        Err(PubSubError::Conflict(ConflictReason::NodeNotEmpty))
    ));
    assert!(service.contains_node(&posts));

    // A leaf's own items never block its deletion.
    service.delete_node(&alice, &posts).await.expect("delete leaf");
    assert!(!service.contains_node(&posts));
    assert_eq!(h.listener.deleted().len(), 1);

    service.delete_node(&alice, &blog).await.expect("delete empty collection");
    assert_eq!(service.node_ids(), vec![service.root_id().expect("root")]);
}

#[tokio::test]
async fn test_purge_policy_deletes_subtree_and_notifies() {
    let h = harness_with(
        PubSubConfig {
            delete_policy: DeletePolicy::Purge,
            ..test_config()
        },
        StaticRoster::new(),
    )
    .await;
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");
    let bob = jid("bob@example.com");

    let blog = service
        .create_node(&alice, CreateNode::collection("blog"))
        .await
        .expect("create collection");
    service
        .create_node(&alice, CreateNode::collection("archive").with_parent("blog"))
        .await
        .expect("create nested collection");
    let old = service
        .create_node(&alice, CreateNode::leaf("old").with_parent("archive"))
        .await
        .expect("create leaf");
    service
        .subscribe(&bob, &old, &bob, None)
        .await
        .expect("subscribe");
    service
        .publish(&alice, &old, Some(item("1", "old post")))
        .await
        .expect("publish");
    h.sender.clear();

    service.delete_node(&alice, &blog).await.expect("delete");
    assert_eq!(service.node_count(), 1);
    assert!(matches!(
        service.items(&alice, &old, None).await,
        Err(PubSubError::NodeNotFound(_))
    ));

    let deleted = h.listener.deleted();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].item_ids, vec!["1"]);

    let payloads = event_payloads(&h.sender.sent_to("bob@example.com"));
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].name(), "delete");
    assert_eq!(payloads[0].attr("node"), Some("old"));

    h.registry.flush().await;
    assert_eq!(h.storage.node_count(), 1);
    assert!(h.storage.item_ids(&old).is_empty());
}

#[tokio::test]
async fn test_pep_node_is_created_on_first_publish() {
    let roster = StaticRoster::new().with_contact("alice@example.com", "bob@example.com", &[]);
    let h = harness_with(test_config(), roster).await;
    let alice = jid("alice@example.com/phone");
    let bob = jid("bob@example.com");
    let carol = jid("carol@example.com");

    let pep = h
        .registry
        .pep_service(&bare("alice@example.com"))
        .await
        .expect("pep service");
    let tune = pep.id().node("http://jabber.org/protocol/tune");

    // Only the owner's publish creates a node.
    assert!(matches!(
        pep.publish(&bob, &tune, Some(item("current", "song"))).await,
        Err(PubSubError::NodeNotFound(_))
    ));
    assert!(!pep.contains_node(&tune));

    let outcome = pep
        .publish(&alice, &tune, Some(item("current", "song")))
        .await
        .expect("publish");
    assert!(outcome.node_created);
    let outcome = pep
        .publish(&alice, &tune, Some(item("current", "next song")))
        .await
        .expect("publish");
    assert!(!outcome.node_created);

    let config = pep.node_config(&alice, &tune).await.expect("config");
    assert_eq!(config, waddle_pubsub::pep::pep_node_config(tune.node_id()));

    // Presence access: roster contacts only.
    let subscription = pep
        .subscribe(&bob, &tune, &bob, None)
        .await
        .expect("contact subscribes");
    assert_eq!(subscription.state, SubscriptionState::Subscribed);
    assert!(pep.subscribe(&carol, &tune, &carol, None).await.is_err());

    // PEP services are flat and owned by their user.
    assert!(pep.root_id().is_none());
    assert!(matches!(
        pep.create_node(&bob, CreateNode::leaf("mine")).await,
        Err(PubSubError::Forbidden(_))
    ));
    assert!(pep.is_admin(&tune, &alice).await.expect("node"));
}

#[tokio::test]
async fn test_last_item_sent_when_contact_comes_online() {
    let roster = StaticRoster::new().with_contact("alice@example.com", "bob@example.com", &[]);
    let h = harness_with(test_config(), roster).await;
    let alice = jid("alice@example.com");
    let bob = jid("bob@example.com");
    let bob_phone = jid("bob@example.com/phone");

    let pep = h
        .registry
        .pep_service(&bare("alice@example.com"))
        .await
        .expect("pep service");
    let mood = pep.id().node("http://jabber.org/protocol/mood");
    pep.publish(&alice, &mood, Some(item("current", "happy")))
        .await
        .expect("publish");
    pep.subscribe(&bob, &mood, &bob, None)
        .await
        .expect("subscribe");
    h.sender.clear();

    h.registry
        .presence_changed(&bob_phone, Some(Show::Available))
        .await;
    let payloads = event_payloads(&h.sender.sent_to("bob@example.com/phone"));
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].attr("node"), Some(mood.node_id()));

    // Already online: a show change sends nothing new.
    h.registry.presence_changed(&bob_phone, Some(Show::Away)).await;
    assert_eq!(h.sender.sent_to("bob@example.com/phone").len(), 1);
}

#[tokio::test]
async fn test_presence_based_delivery_skips_offline_subscribers() {
    let h = harness().await;
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");
    let bob = jid("bob@example.com");
    let node = service
        .create_node(
            &alice,
            CreateNode::leaf("alerts").with_config(NodeConfig {
                presence_based_delivery: true,
                ..NodeConfig::leaf_default()
            }),
        )
        .await
        .expect("create");
    service
        .subscribe(&bob, &node, &bob, None)
        .await
        .expect("subscribe");

    service
        .publish(&alice, &node, Some(item("1", "while offline")))
        .await
        .expect("publish");
    // The presence subscription is the only stanza bob has received.
    assert_eq!(h.sender.presences("subscribe").len(), 1);
    assert!(event_payloads(&h.sender.sent_to("bob@example.com")).is_empty());

    service
        .presence_changed(&jid("bob@example.com/laptop"), Some(Show::Available))
        .await;
    service
        .publish(&alice, &node, Some(item("2", "while online")))
        .await
        .expect("publish");
    assert_eq!(event_payloads(&h.sender.sent_to("bob@example.com")).len(), 1);

    service
        .presence_changed(&jid("bob@example.com/laptop"), None)
        .await;
    service
        .publish(&alice, &node, Some(item("3", "offline again")))
        .await
        .expect("publish");
    assert_eq!(event_payloads(&h.sender.sent_to("bob@example.com")).len(), 1);
}

#[tokio::test]
async fn test_shutdown_flushes_and_reload_restores_state() {
    let h = harness().await;
    let service = h.registry.domain_service();
    let alice = jid("alice@example.com");
    let bob = jid("bob@example.com");

    service
        .create_node(&alice, CreateNode::collection("blog"))
        .await
        .expect("create collection");
    let posts = service
        .create_node(&alice, CreateNode::leaf("posts").with_parent("blog"))
        .await
        .expect("create leaf");
    for id in ["1", "2"] {
        service
            .publish(&alice, &posts, Some(item(id, "post")))
            .await
            .expect("publish");
    }
    service
        .subscribe(&bob, &posts, &bob, None)
        .await
        .expect("subscribe");

    h.registry.shutdown().await;
    assert!(matches!(
        service.publish(&alice, &posts, Some(item("3", "late"))).await,
        Err(PubSubError::ShuttingDown)
    ));
    assert_eq!(h.storage.item_ids(&posts), vec!["1", "2"]);

    let restarted = start(test_config(), StaticRoster::new(), h.storage.clone()).await;
    let service = restarted.registry.domain_service();
    assert_eq!(service.node_count(), 3);

    let blog = service.id().node("blog");
    assert_eq!(service.children(&blog).await.expect("children"), vec![posts.clone()]);

    let ids: Vec<String> = service
        .items(&alice, &posts, None)
        .await
        .expect("items")
        .iter()
        .map(|i| i.item_id().to_string())
        .collect();
    assert_eq!(ids, vec!["1", "2"]);

    let subscriptions = service.user_subscriptions(&bob.to_bare()).await;
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].node, posts);
    assert!(service.is_admin(&posts, &alice).await.expect("node"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_persists_mutation_admitted_before_it() {
    let roster = GatedRoster::default();
    let storage = Arc::new(InMemoryPubSubStorage::new());
    let h = start(test_config(), roster.clone(), storage.clone()).await;
    let registry = Arc::new(h.registry);
    let service = registry.domain_service();
    let alice = jid("alice@example.com");
    let bob = jid("bob@example.com");

    let node = service
        .create_node(
            &alice,
            CreateNode::leaf("status").with_config(NodeConfig {
                access_model: AccessModel::Presence,
                ..NodeConfig::leaf_default()
            }),
        )
        .await
        .expect("create");

    let subscribing = {
        let service = service.clone();
        let bob = bob.clone();
        let node = node.clone();
        tokio::spawn(async move { service.subscribe(&bob, &node, &bob, None).await })
    };
    timeout(DEFAULT_TIMEOUT, roster.entered.notified())
        .await
        .expect("subscribe reached the roster lookup");

    let stopping = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.shutdown().await })
    };
    timeout(DEFAULT_TIMEOUT, async {
        while !registry.is_shutting_down() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("shutdown started");

    // Shutdown waits for the parked subscribe.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stopping.is_finished());

    roster.release.notify_one();
    let subscription = timeout(DEFAULT_TIMEOUT, subscribing)
        .await
        .expect("subscribe finishes")
        .expect("join")
        .expect("subscribe admitted before shutdown");
    assert_eq!(subscription.state, SubscriptionState::Subscribed);
    timeout(DEFAULT_TIMEOUT, stopping)
        .await
        .expect("shutdown finishes")
        .expect("join");

    assert!(matches!(
        service.subscribe(&alice, &node, &alice, None).await,
        Err(PubSubError::ShuttingDown)
    ));

    let restarted = start(test_config(), StaticRoster::new(), storage).await;
    let subscriptions = restarted
        .registry
        .domain_service()
        .user_subscriptions(&bob.to_bare())
        .await;
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].node, node);
}
