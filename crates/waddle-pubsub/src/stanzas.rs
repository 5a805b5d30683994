//! PubSub stanza building.
//!
//! Builds the event notifications, authorization requests and presence
//! stanzas the engine hands to the transport. Builders leave the `to`
//! address unset; the [`StanzaSender`](crate::sender::StanzaSender) fills
//! it in per recipient.

use jid::Jid;
use minidom::Element;

use crate::id::NodeId;
use crate::item::PublishedItem;
use crate::subscription::NodeSubscription;

/// Client namespace for top-level stanzas.
pub const NS_CLIENT: &str = "jabber:client";

/// Stanza error conditions namespace (RFC 6120).
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Main PubSub namespace (XEP-0060).
pub const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";

/// PubSub event namespace for notifications.
pub const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";

/// PubSub owner namespace for node management.
pub const NS_PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";

/// PubSub errors namespace.
pub const NS_PUBSUB_ERRORS: &str = "http://jabber.org/protocol/pubsub#errors";

/// Data forms namespace (XEP-0004).
pub const NS_DATA_FORMS: &str = "jabber:x:data";

/// Stanza headers namespace (XEP-0131).
pub const NS_SHIM: &str = "http://jabber.org/protocol/shim";

/// FORM_TYPE of subscription authorization requests.
pub const FORM_SUBSCRIBE_AUTHORIZATION: &str =
    "http://jabber.org/protocol/pubsub#subscribe_authorization";

/// Build an item element, with or without its payload.
pub fn item_element(item: &PublishedItem, ns: &str, include_payload: bool) -> Element {
    let mut builder = Element::builder("item", ns)
        .attr("id", item.item_id())
        .attr("publisher", item.publisher.to_string());

    if include_payload {
        if let Some(payload) = item.payload() {
            builder = builder.append(payload.clone());
        }
    }

    builder.build()
}

/// Build an items notification for published items.
///
/// `subids` lists the recipient's subscription ids on the node; when
/// non-empty they are attached as SubID headers.
pub fn build_items_event(
    from: &Jid,
    node: &NodeId,
    items: &[PublishedItem],
    include_payload: bool,
    subids: &[String],
) -> Element {
    let mut items_elem = Element::builder("items", NS_PUBSUB_EVENT).attr("node", node.node_id());
    for item in items {
        items_elem = items_elem.append(item_element(item, NS_PUBSUB_EVENT, include_payload));
    }

    with_headers(event_message(from, items_elem.build()), subids)
}

/// Build an items notification for a transient publish (no item retained).
pub fn build_transient_event(from: &Jid, node: &NodeId, subids: &[String]) -> Element {
    let items_elem = Element::builder("items", NS_PUBSUB_EVENT)
        .attr("node", node.node_id())
        .build();
    with_headers(event_message(from, items_elem), subids)
}

/// Build a retraction notification.
pub fn build_retract_event(from: &Jid, node: &NodeId, item_ids: &[&str]) -> Element {
    let mut items_elem = Element::builder("items", NS_PUBSUB_EVENT).attr("node", node.node_id());
    for id in item_ids {
        items_elem = items_elem.append(
            Element::builder("retract", NS_PUBSUB_EVENT)
                .attr("id", *id)
                .build(),
        );
    }
    event_message(from, items_elem.build())
}

/// Build a purge notification.
pub fn build_purge_event(from: &Jid, node: &NodeId) -> Element {
    let purge = Element::builder("purge", NS_PUBSUB_EVENT)
        .attr("node", node.node_id())
        .build();
    event_message(from, purge)
}

/// Build a node deletion notification.
pub fn build_delete_event(from: &Jid, node: &NodeId) -> Element {
    let delete = Element::builder("delete", NS_PUBSUB_EVENT)
        .attr("node", node.node_id())
        .build();
    event_message(from, delete)
}

/// Build a configuration change notification.
pub fn build_configuration_event(from: &Jid, node: &NodeId) -> Element {
    let configuration = Element::builder("configuration", NS_PUBSUB_EVENT)
        .attr("node", node.node_id())
        .build();
    event_message(from, configuration)
}

/// Build a notification that a node was added under a collection.
pub fn build_child_node_event(from: &Jid, collection: &NodeId, child: &NodeId) -> Element {
    let items_elem = Element::builder("items", NS_PUBSUB_EVENT)
        .attr("node", collection.node_id())
        .append(
            Element::builder("item", NS_PUBSUB_EVENT)
                .attr("id", child.node_id())
                .build(),
        )
        .build();
    event_message(from, items_elem)
}

/// Build a subscription state notification (e.g. after owner approval).
pub fn build_subscription_event(from: &Jid, subscription: &NodeSubscription) -> Element {
    Element::builder("message", NS_CLIENT)
        .attr("from", from.to_string())
        .attr("id", new_stanza_id())
        .append(
            Element::builder("pubsub", NS_PUBSUB)
                .append(subscription_element(subscription, NS_PUBSUB))
                .build(),
        )
        .build()
}

/// Build a `<subscription/>` element.
pub fn subscription_element(subscription: &NodeSubscription, ns: &str) -> Element {
    Element::builder("subscription", ns)
        .attr("node", subscription.node.node_id())
        .attr("jid", subscription.jid.to_string())
        .attr("subid", subscription.id.as_str())
        .attr("subscription", subscription.state.as_str())
        .build()
}

/// Build the authorization request form sent to node owners
/// (XEP-0060 Section 8.6).
pub fn build_authorization_request(from: &Jid, subscription: &NodeSubscription) -> Element {
    let form = Element::builder("x", NS_DATA_FORMS)
        .attr("type", "form")
        .append(
            Element::builder("title", NS_DATA_FORMS)
                .append("PubSub subscriber request")
                .build(),
        )
        .append(form_field("FORM_TYPE", Some("hidden"), FORM_SUBSCRIBE_AUTHORIZATION))
        .append(form_field("pubsub#subid", Some("hidden"), &subscription.id))
        .append(form_field(
            "pubsub#node",
            Some("text-single"),
            subscription.node.node_id(),
        ))
        .append(form_field(
            "pubsub#subscriber_jid",
            Some("jid-single"),
            &subscription.jid.to_string(),
        ))
        .append(form_field("pubsub#allow", Some("boolean"), "false"))
        .build();

    Element::builder("message", NS_CLIENT)
        .attr("from", from.to_string())
        .attr("id", new_stanza_id())
        .append(form)
        .build()
}

/// Build a presence subscription stanza (`subscribe` or `unsubscribe`).
pub fn build_presence_subscription(from: &Jid, to: &Jid, kind: &str) -> Element {
    Element::builder("presence", NS_CLIENT)
        .attr("from", from.to_string())
        .attr("to", to.to_string())
        .attr("type", kind)
        .build()
}

fn event_message(from: &Jid, payload: Element) -> Element {
    Element::builder("message", NS_CLIENT)
        .attr("from", from.to_string())
        .attr("id", new_stanza_id())
        .append(
            Element::builder("event", NS_PUBSUB_EVENT)
                .append(payload)
                .build(),
        )
        .build()
}

fn with_headers(mut message: Element, subids: &[String]) -> Element {
    if subids.is_empty() {
        return message;
    }

    let mut headers = Element::builder("headers", NS_SHIM);
    for subid in subids {
        headers = headers.append(
            Element::builder("header", NS_SHIM)
                .attr("name", "SubID")
                .append(subid.as_str())
                .build(),
        );
    }
    message.append_child(headers.build());
    message
}

fn form_field(var: &str, kind: Option<&str>, value: &str) -> Element {
    let mut builder = Element::builder("field", NS_DATA_FORMS).attr("var", var);
    if let Some(kind) = kind {
        builder = builder.attr("type", kind);
    }
    builder
        .append(Element::builder("value", NS_DATA_FORMS).append(value).build())
        .build()
}

fn new_stanza_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
