//! Outbound stanza hand-off to the transport layer.

use jid::Jid;
use minidom::Element;

use crate::id::NodeId;

/// Hands stanzas to the transport.
///
/// Sending is fire-and-forget: implementations enqueue the stanza and
/// return. The engine never retries.
pub trait StanzaSender: Send + Sync + 'static {
    /// Send a fully addressed stanza.
    fn send(&self, stanza: Element);

    /// Send a node notification to one recipient.
    fn send_notification(&self, _node: &NodeId, mut message: Element, to: &Jid) {
        message.set_attr("to", to.to_string());
        self.send(message);
    }

    /// Send the same node notification to several recipients.
    fn broadcast(&self, node: &NodeId, message: &Element, to: &[Jid]) {
        for jid in to {
            self.send_notification(node, message.clone(), jid);
        }
    }
}

/// Sender that drops every stanza.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSender;

impl StanzaSender for NullSender {
    fn send(&self, _stanza: Element) {}
}

/// Sender backed by an unbounded channel, for hosts that route stanzas
/// from a dedicated task.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: tokio::sync::mpsc::UnboundedSender<Element>,
}

impl ChannelSender {
    /// Create a sender and the receiving end the host drains.
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<Element>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StanzaSender for ChannelSender {
    fn send(&self, stanza: Element) {
        if self.tx.send(stanza).is_err() {
            tracing::debug!("Stanza receiver dropped, discarding outbound stanza");
        }
    }
}
