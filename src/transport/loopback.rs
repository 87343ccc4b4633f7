// In-process network connecting several emulated nodes
//
// Delivery goes through unbounded channels, so a send never blocks and
// never re-enters the receiving node on the sender's task. Per-sender
// ordering is preserved.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{Inbound, PttTransport, SendFuture, SignalingTransport};
use crate::error::IssiTesterError;
use crate::ptt::PttPacket;
use crate::sip::message::SipMessage;
use crate::trigger::ObservedEvent;

#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: DashMap<String, mpsc::UnboundedSender<Inbound>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node. Re-attaching replaces the previous receiver.
    pub fn attach(
        self: &Arc<Self>,
        node: &str,
    ) -> (LoopbackEndpoint, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.insert(node.to_string(), tx);
        (
            LoopbackEndpoint {
                network: self.clone(),
                node: node.to_string(),
            },
            rx,
        )
    }

    pub fn detach(&self, node: &str) {
        self.nodes.remove(node);
    }

    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    fn deliver(&self, from: &str, to: &str, event: ObservedEvent) -> Result<(), IssiTesterError> {
        let sender = self
            .nodes
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| IssiTesterError::UnknownNode(to.to_string()))?;
        sender
            .send(Inbound {
                from_node: from.to_string(),
                event,
            })
            .map_err(|_| {
                IssiTesterError::NetworkError(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    format!("node {} stopped receiving", to),
                ))
            })
    }
}

/// One node's handle on the loopback network
#[derive(Clone)]
pub struct LoopbackEndpoint {
    network: Arc<LoopbackNetwork>,
    node: String,
}

impl LoopbackEndpoint {
    pub fn node(&self) -> &str {
        &self.node
    }
}

impl SignalingTransport for LoopbackEndpoint {
    fn send_sip<'a>(&'a self, to_node: &'a str, message: SipMessage) -> SendFuture<'a> {
        Box::pin(async move {
            self.network
                .deliver(&self.node, to_node, ObservedEvent::Sip(message))
        })
    }
}

impl PttTransport for LoopbackEndpoint {
    fn send_ptt<'a>(&'a self, to_node: &'a str, packet: PttPacket) -> SendFuture<'a> {
        Box::pin(async move {
            self.network
                .deliver(&self.node, to_node, ObservedEvent::Ptt(packet))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptt::PttControlType;
    use crate::sip::message::{Method, SipRequest};

    #[tokio::test]
    async fn test_delivers_to_named_node_with_sender() {
        let network = LoopbackNetwork::new();
        let (a, _rx_a) = network.attach("rfss_1");
        let (_b, mut rx_b) = network.attach("rfss_2");

        let invite = SipMessage::Request(SipRequest::new(Method::Invite, "sip:su_2@rfss_2"));
        a.send_sip("rfss_2", invite.clone()).await.unwrap();

        let inbound = rx_b.recv().await.unwrap();
        assert_eq!(inbound.from_node, "rfss_1");
        assert_eq!(inbound.event, ObservedEvent::Sip(invite));
    }

    #[tokio::test]
    async fn test_unknown_node_is_error() {
        let network = LoopbackNetwork::new();
        let (a, _rx) = network.attach("rfss_1");
        let packet = PttPacket::new(PttControlType::Heartbeat, "c", "a", "b");
        assert!(matches!(
            a.send_ptt("rfss_9", packet).await,
            Err(IssiTesterError::UnknownNode(n)) if n == "rfss_9"
        ));
    }

    #[tokio::test]
    async fn test_send_to_self_is_allowed() {
        let network = LoopbackNetwork::new();
        let (a, mut rx) = network.attach("rfss_1");
        let packet = PttPacket::new(PttControlType::Mute, "c", "a", "b");
        a.send_ptt("rfss_1", packet.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event, ObservedEvent::Ptt(packet));
    }

    #[tokio::test]
    async fn test_preserves_order() {
        let network = LoopbackNetwork::new();
        let (a, _rx_a) = network.attach("rfss_1");
        let (_b, mut rx_b) = network.attach("rfss_2");
        for seq in 0..10u32 {
            let mut packet = PttPacket::new(PttControlType::SpurtProgress, "c", "a", "b");
            packet.sequence = seq;
            a.send_ptt("rfss_2", packet).await.unwrap();
        }
        for seq in 0..10u32 {
            match rx_b.recv().await.unwrap().event {
                ObservedEvent::Ptt(p) => assert_eq!(p.sequence, seq),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_network_error() {
        let network = LoopbackNetwork::new();
        let (a, _rx_a) = network.attach("rfss_1");
        let (_b, rx_b) = network.attach("rfss_2");
        drop(rx_b);
        let packet = PttPacket::new(PttControlType::Mute, "c", "a", "b");
        let err = a.send_ptt("rfss_2", packet).await.unwrap_err();
        assert!(err.is_communication_error());
    }
}
