// UDP transport for nodes running as separate processes
//
// SIP travels as RFC 3261 text. PTT control packets travel as JSON
// datagrams, which always start with '{' and so never look like SIP.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Inbound, PttTransport, SendFuture, SignalingTransport};
use crate::error::IssiTesterError;
use crate::ptt::PttPacket;
use crate::sip::formatter::format_sip_message;
use crate::sip::message::SipMessage;
use crate::sip::parser::parse_sip_message;
use crate::trigger::ObservedEvent;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind one socket. Port 0 lets the OS pick.
    pub async fn bind(addr: SocketAddr) -> Result<Self, IssiTesterError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), IssiTesterError> {
        self.socket.send_to(data, addr).await?;
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    pub async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), IssiTesterError> {
        // Stack-allocated buffer to avoid heap allocation per recv
        let mut buf = [0u8; 65535];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        Ok((buf[..len].to_vec(), from))
    }
}

/// Decode one datagram into an observed event
pub fn decode_datagram(data: &[u8]) -> Result<ObservedEvent, IssiTesterError> {
    if data.first() == Some(&b'{') {
        PttPacket::decode(data).map(ObservedEvent::Ptt)
    } else {
        parse_sip_message(data).map(ObservedEvent::Sip)
    }
}

/// Node transport over UDP with a static node-to-address map
pub struct UdpNodeTransport {
    transport: UdpTransport,
    peers: HashMap<String, SocketAddr>,
}

impl UdpNodeTransport {
    pub fn new(transport: UdpTransport, peers: HashMap<String, SocketAddr>) -> Self {
        Self { transport, peers }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    fn peer_addr(&self, node: &str) -> Result<SocketAddr, IssiTesterError> {
        self.peers
            .get(node)
            .copied()
            .ok_or_else(|| IssiTesterError::UnknownNode(node.to_string()))
    }

    fn node_for(&self, addr: SocketAddr) -> String {
        self.peers
            .iter()
            .find(|(_, peer)| **peer == addr)
            .map(|(node, _)| node.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Receive datagrams until the channel closes. Undecodable datagrams
    /// are logged and dropped.
    pub fn spawn_receiver(self: &Arc<Self>, tx: mpsc::UnboundedSender<Inbound>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let (data, from) = match this.transport.recv_from().await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed");
                        continue;
                    }
                };
                let event = match decode_datagram(&data) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(%from, error = %e, "dropping undecodable datagram");
                        continue;
                    }
                };
                let inbound = Inbound {
                    from_node: this.node_for(from),
                    event,
                };
                if tx.send(inbound).is_err() {
                    break;
                }
            }
        })
    }
}

impl SignalingTransport for UdpNodeTransport {
    fn send_sip<'a>(&'a self, to_node: &'a str, message: SipMessage) -> SendFuture<'a> {
        Box::pin(async move {
            let addr = self.peer_addr(to_node)?;
            self.transport.send_to(&format_sip_message(&message), addr).await
        })
    }
}

impl PttTransport for UdpNodeTransport {
    fn send_ptt<'a>(&'a self, to_node: &'a str, packet: PttPacket) -> SendFuture<'a> {
        Box::pin(async move {
            let addr = self.peer_addr(to_node)?;
            self.transport.send_to(&packet.encode()?, addr).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptt::PttControlType;
    use crate::sip::message::{Method, SipRequest};

    async fn localhost() -> UdpTransport {
        UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind")
    }

    #[tokio::test]
    async fn test_send_and_recv_roundtrip() {
        let sender = localhost().await;
        let receiver = localhost().await;
        let payload = b"SIP/2.0 200 OK\r\n\r\n";
        sender
            .send_to(payload, receiver.local_addr().unwrap())
            .await
            .expect("send");
        let (data, from) = receiver.recv_from().await.expect("recv");
        assert_eq!(&data, payload);
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn test_decode_datagram_distinguishes_planes() {
        let packet = PttPacket::new(PttControlType::SpurtRequest, "c", "a", "b");
        assert_eq!(
            decode_datagram(&packet.encode().unwrap()).unwrap(),
            ObservedEvent::Ptt(packet)
        );
        let sip = decode_datagram(b"BYE sip:a@b SIP/2.0\r\nCall-ID: x\r\n\r\n").unwrap();
        assert!(matches!(sip, ObservedEvent::Sip(SipMessage::Request(_))));
        assert!(decode_datagram(b"{not json").is_err());
    }

    #[tokio::test]
    async fn test_node_transport_delivers_with_sender_node() {
        let a_socket = localhost().await;
        let b_socket = localhost().await;
        let a_addr = a_socket.local_addr().unwrap();
        let b_addr = b_socket.local_addr().unwrap();
        let peers: HashMap<String, SocketAddr> =
            [("rfss_1".to_string(), a_addr), ("rfss_2".to_string(), b_addr)].into();

        let a = UdpNodeTransport::new(a_socket, peers.clone());
        let b = Arc::new(UdpNodeTransport::new(b_socket, peers));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = b.spawn_receiver(tx);

        let mut invite = SipRequest::new(Method::Invite, "sip:su_2@rfss_2.p25dr");
        invite.headers.set("Call-ID", "udp-1".to_string());
        a.send_sip("rfss_2", SipMessage::Request(invite)).await.unwrap();

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.from_node, "rfss_1");
        match inbound.event {
            ObservedEvent::Sip(msg) => assert_eq!(msg.call_id(), "udp-1"),
            other => panic!("unexpected {:?}", other),
        }
        receiver.abort();
    }

    #[tokio::test]
    async fn test_unknown_peer_is_error() {
        let transport = UdpNodeTransport::new(localhost().await, HashMap::new());
        let packet = PttPacket::new(PttControlType::Heartbeat, "c", "a", "b");
        assert!(transport.send_ptt("rfss_9", packet).await.is_err());
    }
}
