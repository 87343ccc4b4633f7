// Signaling and media-control transports between emulated nodes

pub mod loopback;
pub mod udp;

pub use loopback::{LoopbackEndpoint, LoopbackNetwork};
pub use udp::{UdpNodeTransport, UdpTransport};

use std::future::Future;
use std::pin::Pin;

use crate::error::IssiTesterError;
use crate::ptt::PttPacket;
use crate::sip::message::SipMessage;
use crate::trigger::ObservedEvent;

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), IssiTesterError>> + Send + 'a>>;

/// A message delivered to a node
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Sending node id, or "unknown" when it cannot be resolved
    pub from_node: String,
    pub event: ObservedEvent,
}

/// SIP delivery between nodes
pub trait SignalingTransport: Send + Sync {
    fn send_sip<'a>(&'a self, to_node: &'a str, message: SipMessage) -> SendFuture<'a>;
}

/// Media-control packet delivery between nodes
pub trait PttTransport: Send + Sync {
    fn send_ptt<'a>(&'a self, to_node: &'a str, packet: PttPacket) -> SendFuture<'a>;
}

/// Both planes behind one handle
pub trait NodeTransport: SignalingTransport + PttTransport {}

impl<T: SignalingTransport + PttTransport> NodeTransport for T {}
