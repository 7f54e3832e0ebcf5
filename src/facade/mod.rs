//! The two terminated SSH legs.
//!
//! [`server::ServerFacade`] speaks the responder side to the victim,
//! [`client::ClientFacade`] the initiator side to the real server. Each
//! exposes its post-handshake activity (channel-opens, global requests) as
//! an event stream consumed by the relay engine; neither decides anything
//! on its own beyond kind filtering.

pub mod client;
pub mod server;

pub use client::{ClientFacade, OutboundControl};
pub use server::ServerFacade;

use russh::Channel;
use tokio::sync::oneshot;

/// Version banner presented to the victim, and reused as our client
/// version toward the real server so both sides see a plausible peer.
pub const VERSION_BANNER: &str = "SSH-2.0-OpenSSH_7.4p1";

/// Channel-open kinds the engine will try to mirror outbound.
///
/// A closed set: anything else is refused at the facade policy layer and
/// never reaches the pairing path.
#[derive(Debug, Clone)]
pub enum ChannelOpenKind {
    Session,
    DirectTcpip {
        host_to_connect: String,
        port_to_connect: u32,
        originator_address: String,
        originator_port: u32,
    },
}

impl std::fmt::Display for ChannelOpenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelOpenKind::Session => write!(f, "session"),
            ChannelOpenKind::DirectTcpip {
                host_to_connect,
                port_to_connect,
                ..
            } => write!(f, "direct-tcpip to {}:{}", host_to_connect, port_to_connect),
        }
    }
}

/// A victim channel-open awaiting the engine's verdict.
///
/// The facade's handler blocks on `verdict` so the protocol-level
/// accept/reject mirrors whatever happened on the outbound leg. Dropping
/// the sender rejects the open.
pub struct PendingChannelOpen {
    pub kind: ChannelOpenKind,
    pub channel: Channel<russh::server::Msg>,
    pub verdict: oneshot::Sender<bool>,
}

/// Connection-global requests from the victim. Received, logged, denied.
#[derive(Debug, Clone)]
pub enum GlobalRequestKind {
    TcpipForward { address: String, port: u32 },
    CancelTcpipForward { address: String, port: u32 },
}

/// Post-handshake activity on the inbound (victim) leg.
pub enum InboundEvent {
    ChannelOpen(PendingChannelOpen),
    GlobalRequest {
        kind: GlobalRequestKind,
        verdict: oneshot::Sender<bool>,
    },
}

/// Channel-opens initiated by the real server toward the victim.
/// Not brokered; the engine refuses them explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOpenKind {
    ForwardedTcpip,
    X11,
    AgentForward,
}

pub enum OutboundEvent {
    ChannelOpen {
        kind: ServerOpenKind,
        channel: Channel<russh::client::Msg>,
    },
}
