//! Outbound leg: the initiator handshake toward the real server.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, Msg, Session};
use russh::keys::PublicKey;
use russh::{Channel, Disconnect, SshId};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ChannelOpenKind, OutboundEvent, ServerOpenKind, VERSION_BANNER};
use crate::error::{Leg, MitmError};

/// The server-facing half of a session.
///
/// Authenticates with the `none` method as the username the victim
/// presented, and accepts whatever host key the real server offers. The
/// missing verification is deliberate: this is an interception tool, not
/// a trust anchor.
pub struct ClientFacade {
    handle: client::Handle<ClientHandler>,
    events: mpsc::UnboundedReceiver<OutboundEvent>,
    /// Fires when the connection ends, however it ends.
    closed: CancellationToken,
}

impl ClientFacade {
    /// Run the initiator handshake over an already-dialed connection,
    /// impersonating `username`.
    pub async fn start(
        stream: TcpStream,
        username: &str,
        handshake_timeout: Duration,
        token: &CancellationToken,
    ) -> Result<Self, MitmError> {
        let config = Arc::new(client::Config {
            client_id: SshId::Standard(VERSION_BANNER.to_string()),
            ..Default::default()
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let handler = ClientHandler {
            events: event_tx,
            closed: closed.clone(),
        };

        let handshake = async {
            let mut handle = client::connect_stream(config, stream, handler)
                .await
                .map_err(|e| MitmError::handshake(Leg::Outbound, e))?;
            match handle
                .authenticate_none(username)
                .await
                .map_err(|e| MitmError::handshake(Leg::Outbound, e))?
            {
                AuthResult::Success => Ok(handle),
                AuthResult::Failure { .. } => Err(MitmError::handshake(
                    Leg::Outbound,
                    format!("server rejected none authentication for {:?}", username),
                )),
            }
        };

        let handle = tokio::select! {
            result = handshake => result?,
            _ = tokio::time::sleep(handshake_timeout) => {
                return Err(MitmError::handshake(Leg::Outbound, "handshake timed out"));
            }
            _ = token.cancelled() => return Err(MitmError::Timeout),
        };

        debug!(username = %username, "outbound handshake complete");

        Ok(Self {
            handle,
            events: event_rx,
            closed,
        })
    }

    /// Take the facade apart for the engine's two loops: the open/close
    /// control surface, the server-initiated event stream, and the
    /// leg-closure signal.
    pub fn split(
        self,
    ) -> (
        OutboundControl,
        mpsc::UnboundedReceiver<OutboundEvent>,
        CancellationToken,
    ) {
        (
            OutboundControl {
                handle: self.handle,
            },
            self.events,
            self.closed,
        )
    }
}

/// The side of the outbound leg the pairing loop drives: mirroring
/// channel-opens and tearing the leg down.
pub struct OutboundControl {
    handle: client::Handle<ClientHandler>,
}

impl OutboundControl {
    /// Mirror a victim channel-open to the real server. Any failure here
    /// is a pairing failure, local to this one open.
    pub async fn mirror_open(&mut self, kind: &ChannelOpenKind) -> Result<Channel<Msg>, MitmError> {
        let opened = match kind {
            ChannelOpenKind::Session => self.handle.channel_open_session().await,
            ChannelOpenKind::DirectTcpip {
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            } => {
                self.handle
                    .channel_open_direct_tcpip(
                        host_to_connect.as_str(),
                        *port_to_connect,
                        originator_address.as_str(),
                        *originator_port,
                    )
                    .await
            }
        };
        opened.map_err(MitmError::Pairing)
    }

    /// Polite teardown of the outbound leg.
    pub async fn disconnect(&mut self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "session closed", "")
            .await;
    }
}

/// Protocol callbacks for the outbound leg.
pub struct ClientHandler {
    events: mpsc::UnboundedSender<OutboundEvent>,
    closed: CancellationToken,
}

impl ClientHandler {
    fn forward_open(&self, kind: ServerOpenKind, channel: Channel<Msg>) {
        // If the engine is gone the channel is dropped here, which
        // refuses it just the same.
        let _ = self.events.send(OutboundEvent::ChannelOpen { kind, channel });
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        // The session task owns the handler; it ending means the leg is
        // gone, cleanly or not.
        self.closed.cancel();
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_open(ServerOpenKind::ForwardedTcpip, channel);
        Ok(())
    }

    async fn server_channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_open(ServerOpenKind::X11, channel);
        Ok(())
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_open(ServerOpenKind::AgentForward, channel);
        Ok(())
    }
}
