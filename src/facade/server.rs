//! Inbound leg: the responder handshake toward the victim.

use std::sync::Arc;
use std::time::Duration;

use russh::keys::HashAlg;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, MethodKind, MethodSet, SshId};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ChannelOpenKind, GlobalRequestKind, InboundEvent, PendingChannelOpen, VERSION_BANNER};
use crate::error::{Leg, MitmError};
use crate::identity::HostIdentity;

/// The victim-facing half of a session.
///
/// Construction completes the whole responder handshake including `none`
/// authentication, so a successfully started facade always knows the
/// username the victim asked for.
pub struct ServerFacade {
    pub(crate) username: String,
    pub(crate) handle: server::Handle,
    pub(crate) events: mpsc::UnboundedReceiver<InboundEvent>,
    /// Resolves when the underlying connection is gone; aborting it
    /// force-closes the leg.
    pub(crate) task: JoinHandle<Result<(), russh::Error>>,
}

impl ServerFacade {
    /// Run the responder handshake over an accepted connection,
    /// presenting `identity` as the host key and requiring no client
    /// authentication.
    pub async fn start(
        stream: TcpStream,
        identity: &HostIdentity,
        handshake_timeout: Duration,
        token: &CancellationToken,
    ) -> Result<Self, MitmError> {
        let config = Arc::new(server::Config {
            server_id: SshId::Standard(VERSION_BANNER.to_string()),
            methods: MethodSet::from(&[MethodKind::None][..]),
            keys: vec![identity.key().clone()],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = oneshot::channel();
        let handler = ServerHandler {
            events: event_tx,
            username: Some(user_tx),
        };

        // One deadline covers the whole responder handshake: version
        // exchange (inside run_stream), kex, and authentication.
        let deadline = tokio::time::Instant::now() + handshake_timeout;
        let running = tokio::select! {
            result = server::run_stream(config, stream, handler) => {
                result.map_err(|e| MitmError::handshake(Leg::Inbound, e))?
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(MitmError::handshake(Leg::Inbound, "handshake timed out"));
            }
            _ = token.cancelled() => return Err(MitmError::Timeout),
        };
        let handle = running.handle();
        let task = tokio::spawn(running);

        // The facade is not usable until the victim has authenticated;
        // until then the leg can still die or the session be cancelled.
        let username = tokio::select! {
            user = user_rx => user.map_err(|_| {
                MitmError::handshake(Leg::Inbound, "connection closed before authentication")
            })?,
            _ = tokio::time::sleep_until(deadline) => {
                task.abort();
                return Err(MitmError::handshake(Leg::Inbound, "handshake timed out"));
            }
            _ = token.cancelled() => {
                task.abort();
                return Err(MitmError::Timeout);
            }
        };

        debug!(
            username = %username,
            fingerprint = %identity.key().public_key().fingerprint(HashAlg::Sha256),
            "inbound handshake complete"
        );

        Ok(Self {
            username,
            handle,
            events: event_rx,
            task,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

/// Protocol callbacks for the inbound leg. Converts the callback-driven
/// connection into the facade's event stream; every decision that needs
/// both legs is deferred to the engine through a verdict slot.
struct ServerHandler {
    events: mpsc::UnboundedSender<InboundEvent>,
    username: Option<oneshot::Sender<String>>,
}

impl ServerHandler {
    /// Hand a channel-open to the engine and wait for its verdict. If the
    /// engine is gone the open is refused.
    async fn dispatch_open(
        &mut self,
        kind: ChannelOpenKind,
        channel: Channel<Msg>,
    ) -> Result<bool, russh::Error> {
        let (verdict_tx, verdict_rx) = oneshot::channel();
        let pending = PendingChannelOpen {
            kind,
            channel,
            verdict: verdict_tx,
        };
        if self.events.send(InboundEvent::ChannelOpen(pending)).is_err() {
            return Ok(false);
        }
        Ok(verdict_rx.await.unwrap_or(false))
    }

    async fn dispatch_global(&mut self, kind: GlobalRequestKind) -> Result<bool, russh::Error> {
        let (verdict_tx, verdict_rx) = oneshot::channel();
        if self
            .events
            .send(InboundEvent::GlobalRequest {
                kind,
                verdict: verdict_tx,
            })
            .is_err()
        {
            return Ok(false);
        }
        Ok(verdict_rx.await.unwrap_or(false))
    }
}

impl server::Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        // Credentials are never brokered; accepting `none` is what lets
        // an unmodified client walk straight through.
        if let Some(tx) = self.username.take() {
            let _ = tx.send(user.to_string());
        }
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.dispatch_open(ChannelOpenKind::Session, channel).await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let kind = ChannelOpenKind::DirectTcpip {
            host_to_connect: host_to_connect.to_string(),
            port_to_connect,
            originator_address: originator_address.to_string(),
            originator_port,
        };
        self.dispatch_open(kind, channel).await
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.dispatch_global(GlobalRequestKind::TcpipForward {
            address: address.to_string(),
            port: *port,
        })
        .await
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.dispatch_global(GlobalRequestKind::CancelTcpipForward {
            address: address.to_string(),
            port,
        })
        .await
    }
}
