//! One paired channel: victim-side and server-side halves wired together.

use std::sync::Arc;

use russh::server;
use russh::{Channel, ChannelMsg};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::session::RelaySession;
use crate::hooks::{Direction, ObservationSink, StreamKind, TapRecord};

enum Flow {
    Continue,
    Stop,
}

/// A victim channel and its mirrored server channel, plus everything the
/// relay worker needs to pump bytes and broker sub-requests between them.
///
/// Jointly owned by exactly one worker task. The pair dies when either
/// side closes, any forward faults, or the session scope is cancelled;
/// whichever way it dies, both sides end up closed.
pub(crate) struct ChannelPair {
    pub pair_id: u32,
    pub inbound: Channel<server::Msg>,
    pub outbound: Channel<russh::client::Msg>,
    pub server_handle: server::Handle,
    pub session: Arc<RelaySession>,
    pub sink: Arc<dyn ObservationSink>,
    pub token: CancellationToken,
}

impl ChannelPair {
    pub(crate) async fn run(self) {
        let ChannelPair {
            pair_id,
            mut inbound,
            mut outbound,
            server_handle,
            session,
            sink,
            token,
        } = self;
        let victim_id = inbound.id();
        // Brokered sub-requests awaiting the server's reply. Replies come
        // back strictly in request order, so a depth counter is enough.
        let mut pending_replies: u32 = 0;

        debug!(session_id = %session.session_id, pair_id, "channel pair established");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                msg = inbound.wait() => {
                    let Some(msg) = msg else { break };
                    match victim_message(
                        msg, pair_id, &mut outbound, &server_handle, victim_id,
                        &session, sink.as_ref(), &mut pending_replies,
                    )
                    .await
                    {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => break,
                        Err(e) => {
                            warn!(session_id = %session.session_id, pair_id, error = %e,
                                "relay fault on victim side, tearing pair down");
                            break;
                        }
                    }
                }
                msg = outbound.wait() => {
                    let Some(msg) = msg else { break };
                    match server_message(
                        msg, pair_id, &mut inbound, &server_handle, victim_id,
                        &session, sink.as_ref(), &mut pending_replies,
                    )
                    .await
                    {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => break,
                        Err(e) => {
                            warn!(session_id = %session.session_id, pair_id, error = %e,
                                "relay fault on server side, tearing pair down");
                            break;
                        }
                    }
                }
            }
        }

        // Whichever side ended first, the other must not outlive it.
        let _ = outbound.close().await;
        let _ = inbound.close().await;
        debug!(session_id = %session.session_id, pair_id, "channel pair closed");
    }
}

/// Traffic and sub-requests coming from the victim.
#[allow(clippy::too_many_arguments)]
async fn victim_message(
    msg: ChannelMsg,
    pair_id: u32,
    outbound: &mut Channel<russh::client::Msg>,
    server_handle: &server::Handle,
    victim_id: russh::ChannelId,
    session: &RelaySession,
    sink: &dyn ObservationSink,
    pending_replies: &mut u32,
) -> Result<Flow, russh::Error> {
    match msg {
        ChannelMsg::Data { data } => {
            sink.observe(TapRecord {
                direction: Direction::ClientToServer,
                stream: StreamKind::Data,
                channel: pair_id,
                bytes: &data,
            });
            session.add_bytes_up(data.len() as u64);
            outbound.data(&data[..]).await?;
        }
        ChannelMsg::ExtendedData { data, ext } => {
            sink.observe(TapRecord {
                direction: Direction::ClientToServer,
                stream: StreamKind::Stderr,
                channel: pair_id,
                bytes: &data,
            });
            session.add_bytes_up(data.len() as u64);
            outbound.extended_data(ext, &data[..]).await?;
        }
        ChannelMsg::Eof => {
            outbound.eof().await?;
        }
        ChannelMsg::Close => return Ok(Flow::Stop),
        ChannelMsg::RequestShell { want_reply } => {
            // The one sub-request actively brokered: pass it through and
            // let the server's reply decide the victim's reply.
            debug!(pair_id, "forwarding shell request");
            outbound.request_shell(want_reply).await?;
            if want_reply {
                *pending_replies += 1;
            }
        }
        // Extension point: exec, pty, env and friends would be forwarded
        // here. Until then they are refused so the victim never assumes a
        // capability the relay does not broker.
        ChannelMsg::Exec { want_reply, .. }
        | ChannelMsg::RequestPty { want_reply, .. }
        | ChannelMsg::SetEnv { want_reply, .. }
        | ChannelMsg::RequestSubsystem { want_reply, .. }
        | ChannelMsg::RequestX11 { want_reply, .. }
        | ChannelMsg::AgentForward { want_reply } => {
            debug!(pair_id, "refusing unbrokered sub-request");
            if want_reply && server_handle.channel_failure(victim_id).await.is_err() {
                return Ok(Flow::Stop);
            }
        }
        ChannelMsg::WindowChange { .. } | ChannelMsg::Signal { .. } => {
            // No reply defined for these; dropped.
            trace!(pair_id, "dropping reply-less sub-request");
        }
        other => trace!(pair_id, ?other, "ignoring victim channel message"),
    }
    Ok(Flow::Continue)
}

/// Traffic and replies coming from the real server.
#[allow(clippy::too_many_arguments)]
async fn server_message(
    msg: ChannelMsg,
    pair_id: u32,
    inbound: &mut Channel<server::Msg>,
    server_handle: &server::Handle,
    victim_id: russh::ChannelId,
    session: &RelaySession,
    sink: &dyn ObservationSink,
    pending_replies: &mut u32,
) -> Result<Flow, russh::Error> {
    match msg {
        ChannelMsg::Data { data } => {
            sink.observe(TapRecord {
                direction: Direction::ServerToClient,
                stream: StreamKind::Data,
                channel: pair_id,
                bytes: &data,
            });
            session.add_bytes_down(data.len() as u64);
            inbound.data(&data[..]).await?;
        }
        ChannelMsg::ExtendedData { data, ext } => {
            sink.observe(TapRecord {
                direction: Direction::ServerToClient,
                stream: StreamKind::Stderr,
                channel: pair_id,
                bytes: &data,
            });
            session.add_bytes_down(data.len() as u64);
            inbound.extended_data(ext, &data[..]).await?;
        }
        ChannelMsg::Eof => {
            inbound.eof().await?;
        }
        ChannelMsg::Close => return Ok(Flow::Stop),
        ChannelMsg::Success => {
            if *pending_replies > 0 {
                *pending_replies -= 1;
                if server_handle.channel_success(victim_id).await.is_err() {
                    return Ok(Flow::Stop);
                }
            } else {
                trace!(pair_id, "unsolicited success reply from server");
            }
        }
        ChannelMsg::Failure => {
            if *pending_replies > 0 {
                *pending_replies -= 1;
                if server_handle.channel_failure(victim_id).await.is_err() {
                    return Ok(Flow::Stop);
                }
            } else {
                trace!(pair_id, "unsolicited failure reply from server");
            }
        }
        // Server-side in-channel requests are logged only; forwarding
        // exit-status to the victim is a known extension point.
        ChannelMsg::ExitStatus { exit_status } => {
            debug!(pair_id, exit_status, "server reported exit status, not forwarded");
        }
        ChannelMsg::ExitSignal { ref signal_name, .. } => {
            debug!(pair_id, signal = ?signal_name, "server reported exit signal, not forwarded");
        }
        ChannelMsg::WindowAdjusted { .. } | ChannelMsg::XonXoff { .. } => {}
        other => trace!(pair_id, ?other, "ignoring server channel message"),
    }
    Ok(Flow::Continue)
}
