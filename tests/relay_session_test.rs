//! End-to-end interception tests: a real russh client on one side, a
//! real russh server on the other, the engine in between.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::client::AuthResult;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::Algorithm;
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use sshmonkey::{HostIdentity, MemorySink, RelayEngine};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Knobs for the stand-in real server.
#[derive(Clone, Copy)]
struct UpstreamBehavior {
    /// Whether session channel-opens are confirmed or refused.
    accept_session: bool,
    /// Whether receiving data that starts with `die` kills the connection.
    drop_on_die: bool,
    /// Whether session channel-opens are left unanswered forever.
    stall_opens: bool,
}

impl Default for UpstreamBehavior {
    fn default() -> Self {
        Self {
            accept_session: true,
            drop_on_die: false,
            stall_opens: false,
        }
    }
}

/// A minimal real server: accepts `none` auth, confirms shell requests,
/// and answers `echo <text>` with `<text>`.
struct UpstreamHandler {
    behavior: UpstreamBehavior,
    session_opens: Arc<AtomicUsize>,
}

impl russh::server::Handler for UpstreamHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.session_opens.fetch_add(1, Ordering::SeqCst);
        if self.behavior.stall_opens {
            std::future::pending::<()>().await;
        }
        Ok(self.behavior.accept_session)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let handle = session.handle();
        tokio::spawn(async move {
            let _ = handle.channel_success(channel).await;
        });
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.behavior.drop_on_die && data.starts_with(b"die") {
            return Err(russh::Error::Disconnect);
        }
        if let Some(rest) = data.strip_prefix(b"echo ") {
            let reply = CryptoVec::from_slice(rest);
            let handle = session.handle();
            tokio::spawn(async move {
                let _ = handle.data(channel, reply).await;
            });
        }
        Ok(())
    }
}

/// Bind an ephemeral upstream server and serve connections forever.
/// The counter records every session channel-open that reaches it.
async fn spawn_upstream(behavior: UpstreamBehavior) -> (SocketAddr, Arc<AtomicUsize>) {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let config = Arc::new(russh::server::Config {
        methods: MethodSet::from(&[MethodKind::None][..]),
        keys: vec![key],
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    });
    let session_opens = Arc::new(AtomicUsize::new(0));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let opens = session_opens.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let config = config.clone();
            let handler = UpstreamHandler {
                behavior,
                session_opens: opens.clone(),
            };
            tokio::spawn(async move {
                if let Ok(session) = russh::server::run_stream(config, stream, handler).await {
                    let _ = session.await;
                }
            });
        }
    });
    (addr, session_opens)
}

fn test_engine(sink: Option<Arc<MemorySink>>) -> Arc<RelayEngine> {
    let identity = HostIdentity::generate_ed25519().unwrap();
    let mut engine = RelayEngine::new()
        .with_identity(identity)
        .with_handshake_timeout(Duration::from_secs(10));
    if let Some(sink) = sink {
        engine = engine.with_sink(sink);
    }
    Arc::new(engine)
}

/// Bind an ephemeral proxy port, accept exactly one victim connection,
/// and run one interception session for it. Returns the port and the
/// session's eventual outcome.
async fn spawn_proxy(
    engine: Arc<RelayEngine>,
    upstream: SocketAddr,
    token: CancellationToken,
) -> (SocketAddr, JoinHandle<sshmonkey::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (victim, _) = listener.accept().await.unwrap();
        let outbound = TcpStream::connect(upstream).await.unwrap();
        engine.relay(&token, victim, outbound).await
    });
    (addr, task)
}

struct VictimHandler;

impl russh::client::Handler for VictimHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn connect_victim(proxy: SocketAddr) -> russh::client::Handle<VictimHandler> {
    let config = Arc::new(russh::client::Config::default());
    let mut handle = russh::client::connect(config, proxy, VictimHandler)
        .await
        .unwrap();
    let auth = handle.authenticate_none("intercepted").await.unwrap();
    assert!(matches!(auth, AuthResult::Success), "none auth must pass");
    handle
}

/// Drain channel messages until a reply to the last sub-request arrives.
async fn await_reply(channel: &mut Channel<russh::client::Msg>) -> bool {
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Success => return true,
            ChannelMsg::Failure => return false,
            _ => continue,
        }
    }
    panic!("channel closed before the sub-request was answered");
}

async fn read_until_newline(channel: &mut Channel<russh::client::Msg>) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(msg) = channel.wait().await {
        if let ChannelMsg::Data { data } = msg {
            out.extend_from_slice(&data);
            if out.ends_with(b"\n") {
                break;
            }
        }
    }
    out
}

#[tokio::test]
async fn shell_echo_round_trip_is_relayed_and_observed() {
    timeout(TEST_TIMEOUT, async {
        let (upstream, _) = spawn_upstream(UpstreamBehavior::default()).await;
        let sink = Arc::new(MemorySink::new());
        let engine = test_engine(Some(sink.clone()));
        let token = CancellationToken::new();
        let (proxy, session) = spawn_proxy(engine, upstream, token.clone()).await;

        let mut handle = connect_victim(proxy).await;
        let mut channel = handle.channel_open_session().await.unwrap();

        channel.request_shell(true).await.unwrap();
        assert!(await_reply(&mut channel).await, "shell must be confirmed");

        channel.data(&b"echo hi\n"[..]).await.unwrap();
        assert_eq!(read_until_newline(&mut channel).await, b"hi\n");

        // Both directions of the plaintext were duplicated to the sink.
        assert_eq!(sink.client_to_server(), b"echo hi\n");
        assert_eq!(sink.server_to_client(), b"hi\n");

        token.cancel();
        assert!(session.await.unwrap().is_ok());
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn upstream_refusal_propagates_to_the_victim() {
    timeout(TEST_TIMEOUT, async {
        let (upstream, _) = spawn_upstream(UpstreamBehavior {
            accept_session: false,
            ..Default::default()
        })
        .await;
        let engine = test_engine(None);
        let token = CancellationToken::new();
        let (proxy, session) = spawn_proxy(engine, upstream, token.clone()).await;

        let mut handle = connect_victim(proxy).await;
        // The real server refuses the mirrored open, so the victim's open
        // fails too. The session itself stays up.
        assert!(handle.channel_open_session().await.is_err());

        token.cancel();
        assert!(session.await.unwrap().is_ok());
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn non_shell_sub_requests_are_refused() {
    timeout(TEST_TIMEOUT, async {
        let (upstream, _) = spawn_upstream(UpstreamBehavior::default()).await;
        let engine = test_engine(None);
        let token = CancellationToken::new();
        let (proxy, session) = spawn_proxy(engine, upstream, token.clone()).await;

        let mut handle = connect_victim(proxy).await;
        let mut channel = handle.channel_open_session().await.unwrap();

        channel.exec(true, "ls /").await.unwrap();
        assert!(
            !await_reply(&mut channel).await,
            "exec must be answered with a failure, not forwarded"
        );

        // The same channel still brokers a shell afterwards.
        channel.request_shell(true).await.unwrap();
        assert!(await_reply(&mut channel).await);

        token.cancel();
        assert!(session.await.unwrap().is_ok());
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn upstream_death_surfaces_as_outbound_error() {
    timeout(TEST_TIMEOUT, async {
        let (upstream, _) = spawn_upstream(UpstreamBehavior {
            drop_on_die: true,
            ..Default::default()
        })
        .await;
        let engine = test_engine(None);
        let token = CancellationToken::new();
        let (proxy, session) = spawn_proxy(engine, upstream, token).await;

        let mut handle = connect_victim(proxy).await;
        let mut channel = handle.channel_open_session().await.unwrap();
        channel.data(&b"die\n"[..]).await.unwrap();

        let outcome = session.await.unwrap();
        let err = outcome.expect_err("a dead real server is a session error");
        assert!(
            err.to_string().contains("outbound"),
            "error should name the outbound leg: {}",
            err
        );
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn cancellation_closes_the_session_cleanly() {
    timeout(TEST_TIMEOUT, async {
        let (upstream, _) = spawn_upstream(UpstreamBehavior::default()).await;
        let engine = test_engine(None);
        let token = CancellationToken::new();
        let (proxy, session) = spawn_proxy(engine, upstream, token.clone()).await;

        let mut handle = connect_victim(proxy).await;
        let mut channel = handle.channel_open_session().await.unwrap();
        channel.request_shell(true).await.unwrap();
        assert!(await_reply(&mut channel).await);

        token.cancel();
        // Cancellation is a normal termination, not an error, and it must
        // not hang waiting on either leg.
        assert!(session.await.unwrap().is_ok());
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn handshake_timeout_rejects_a_silent_victim() {
    timeout(TEST_TIMEOUT, async {
        let (upstream, _) = spawn_upstream(UpstreamBehavior::default()).await;
        let identity = HostIdentity::generate_ed25519().unwrap();
        let engine = Arc::new(
            RelayEngine::new()
                .with_identity(identity)
                .with_handshake_timeout(Duration::from_millis(500)),
        );
        let token = CancellationToken::new();
        let (proxy, session) = spawn_proxy(engine, upstream, token).await;

        // Connect and say nothing.
        let _victim = TcpStream::connect(proxy).await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = session.await.unwrap();
        assert!(outcome.is_err(), "a silent victim must not hold a session");
        // One deadline spans the whole handshake; the phases must not
        // each get their own full allowance.
        assert!(
            started.elapsed() < Duration::from_millis(900),
            "handshake timeout took {:?}, more than one budget",
            started.elapsed()
        );
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn cancellation_wins_while_a_mirror_open_is_stalled() {
    timeout(TEST_TIMEOUT, async {
        let (upstream, upstream_opens) = spawn_upstream(UpstreamBehavior {
            stall_opens: true,
            ..Default::default()
        })
        .await;
        let engine = test_engine(None);
        let token = CancellationToken::new();
        let (proxy, session) = spawn_proxy(engine, upstream, token.clone()).await;

        let mut handle = connect_victim(proxy).await;
        // The mirrored open reaches a server that never answers, so this
        // never resolves; drive it from a side task.
        let open_attempt = tokio::spawn(async move { handle.channel_open_session().await });

        // Wait until the stalled mirror is actually in flight.
        while upstream_opens.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        token.cancel();

        let outcome = timeout(Duration::from_secs(10), session)
            .await
            .expect("session must close promptly after cancellation")
            .unwrap();
        assert!(outcome.is_ok());
        open_attempt.abort();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn unbrokered_open_kinds_are_rejected_without_an_outbound_attempt() {
    timeout(TEST_TIMEOUT, async {
        let (upstream, upstream_opens) = spawn_upstream(UpstreamBehavior::default()).await;
        let engine = test_engine(None);
        let token = CancellationToken::new();
        let (proxy, session) = spawn_proxy(engine, upstream, token.clone()).await;

        let mut handle = connect_victim(proxy).await;

        // Not a kind the relay mirrors; refused at the protocol layer
        // before any outbound open is attempted.
        assert!(handle
            .channel_open_direct_streamlocal("/var/run/agent.sock")
            .await
            .is_err());
        assert_eq!(upstream_opens.load(Ordering::SeqCst), 0);

        // The session is unharmed and still pairs ordinary opens.
        assert!(handle.channel_open_session().await.is_ok());
        assert_eq!(upstream_opens.load(Ordering::SeqCst), 1);

        token.cancel();
        assert!(session.await.unwrap().is_ok());
    })
    .await
    .unwrap();
}
