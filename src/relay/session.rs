//! Per-session bookkeeping: state machine position and byte counters.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, info};

/// Where one intercepted session is in its life.
///
/// The path is strictly linear; any handshake failure jumps straight to
/// `Closed` without ever relaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ServerHandshaking,
    ClientHandshaking,
    Relaying,
    Draining,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::ServerHandshaking => "server-handshaking",
            SessionState::ClientHandshaking => "client-handshaking",
            SessionState::Relaying => "relaying",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One intercepted connection pair.
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub victim_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub start_time: Instant,
    state: Mutex<SessionState>,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl RelaySession {
    pub fn new(session_id: String, victim_addr: SocketAddr, server_addr: SocketAddr) -> Self {
        debug!(
            session_id = %session_id,
            victim = %victim_addr,
            server = %server_addr,
            "creating session"
        );
        Self {
            session_id,
            victim_addr,
            server_addr,
            start_time: Instant::now(),
            state: Mutex::new(SessionState::Idle),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!(session_id = %self.session_id, from = %state, to = %next, "state transition");
            *state = next;
        }
    }

    /// Victim-to-server bytes observed so far.
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Server-to-victim bytes observed so far.
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// One summary line when the session reaches `Closed`.
    pub fn log_summary(&self, username: Option<&str>) {
        info!(
            session_id = %self.session_id,
            victim = %self.victim_addr,
            server = %self.server_addr,
            username = username,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            "session closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> RelaySession {
        RelaySession::new(
            "test".into(),
            "127.0.0.1:1111".parse().unwrap(),
            "127.0.0.1:22".parse().unwrap(),
        )
    }

    #[test]
    fn starts_idle() {
        assert_eq!(session().state(), SessionState::Idle);
    }

    #[test]
    fn counters_accumulate() {
        let s = session();
        s.add_bytes_up(5);
        s.add_bytes_up(3);
        s.add_bytes_down(7);
        assert_eq!(s.bytes_up(), 8);
        assert_eq!(s.bytes_down(), 7);
    }

    #[test]
    fn state_transitions_are_recorded() {
        let s = session();
        s.set_state(SessionState::ServerHandshaking);
        s.set_state(SessionState::Relaying);
        assert_eq!(s.state(), SessionState::Relaying);
    }
}
