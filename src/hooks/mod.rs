//! Pluggable observation of relayed plaintext.
//!
//! Every byte that crosses an intercepted channel is duplicated to an
//! [`ObservationSink`] tagged with its direction, stream kind, and channel
//! id. Sinks must not block the relay path: buffer or drop under
//! backpressure rather than stall the proxied session.

use std::sync::Mutex;

use tracing::info;

/// Which way the observed bytes were travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client->server"),
            Direction::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// Which sub-stream of the channel carried them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// The main data stream (stdin/stdout of a shell).
    Data,
    /// The auxiliary error stream (stderr).
    Stderr,
}

/// One observed slice of plaintext.
#[derive(Debug, Clone, Copy)]
pub struct TapRecord<'a> {
    pub direction: Direction,
    pub stream: StreamKind,
    /// Channel id on the victim-facing leg, stable for the pair's lifetime.
    pub channel: u32,
    pub bytes: &'a [u8],
}

/// Capability receiving a copy of relayed plaintext.
///
/// Shared read-only across all relay workers of a session; impls must be
/// safe for concurrent calls and must return promptly.
pub trait ObservationSink: Send + Sync {
    fn observe(&self, tap: TapRecord<'_>);
}

/// Default sink: renders each tap to the log, printable text verbatim and
/// binary payloads as hex.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ObservationSink for ConsoleSink {
    fn observe(&self, tap: TapRecord<'_>) {
        info!(
            direction = %tap.direction,
            stream = ?tap.stream,
            channel = tap.channel,
            len = tap.bytes.len(),
            "tap: {}",
            render(tap.bytes)
        );
    }
}

fn render(bytes: &[u8]) -> String {
    if bytes.iter().all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace()) {
        String::from_utf8_lossy(bytes).trim_end().to_string()
    } else {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Buffering sink that concatenates everything seen per direction.
/// Used by tests and by embedders that post-process captures.
#[derive(Debug, Default)]
pub struct MemorySink {
    client_to_server: Mutex<Vec<u8>>,
    server_to_client: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_to_server(&self) -> Vec<u8> {
        self.client_to_server.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn server_to_client(&self) -> Vec<u8> {
        self.server_to_client.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ObservationSink for MemorySink {
    fn observe(&self, tap: TapRecord<'_>) {
        let buf = match tap.direction {
            Direction::ClientToServer => &self.client_to_server,
            Direction::ServerToClient => &self.server_to_client,
        };
        buf.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(tap.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_separates_directions() {
        let sink = MemorySink::new();
        sink.observe(TapRecord {
            direction: Direction::ClientToServer,
            stream: StreamKind::Data,
            channel: 0,
            bytes: b"up",
        });
        sink.observe(TapRecord {
            direction: Direction::ServerToClient,
            stream: StreamKind::Stderr,
            channel: 0,
            bytes: b"down",
        });
        assert_eq!(sink.client_to_server(), b"up");
        assert_eq!(sink.server_to_client(), b"down");
    }

    #[test]
    fn render_falls_back_to_hex_for_binary() {
        assert_eq!(render(b"ls /\n"), "ls /");
        assert_eq!(render(&[0x00, 0xff]), "00ff");
    }
}
