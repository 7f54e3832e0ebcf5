//! sshmonkey
//!
//! A transparent SSH interception proxy. The engine terminates both legs
//! of the handshake itself, responder toward the victim client and
//! initiator toward the real server, then pairs channels 1:1 across the
//! legs, brokers in-channel sub-requests, and duplicates the relayed
//! plaintext to a pluggable observation sink.

pub mod config;
pub mod error;
pub mod facade;
pub mod hooks;
pub mod identity;
pub mod lifecycle;
pub mod relay;

pub use config::Config;
pub use error::{IdentityError, Leg, MitmError, Result};
pub use hooks::{ConsoleSink, MemorySink, ObservationSink};
pub use identity::HostIdentity;
pub use lifecycle::LifecycleController;
pub use relay::{RelayEngine, SessionState};
