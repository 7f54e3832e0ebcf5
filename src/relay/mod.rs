//! Channel relay between the two terminated legs.

pub mod engine;
pub(crate) mod pair;
pub mod session;

pub use engine::RelayEngine;
pub use session::{RelaySession, SessionState};
