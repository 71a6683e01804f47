//! The `broker` module manages the connection to a single broker endpoint.
//!
//! A `BrokerSession` owns one protocol session and knows how to replace it.
//! Operations on it run through `retry_on_send`, which hands lost connections
//! to the `ConnectionLostHandler` configured in `ConnectionParameters` and
//! tries again once the handler returns.

pub mod handler;
pub mod params;
pub mod retry;
pub mod session;

pub use handler::{ConnectionLostHandler, FixedDelayReconnect};
pub use params::ConnectionParameters;
pub use retry::{Outcome, RecoveryPolicy, retry_on_send};
pub use session::{BrokerSession, SessionState};
