//! The `client` module is the application-facing surface.
//!
//! `Producer` publishes through one broker connection. `Consumer` connects to
//! every broker behind a logical address and merges their deliveries into one
//! `Subscription`; each `Message` remembers the session that delivered it so
//! it can be acknowledged there.

pub mod consumer;
pub mod fanin;
pub mod message;
pub mod producer;

pub use consumer::{Consumer, Subscription, SubscriptionSpec};
pub use message::{AckMode, Message};
pub use producer::{Producer, SendParams};
