//! # StompSub
//!
//! `stompsub` is a resilient STOMP client. It publishes to and consumes from a
//! broker reachable under a logical address, and keeps working across dropped
//! connections without the application writing reconnect logic.
//!
//! ## Core Modules
//!
//! - `transport`: STOMP frames and codec, the protocol engine, name resolution
//!   and TCP/TLS dialing.
//! - `broker`: one session to one broker endpoint, its reconnect state machine
//!   and the retry-on-send wrapper.
//! - `client`: `Producer`, the multi-broker `Consumer` and `Message` handles.
//! - `config`: loading settings from files and the environment.
//! - `utils`: the error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use broker::{ConnectionLostHandler, ConnectionParameters, FixedDelayReconnect, RecoveryPolicy};
pub use client::{AckMode, Consumer, Message, Producer, SendParams, Subscription};
pub use utils::{Error, Result};
