//! # retrysub
//!
//! `retrysub` is a reliability layer for publish/subscribe messaging over an
//! AMQP exchange. Every inbound message is handed to a handler under a
//! deadline; failed or timed-out messages are republished with one attempt
//! fewer, and messages that run out of attempts are routed to a dead-letter
//! exchange. Each delivery is acknowledged exactly once.
//!
//! ## Core Modules
//!
//! - `client`: `Connection`, the surface for subscribing, publishing and closing.
//! - `config`: Loads connection, delivery and logging settings.
//! - `delivery`: Header defaulting, retry policy, handler contract and the
//!   delivery coordinator.
//! - `transport`: The publish/subscribe/ack contract plus AMQP and in-memory adapters.
//! - `utils`: Error types and the logging capability.

pub mod client;
pub mod config;
pub mod delivery;
pub mod transport;
pub mod utils;

pub use client::{Connection, ConnectionOptions, Registration, Subscription};
pub use delivery::{Completion, Handler, Message, handler_fn};
