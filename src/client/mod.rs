//! The `client` module is the surface callers use: open a connection, register
//! handlers for routing keys, publish messages and close.

pub mod connection;

pub use connection::{Connection, ConnectionOptions, Registration, Subscription};

#[cfg(test)]
mod tests;
