//! The `utils` module provides the error taxonomy and the logging capability
//! shared by the delivery core, the transports and the client surface.

pub mod error;
pub mod logging;
