//! The `delivery` module is the reliability core: header defaulting, the
//! retry/dead-letter policy, the handler contract and the coordinator that
//! ties one delivery attempt together.

pub mod coordinator;
pub mod handler;
pub mod headers;
pub mod message;
pub mod retry;

pub use coordinator::{AttemptState, DeliveryCoordinator};
pub use handler::{Completion, FnHandler, Handler, Outcome, handler_fn};
pub use headers::{ControlFields, HeaderDefaults, ensure_defaults};
pub use message::{Headers, Message};
pub use retry::{Exchanges, RetryAction, RetryDecision, RetryPolicy};
