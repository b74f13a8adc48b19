//! Shared types for the cannon daemon: the message handed to runners,
//! the exit-code contract with handlers, and error aggregation.

pub mod exit;
pub mod logging;

mod error;
mod message;

pub use error::MultiError;
pub use message::Message;
