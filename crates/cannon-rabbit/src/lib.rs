//! The rabbitmq side of the daemon: named connections with retry and
//! reopen, idempotent topology declaration, the consumer dispatch
//! engine and the factory the supervisor reincarnates consumers
//! through.

mod consumer;
mod error;
mod factory;
mod header;
mod pool;
mod topology;

pub use consumer::RabbitConsumer;
pub use error::RabbitError;
pub use factory::{RabbitFactory, FACTORY_NAME};
pub use pool::ConnectionPool;

pub type Result<T> = std::result::Result<T, RabbitError>;
