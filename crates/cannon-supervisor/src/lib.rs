//! Consumer supervision: tracks every running consumer, detects dead
//! ones on a periodic tick and asks their originating factory to
//! recreate them.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use cannon_common::MultiError;

mod manager;

pub use manager::Manager;

/// Creates consumers. The factory name is the identity the supervisor
/// uses to reincarnate a dead consumer; consumers only carry the name,
/// never a reference back to the factory.
#[async_trait]
pub trait Factory: Send + Sync {
    /// Create every configured consumer. Returns on the first failure.
    async fn create_consumers(&self) -> anyhow::Result<Vec<Arc<dyn Consumer>>>;

    /// Create the named consumer again, reopening channels and
    /// redeclaring topology as needed.
    async fn create_consumer(&self, name: &str) -> anyhow::Result<Arc<dyn Consumer>>;

    fn name(&self) -> &str;
}

/// A running consumer as the supervisor sees it.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Start the dispatch loop. Idempotent.
    fn run(&self);

    /// Stop the dispatch loop, wait for in-flight work to drain and
    /// return any residual dispatch error. Idempotent.
    async fn kill(&self) -> anyhow::Result<()>;

    /// False once the dispatch loop has returned and the channel is
    /// closed.
    fn alive(&self) -> bool;

    fn name(&self) -> &str;

    fn factory_name(&self) -> &str;
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The single-writer state task is gone; the supervisor cannot
    /// accept operations anymore.
    #[error("the supervisor state task is no longer running")]
    Closed,

    #[error(transparent)]
    Factory(#[from] anyhow::Error),

    #[error(transparent)]
    Stop(#[from] MultiError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
