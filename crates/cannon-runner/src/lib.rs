//! Handler runners: pluggable processors a consumer dispatches each
//! message to. Two variants exist, a subprocess runner that pipes the
//! message body to a child process and an HTTP runner that POSTs it to
//! a configured endpoint. Both report an exit code from the shared
//! taxonomy plus an optional error carrying captured output.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use cannon_common::Message;
use cannon_config::{RunnerConfig, RunnerKind};

mod command;
mod http;
mod outcome;

pub use command::CommandRunner;
pub use http::HttpRunner;
pub use outcome::{Outcome, RunnerError};

/// A handler runner. The exit code of the returned outcome decides how
/// the delivery is settled; the error, when present, means the runner
/// could not faithfully execute the handler and carries diagnostics.
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn process(&self, message: Message) -> Outcome;
}

/// Raised while constructing a runner from its configuration.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("the command {0:?} does not exist")]
    MissingExecutable(String),

    #[error("failed to build the HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Construct the runner a consumer configuration asks for.
pub fn new_runner(config: &RunnerConfig) -> Result<Arc<dyn Runnable>, BuildError> {
    match config.kind {
        RunnerKind::Command => Ok(Arc::new(CommandRunner::new(config)?)),
        RunnerKind::Http => Ok(Arc::new(HttpRunner::new(config)?)),
    }
}
