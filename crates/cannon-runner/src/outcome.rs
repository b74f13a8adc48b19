use std::fmt;

use cannon_common::exit::EXIT_ACK;

/// Raised when a runner could not faithfully execute its handler.
/// Carries the captured handler output and a status code for
/// diagnostics (HTTP status or process exit status).
#[derive(Debug, Default)]
pub struct RunnerError {
    message: String,
    output: Vec<u8>,
    status_code: i32,
}

impl RunnerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: Vec<u8>) -> Self {
        self.output = output;
        self
    }

    pub fn with_status(mut self, status_code: i32) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn status_code(&self) -> i32 {
        self.status_code
    }
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.status_code != 0 {
            write!(f, "{} (status {})", self.message, self.status_code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for RunnerError {}

/// What a runner reports back for one message.
#[derive(Debug)]
pub struct Outcome {
    pub exit_code: i32,
    pub error: Option<RunnerError>,
}

impl Outcome {
    /// The message was handled; acknowledge it.
    pub fn ack() -> Self {
        Self {
            exit_code: EXIT_ACK,
            error: None,
        }
    }

    /// The handler signalled an exit code without a runner failure.
    pub fn code(exit_code: i32) -> Self {
        Self {
            exit_code,
            error: None,
        }
    }

    /// The runner failed; the exit code tells the dispatcher how to
    /// settle the delivery.
    pub fn failed(exit_code: i32, error: RunnerError) -> Self {
        Self {
            exit_code,
            error: Some(error),
        }
    }
}
