//! Subprocess runner: spawns a configured executable per message and
//! streams the message body to its standard input.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use cannon_common::exit::{EXIT_NACK_REQUEUE, EXIT_TIMEOUT};
use cannon_common::Message;
use cannon_config::RunnerConfig;

use crate::{BuildError, Outcome, Runnable, RunnerError};

#[derive(Debug)]
pub struct CommandRunner {
    path: String,
    args: Vec<String>,
    ignore_output: bool,
}

impl CommandRunner {
    /// Checks once, at construction, that the executable exists.
    /// Leading argv tokens embedded in the configured path are split
    /// off and prepended to the configured arguments.
    pub fn new(config: &RunnerConfig) -> Result<Self, BuildError> {
        let mut path = config.options.path.clone();
        let mut args = config.options.args.clone();

        if let Some((executable, embedded)) = path.split_once(' ') {
            let mut lead: Vec<String> = embedded.split(' ').map(str::to_string).collect();
            lead.extend(args);
            args = lead;
            path = executable.to_string();
        }

        if !Path::new(&path).exists() {
            return Err(BuildError::MissingExecutable(path));
        }

        Ok(Self {
            path,
            args,
            ignore_output: config.ignore_output,
        })
    }
}

#[async_trait]
impl Runnable for CommandRunner {
    async fn process(&self, message: Message) -> Outcome {
        // kill_on_drop terminates the child when the worker's deadline
        // lapses and this future is dropped.
        let spawned = Command::new(&self.path)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(error) => {
                return Outcome::failed(
                    EXIT_NACK_REQUEUE,
                    RunnerError::new(format!("failed to spawn {:?}: {error}", self.path)),
                );
            }
        };

        // Stream the body from a separate task so a child that talks
        // before reading everything cannot deadlock against us; the
        // drop at the end of the task closes the child's stdin.
        if let Some(mut stdin) = child.stdin.take() {
            let body = message.body;
            tokio::spawn(async move {
                if let Err(error) = stdin.write_all(&body).await {
                    warn!(error = %error, "failed to stream the message body to the handler");
                }
            });
        }

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(error) => {
                return Outcome::failed(
                    EXIT_NACK_REQUEUE,
                    RunnerError::new(format!("failed to wait for {:?}: {error}", self.path)),
                );
            }
        };

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        match output.status.code() {
            Some(0) => {
                if !self.ignore_output && !combined.is_empty() {
                    info!(
                        output = %String::from_utf8_lossy(&combined),
                        "message processed with output"
                    );
                }
                Outcome::ack()
            }
            Some(code) => Outcome::failed(
                code,
                RunnerError::new("handler exited with a non-zero status")
                    .with_output(combined)
                    .with_status(code),
            ),
            // No exit status means the child was terminated by a
            // signal; the per-message deadline is the only thing that
            // kills handlers.
            None => Outcome::failed(
                EXIT_TIMEOUT,
                RunnerError::new("handler was terminated by a signal")
                    .with_output(combined)
                    .with_status(EXIT_TIMEOUT),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cannon_config::{RunnerKind, RunnerOptions};
    use std::collections::HashMap;
    use std::time::Duration;

    fn config(path: &str, args: &[&str]) -> RunnerConfig {
        RunnerConfig {
            kind: RunnerKind::Command,
            ignore_output: false,
            timeout: Duration::from_secs(5),
            options: RunnerOptions {
                path: path.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        }
    }

    fn message(body: &str) -> Message {
        Message::new(body.as_bytes().to_vec(), HashMap::new())
    }

    #[test]
    fn construction_fails_for_a_missing_executable() {
        let error = CommandRunner::new(&config("/does/not/exist", &[])).unwrap_err();
        assert!(matches!(error, BuildError::MissingExecutable(_)));
    }

    #[test]
    fn leading_argv_tokens_in_the_path_are_split() {
        let runner = CommandRunner::new(&config("/bin/sh -c", &["exit 0"])).unwrap();
        assert_eq!(runner.path, "/bin/sh");
        assert_eq!(runner.args, vec!["-c", "exit 0"]);
    }

    #[tokio::test]
    async fn a_clean_exit_acks() {
        let runner = CommandRunner::new(&config("/bin/sh", &["-c", "exit 0"])).unwrap();
        let outcome = runner.process(message("{}")).await;
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn the_exit_status_passes_through() {
        let runner = CommandRunner::new(&config("/bin/sh", &["-c", "echo boom >&2; exit 5"])).unwrap();
        let outcome = runner.process(message("{}")).await;
        assert_eq!(outcome.exit_code, 5);
        let error = outcome.error.unwrap();
        assert_eq!(error.status_code(), 5);
        assert!(String::from_utf8_lossy(error.output()).contains("boom"));
    }

    #[tokio::test]
    async fn the_body_is_streamed_to_stdin() {
        let runner = CommandRunner::new(&config("/bin/sh", &["-c", "grep -q fooo"])).unwrap();
        let hit = runner.process(message("{\"fooo\":\"bazzz\"}")).await;
        assert_eq!(hit.exit_code, 0);

        let miss = runner.process(message("{\"other\":1}")).await;
        assert_eq!(miss.exit_code, 1);
    }

    #[tokio::test]
    async fn a_signalled_child_reports_a_timeout() {
        let runner = CommandRunner::new(&config("/bin/sh", &["-c", "kill -TERM $$"])).unwrap();
        let outcome = runner.process(message("")).await;
        assert_eq!(outcome.exit_code, EXIT_TIMEOUT);
        assert!(outcome.error.is_some());
    }
}
