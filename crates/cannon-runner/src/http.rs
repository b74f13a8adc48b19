//! HTTP runner: POSTs the message body to a configured endpoint and
//! derives the exit code from the response.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use cannon_common::exit::{EXIT_NACK_REQUEUE, EXIT_TIMEOUT};
use cannon_common::Message;
use cannon_config::RunnerConfig;

use crate::{BuildError, Outcome, Runnable, RunnerError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The body shape a handler uses to signal its outcome.
#[derive(Debug, Deserialize)]
struct HandlerResponse {
    #[serde(rename = "response-code")]
    response_code: i32,
}

pub struct HttpRunner {
    url: String,
    headers: HashMap<String, String>,
    return_on_5xx: i32,
    ignore_output: bool,
    client: Client,
}

impl HttpRunner {
    pub fn new(config: &RunnerConfig) -> Result<Self, BuildError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            url: config.options.url.clone(),
            headers: config.options.headers.clone(),
            return_on_5xx: config.options.return_on_5xx,
            ignore_output: config.ignore_output,
            client,
        })
    }

    /// Default headers from the configuration overlaid with the
    /// message's own headers; the message wins on conflict.
    fn request_headers(&self, message: &Message) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(self.headers.len() + message.headers.len());
        for (key, value) in self.headers.iter().chain(&message.headers) {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %key, "skipping a header that is not valid for HTTP"),
            }
        }
        headers
    }
}

#[async_trait]
impl Runnable for HttpRunner {
    async fn process(&self, message: Message) -> Outcome {
        let headers = self.request_headers(&message);
        let request = self
            .client
            .post(&self.url)
            .headers(headers)
            .body(message.body);

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                let exit_code = if error.is_timeout() {
                    EXIT_TIMEOUT
                } else {
                    EXIT_NACK_REQUEUE
                };
                return Outcome::failed(
                    exit_code,
                    RunnerError::new(format!("request failed: {error}")),
                );
            }
        };

        let status = response.status().as_u16();
        let body = match response.bytes().await {
            Ok(body) => body.to_vec(),
            Err(error) => {
                let exit_code = if error.is_timeout() {
                    EXIT_TIMEOUT
                } else {
                    EXIT_NACK_REQUEUE
                };
                return Outcome::failed(
                    exit_code,
                    RunnerError::new(format!("failed to read the response body: {error}")),
                );
            }
        };

        if status >= 500 {
            return Outcome::failed(
                self.return_on_5xx,
                RunnerError::new("handler returned a server error")
                    .with_output(body)
                    .with_status(i32::from(status)),
            );
        }
        if status >= 400 {
            return Outcome::failed(
                EXIT_NACK_REQUEUE,
                RunnerError::new("handler returned a client error")
                    .with_output(body)
                    .with_status(i32::from(status)),
            );
        }

        if self.ignore_output || body.is_empty() {
            return Outcome::ack();
        }

        match serde_json::from_slice::<HandlerResponse>(&body) {
            Ok(handler) => Outcome::code(handler.response_code),
            Err(error) => Outcome::failed(
                EXIT_NACK_REQUEUE,
                RunnerError::new(format!("invalid handler response: {error}"))
                    .with_output(body)
                    .with_status(i32::from(status)),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cannon_common::exit::{EXIT_ACK, EXIT_FAILED, EXIT_NACK};
    use cannon_config::{RunnerKind, RunnerOptions};
    use std::time::Instant;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: String) -> RunnerConfig {
        RunnerConfig {
            kind: RunnerKind::Http,
            ignore_output: false,
            timeout: Duration::from_secs(5),
            options: RunnerOptions {
                url,
                ..Default::default()
            },
        }
    }

    fn message(body: &str) -> Message {
        Message::new(body.as_bytes().to_vec(), HashMap::new())
    }

    async fn runner_for(server: &MockServer, adjust: impl FnOnce(&mut RunnerConfig)) -> HttpRunner {
        let mut cfg = config(format!("{}/handle", server.uri()));
        adjust(&mut cfg);
        HttpRunner::new(&cfg).unwrap()
    }

    #[tokio::test]
    async fn the_response_code_comes_from_the_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/handle"))
            .and(body_string("{\"fooo\":\"bazzz\"}"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"response-code\":1}"))
            .mount(&server)
            .await;

        let runner = runner_for(&server, |_| {}).await;
        let outcome = runner.process(message("{\"fooo\":\"bazzz\"}")).await;
        assert_eq!(outcome.exit_code, EXIT_FAILED);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn an_empty_body_acks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let runner = runner_for(&server, |_| {}).await;
        let outcome = runner.process(message("{}")).await;
        assert_eq!(outcome.exit_code, EXIT_ACK);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn a_malformed_body_requeues() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json at all"))
            .mount(&server)
            .await;

        let runner = runner_for(&server, |_| {}).await;
        let outcome = runner.process(message("{}")).await;
        assert_eq!(outcome.exit_code, EXIT_NACK_REQUEUE);
        let error = outcome.error.unwrap();
        assert_eq!(error.output(), b"not json at all");
    }

    #[tokio::test]
    async fn output_is_ignored_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"response-code\":1}"))
            .mount(&server)
            .await;

        let runner = runner_for(&server, |cfg| cfg.ignore_output = true).await;
        let outcome = runner.process(message("{}")).await;
        assert_eq!(outcome.exit_code, EXIT_ACK);
    }

    #[tokio::test]
    async fn a_client_error_requeues() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(404).set_body_string("some random content here"),
            )
            .mount(&server)
            .await;

        let runner = runner_for(&server, |_| {}).await;
        let outcome = runner.process(message("{}")).await;
        assert_eq!(outcome.exit_code, EXIT_NACK_REQUEUE);
        let error = outcome.error.unwrap();
        assert_eq!(error.status_code(), 404);
        assert_eq!(error.output(), b"some random content here");
    }

    #[tokio::test]
    async fn a_server_error_returns_the_configured_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let default = runner_for(&server, |_| {}).await;
        assert_eq!(default.process(message("{}")).await.exit_code, EXIT_NACK_REQUEUE);

        let custom = runner_for(&server, |cfg| cfg.options.return_on_5xx = EXIT_NACK).await;
        let outcome = custom.process(message("{}")).await;
        assert_eq!(outcome.exit_code, EXIT_NACK);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn a_slow_handler_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_secs(4)),
            )
            .mount(&server)
            .await;

        let runner = runner_for(&server, |cfg| cfg.timeout = Duration::from_secs(1)).await;
        let started = Instant::now();
        let outcome = runner.process(message("{}")).await;
        assert_eq!(outcome.exit_code, EXIT_TIMEOUT);
        assert!(outcome.error.is_some());
        assert!(started.elapsed() < Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn message_headers_win_over_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-Token", "from-message"))
            .and(header("X-Extra", "from-config"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let runner = runner_for(&server, |cfg| {
            cfg.options.headers.insert("X-Token".into(), "from-config".into());
            cfg.options.headers.insert("X-Extra".into(), "from-config".into());
        })
        .await;

        let mut msg = message("{}");
        msg.headers.insert("X-Token".into(), "from-message".into());

        let outcome = runner.process(msg).await;
        // The mock only matches when the overlay went the right way.
        assert_eq!(outcome.exit_code, EXIT_ACK);
    }
}
