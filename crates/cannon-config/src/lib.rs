//! Configuration schema for the cannon daemon.
//!
//! The configuration file is YAML. Option keys are lenient: snake_case,
//! lowercase and (where the documented form uses them) kebab-case
//! spellings are all accepted. `${VAR}` references are substituted from
//! the process environment before parsing (see [`loader`]).

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

mod loader;

pub use loader::{load, parse};

/// Free-form `x-*` argument tables passed through to the broker.
/// Scalar coercion (64-bit integer promotion included) happens at
/// declaration time, not here.
pub type ArgTable = HashMap<String, serde_yaml::Value>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Root of the configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub rabbitmq: Option<RabbitConfig>,
}

/// Everything the rabbitmq factory needs: connections, the topology to
/// declare, and the consumers to run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RabbitConfig {
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeConfig>,
    #[serde(default, alias = "deadletters")]
    pub dead_letters: HashMap<String, DeadLetterConfig>,
    #[serde(default)]
    pub consumers: HashMap<String, ConsumerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub dsn: String,
    /// Dial timeout for one connection attempt.
    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Pause between attempts.
    #[serde(default = "default_retry_sleep", with = "humantime_serde")]
    pub sleep: Duration,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// direct, topic, fanout or headers.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: ExchangeOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExchangeOptions {
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default, alias = "autodelete", alias = "autoDelete")]
    pub auto_delete: bool,
    #[serde(default, alias = "nowait", alias = "noWait")]
    pub no_wait: bool,
    #[serde(default)]
    pub args: ArgTable,
}

/// A dead-letter queue. Declared before any queue that references it
/// through its `x-dead-letter-exchange` arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterConfig {
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub options: QueueOptions,
}

/// How a queue connects to an exchange. An empty routing key list binds
/// zero keys, which is legal for fanout exchanges.
#[derive(Debug, Clone, Deserialize)]
pub struct Binding {
    pub exchange: String,
    #[serde(default, alias = "routingkeys", alias = "routing-keys")]
    pub routing_keys: Vec<String>,
    #[serde(default)]
    pub options: BindingOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueOptions {
    #[serde(default)]
    pub durable: bool,
    #[serde(default, alias = "autodelete", alias = "autoDelete")]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default, alias = "nowait", alias = "noWait")]
    pub no_wait: bool,
    #[serde(default)]
    pub args: ArgTable,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindingOptions {
    #[serde(default, alias = "nowait", alias = "noWait")]
    pub no_wait: bool,
    #[serde(default)]
    pub args: ArgTable,
}

/// Options for the basic.consume subscription itself.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumeOptions {
    #[serde(default, alias = "autoack", alias = "autoAck", alias = "no_ack", alias = "noack")]
    pub auto_ack: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default, alias = "nolocal", alias = "noLocal")]
    pub no_local: bool,
    #[serde(default, alias = "nowait", alias = "noWait")]
    pub no_wait: bool,
    #[serde(default)]
    pub args: ArgTable,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Name of the connection this consumer's channel is opened on.
    pub connection: String,
    /// Upper bound on concurrently processed messages.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_prefetch_count", alias = "prefetchcount", alias = "prefetch-count")]
    pub prefetch_count: u16,
    /// Name of a dead_letters entry declared before this queue.
    #[serde(default, alias = "deadletter", alias = "dead-letter")]
    pub dead_letter: Option<String>,
    pub queue: QueueConfig,
    #[serde(default)]
    pub options: ConsumeOptions,
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Command,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(rename = "type")]
    pub kind: RunnerKind,
    /// Suppresses logging of handler output on success.
    #[serde(default, alias = "ignore-output", alias = "ignoreoutput")]
    pub ignore_output: bool,
    /// Per-message deadline. Applied to the worker when at least one
    /// second; also bounds the HTTP client round-trip.
    #[serde(default = "default_runner_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub options: RunnerOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerOptions {
    /// Executable for command runners. May embed leading argv tokens
    /// separated by single spaces.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Target for http runners.
    #[serde(default)]
    pub url: String,
    /// Exit code returned when the handler answers with a 5xx status.
    #[serde(
        default = "default_return_on_5xx",
        alias = "return-on-5xx",
        alias = "returnon5xx",
        alias = "return_on5xx"
    )]
    pub return_on_5xx: i32,
    /// Default request headers; message headers win on conflict.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_retry_sleep() -> Duration {
    Duration::from_millis(500)
}

fn default_retries() -> u32 {
    5
}

fn default_workers() -> usize {
    1
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_runner_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_return_on_5xx() -> i32 {
    4
}
