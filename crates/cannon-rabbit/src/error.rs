use thiserror::Error;

#[derive(Error, Debug)]
pub enum RabbitError {
    #[error("failed to open the connection {name:?} after {attempts} attempts: {reason}")]
    ConnectionOpen {
        name: String,
        attempts: u32,
        reason: String,
    },

    #[error("the connection {0:?} is not configured; available connections: {1}")]
    UnknownConnection(String, String),

    #[error("the consumer {0:?} is not configured")]
    UnknownConsumer(String),

    #[error("failed to open a channel on the connection {name:?}: {source}")]
    ChannelOpen { name: String, source: lapin::Error },

    #[error("failed to declare the queue {queue:?}: {source}")]
    QueueDeclare { queue: String, source: lapin::Error },

    #[error("failed to declare the exchange {exchange:?}: {source}")]
    ExchangeDeclare {
        exchange: String,
        source: lapin::Error,
    },

    #[error("failed to bind the queue {queue:?} to the exchange {exchange:?}: {source}")]
    QueueBind {
        queue: String,
        exchange: String,
        source: lapin::Error,
    },

    #[error("failed to set QoS on the channel: {0}")]
    Qos(lapin::Error),

    #[error("failed to start consuming from {queue:?}: {source}")]
    Consume { queue: String, source: lapin::Error },

    #[error("failed to build the runner: {0}")]
    Runner(#[from] cannon_runner::BuildError),

    /// The broker closed the channel underneath the consumer; the
    /// delivery stream ended.
    #[error("the channel was closed by the broker")]
    ChannelClosed,

    /// A delivery arrived broken, which only happens on a channel that
    /// died with buffered deliveries.
    #[error("received a broken delivery: {0}")]
    BrokenDelivery(lapin::Error),
}
