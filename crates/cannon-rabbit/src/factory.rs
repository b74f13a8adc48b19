//! The rabbitmq factory: owns the connection pool and the declared
//! consumer configurations, and constructs consumers on demand. It is
//! the identity the supervisor uses to reincarnate dead consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use cannon_config::{ConsumerConfig, RabbitConfig};
use cannon_runner::new_runner;
use cannon_supervisor::Consumer;

use crate::consumer::RabbitConsumer;
use crate::pool::ConnectionPool;
use crate::topology::declare_consumer_topology;
use crate::{RabbitError, Result};

pub const FACTORY_NAME: &str = "rabbitmq";

pub struct RabbitFactory {
    config: RabbitConfig,
    // The supervisor serializes all factory calls, the lock only
    // satisfies the shared-reference seam.
    pool: Mutex<ConnectionPool>,
    counter: AtomicU64,
}

impl RabbitFactory {
    /// Opens every configured connection; a connection that stays
    /// unreachable past its retry budget fails the whole factory.
    pub async fn create(config: RabbitConfig) -> Result<Self> {
        let pool = ConnectionPool::open(&config.connections).await?;
        Ok(Self {
            config,
            pool: Mutex::new(pool),
            counter: AtomicU64::new(0),
        })
    }

    async fn new_consumer(&self, name: &str, config: &ConsumerConfig) -> Result<RabbitConsumer> {
        debug!(connection = %config.connection, consumer = %name, "opening a channel");
        let channel = self.pool.lock().await.get_channel(&config.connection).await?;

        declare_consumer_topology(&channel, name, config, &self.config).await?;

        let runner = new_runner(&config.runner)?;

        let number = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let tag = format!("{}-{}-{}", FACTORY_NAME, name, encode_tag(number));

        Ok(RabbitConsumer::new(
            name.to_string(),
            FACTORY_NAME.to_string(),
            tag,
            config.queue.name.clone(),
            channel,
            runner,
            config.options.clone(),
            config.workers,
            config.runner.timeout,
        ))
    }
}

#[async_trait]
impl cannon_supervisor::Factory for RabbitFactory {
    async fn create_consumers(&self) -> anyhow::Result<Vec<Arc<dyn Consumer>>> {
        let mut consumers: Vec<Arc<dyn Consumer>> = Vec::with_capacity(self.config.consumers.len());
        for (name, config) in &self.config.consumers {
            let consumer = self.new_consumer(name, config).await?;
            consumers.push(Arc::new(consumer));
        }
        Ok(consumers)
    }

    async fn create_consumer(&self, name: &str) -> anyhow::Result<Arc<dyn Consumer>> {
        let config = self
            .config
            .consumers
            .get(name)
            .ok_or_else(|| RabbitError::UnknownConsumer(name.to_string()))?;
        let consumer = self.new_consumer(name, config).await?;
        Ok(Arc::new(consumer))
    }

    fn name(&self) -> &str {
        FACTORY_NAME
    }
}

/// Short base36 form of the per-factory monotonic counter; together
/// with the factory and consumer names it keeps tags unique across the
/// process lifetime.
fn encode_tag(mut number: u64) -> String {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut encoded = Vec::new();
    loop {
        encoded.push(ALPHABET[(number % 36) as usize]);
        number /= 36;
        if number == 0 {
            break;
        }
    }
    encoded.reverse();
    String::from_utf8_lossy(&encoded).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn encoded_tags_stay_unique() {
        let tags: HashSet<String> = (1..=1000).map(encode_tag).collect();
        assert_eq!(tags.len(), 1000);
    }

    #[test]
    fn encoding_is_base36() {
        assert_eq!(encode_tag(1), "1");
        assert_eq!(encode_tag(35), "z");
        assert_eq!(encode_tag(36), "10");
    }
}
