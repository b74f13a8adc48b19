//! Topology declaration for one consumer, in the order the broker's
//! prerequisite graph requires: dead-letter queues first, then the
//! primary queue, then each binding's exchange followed by its binds,
//! then QoS.
//!
//! Declarations are idempotent on the broker side, but every fresh
//! channel redeclares to guarantee visibility after reconnects.

use lapin::options::{
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldArray, FieldTable};
use lapin::{Channel, ExchangeKind};
use tracing::{debug, warn};

use cannon_config::{ArgTable, ConsumerConfig, QueueConfig, RabbitConfig};

use crate::{RabbitError, Result};

pub(crate) async fn declare_consumer_topology(
    channel: &Channel,
    name: &str,
    config: &ConsumerConfig,
    rabbit: &RabbitConfig,
) -> Result<()> {
    // A dead-letter queue must exist before any queue referencing it
    // through its x-dead-letter arguments.
    if let Some(dead_letter) = &config.dead_letter {
        match rabbit.dead_letters.get(dead_letter) {
            Some(entry) => declare_queue(channel, &entry.queue).await?,
            None => warn!(
                dead_letter = %dead_letter,
                consumer = %name,
                "dead letter config is missing, declaration continues"
            ),
        }
    }

    declare_queue(channel, &config.queue).await?;

    for binding in &config.queue.bindings {
        declare_exchange(channel, &binding.exchange, rabbit).await?;
        // An empty key list binds nothing, which is legal for fanout
        // exchanges where the exchange type supersedes the key.
        for routing_key in &binding.routing_keys {
            channel
                .queue_bind(
                    &config.queue.name,
                    &binding.exchange,
                    routing_key,
                    QueueBindOptions {
                        nowait: binding.options.no_wait,
                    },
                    to_field_table(&binding.options.args),
                )
                .await
                .map_err(|source| RabbitError::QueueBind {
                    queue: config.queue.name.clone(),
                    exchange: binding.exchange.clone(),
                    source,
                })?;
        }
    }

    debug!(consumer = %name, prefetch = config.prefetch_count, "setting QoS");
    channel
        .basic_qos(config.prefetch_count, BasicQosOptions::default())
        .await
        .map_err(RabbitError::Qos)?;

    Ok(())
}

async fn declare_queue(channel: &Channel, queue: &QueueConfig) -> Result<()> {
    debug!(queue = %queue.name, "declaring a queue");
    channel
        .queue_declare(
            &queue.name,
            QueueDeclareOptions {
                durable: queue.options.durable,
                auto_delete: queue.options.auto_delete,
                exclusive: queue.options.exclusive,
                nowait: queue.options.no_wait,
                passive: false,
            },
            to_field_table(&queue.options.args),
        )
        .await
        .map_err(|source| RabbitError::QueueDeclare {
            queue: queue.name.clone(),
            source,
        })?;
    Ok(())
}

async fn declare_exchange(channel: &Channel, name: &str, rabbit: &RabbitConfig) -> Result<()> {
    if name.is_empty() {
        warn!("a binding references an empty exchange name, wrong config?");
        return Ok(());
    }
    let Some(exchange) = rabbit.exchanges.get(name) else {
        warn!(exchange = %name, "exchange config is missing, declaration continues");
        return Ok(());
    };

    debug!(exchange = %name, kind = %exchange.kind, "declaring an exchange");
    channel
        .exchange_declare(
            name,
            exchange_kind(&exchange.kind),
            ExchangeDeclareOptions {
                durable: exchange.options.durable,
                auto_delete: exchange.options.auto_delete,
                internal: exchange.options.internal,
                nowait: exchange.options.no_wait,
                passive: false,
            },
            to_field_table(&exchange.options.args),
        )
        .await
        .map_err(|source| RabbitError::ExchangeDeclare {
            exchange: name.to_string(),
            source,
        })?;
    Ok(())
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "topic" => ExchangeKind::Topic,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        custom => ExchangeKind::Custom(custom.to_string()),
    }
}

/// Converts a configured argument table to the wire representation.
/// The protocol is strict about integer widths, so every integer is
/// promoted to 64-bit signed before submission.
pub(crate) fn to_field_table(args: &ArgTable) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        match to_amqp_value(value) {
            Some(value) => table.insert(key.as_str().into(), value),
            None => warn!(key = %key, "unsupported argument value, skipping"),
        }
    }
    table
}

fn to_amqp_value(value: &serde_yaml::Value) -> Option<AMQPValue> {
    use serde_yaml::Value;

    match value {
        Value::Null => Some(AMQPValue::Void),
        Value::Bool(value) => Some(AMQPValue::Boolean(*value)),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Some(AMQPValue::LongLongInt(int))
            } else if let Some(int) = number.as_u64() {
                i64::try_from(int).ok().map(AMQPValue::LongLongInt)
            } else {
                number.as_f64().map(AMQPValue::Double)
            }
        }
        Value::String(value) => Some(AMQPValue::LongString(value.as_str().into())),
        Value::Sequence(values) => {
            let mut array = FieldArray::default();
            for value in values {
                array.push(to_amqp_value(value)?);
            }
            Some(AMQPValue::FieldArray(array))
        }
        Value::Mapping(mapping) => {
            let mut table = FieldTable::default();
            for (key, value) in mapping {
                let key = key.as_str()?;
                table.insert(key.into(), to_amqp_value(value)?);
            }
            Some(AMQPValue::FieldTable(table))
        }
        Value::Tagged(_) => None,
    }
}
