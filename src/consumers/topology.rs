//! Declaring the exchange, queue and bindings a consumer relies on.
use crate::amqp::configuration::QueueSettings;
use crate::amqp::options::{
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use crate::amqp::ConsumerChannel;

/// Ensure the topology described by `queue` exists on the broker:
/// - declare the exchange;
/// - declare the queue;
/// - bind the queue to the exchange for every routing key (the empty key if none is configured);
/// - apply the prefetch settings, if any.
///
/// The queue `arguments` are sent with the exchange declaration, the queue declaration and
/// every binding.
#[tracing::instrument(name = "declare_topology", skip_all, fields(queue_name = %queue.name, exchange = %queue.exchange))]
pub(crate) async fn declare<C: ConsumerChannel>(
    channel: &C,
    queue: &QueueSettings,
) -> Result<(), anyhow::Error> {
    let arguments = queue.arguments_table();
    channel
        .exchange_declare(
            &queue.exchange,
            queue.exchange_kind(),
            ExchangeDeclareOptions {
                passive: false,
                durable: queue.durable,
                auto_delete: queue.auto_delete,
                internal: queue.internal,
                nowait: queue.nowait,
            },
            arguments.clone(),
        )
        .await?;

    channel
        .queue_declare(
            &queue.name,
            QueueDeclareOptions {
                passive: queue.passive,
                durable: queue.durable,
                exclusive: queue.exclusive,
                auto_delete: queue.auto_delete,
                nowait: queue.nowait,
            },
            arguments.clone(),
        )
        .await?;

    for routing_key in queue.binding_keys() {
        channel
            .queue_bind(
                &queue.name,
                &queue.exchange,
                &routing_key,
                QueueBindOptions {
                    nowait: queue.nowait,
                },
                arguments.clone(),
            )
            .await?;
    }

    if let Some(prefetch) = queue.prefetch.filter(|p| p.count > 0) {
        if prefetch.size != 0 {
            tracing::warn!(
                size = prefetch.size,
                "Prefetch size is not supported by RabbitMq, only the count is applied"
            );
        }
        channel
            .basic_qos(prefetch.count, BasicQosOptions { global: false })
            .await?;
    }
    Ok(())
}
