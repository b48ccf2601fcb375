/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("Failed to dial a new publisher connection to RabbitMq")]
    Dial(#[source] anyhow::Error),
    #[error("Failed to publish the message with routing key {routing_key:?}")]
    Publish {
        routing_key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("The connection pool has been shut down")]
    Closed,
}
