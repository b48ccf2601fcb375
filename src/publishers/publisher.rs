use crate::amqp::configuration::{Configuration, ConfigurationError};
use crate::amqp::Transport;
use crate::pool::{PoolError, ServerPool};
use crate::publishers::Message;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

/// A high-level interface to publish messages.
///
/// It resolves the queue and server a message is meant for, picks a connection from the
/// [`ServerPool`] and publishes the message once for every routing key.
///
/// # Fault tolerance
///
/// A connection that fails to publish is retired by its pool: the next publish will go through
/// another (possibly brand new) connection. `Publisher` itself never retries.
///
/// # How do I build a `Publisher`?
///
/// The starting point is [`Publisher::builder`].
pub struct Publisher<T: Transport> {
    servers: Arc<ServerPool<T>>,
    configuration: Arc<Configuration>,
    /// Timeout on publishing, to all routing keys.
    timeout: Duration,
}

impl<T: Transport> Publisher<T> {
    /// Start building a [`Publisher`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use warren::amqp::configuration::Configuration;
    /// use warren::amqp::LapinTransport;
    /// use warren::pool::ServerPool;
    /// use warren::publishers::Publisher;
    /// use std::sync::Arc;
    ///
    /// fn get_publisher(configuration: Configuration) -> Publisher<LapinTransport> {
    ///     let servers = Arc::new(ServerPool::new(Arc::new(LapinTransport)));
    ///     Publisher::builder(servers, Arc::new(configuration))
    ///         .publish_timeout(std::time::Duration::from_secs(3))
    ///         .build()
    /// }
    /// ```
    pub fn builder(
        servers: Arc<ServerPool<T>>,
        configuration: Arc<Configuration>,
    ) -> PublisherBuilder<T> {
        PublisherBuilder::new(servers, configuration)
    }

    /// Publish a message to the exchange of `queue_name`, hosted on `server_name`.
    ///
    /// The message is published once per routing key. If `routing_keys` is empty the routing
    /// keys configured for the queue are used, and if there are none the empty routing key.
    #[tracing::instrument(name = "publish", skip(self, message, routing_keys))]
    pub async fn publish(
        &self,
        message: Message,
        queue_name: &str,
        server_name: &str,
        routing_keys: &[&str],
    ) -> Result<(), PublisherError> {
        let server = self.configuration.server(server_name)?;
        let queue = self.configuration.queue(queue_name)?;
        let routing_keys = if routing_keys.is_empty() {
            queue.binding_keys()
        } else {
            routing_keys.iter().map(|key| key.to_string()).collect()
        };
        let pool = self.servers.get_or_create(server_name, server);

        let message = inject_amqp_properties(message);
        let publishing = pool.publish(
            &queue.exchange,
            &routing_keys,
            &message.payload,
            &message.properties,
        );
        tokio::time::timeout(self.timeout, publishing)
            .await
            .map_err(|_| PublisherError::TimeoutError)??;
        Ok(())
    }
}

/// Error returned when trying to publish a message using `Publisher`.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("The queue or server to publish to is not configured correctly")]
    Configuration(#[from] ConfigurationError),
    #[error("Failed to publish the message to the RabbitMq broker")]
    Pool(#[from] PoolError),
    #[error("The timeout threshold was reached while trying to publish the message")]
    TimeoutError,
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder<T: Transport> {
    servers: Arc<ServerPool<T>>,
    configuration: Arc<Configuration>,
    timeout: Duration,
}

impl<T: Transport> PublisherBuilder<T> {
    fn new(servers: Arc<ServerPool<T>>, configuration: Arc<Configuration>) -> Self {
        Self {
            servers,
            configuration,
            timeout: Duration::from_secs(3),
        }
    }

    /// Timeout applied when attempting to publish a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Finalise the builder and get an instance of [`Publisher`].
    pub fn build(self) -> Publisher<T> {
        Publisher {
            servers: self.servers,
            configuration: self.configuration,
            timeout: self.timeout,
        }
    }
}

/// Stamp the current time and a fresh message id, unless the message carries its own.
fn inject_amqp_properties(mut message: Message) -> Message {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = message.properties;
    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    message.properties =
        props.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()));

    message
}
