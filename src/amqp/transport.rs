//! The transport capability the pools and consumers are built on.
//!
//! [`Transport`] hands out two kinds of links to a server:
//! - [`PublisherChannel`]s, pooled by [`ConnectionPool`](crate::pool::ConnectionPool);
//! - [`ConsumerChannel`]s, dedicated to a single [`Consumer`](crate::consumers::Consumer).
//!
//! [`LapinTransport`] is the implementation backed by [`lapin`]. Anything else (e.g. an in-memory
//! broker for tests) can be plugged in by implementing these traits.
use crate::amqp::configuration::{ServerSettings, TlsSettings};
use crate::consumers::Delivery;
use anyhow::Context;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::tcp::{AMQPUriTcpExt, NativeTlsConnector};
use lapin::types::FieldTable;
use lapin::uri::AMQPScheme;
use lapin::{BasicProperties, ConnectionProperties, ExchangeKind};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

/// A stream of deliveries pushed by the broker for a single consumer tag.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, anyhow::Error>>;

/// Opens links to a RabbitMq server.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Publisher: PublisherChannel;
    type Consumer: ConsumerChannel;

    /// Dial a connection and open a channel with publisher confirmations disabled.
    async fn connect_publisher(
        &self,
        server: &ServerSettings,
    ) -> Result<Self::Publisher, anyhow::Error>;

    /// Dial a dedicated connection and open a channel to consume from.
    async fn connect_consumer(
        &self,
        server: &ServerSettings,
    ) -> Result<Self::Consumer, anyhow::Error>;
}

/// A connection plus channel used to publish messages.
#[async_trait::async_trait]
pub trait PublisherChannel: Send + Sync + 'static {
    /// Publish a single message, fire-and-forget.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error>;

    /// Close the channel, then the connection.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A connection plus channel dedicated to a consumer.
#[async_trait::async_trait]
pub trait ConsumerChannel: Send + Sync + 'static {
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error>;

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), anyhow::Error>;

    /// Start a new consumer on `queue`, with manual acknowledgements.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, anyhow::Error>;

    /// Resolves when the broker (or the network) closes the channel without us asking.
    ///
    /// It never resolves if the channel is closed via [`ConsumerChannel::close`].
    async fn closed(&self) -> anyhow::Error;

    /// Close the channel, then the connection.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// [`Transport`] backed by `lapin`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LapinTransport;

/// Dial a connection and open a channel on it.
async fn open(
    server: &ServerSettings,
) -> Result<(lapin::Connection, lapin::Channel), anyhow::Error> {
    let connection = dial(server).await?;
    let channel = connection
        .create_channel()
        .await
        .context("Failed to open a channel")?;
    Ok((connection, channel))
}

/// The TLS handshake parameters for a server.
struct TlsTarget {
    connector: NativeTlsConnector,
    /// Expected in the server certificate. Falls back to the host name.
    domain: String,
}

impl TlsTarget {
    fn new(server: &ServerSettings, tls: &TlsSettings) -> Result<Self, anyhow::Error> {
        let mut builder = NativeTlsConnector::builder();
        if let Some(certificate) = tls.ca_certificate_chain()? {
            builder.add_root_certificate(certificate);
        }
        let connector = builder
            .build()
            .context("Failed to build the TLS connector")?;
        Ok(Self {
            connector,
            domain: tls.domain.clone().unwrap_or_else(|| server.host.clone()),
        })
    }
}

/// Open an AMQP connection to `server`, over TLS if it has TLS settings.
///
/// The whole handshake is bounded by [`ServerSettings::connection_timeout`].
#[tracing::instrument(name = "rabbitmq_connect", skip_all, fields(host = %server.host, port = server.port))]
async fn dial(server: &ServerSettings) -> Result<lapin::Connection, anyhow::Error> {
    let tls = server
        .tls
        .as_ref()
        .map(|tls| TlsTarget::new(server, tls))
        .transpose()?;
    let uri = server.amqp_uri();
    let properties =
        ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
    let handshake = async move {
        match tls {
            None => lapin::Connection::connect_uri(uri, properties).await,
            Some(TlsTarget { connector, domain }) => {
                let connect = move |uri: &lapin::uri::AMQPUri| {
                    // TCP first, then the TLS handshake against `domain`.
                    let mut plain = uri.clone();
                    plain.scheme = AMQPScheme::AMQP;
                    plain
                        .connect()
                        .and_then(|tcp| tcp.into_native_tls(&connector, &domain))
                };
                lapin::Connection::connector(uri, Box::new(connect), properties).await
            }
        }
    };
    let timeout = server.connection_timeout();
    let connection = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| anyhow::anyhow!("Timed out after {timeout:?} while connecting"))?
        .context("Failed to connect")?;
    connection.on_error(|e| warn!(error = ?e, "RabbitMq connection broken"));
    Ok(connection)
}

async fn close_link(
    connection: &lapin::Connection,
    channel: &lapin::Channel,
) -> Result<(), anyhow::Error> {
    // Closing a channel twice is an error for lapin: only close what is still open.
    if channel.status().connected() {
        channel.close(200, "OK").await?;
    }
    if connection.status().connected() {
        connection.close(200, "OK").await?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl Transport for LapinTransport {
    type Publisher = LapinPublisher;
    type Consumer = LapinConsumer;

    async fn connect_publisher(
        &self,
        server: &ServerSettings,
    ) -> Result<Self::Publisher, anyhow::Error> {
        // Channels start without publisher confirms (`confirm_select` is never sent).
        let (connection, channel) = open(server).await?;
        Ok(LapinPublisher {
            connection,
            channel,
        })
    }

    async fn connect_consumer(
        &self,
        server: &ServerSettings,
    ) -> Result<Self::Consumer, anyhow::Error> {
        let (connection, channel) = open(server).await?;
        let (sender, receiver) = oneshot::channel();
        let mut sender = Some(sender);
        channel.on_error(move |e| {
            if let Some(sender) = sender.take() {
                let _ = sender.send(e);
            }
        });
        Ok(LapinConsumer {
            connection,
            channel,
            closed: Mutex::new(Some(receiver)),
        })
    }
}

/// A `lapin` connection and channel used for publishing.
pub struct LapinPublisher {
    connection: lapin::Connection,
    channel: lapin::Channel,
}

#[async_trait::async_trait]
impl PublisherChannel for LapinPublisher {
    #[tracing::instrument(level = "debug", skip(self, payload, properties))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        // Without publisher confirms the returned confirmation resolves to `NotRequested`:
        // there is nothing to wait for.
        let _confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        close_link(&self.connection, &self.channel).await
    }
}

/// A `lapin` connection and channel dedicated to a consumer.
pub struct LapinConsumer {
    connection: lapin::Connection,
    channel: lapin::Channel,
    closed: Mutex<Option<oneshot::Receiver<lapin::Error>>>,
}

#[async_trait::async_trait]
impl ConsumerChannel for LapinConsumer {
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error> {
        self.channel
            .exchange_declare(exchange, kind, options, arguments)
            .await?;
        Ok(())
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error> {
        self.channel.queue_declare(queue, options, arguments).await?;
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), anyhow::Error> {
        self.channel
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await?;
        Ok(())
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), anyhow::Error> {
        self.channel.basic_qos(prefetch_count, options).await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, anyhow::Error> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(anyhow::Error::from))
            .boxed())
    }

    async fn closed(&self) -> anyhow::Error {
        let receiver = self
            .closed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match receiver {
            Some(receiver) => match receiver.await {
                Ok(e) => e.into(),
                Err(_) => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        close_link(&self.connection, &self.channel).await
    }
}
