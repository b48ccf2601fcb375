use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::{acker::Acker, options::BasicAckOptions, options::BasicRejectOptions, BasicProperties};
use std::fmt;
use std::sync::Arc;

/// Settles a delivery with the broker.
///
/// Each delivery must be settled exactly once: [`Subscriber`](crate::consumers::Subscriber)s
/// take care of it according to the [`BrokerAction`](crate::consumers::BrokerAction) returned
/// by the handler.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    /// Acknowledge this delivery only (`multiple = false`).
    async fn ack(&self) -> Result<(), anyhow::Error>;

    /// Reject this delivery, asking the broker to requeue it or not.
    async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<(), anyhow::Error> {
        Acker::ack(self, BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), anyhow::Error> {
        Acker::reject(self, BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

/// A received AMQP message.
pub struct Delivery {
    /// The delivery tag of the message.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,

    // Hidden from public interface, to stop a message being acked / rejected inside a message handler.
    // AMQP protocol specifics that a message must not be acked /rejected multiple times:
    // https://www.rabbitmq.com/amqp-0-9-1-reference.html#basic.ack.delivery-tag
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    /// Build a delivery settled through a custom [`Acknowledger`].
    ///
    /// Transports other than `lapin` use it to hand messages to subscribers.
    pub fn new(delivery_tag: DeliveryTag, data: Vec<u8>, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            exchange: ShortString::from(""),
            routing_key: ShortString::from(""),
            redelivered: false,
            properties: BasicProperties::default(),
            data,
            acker,
        }
    }

    pub(crate) fn acker(&self) -> &dyn Acknowledger {
        self.acker.as_ref()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data", &self.data.len())
            .finish()
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
            acker: Arc::new(value.acker),
        }
    }
}
