use amq_protocol_types::{FieldTable, ShortShortUInt, ShortString, Timestamp};
use crate::amqp::BasicProperties;

/// A message to be published via [`Publisher`](super::Publisher).
///
/// Where the message goes (exchange and routing keys) is decided by the queue it is published to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// The body of the message, as a sequence of bytes.
    pub payload: Vec<u8>,
    /// AMQP properties attached to the message.
    pub properties: BasicProperties,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            properties: BasicProperties::default(),
        }
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = f(self.properties);
        self
    }

    pub fn with_content_type(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_type(value))
    }

    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    /// `2` makes the message persistent.
    pub fn with_delivery_mode(self, value: ShortShortUInt) -> Self {
        self.props(|p| p.with_delivery_mode(value))
    }

    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    pub fn with_message_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_message_id(value))
    }

    pub fn with_timestamp(self, value: Timestamp) -> Self {
        self.props(|p| p.with_timestamp(value))
    }

    pub fn with_app_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_app_id(value))
    }
}
