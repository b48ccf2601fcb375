//! Helpers for connecting to a rabbitmq broker

pub mod configuration;
pub mod transport;
pub use transport::{
    ConsumerChannel, DeliveryStream, LapinTransport, PublisherChannel, Transport,
};

pub use lapin::{options, types, BasicProperties, ExchangeKind};
