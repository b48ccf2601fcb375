//! Facilities to publish messages to a RabbitMq exchange. Check out [`Publisher`] as a starting point.
mod message;
mod publisher;

pub use message::Message;
pub use publisher::{Publisher, PublisherBuilder, PublisherError};
