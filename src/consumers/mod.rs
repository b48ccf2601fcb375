//! Facilities to consume messages from a RabbitMq queue. Check out [`Consumer`] as a
//! starting point.
pub use consumer::{Consumer, Phase, Shutdown};
pub use error::ConsumeError;
pub use handler::{BrokerAction, Handler};
pub use incoming_message::{Acknowledger, Delivery};
pub use registry::{Registry, RegistryEntry};
pub use subscriber::Subscriber;
pub use supervision::{RetryPolicy, SupervisionPolicy};

mod consumer;
mod error;
mod handler;
mod incoming_message;
mod registry;
mod subscriber;
mod supervision;
mod topology;
