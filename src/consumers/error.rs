use crate::amqp::configuration::ConfigurationError;

/// Why a [`Consumer`](crate::consumers::Consumer) could not start or keep consuming.
#[derive(thiserror::Error, Debug)]
pub enum ConsumeError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("Failed to connect to RabbitMq server {server}")]
    Connect {
        server: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to declare the topology of queue {queue}")]
    Declare {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to subscribe to queue {queue}")]
    Subscribe {
        queue: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Consumer {0} is already running")]
    AlreadyRunning(String),
}

impl ConsumeError {
    /// Errors that no amount of retrying is going to fix.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::AlreadyRunning(_))
    }
}
