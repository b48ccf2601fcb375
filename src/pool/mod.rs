//! Adaptive pooling of publisher connections.
//!
//! A [`ServerPool`] owns one [`ConnectionPool`] per RabbitMq server. Each pool:
//! - starts empty and dials connections on demand;
//! - grows with the request rate, up to the server's `max_publish_connections`;
//! - hands connections out round-robin;
//! - retires idle, overused or broken connections, closing them after a grace period.
//!
//! ```rust,no_run
//! use warren::amqp::configuration::ServerSettings;
//! use warren::amqp::{BasicProperties, LapinTransport};
//! use warren::pool::ServerPool;
//! use std::sync::Arc;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let servers = ServerPool::new(Arc::new(LapinTransport));
//!     let pool = servers.get_or_create("main", &ServerSettings::default());
//!     pool.publish(
//!         "orders",
//!         &["orders.created".to_string()],
//!         b"{}",
//!         &BasicProperties::default(),
//!     )
//!     .await?;
//!     servers.shutdown().await;
//!     Ok(())
//! }
//! ```

mod connection;
mod connection_pool;
mod error;
mod server_pool;

pub use connection::{Connection, PooledConnection};
pub use connection_pool::{ConnectionPool, PoolPolicy};
pub use error::PoolError;
pub use server_pool::ServerPool;
