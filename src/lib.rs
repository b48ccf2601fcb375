//! `warren` is a RabbitMQ toolkit, built on top of [`lapin`], for services that publish and
//! consume continuously.
//!
//! It provides:
//! - an adaptive pool of publisher connections per server, see [`ServerPool`](crate::pool::ServerPool)
//!   and the [`Publisher`](crate::publishers::Publisher) built on it;
//! - supervised consumers running a configurable number of subscribers, see
//!   [`Consumer`](crate::consumers::Consumer);
//! - a command [`Dispatcher`](crate::commands::Dispatcher) to start, stop, restart and resize
//!   consumers at runtime.

pub mod commands;
pub mod consumers;
pub mod publishers;

pub mod amqp;
pub mod pool;
