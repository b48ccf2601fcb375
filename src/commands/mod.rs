//! Runtime control of consumers: parsing commands, executing them against a registry and
//! serving them over TCP.
mod command;
pub mod control;
mod dispatcher;
mod report;

pub use command::{Action, Command, CommandError, Target};
pub use dispatcher::Dispatcher;
pub use report::{Level, Report};
