use crate::amqp::configuration::Configuration;
use crate::amqp::Transport;
use crate::commands::{Action, Command, Report, Target};
use crate::consumers::{Consumer, ConsumeError, Registry, SupervisionPolicy};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Executes control commands against the consumers of a [`Registry`].
///
/// Every consumer is created once, when the dispatcher is built, and lives as long as the
/// dispatcher: commands only move it through its lifecycle.
pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    configuration: Arc<Configuration>,
    consumers: BTreeMap<String, Arc<Consumer>>,
    policy: SupervisionPolicy,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: Arc<T>, configuration: Arc<Configuration>, registry: &Registry) -> Self {
        Self::with_policy(
            transport,
            configuration,
            registry,
            SupervisionPolicy::default(),
        )
    }

    pub fn with_policy(
        transport: Arc<T>,
        configuration: Arc<Configuration>,
        registry: &Registry,
        policy: SupervisionPolicy,
    ) -> Self {
        let consumers = registry
            .iter()
            .map(|(name, entry)| {
                let consumer = Consumer::new(name, entry, policy.reject_penalty);
                (name.to_owned(), Arc::new(consumer))
            })
            .collect();
        Self {
            transport,
            configuration,
            consumers,
            policy,
        }
    }

    pub fn consumer(&self, name: &str) -> Option<&Arc<Consumer>> {
        self.consumers.get(name)
    }

    pub fn consumers(&self) -> impl Iterator<Item = &Arc<Consumer>> {
        self.consumers.values()
    }

    /// Parse and execute a command line. Malformed commands produce a single failure report.
    pub async fn dispatch(&self, line: &str) -> Vec<Report> {
        tracing::info!(command = line.trim(), "Received command");
        match line.parse::<Command>() {
            Ok(command) => self.execute(&command).await,
            Err(e) => {
                let report = Report::failure(format!("Unknown command: {} ({e})", line.trim()));
                report.trace();
                vec![report]
            }
        }
    }

    #[tracing::instrument(name = "execute_command", skip_all, fields(command = %command))]
    pub async fn execute(&self, command: &Command) -> Vec<Report> {
        let mut reports = Vec::new();
        let consumers = self.resolve(&command.target, &mut reports);
        for consumer in consumers {
            match command.action {
                Action::Start => reports.push(self.start(consumer)),
                Action::Stop => reports.push(stop(consumer)),
                Action::Restart => reports.extend(self.restart(consumer).await),
                Action::Status => reports.push(status(consumer)),
                Action::SetCount(count) => {
                    consumer.set_count(count);
                    reports.push(Report::success(format!(
                        "Consumer '{}' set subscribers count to: {}",
                        consumer.name(),
                        count
                    )));
                    if !consumer.is_idle() {
                        reports.extend(self.restart(consumer).await);
                    }
                }
            }
        }
        for report in &reports {
            report.trace();
        }
        reports
    }

    /// Start every consumer of the registry.
    pub fn start_all(&self) -> Vec<Report> {
        let reports: Vec<_> = self.consumers.values().map(|c| self.start(c)).collect();
        for report in &reports {
            report.trace();
        }
        reports
    }

    /// Stop every consumer and wait for them to wind down.
    pub async fn shutdown(&self) {
        for consumer in self.consumers.values() {
            consumer.stop();
        }
        for consumer in self.consumers.values() {
            if !self.wait_until_idle(consumer).await {
                tracing::warn!(
                    consumer = consumer.name(),
                    "Consumer did not stop in time during shutdown"
                );
            }
        }
        tracing::info!("All consumers stopped");
    }

    fn resolve<'a>(&'a self, target: &Target, reports: &mut Vec<Report>) -> Vec<&'a Arc<Consumer>> {
        match target {
            Target::All => self.consumers.values().collect(),
            Target::Names(names) => names
                .iter()
                .filter_map(|name| {
                    let consumer = self.consumers.get(name);
                    if consumer.is_none() {
                        reports.push(Report::attention(format!(
                            "Consumer '{name}' not found in registry"
                        )));
                    }
                    consumer
                })
                .collect(),
        }
    }

    fn start(&self, consumer: &Arc<Consumer>) -> Report {
        let name = consumer.name();
        if !consumer.is_idle() {
            return Report::attention(format!("Subscribers for '{name}' already started"));
        }
        let supervisor = consumer.spawn_supervised(
            Arc::clone(&self.transport),
            Arc::clone(&self.configuration),
            self.policy.retry,
        );
        match supervisor {
            Ok(supervisor) => {
                let consumer_name = name.to_owned();
                tokio::spawn(async move {
                    let name = consumer_name.as_str();
                    match supervisor.await {
                        Ok(Ok(shutdown)) => {
                            tracing::info!(consumer = name, ?shutdown, "Consumer stopped")
                        }
                        Ok(Err(e)) => tracing::error!(
                            consumer = name,
                            error = ?e,
                            "Consumer gave up, it must be started again"
                        ),
                        Err(e) => tracing::error!(
                            consumer = name,
                            error = ?e,
                            "Consumer supervisor panicked"
                        ),
                    }
                });
                Report::success(format!("Starting subscribe for '{name}' consumer"))
            }
            Err(ConsumeError::AlreadyRunning(_)) => {
                Report::attention(format!("Subscribers for '{name}' already started"))
            }
            Err(e) => Report::failure(format!("Failed to start '{name}': {e}")),
        }
    }

    async fn restart(&self, consumer: &Arc<Consumer>) -> Vec<Report> {
        let mut reports = Vec::new();
        if !consumer.is_idle() {
            reports.push(Report::attention(format!(
                "Stopping subscribers for '{}'",
                consumer.name()
            )));
            consumer.stop();
            if !self.wait_until_idle(consumer).await {
                reports.push(Report::failure(format!(
                    "Consumer '{}' did not stop in time, not restarting it",
                    consumer.name()
                )));
                return reports;
            }
        }
        reports.push(self.start(consumer));
        reports
    }

    async fn wait_until_idle(&self, consumer: &Consumer) -> bool {
        tokio::time::timeout(self.policy.stop_timeout, consumer.wait_until_idle())
            .await
            .is_ok()
    }
}

fn stop(consumer: &Consumer) -> Report {
    let name = consumer.name();
    if consumer.is_idle() {
        return Report::attention(format!("Subscribers for '{name}' already stopped"));
    }
    consumer.stop();
    Report::attention(format!("Stopping subscribers for '{name}'"))
}

fn status(consumer: &Consumer) -> Report {
    let message = format!(
        "Consumer '{}' has {} subscribers ({})",
        consumer.name(),
        consumer.subscribers_count(),
        consumer.phase()
    );
    match consumer.last_error() {
        Some(e) => Report::attention(format!("{message}, last failure: {e}")),
        None => Report::success(message),
    }
}
