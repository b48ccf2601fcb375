use crate::amqp::configuration::{Configuration, ConfigurationError, QueueSettings};
use crate::amqp::{ConsumerChannel, Transport};
use crate::consumers::subscriber::Subscriber;
use crate::consumers::{topology, ConsumeError, Handler, RegistryEntry, RetryPolicy};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Where a [`Consumer`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Declaring,
    Subscribed,
    /// Stopped on request, tearing down the channel.
    Closing,
    /// The broker closed the channel: tearing down before going back to idle.
    Faulted,
    /// Waiting before the next start attempt.
    Retrying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Declaring => "declaring",
            Self::Subscribed => "subscribed",
            Self::Closing => "closing",
            Self::Faulted => "faulted",
            Self::Retrying => "retrying",
        };
        f.write_str(phase)
    }
}

/// How a [`Consumer::consume`] run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// [`Consumer::stop`] was called.
    Stopped,
    /// The broker (or the network) closed the channel: the consumer stopped itself.
    ChannelClosed,
}

struct ConsumerState {
    count: u16,
    phase: Phase,
    subscribers: Vec<Subscriber>,
    /// Present while a `consume` run is in progress and has not been asked to stop.
    stop: Option<oneshot::Sender<()>>,
    /// A supervisor is driving this consumer, possibly between two attempts.
    supervised: bool,
    /// Bumped by every call to `stop`, to cancel supervisors waiting to retry.
    epoch: u64,
    last_error: Option<String>,
}

/// A named consumer: a dedicated channel to one queue, shared by `count` [`Subscriber`]s.
///
/// All the mutable state (subscribers, stop signal, phase) lives behind a single mutex: a
/// `stop` racing with a `subscribe` either sees the new subscribers or prevents them from
/// being registered.
pub struct Consumer {
    name: String,
    queue_name: String,
    server_name: String,
    handler: Arc<dyn Handler>,
    reject_penalty: Duration,
    state: Mutex<ConsumerState>,
    changed: Notify,
}

impl Consumer {
    pub fn new(name: impl Into<String>, entry: &RegistryEntry, reject_penalty: Duration) -> Self {
        Self {
            name: name.into(),
            queue_name: entry.queue_name.clone(),
            server_name: entry.server_name.clone(),
            handler: Arc::clone(&entry.handler),
            reject_penalty,
            state: Mutex::new(ConsumerState {
                count: entry.subscribers,
                phase: Phase::Idle,
                subscribers: Vec::new(),
                stop: None,
                supervised: false,
                epoch: 0,
                last_error: None,
            }),
            changed: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConsumerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut ConsumerState)) {
        f(&mut self.state());
        self.changed.notify_waiters();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    /// Number of subscribers started by the next run.
    pub fn count(&self) -> u16 {
        self.state().count
    }

    /// Change the number of subscribers. It takes effect on the next run.
    pub fn set_count(&self, count: u16) {
        self.state().count = count;
    }

    pub fn has_subscribers(&self) -> bool {
        !self.state().subscribers.is_empty()
    }

    pub fn subscribers_count(&self) -> usize {
        self.state().subscribers.len()
    }

    pub fn subscriber_names(&self) -> Vec<String> {
        self.state()
            .subscribers
            .iter()
            .map(|s| s.name().to_owned())
            .collect()
    }

    /// Why the last supervised run gave up, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    /// Not running, nor waiting to retry.
    pub fn is_idle(&self) -> bool {
        let state = self.state();
        state.phase == Phase::Idle && !state.supervised
    }

    /// Resolves once the consumer is idle.
    pub async fn wait_until_idle(&self) {
        loop {
            let changed = self.changed.notified();
            if self.is_idle() {
                return;
            }
            changed.await;
        }
    }

    /// Stop every subscriber, then release the consumer-level stop signal.
    ///
    /// It also cancels a supervisor waiting for its next attempt.
    pub fn stop(&self) {
        self.update(|state| halt(state, Phase::Closing));
    }

    /// Consume from the queue until [`Consumer::stop`] is called or the channel is closed.
    ///
    /// It dials a dedicated connection, declares the queue topology, starts the subscribers and
    /// then waits. The channel and connection are closed before returning, whatever the outcome.
    pub async fn consume<T: Transport>(
        &self,
        transport: &T,
        configuration: &Configuration,
    ) -> Result<Shutdown, ConsumeError> {
        self.consume_since(transport, configuration, None).await
    }

    /// A `consume` run that does not start at all if `stop` was called since `epoch`.
    #[tracing::instrument(name = "consumer_run", skip_all, fields(consumer = %self.name, queue_name = %self.queue_name))]
    async fn consume_since<T: Transport>(
        &self,
        transport: &T,
        configuration: &Configuration,
        epoch: Option<u64>,
    ) -> Result<Shutdown, ConsumeError> {
        let Some(stopped) = self.begin(epoch)? else {
            return Ok(Shutdown::Stopped);
        };
        let outcome = self.run(transport, configuration, stopped).await;
        self.update(|state| {
            // Subscribers started before a failure must not outlive the channel.
            for subscriber in state.subscribers.drain(..) {
                subscriber.stop();
            }
            state.stop = None;
            state.phase = Phase::Idle;
        });
        match &outcome {
            Ok(shutdown) => tracing::info!(?shutdown, "Consumer exited"),
            Err(e) => tracing::warn!(error = ?e, "Consumer failed"),
        }
        outcome
    }

    fn begin(&self, epoch: Option<u64>) -> Result<Option<oneshot::Receiver<()>>, ConsumeError> {
        let mut state = self.state();
        if matches!(epoch, Some(epoch) if epoch != state.epoch) {
            return Ok(None);
        }
        if !matches!(state.phase, Phase::Idle | Phase::Retrying) {
            return Err(ConsumeError::AlreadyRunning(self.name.clone()));
        }
        let (stop, stopped) = oneshot::channel();
        state.stop = Some(stop);
        state.phase = Phase::Connecting;
        Ok(Some(stopped))
    }

    async fn run<T: Transport>(
        &self,
        transport: &T,
        configuration: &Configuration,
        stopped: oneshot::Receiver<()>,
    ) -> Result<Shutdown, ConsumeError> {
        let server = configuration.server(&self.server_name)?;
        let queue = configuration.queue(&self.queue_name)?;
        if queue.exchange.is_empty() {
            return Err(ConfigurationError::MissingExchange(self.queue_name.clone()).into());
        }

        let channel = transport
            .connect_consumer(server)
            .await
            .map_err(|source| ConsumeError::Connect {
                server: self.server_name.clone(),
                source,
            })?;
        let outcome = self.serve(&channel, &queue, stopped).await;
        if let Err(e) = channel.close().await {
            tracing::warn!(error = ?e, "Failed to close the consumer channel");
        }
        outcome
    }

    async fn serve<C: ConsumerChannel>(
        &self,
        channel: &C,
        queue: &QueueSettings,
        mut stopped: oneshot::Receiver<()>,
    ) -> Result<Shutdown, ConsumeError> {
        self.advance(Phase::Declaring);
        topology::declare(channel, queue)
            .await
            .map_err(|source| ConsumeError::Declare {
                queue: queue.name.clone(),
                source,
            })?;

        self.subscribe(channel, queue).await?;

        tokio::select! {
            biased;

            _ = &mut stopped => Ok(Shutdown::Stopped),
            error = channel.closed() => {
                tracing::error!(error = ?error, "Channel closed unexpectedly, stopping the consumer");
                self.update(|state| {
                    halt(state, Phase::Faulted);
                    state.last_error = Some(format!("channel closed unexpectedly: {error}"));
                });
                Ok(Shutdown::ChannelClosed)
            }
        }
    }

    /// Move to `phase`, unless the run has been asked to stop in the meantime.
    fn advance(&self, phase: Phase) {
        self.update(|state| {
            if state.stop.is_some() {
                state.phase = phase;
            }
        });
    }

    /// Open `count` delivery streams on the queue and start a [`Subscriber`] on each of them.
    ///
    /// Nothing is registered if the consumer was stopped while the streams were being opened.
    async fn subscribe<C: ConsumerChannel>(
        &self,
        channel: &C,
        queue: &QueueSettings,
    ) -> Result<(), ConsumeError> {
        let count = self.count();
        let mut streams = Vec::with_capacity(count.into());
        for _ in 0..count {
            let name = subscriber_name(&queue.name);
            let deliveries = channel
                .basic_consume(&queue.name, &name)
                .await
                .map_err(|source| ConsumeError::Subscribe {
                    queue: queue.name.clone(),
                    source,
                })?;
            streams.push((name, deliveries));
        }

        self.update(|state| {
            if state.stop.is_none() {
                tracing::debug!("Stopped while subscribing, dropping the delivery streams");
                return;
            }
            for (name, deliveries) in streams {
                state.subscribers.push(Subscriber::spawn(
                    name,
                    deliveries,
                    Arc::clone(&self.handler),
                    self.reject_penalty,
                ));
            }
            state.phase = Phase::Subscribed;
        });
        tracing::info!(count, "Subscribers started");
        Ok(())
    }

    /// Run [`Consumer::consume`] until it is stopped, retrying failed attempts according to
    /// `retry`.
    ///
    /// The consumer is not restarted after the broker closes its channel: that requires an
    /// explicit restart. When attempts are exhausted, or the failure cannot be fixed by
    /// retrying, the error is recorded (see [`Consumer::last_error`]) and returned.
    pub async fn supervise<T: Transport>(
        self: Arc<Self>,
        transport: Arc<T>,
        configuration: Arc<Configuration>,
        retry: RetryPolicy,
    ) -> Result<Shutdown, ConsumeError> {
        let epoch = self.claim()?;
        self.supervised(transport, configuration, retry, epoch)
            .await
    }

    /// Like [`Consumer::supervise`], on a background task.
    ///
    /// The consumer is claimed before returning: it is no longer idle, and a second call fails
    /// with [`ConsumeError::AlreadyRunning`].
    pub fn spawn_supervised<T: Transport>(
        self: &Arc<Self>,
        transport: Arc<T>,
        configuration: Arc<Configuration>,
        retry: RetryPolicy,
    ) -> Result<JoinHandle<Result<Shutdown, ConsumeError>>, ConsumeError> {
        let epoch = self.claim()?;
        let consumer = Arc::clone(self);
        Ok(tokio::spawn(async move {
            consumer
                .supervised(transport, configuration, retry, epoch)
                .await
        }))
    }

    fn claim(&self) -> Result<u64, ConsumeError> {
        let mut state = self.state();
        if state.supervised || state.phase != Phase::Idle {
            return Err(ConsumeError::AlreadyRunning(self.name.clone()));
        }
        state.supervised = true;
        state.last_error = None;
        Ok(state.epoch)
    }

    #[tracing::instrument(name = "consumer_supervise", skip_all, fields(consumer = %self.name))]
    async fn supervised<T: Transport>(
        &self,
        transport: Arc<T>,
        configuration: Arc<Configuration>,
        retry: RetryPolicy,
        epoch: u64,
    ) -> Result<Shutdown, ConsumeError> {
        let outcome = self
            .attempts(transport.as_ref(), &configuration, retry, epoch)
            .await;
        self.update(|state| {
            state.supervised = false;
            if state.phase == Phase::Retrying {
                state.phase = Phase::Idle;
            }
            if let Err(e) = &outcome {
                state.last_error = Some(error_chain(e));
            }
        });
        outcome
    }

    async fn attempts<T: Transport>(
        &self,
        transport: &T,
        configuration: &Configuration,
        retry: RetryPolicy,
        epoch: u64,
    ) -> Result<Shutdown, ConsumeError> {
        let mut delays = retry.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let e = match self
                .consume_since(transport, configuration, Some(epoch))
                .await
            {
                Ok(shutdown) => return Ok(shutdown),
                Err(e) => e,
            };
            let delay = match delays.next() {
                Some(delay) if !e.is_terminal() => delay,
                _ => {
                    tracing::error!(error = ?e, attempt, "Giving up on starting the consumer");
                    return Err(e);
                }
            };
            tracing::warn!(error = ?e, attempt, ?delay, "Failed to start the consumer, retrying");
            self.update(|state| {
                if state.epoch == epoch {
                    state.phase = Phase::Retrying;
                }
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancelled(epoch) => return Ok(Shutdown::Stopped),
            }
        }
    }

    /// Resolves once `stop` has been called since `epoch`.
    async fn cancelled(&self, epoch: u64) {
        loop {
            let changed = self.changed.notified();
            let current = self.state().epoch;
            if current != epoch {
                return;
            }
            changed.await;
        }
    }
}

fn halt(state: &mut ConsumerState, phase: Phase) {
    for subscriber in state.subscribers.drain(..) {
        subscriber.stop();
    }
    if let Some(stop) = state.stop.take() {
        let _ = stop.send(());
        state.phase = phase;
    }
    state.epoch += 1;
}

/// `<queue>-<random suffix>`, used as consumer tag.
fn subscriber_name(queue_name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", queue_name, &suffix[..8])
}

/// `e` followed by its sources, `: `-separated.
fn error_chain(e: &ConsumeError) -> String {
    anyhow::Chain::new(e)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}
