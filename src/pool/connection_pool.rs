use crate::amqp::configuration::ServerSettings;
use crate::amqp::{BasicProperties, PublisherChannel, Transport};
use crate::pool::connection::{Connection, Entry, PooledConnection, Retiring, Slots};
use crate::pool::PoolError;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

/// Tunables of the adaptive sizing and of the idle reclaimer.
#[derive(Debug, Clone, Copy)]
pub struct PoolPolicy {
    /// Request rate a single connection is expected to sustain.
    ///
    /// The pool targets `requests_per_second * max_connections / rps_per_connection` connections.
    pub rps_per_connection: u64,
    /// How often the reclaimer scans the pool. It is also the length of the request rate window.
    pub reclaim_interval: Duration,
    /// How long a connection flagged for removal stays open before being closed.
    pub removal_grace: Duration,
    /// Connections that have published this many messages are retired.
    pub max_messages_per_connection: u64,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            rps_per_connection: 5000,
            reclaim_interval: Duration::from_secs(1),
            removal_grace: Duration::from_secs(10),
            max_messages_per_connection: 50_000,
        }
    }
}

impl PoolPolicy {
    /// The number of connections the pool should hold for the observed request rate.
    pub fn target_connections(&self, requests: u64, max_connections: usize) -> usize {
        let target = requests.saturating_mul(max_connections as u64) / self.rps_per_connection.max(1);
        usize::try_from(target).unwrap_or(usize::MAX)
    }
}

struct PoolState<L> {
    slots: Slots<L>,
    retiring: Vec<Retiring<L>>,
    /// Next slot to be considered by round robin.
    cursor: usize,
    /// Requests served since the last reclaimer pass.
    requests: u64,
    next_id: u64,
    closed: bool,
}

impl<L> PoolState<L> {
    /// Move the connection in `slot` to the retiring list, if it is still the one with `id`.
    fn retire(&mut self, slot: usize, id: u64, now: Instant) -> bool {
        match self.slots.take(slot, id) {
            Some(connection) => {
                self.retiring.push(Retiring {
                    connection,
                    flagged_at: now,
                });
                true
            }
            None => false,
        }
    }
}

enum Step<L> {
    Dial(usize),
    Ready(PooledConnection<L>),
    Wait,
}

/// A pool of publisher connections towards a single RabbitMq server.
///
/// Connections are handed out round-robin. The pool starts empty and grows, up to
/// [`ServerSettings::max_connections`], as the request rate observed in the current window
/// increases. A background reclaimer (see [`ConnectionPool::spawn_reclaimer`]) retires connections
/// that stay idle for longer than [`ServerSettings::max_idle_lifetime`].
///
/// A retired connection is no longer handed out, but it is only closed after
/// [`PoolPolicy::removal_grace`]: publishes already in flight on it get to complete.
pub struct ConnectionPool<T: Transport> {
    transport: Arc<T>,
    server: ServerSettings,
    policy: PoolPolicy,
    state: Mutex<PoolState<T::Publisher>>,
    /// Woken up every time a dial completes, successfully or not.
    dialed: Notify,
    exit: watch::Sender<bool>,
}

impl<T: Transport> ConnectionPool<T> {
    /// Build an empty pool. No connection is dialed until the first request.
    pub fn new(transport: Arc<T>, server: ServerSettings, policy: PoolPolicy) -> Self {
        let (exit, _) = watch::channel(false);
        Self {
            state: Mutex::new(PoolState {
                slots: Slots::with_capacity(server.max_connections()),
                retiring: Vec::new(),
                cursor: 0,
                requests: 0,
                next_id: 0,
                closed: false,
            }),
            transport,
            server,
            policy,
            dialed: Notify::new(),
            exit,
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState<T::Publisher>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_connections(&self) -> usize {
        self.server.max_connections()
    }

    /// Connections that can currently be handed out.
    pub fn live_connections(&self) -> usize {
        self.state().slots.live()
    }

    /// Connections flagged for removal and not closed yet.
    pub fn retiring_connections(&self) -> usize {
        self.state().retiring.len()
    }

    /// Requests served since the last reclaimer pass.
    pub fn requests_in_window(&self) -> u64 {
        self.state().requests
    }

    /// Get a connection to publish on.
    ///
    /// A new connection is dialed if the pool is empty, or if the request rate in the current
    /// window calls for more connections than the pool holds (and the pool is not full yet).
    /// Otherwise the next live connection in round-robin order is returned, and its idle
    /// deadline pushed forward.
    ///
    /// Dials run on their own task: a caller that gives up (e.g. on a timeout) does not abort
    /// them, and the connection joins the pool once dialed.
    pub async fn get_connection(
        self: &Arc<Self>,
    ) -> Result<PooledConnection<T::Publisher>, PoolError> {
        let mut counted = false;
        loop {
            let waiting = self.dialed.notified();
            let step = {
                let mut state = self.state();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                if !counted {
                    state.requests += 1;
                    counted = true;
                }
                self.next_step(&mut state)
            };
            match step {
                Step::Ready(connection) => return Ok(connection),
                Step::Dial(slot) => return self.spawn_dial(slot).await,
                // Every slot is taken by an in-progress dial: wait for one of them.
                Step::Wait => waiting.await,
            }
        }
    }

    fn next_step(&self, state: &mut PoolState<T::Publisher>) -> Step<T::Publisher> {
        let max_connections = state.slots.capacity();
        let occupied = state.slots.occupied();
        let target = self
            .policy
            .target_connections(state.requests, max_connections);
        if occupied < max_connections && (occupied == 0 || occupied < target) {
            if let Some(slot) = state.slots.reserve() {
                return Step::Dial(slot);
            }
        }
        let Some(slot) = state.slots.next_live(state.cursor) else {
            return Step::Wait;
        };
        state.cursor = (slot + 1) % max_connections;
        let idle_deadline = Instant::now() + self.server.max_idle_lifetime();
        match state.slots.entry_mut(slot) {
            Some(entry) => {
                entry.idle_deadline = idle_deadline;
                Step::Ready(PooledConnection {
                    slot,
                    connection: Arc::clone(&entry.connection),
                })
            }
            None => Step::Wait,
        }
    }

    async fn spawn_dial(
        self: &Arc<Self>,
        slot: usize,
    ) -> Result<PooledConnection<T::Publisher>, PoolError> {
        let pool = Arc::clone(self);
        let dialing = async move { pool.dial(slot).await }.in_current_span();
        match tokio::spawn(dialing).await {
            Ok(outcome) => outcome,
            Err(e) => Err(PoolError::Dial(anyhow::anyhow!(
                "the dialing task did not complete: {e}"
            ))),
        }
    }

    /// Dial a new connection into the reserved `slot`.
    #[tracing::instrument(name = "pool_dial", skip(self), fields(host = %self.server.host))]
    async fn dial(&self, slot: usize) -> Result<PooledConnection<T::Publisher>, PoolError> {
        let mut reservation = Reservation {
            pool: self,
            slot,
            armed: true,
        };
        let link = self
            .transport
            .connect_publisher(&self.server)
            .await
            .map_err(PoolError::Dial)?;

        let installed = {
            let mut state = self.state();
            if state.closed {
                Err(link)
            } else {
                let id = state.next_id;
                state.next_id += 1;
                let connection = Arc::new(Connection::new(id, link));
                state.slots.fill(
                    slot,
                    Entry {
                        connection: Arc::clone(&connection),
                        idle_deadline: Instant::now() + self.server.max_idle_lifetime(),
                    },
                );
                Ok((connection, state.slots.live()))
            }
        };
        let (connection, live) = match installed {
            Ok(installed) => installed,
            Err(link) => {
                drop(reservation);
                if let Err(e) = link.close().await {
                    warn!(error = ?e, "Failed to close a connection dialed during shutdown");
                }
                return Err(PoolError::Closed);
            }
        };
        reservation.armed = false;
        self.dialed.notify_waiters();
        info!(connection_id = connection.id(), live, "Dialed a new publisher connection");
        Ok(PooledConnection { slot, connection })
    }

    /// Publish `payload` on one connection, once for each routing key, in order.
    ///
    /// The first failure flags the connection for removal and is returned to the caller:
    /// the pool never retries.
    pub async fn publish(
        self: &Arc<Self>,
        exchange: &str,
        routing_keys: &[String],
        payload: &[u8],
        properties: &BasicProperties,
    ) -> Result<(), PoolError> {
        let connection = self.get_connection().await?;
        for routing_key in routing_keys {
            if let Err(source) = connection
                .link()
                .publish(exchange, routing_key, payload, properties.clone())
                .await
            {
                warn!(
                    connection_id = connection.id(),
                    exchange,
                    routing_key = routing_key.as_str(),
                    error = ?source,
                    "Publishing failed, flagging the connection for removal"
                );
                self.flag(&connection);
                return Err(PoolError::Publish {
                    routing_key: routing_key.clone(),
                    source,
                });
            }
            connection.record_publish();
        }
        Ok(())
    }

    /// Flag a connection for removal: it will not be handed out anymore.
    ///
    /// It does nothing if the connection has already been flagged.
    pub fn flag(&self, connection: &PooledConnection<T::Publisher>) {
        self.state()
            .retire(connection.slot, connection.id(), Instant::now());
    }

    /// A single reclaimer pass, as of `now`.
    ///
    /// - connections past their idle deadline, or that published too many messages, are flagged;
    /// - connections flagged for longer than [`PoolPolicy::removal_grace`] are closed;
    /// - the request rate window is reset.
    pub async fn reclaim(&self, now: Instant) {
        let capacity = self.state().slots.capacity();
        for slot in 0..capacity {
            // Lock per slot: publishers are never starved by a full scan.
            let mut state = self.state();
            let Some(entry) = state.slots.entry_mut(slot) else {
                continue;
            };
            let id = entry.connection.id();
            let idle = entry.idle_deadline <= now;
            let overused = entry.connection.published() >= self.policy.max_messages_per_connection;
            if (idle || overused) && state.retire(slot, id, now) {
                debug!(connection_id = id, idle, overused, "Flagged connection for removal");
            }
        }

        let expired = {
            let mut state = self.state();
            state.requests = 0;
            let grace = self.policy.removal_grace;
            let (expired, retiring): (Vec<_>, Vec<_>) = std::mem::take(&mut state.retiring)
                .into_iter()
                .partition(|r| now.saturating_duration_since(r.flagged_at) >= grace);
            state.retiring = retiring;
            expired
        };
        for retired in expired {
            close(retired.connection).await;
        }
    }

    /// Start the background reclaimer for this pool.
    ///
    /// The task runs a [`ConnectionPool::reclaim`] pass every [`PoolPolicy::reclaim_interval`]
    /// until [`ConnectionPool::shutdown`] is called or the pool is dropped.
    pub fn spawn_reclaimer(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let mut exit = self.exit.subscribe();
        let interval = self.policy.reclaim_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = exit.changed() => break,
                    _ = ticker.tick() => {}
                }
                let Some(pool) = Weak::upgrade(&pool) else {
                    break;
                };
                pool.reclaim(Instant::now()).await;
            }
            debug!("Connection pool reclaimer exited");
        })
    }

    /// Stop the reclaimer and close every connection, retiring ones included.
    ///
    /// Any later request fails with [`PoolError::Closed`].
    pub async fn shutdown(&self) {
        let connections = {
            let mut state = self.state();
            state.closed = true;
            let mut connections = state.slots.drain();
            connections.extend(state.retiring.drain(..).map(|r| r.connection));
            connections
        };
        let _ = self.exit.send(true);
        self.dialed.notify_waiters();
        for connection in connections {
            close(connection).await;
        }
    }
}

async fn close<L: PublisherChannel>(connection: Arc<Connection<L>>) {
    let id = connection.id();
    match connection.link().close().await {
        Ok(()) => debug!(connection_id = id, "Closed publisher connection"),
        Err(e) => error!(connection_id = id, error = ?e, "Failed to close publisher connection"),
    }
}

/// Gives the reserved slot back if the dial fails or the caller goes away mid-dial.
struct Reservation<'a, T: Transport> {
    pool: &'a ConnectionPool<T>,
    slot: usize,
    armed: bool,
}

impl<T: Transport> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state().slots.release(self.slot);
            self.pool.dialed.notify_waiters();
        }
    }
}
