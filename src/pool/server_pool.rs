use crate::amqp::configuration::ServerSettings;
use crate::amqp::Transport;
use crate::pool::{ConnectionPool, PoolPolicy};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// One [`ConnectionPool`] per configured server, created lazily on first use.
///
/// The first call to [`ServerPool::get_or_create`] for a server name wins: later calls return
/// the same pool, whatever settings they pass.
pub struct ServerPool<T: Transport> {
    transport: Arc<T>,
    policy: PoolPolicy,
    pools: Mutex<HashMap<String, Arc<ConnectionPool<T>>>>,
    reclaimers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> ServerPool<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_policy(transport, PoolPolicy::default())
    }

    pub fn with_policy(transport: Arc<T>, policy: PoolPolicy) -> Self {
        Self {
            transport,
            policy,
            pools: Mutex::new(HashMap::new()),
            reclaimers: Mutex::new(Vec::new()),
        }
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<String, Arc<ConnectionPool<T>>>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The pool for `server_name`, creating it (and starting its reclaimer) if needed.
    pub fn get_or_create(
        &self,
        server_name: &str,
        settings: &ServerSettings,
    ) -> Arc<ConnectionPool<T>> {
        let mut pools = self.pools();
        if let Some(pool) = pools.get(server_name) {
            return Arc::clone(pool);
        }
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&self.transport),
            settings.clone(),
            self.policy,
        ));
        let reclaimer = pool.spawn_reclaimer();
        self.reclaimers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reclaimer);
        pools.insert(server_name.to_owned(), Arc::clone(&pool));
        tracing::info!(
            server = server_name,
            max_connections = pool.max_connections(),
            "Created publisher connection pool"
        );
        pool
    }

    pub fn get(&self, server_name: &str) -> Option<Arc<ConnectionPool<T>>> {
        self.pools().get(server_name).cloned()
    }

    /// Number of servers a pool has been created for.
    pub fn len(&self) -> usize {
        self.pools().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools().is_empty()
    }

    /// Shut every pool down and wait for their reclaimers to exit.
    pub async fn shutdown(&self) {
        let pools: Vec<_> = self.pools().drain().collect();
        for (name, pool) in pools {
            pool.shutdown().await;
            tracing::info!(server = name.as_str(), "Closed publisher connection pool");
        }
        let reclaimers: Vec<_> = self
            .reclaimers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for reclaimer in reclaimers {
            if let Err(e) = reclaimer.await {
                tracing::error!(error = ?e, "Connection pool reclaimer panicked");
            }
        }
    }
}
