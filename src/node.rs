use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::notifier::{driver, DriverChannels, HubHandle, NotificationHub, PgDriver};
use crate::peer::{LeaderElector, PeerHandle};
use crate::pruner::{PgPruneBackend, PruneBackend, PrunerTask};
use crate::registry::{Registered, Registry};

/// A running node: notification hub, leader elector, pruner and optional dashboard.
pub struct Node {
    pub config: Arc<NodeConfig>,
    pub registry: Registry,
    pub hub: HubHandle,
    pub peer: PeerHandle,
    /// Stops the hub and driver. Cancelled once the elector has exited, so
    /// the elector can still unlock through the hub on the way out.
    connection: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Starts a node against the configured Postgres database.
    ///
    /// The pool connects lazily; the driver keeps retrying until the database
    /// is reachable, and the node reports "not connected"/"not leader" meanwhile.
    ///
    /// # Errors
    ///
    /// Returns an error if the database URL cannot be parsed.
    pub async fn start(config: NodeConfig, shutdown: CancellationToken) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&config.database_url)?;

        let (channels, endpoint) = driver::channel(config.notifier.buffer);
        let pg_driver = PgDriver::new(pool.clone(), config.notifier.clone());

        let backend = PgPruneBackend::new(pool, config.prefix.clone());
        let mut node = Self::spawn(config, Registry::new(), channels, backend, shutdown).await;

        let driver_shutdown = node.connection.clone();
        node.tasks.push(tokio::spawn(async move {
            pg_driver.run(endpoint, driver_shutdown).await;
        }));
        Ok(node)
    }

    /// Starts the node's actors on top of an already running driver.
    ///
    /// The hub and elector are registered under the cluster name in
    /// `registry` before the elector runs its first round.
    pub async fn spawn<B>(
        config: NodeConfig,
        registry: Registry,
        driver: DriverChannels,
        prune_backend: B,
        shutdown: CancellationToken,
    ) -> Self
    where
        B: PruneBackend + 'static,
    {
        let config = Arc::new(config);
        let connection = CancellationToken::new();
        let mut tasks = Vec::new();

        let (hub, hub_handle, hub_rx) = NotificationHub::new(&config, driver);
        registry
            .register(&config.name, Registered::Notifier(hub_handle.clone()))
            .await;
        let hub_shutdown = connection.clone();
        tasks.push(tokio::spawn(async move {
            hub.run(hub_rx, hub_shutdown).await;
        }));

        let (elector, peer, peer_rx) = LeaderElector::new(&config, registry.clone());
        registry
            .register(&config.name, Registered::Peer(peer.clone()))
            .await;
        let peer_shutdown = shutdown.clone();
        let stop_connection = connection.clone();
        tasks.push(tokio::spawn(async move {
            // Also fires if the task panics or is aborted.
            let _guard = stop_connection.drop_guard();
            elector.run(peer_rx, peer_shutdown).await;
        }));

        let pruner = PrunerTask {
            backend: prune_backend,
            config: config.pruner.clone(),
            peer: peer.clone(),
        };
        let pruner_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            pruner.run(pruner_shutdown).await;
        }));

        if let Some(addr) = config.dashboard_addr {
            let state = DashboardState {
                config: config.clone(),
                hub: hub_handle.clone(),
                peer: peer.clone(),
            };
            let dashboard_shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                run_dashboard(addr, state, dashboard_shutdown).await;
            }));
        }

        tracing::info!(
            name = %config.name,
            ident = %config.ident(),
            dashboard_addr = ?config.dashboard_addr,
            "Node started"
        );

        Self {
            config,
            registry,
            hub: hub_handle,
            peer,
            connection,
            tasks,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.peer.is_leader()
    }

    pub fn is_connected(&self) -> bool {
        self.hub.is_connected()
    }

    /// Waits for every task of the node to finish (after shutdown is requested).
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "Node task panicked");
                }
            }
        }
    }

    /// Stops every task immediately without releasing held locks.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
