use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{NodeConfig, PeerConfig};
use crate::notifier::monitor::Monitor;
use crate::notifier::HubHandle;
use crate::peer::lock;
use crate::registry::Registry;
use crate::timer::jitter;

/// Messages for the elector mailbox.
#[derive(Debug)]
pub enum PeerMessage {
    /// The monitored hub connection went away.
    ConnectionDown { monitor: u64 },
}

/// Cloneable view of a running [`LeaderElector`].
#[derive(Debug, Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<PeerMessage>,
    leader: watch::Receiver<bool>,
}

impl PeerHandle {
    /// Current leadership belief. Never triggers a lock attempt, and is
    /// false once the elector has stopped.
    pub fn is_leader(&self) -> bool {
        !self.tx.is_closed() && *self.leader.borrow()
    }

    /// Receiver tracking every leadership change.
    pub fn watch_leadership(&self) -> watch::Receiver<bool> {
        self.leader.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The hub this elector watches, and the session it held the lock on.
struct Watched {
    hub: HubHandle,
    monitor: Monitor,
    held_generation: Option<u64>,
}

/// Cluster-wide leader election over a Postgres advisory lock.
///
/// Each round the elector makes sure it is watching the node's notification
/// hub, then either confirms it still holds the lock (same live session) or
/// tries to take it with `pg_try_advisory_lock`. Anything but an explicit
/// `true` means follower. Rounds repeat on a jittered timer that runs
/// `leader_boost` times faster while leading.
pub struct LeaderElector {
    name: String,
    lock_key: i64,
    timing: PeerConfig,
    query_timeout: Duration,
    registry: Registry,
    is_leader: bool,
    watched: Option<Watched>,
    leader_tx: watch::Sender<bool>,
    mailbox: mpsc::WeakSender<PeerMessage>,
}

impl LeaderElector {
    pub fn new(
        config: &NodeConfig,
        registry: Registry,
    ) -> (Self, PeerHandle, mpsc::Receiver<PeerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let (leader_tx, leader_rx) = watch::channel(false);

        let elector = Self {
            name: config.name.clone(),
            lock_key: lock::lock_key(&config.name),
            timing: config.peer.clone(),
            query_timeout: config.notifier.query_timeout,
            registry,
            is_leader: false,
            watched: None,
            leader_tx,
            mailbox: tx.downgrade(),
        };
        let handle = PeerHandle {
            tx,
            leader: leader_rx,
        };

        (elector, handle, rx)
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn lock_key(&self) -> i64 {
        self.lock_key
    }

    /// Runs election rounds until shutdown, then releases the lock if held.
    pub async fn run(mut self, mut mailbox: mpsc::Receiver<PeerMessage>, shutdown: CancellationToken) {
        tracing::info!(name = %self.name, lock_key = self.lock_key, "Leader elector started");

        let delay = self.tick().await;
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(msg) = mailbox.recv() => self.handle_message(msg),
                () = &mut timer => {
                    let delay = self.tick().await;
                    timer.as_mut().reset(Instant::now() + delay);
                }
            }
        }

        self.release().await;
        tracing::info!(name = %self.name, "Leader elector stopped");
    }

    fn handle_message(&mut self, msg: PeerMessage) {
        match msg {
            PeerMessage::ConnectionDown { monitor } => {
                let current = self.watched.as_ref().map(|w| w.monitor.id());
                if current != Some(monitor) {
                    return;
                }
                self.watched = None;
                if self.is_leader {
                    tracing::warn!(name = %self.name, "Notifier connection lost, stepping down");
                }
                self.set_leader(false);
            }
        }
    }

    /// Runs one election round and returns the delay before the next.
    pub async fn tick(&mut self) -> Duration {
        if self.watched.is_none() {
            self.watch_hub().await;
        }

        let hub = self.watched.as_ref().map(|w| w.hub.clone());
        let retained = self.is_leader && self.watched.as_ref().is_some_and(Self::still_holds);

        let leader = match hub {
            None => false,
            Some(_) if retained => true,
            Some(hub) => {
                let acquired = self.acquire(&hub).await;
                if let Some(watched) = self.watched.as_mut() {
                    watched.held_generation = acquired.then(|| hub.connection().generation);
                }
                acquired
            }
        };

        self.set_leader(leader);
        jitter(self.timing.base_delay(leader))
    }

    /// The lock lives as long as the session that took it.
    fn still_holds(watched: &Watched) -> bool {
        let state = watched.hub.connection();
        watched.hub.is_connected() && watched.held_generation == Some(state.generation)
    }

    async fn watch_hub(&mut self) {
        let Some(hub) = self.registry.notifier(&self.name).await else {
            tracing::debug!(name = %self.name, "Notifier not available yet");
            return;
        };

        let monitor = Monitor::spawn_with(hub.until_down(), self.mailbox.clone(), |monitor| {
            PeerMessage::ConnectionDown { monitor }
        });
        self.watched = Some(Watched {
            hub,
            monitor,
            held_generation: None,
        });
    }

    async fn acquire(&self, hub: &HubHandle) -> bool {
        let attempt = hub.run_query(lock::try_lock_sql(self.lock_key));
        match tokio::time::timeout(self.query_timeout, attempt).await {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::debug!(name = %self.name, error = %e, "Leadership attempt failed");
                }
                lock::acquired(&result)
            }
            Err(_) => {
                tracing::warn!(name = %self.name, "Leadership attempt timed out");
                false
            }
        }
    }

    fn set_leader(&mut self, leader: bool) {
        if leader != self.is_leader {
            if leader {
                tracing::info!(name = %self.name, "Became leader");
            } else {
                tracing::info!(name = %self.name, "No longer leader");
            }
        }
        self.is_leader = leader;
        self.leader_tx.send_replace(leader);
    }

    /// Best-effort unlock so another node can take over without waiting for
    /// this session to close.
    async fn release(&mut self) {
        if !self.is_leader {
            return;
        }
        if let Some(watched) = &self.watched {
            if watched.hub.is_connected() {
                let unlock = watched.hub.run_query(lock::unlock_sql(self.lock_key));
                match tokio::time::timeout(self.query_timeout, unlock).await {
                    Ok(Ok(_)) => tracing::info!(name = %self.name, "Released leadership"),
                    Ok(Err(e)) => tracing::debug!(error = %e, "Failed to release leadership"),
                    Err(_) => tracing::debug!("Timed out releasing leadership"),
                }
            }
        }
        self.set_leader(false);
    }
}
