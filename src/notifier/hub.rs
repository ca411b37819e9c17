use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RelayError, Result};
use crate::notifier::channels::{SubscriberId, Subscriptions};
use crate::notifier::driver::{DriverChannels, DriverCommand, DriverEvent, QueryResult};
use crate::notifier::monitor::Monitor;
use crate::notifier::payload;
use crate::scope;

static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

/// A decoded notification, addressed by its short channel name.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub channel: String,
    pub payload: Value,
}

/// In-process endpoint that receives notifications from the hub.
///
/// The hub watches the paired receiver: once it is dropped, every channel the
/// subscriber held is released.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Notification>,
}

impl Subscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Self {
            id: NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed),
            tx,
        };
        (subscriber, rx)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    fn deliver(&self, notification: Notification) -> bool {
        self.tx.send(notification).is_ok()
    }
}

/// Connectivity snapshot published by the hub.
///
/// `generation` increases on every successful connect, so a monitor can tell
/// the session it started watching from a later one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub generation: u64,
}

/// Messages accepted by the hub mailbox.
#[derive(Debug)]
pub enum HubMessage {
    Query {
        sql: String,
        response_tx: oneshot::Sender<Result<QueryResult>>,
    },
    Subscribe {
        subscriber: Subscriber,
        channels: Vec<String>,
        response_tx: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        id: SubscriberId,
        channels: Vec<String>,
        response_tx: oneshot::Sender<Result<()>>,
    },
    Channels {
        response_tx: oneshot::Sender<Vec<String>>,
    },
    /// A subscriber's receiver was dropped.
    ListenerDown { id: SubscriberId },
}

/// Cloneable client of a running [`NotificationHub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubMessage>,
    state: watch::Receiver<ConnectionState>,
}

impl HubHandle {
    /// Whether the shared connection is established. False once the hub has stopped.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed() && self.state.borrow().connected
    }

    pub fn connection(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver tracking every connectivity change.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Whether the hub actor has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the session that is current right now is gone.
    ///
    /// Completes immediately when the hub is already disconnected, and when
    /// the hub itself stops.
    pub fn until_down(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.state.clone();
        let watched = *state.borrow_and_update();
        async move {
            if !watched.connected {
                return;
            }
            let _ = state
                .wait_for(|s| !s.connected || s.generation != watched.generation)
                .await;
        }
    }

    /// Runs one statement on the shared connection.
    ///
    /// Fails with [`RelayError::QueryInFlight`] if another statement is
    /// outstanding and with [`RelayError::Disconnected`] if there is no
    /// connection or it drops before the result arrives.
    pub async fn run_query(&self, sql: impl Into<String>) -> Result<QueryResult> {
        let sql = sql.into();
        self.call(|response_tx| HubMessage::Query { sql, response_tx })
            .await?
    }

    /// Registers interest of `subscriber` in `channels` (short names).
    pub async fn subscribe<I, S>(&self, subscriber: &Subscriber, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subscriber = subscriber.clone();
        let channels = channels.into_iter().map(Into::into).collect();
        self.call(|response_tx| HubMessage::Subscribe {
            subscriber,
            channels,
            response_tx,
        })
        .await?
    }

    pub async fn unsubscribe<I, S>(&self, subscriber: &Subscriber, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = subscriber.id();
        let channels = channels.into_iter().map(Into::into).collect();
        self.call(|response_tx| HubMessage::Unsubscribe {
            id,
            channels,
            response_tx,
        })
        .await?
    }

    /// Short names of every channel currently subscribed, sorted.
    pub async fn channels(&self) -> Vec<String> {
        self.call(|response_tx| HubMessage::Channels { response_tx })
            .await
            .unwrap_or_default()
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> HubMessage) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| RelayError::ActorUnavailable("notification hub"))?;
        response_rx
            .await
            .map_err(|_| RelayError::ActorUnavailable("notification hub"))
    }
}

/// Who is waiting on the statement currently sent to the driver.
enum Pending {
    Query(oneshot::Sender<Result<QueryResult>>),
    /// A LISTEN batch for channels `id` was first to ask for.
    Listen {
        id: SubscriberId,
        channels: Vec<String>,
        response_tx: oneshot::Sender<Result<()>>,
    },
    /// An UNLISTEN batch or a restore; `None` when the hub issued it on its own.
    Ack(Option<oneshot::Sender<Result<()>>>),
}

impl Pending {
    fn complete(self, result: std::result::Result<QueryResult, String>) {
        match self {
            Pending::Query(tx) => {
                let _ = tx.send(result.map_err(RelayError::Database));
            }
            Pending::Listen { response_tx, .. } => {
                let _ = response_tx.send(result.map(|_| ()).map_err(RelayError::Database));
            }
            Pending::Ack(tx) => {
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "Subscription command failed");
                }
                if let Some(tx) = tx {
                    let _ = tx.send(result.map(|_| ()).map_err(RelayError::Database));
                }
            }
        }
    }

    /// Settles a caller whose statement can no longer run.
    ///
    /// Subscription changes are already recorded and will be replayed on
    /// reconnect, so they succeed; ad hoc queries fail.
    fn abandon(self) {
        match self {
            Pending::Query(tx) => {
                let _ = tx.send(Err(RelayError::Disconnected));
            }
            Pending::Listen { response_tx, .. } | Pending::Ack(Some(response_tx)) => {
                let _ = response_tx.send(Ok(()));
            }
            Pending::Ack(None) => {}
        }
    }
}

struct Outgoing {
    sql: String,
    pending: Pending,
}

struct Listener {
    subscriber: Subscriber,
    _monitor: Monitor,
}

/// Owner of the single LISTEN/NOTIFY connection.
///
/// Multiplexes channel subscriptions of any number of in-process
/// [`Subscriber`]s over one database session and routes inbound
/// notifications to the subscribers of their channel. All state is private
/// to the actor task; callers go through [`HubHandle`].
pub struct NotificationHub {
    prefix: String,
    ident: String,
    connected: bool,
    generation: u64,
    subscriptions: Subscriptions<Listener>,
    /// Statement sent to the driver and the id its result will carry.
    pending: Option<(u64, Pending)>,
    next_query: u64,
    outbox: VecDeque<Outgoing>,
    driver: DriverChannels,
    state_tx: watch::Sender<ConnectionState>,
    mailbox: mpsc::WeakSender<HubMessage>,
}

impl NotificationHub {
    pub fn new(
        config: &NodeConfig,
        driver: DriverChannels,
    ) -> (Self, HubHandle, mpsc::Receiver<HubMessage>) {
        let (tx, rx) = mpsc::channel(config.notifier.buffer);
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());

        let hub = Self {
            prefix: config.prefix.clone(),
            ident: config.ident(),
            connected: false,
            generation: 0,
            subscriptions: Subscriptions::new(),
            pending: None,
            next_query: 1,
            outbox: VecDeque::new(),
            driver,
            state_tx,
            mailbox: tx.downgrade(),
        };
        let handle = HubHandle { tx, state: state_rx };

        (hub, handle, rx)
    }

    /// Runs the hub until shutdown, until every handle is dropped, or until the driver stops.
    pub async fn run(mut self, mut mailbox: mpsc::Receiver<HubMessage>, shutdown: CancellationToken) {
        tracing::info!(ident = %self.ident, prefix = %self.prefix, "Notification hub started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.driver.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        tracing::warn!("Notifier driver stopped");
                        break;
                    }
                },
                msg = mailbox.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
            }
        }

        self.set_disconnected();
        tracing::info!("Notification hub stopped");
    }

    async fn handle_message(&mut self, msg: HubMessage) {
        match msg {
            HubMessage::Query { sql, response_tx } => {
                if self.pending.is_some() || !self.outbox.is_empty() {
                    let _ = response_tx.send(Err(RelayError::QueryInFlight));
                } else if !self.connected {
                    let _ = response_tx.send(Err(RelayError::Disconnected));
                } else {
                    self.enqueue(sql, Pending::Query(response_tx)).await;
                }
            }
            HubMessage::Subscribe {
                subscriber,
                channels,
                response_tx,
            } => {
                let id = subscriber.id();
                let mailbox = self.mailbox.clone();
                let added = self.subscriptions.subscribe(id, channels, || {
                    let monitor = Monitor::spawn(
                        closed(subscriber.clone()),
                        mailbox,
                        HubMessage::ListenerDown { id },
                    );
                    Listener {
                        subscriber,
                        _monitor: monitor,
                    }
                });

                if self.connected && !added.is_empty() {
                    tracing::debug!(subscriber = id, channels = ?added, "Listening");
                    let sql = payload::listen_sql(&self.prefix, added.iter().map(String::as_str));
                    let pending = Pending::Listen {
                        id,
                        channels: added,
                        response_tx,
                    };
                    self.enqueue(sql, pending).await;
                } else {
                    let _ = response_tx.send(Ok(()));
                }
            }
            HubMessage::Unsubscribe {
                id,
                channels,
                response_tx,
            } => {
                let removal = self.subscriptions.unsubscribe(id, channels);
                if self.connected && !removal.emptied.is_empty() {
                    tracing::debug!(subscriber = id, channels = ?removal.emptied, "Unlistening");
                    let sql = payload::unlisten_sql(
                        &self.prefix,
                        removal.emptied.iter().map(String::as_str),
                    );
                    self.enqueue(sql, Pending::Ack(Some(response_tx))).await;
                } else {
                    let _ = response_tx.send(Ok(()));
                }
            }
            HubMessage::Channels { response_tx } => {
                let _ = response_tx.send(self.subscriptions.channel_names());
            }
            HubMessage::ListenerDown { id } => {
                let removal = self.subscriptions.remove_listener(id);
                if removal.released.is_none() {
                    return;
                }
                tracing::debug!(subscriber = id, released = ?removal.emptied, "Subscriber terminated");
                if self.connected && !removal.emptied.is_empty() {
                    let sql = payload::unlisten_sql(
                        &self.prefix,
                        removal.emptied.iter().map(String::as_str),
                    );
                    self.enqueue(sql, Pending::Ack(None)).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Connected => {
                self.connected = true;
                self.generation += 1;
                self.publish_state();
                tracing::info!(generation = self.generation, "Notifier connected");

                if !self.subscriptions.is_empty() {
                    let channels = self.subscriptions.channel_names();
                    tracing::debug!(channels = ?channels, "Restoring subscriptions");
                    let sql = payload::listen_sql(&self.prefix, channels.iter().map(String::as_str));
                    self.enqueue(sql, Pending::Ack(None)).await;
                }
            }
            DriverEvent::Disconnected { reason } => {
                if self.connected {
                    tracing::warn!(reason = %reason, "Notifier disconnected");
                } else {
                    tracing::debug!(reason = %reason, "Notifier still disconnected");
                }
                self.set_disconnected();
            }
            DriverEvent::QueryResult { id, result } => match self.pending.take() {
                Some((expected, pending)) if expected == id => {
                    self.settle(pending, result);
                    self.pump().await;
                }
                other => {
                    self.pending = other;
                    tracing::debug!(id, "Dropping result of an abandoned statement");
                }
            },
            DriverEvent::Notification { channel, payload } => {
                self.route(&channel, &payload);
            }
        }
    }

    fn route(&self, full_channel: &str, raw: &str) {
        let channel = payload::shorten(&self.prefix, full_channel);
        let decoded = match payload::decode(raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(channel = %full_channel, error = %e, "Dropping malformed notification");
                return;
            }
        };

        if !scope::should_deliver(&decoded, &self.ident) {
            tracing::trace!(channel, "Notification scoped to another node");
            return;
        }

        for listener in self.subscriptions.subscribers(channel) {
            let delivered = listener.subscriber.deliver(Notification {
                channel: channel.to_string(),
                payload: decoded.clone(),
            });
            if !delivered {
                tracing::trace!(subscriber = listener.subscriber.id(), "Subscriber gone before delivery");
            }
        }
    }

    fn settle(&mut self, pending: Pending, result: std::result::Result<QueryResult, String>) {
        let (id, channels, response_tx, e) = match (pending, result) {
            (
                Pending::Listen {
                    id,
                    channels,
                    response_tx,
                },
                Err(e),
            ) => (id, channels, response_tx, e),
            (pending, result) => {
                pending.complete(result);
                return;
            }
        };

        // Forget the failed interest so a later subscribe asks again.
        tracing::warn!(subscriber = id, channels = ?channels, error = %e, "LISTEN failed");
        let removal = self.subscriptions.unsubscribe(id, channels.clone());
        let still_wanted: Vec<&str> = channels
            .iter()
            .filter(|c| !removal.emptied.contains(*c))
            .map(String::as_str)
            .collect();
        if !still_wanted.is_empty() {
            // Others joined while the batch was in flight.
            self.outbox.push_back(Outgoing {
                sql: payload::listen_sql(&self.prefix, still_wanted),
                pending: Pending::Ack(None),
            });
        }
        let _ = response_tx.send(Err(RelayError::Database(e)));
    }

    async fn enqueue(&mut self, sql: String, pending: Pending) {
        self.outbox.push_back(Outgoing { sql, pending });
        self.pump().await;
    }

    /// Sends the next queued statement if the connection is idle.
    async fn pump(&mut self) {
        while self.pending.is_none() && self.connected {
            let Some(next) = self.outbox.pop_front() else {
                return;
            };
            let id = self.next_query;
            self.next_query += 1;
            let command = DriverCommand::Execute {
                id,
                generation: self.generation,
                sql: next.sql,
            };
            if self.driver.commands.send(command).await.is_err() {
                tracing::warn!("Notifier driver is not accepting commands");
                next.pending.abandon();
                continue;
            }
            self.pending = Some((id, next.pending));
        }
    }

    fn set_disconnected(&mut self) {
        self.connected = false;
        self.publish_state();
        if let Some((_, pending)) = self.pending.take() {
            pending.abandon();
        }
        for outgoing in self.outbox.drain(..) {
            outgoing.pending.abandon();
        }
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(ConnectionState {
            connected: self.connected,
            generation: self.generation,
        });
    }
}

async fn closed(subscriber: Subscriber) {
    subscriber.tx.closed().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::driver;

    #[test]
    fn subscribers_get_unique_ids() {
        let (a, _ra) = Subscriber::new();
        let (b, _rb) = Subscriber::new();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn handle_reports_disconnected_before_driver_connects() {
        let (channels, _endpoint) = driver::channel(8);
        let (_hub, handle, _rx) = NotificationHub::new(&NodeConfig::default(), channels);
        assert!(!handle.is_connected());
        assert_eq!(handle.connection(), ConnectionState::default());
    }

    #[tokio::test]
    async fn handle_fails_fast_once_hub_is_gone() {
        let (channels, _endpoint) = driver::channel(8);
        let (hub, handle, rx) = NotificationHub::new(&NodeConfig::default(), channels);
        drop(hub);
        drop(rx);
        assert!(handle.is_closed());
        assert!(!handle.is_connected());
        assert!(matches!(
            handle.run_query("SELECT 1").await,
            Err(RelayError::ActorUnavailable(_))
        ));
        assert!(handle.channels().await.is_empty());
    }

    #[tokio::test]
    async fn until_down_is_immediate_without_connection() {
        let (channels, _endpoint) = driver::channel(8);
        let (_hub, handle, _rx) = NotificationHub::new(&NodeConfig::default(), channels);
        tokio::time::timeout(std::time::Duration::from_millis(50), handle.until_down())
            .await
            .expect("monitor of a dead connection fires at once");
    }
}
