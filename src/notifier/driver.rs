//! Boundary between the notification hub and the physical database connection.
//!
//! The hub never touches a socket. It sends [`DriverCommand`]s and receives
//! [`DriverEvent`]s over a pair of channels; whatever owns the other end of
//! those channels owns the connection. [`PgDriver`] is the Postgres
//! implementation.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool, PgRow};
use sqlx::{Column, Executor, Row, TypeInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NotifierConfig;
use crate::timer::jitter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCommand {
    /// Run one (possibly multi-statement) block of SQL.
    ///
    /// `generation` names the session the hub meant it for: the count of
    /// `Connected` events it had seen when sending. Commands for an earlier
    /// session are answered with an error and never run.
    Execute {
        id: u64,
        generation: u64,
        sql: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Connected,
    Disconnected { reason: String },
    /// Outcome of the [`DriverCommand::Execute`] with the same `id`.
    QueryResult {
        id: u64,
        result: Result<QueryResult, String>,
    },
    Notification { channel: String, payload: String },
}

/// Rows returned by a statement, each cell decoded to JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// Result shaped like `SELECT <bool>`.
    pub fn single_bool(value: bool) -> Self {
        Self::new(vec!["result".to_string()], vec![vec![Value::Bool(value)]])
    }

    /// The value of a single-row, single-column boolean result.
    ///
    /// Any other shape yields `None`.
    pub fn as_single_bool(&self) -> Option<bool> {
        match self.rows.as_slice() {
            [row] => match row.as_slice() {
                [Value::Bool(b)] => Some(*b),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Hub side of the driver channels.
pub struct DriverChannels {
    pub commands: mpsc::Sender<DriverCommand>,
    pub events: mpsc::Receiver<DriverEvent>,
}

/// Connection side of the driver channels.
pub struct DriverEndpoint {
    pub commands: mpsc::Receiver<DriverCommand>,
    pub events: mpsc::Sender<DriverEvent>,
}

pub fn channel(buffer: usize) -> (DriverChannels, DriverEndpoint) {
    let (command_tx, command_rx) = mpsc::channel(buffer);
    let (event_tx, event_rx) = mpsc::channel(buffer);
    (
        DriverChannels {
            commands: command_tx,
            events: event_rx,
        },
        DriverEndpoint {
            commands: command_rx,
            events: event_tx,
        },
    )
}

/// Answers every queued command with `reason` without running it.
///
/// Returns false once the hub has gone away.
pub async fn reject_queued(endpoint: &mut DriverEndpoint, reason: &str) -> bool {
    while let Ok(DriverCommand::Execute { id, .. }) = endpoint.commands.try_recv() {
        let event = DriverEvent::QueryResult {
            id,
            result: Err(reason.to_string()),
        };
        if endpoint.events.send(event).await.is_err() {
            return false;
        }
    }
    true
}

type StatementFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<PgRow>, sqlx::Error>> + Send + 'a>>;

/// Named lifetime keeps the driver future `Send` when spawned.
fn run_statement<'a>(listener: &'a mut PgListener, sql: &'a str) -> StatementFuture<'a> {
    listener.fetch_all(sqlx::raw_sql(sql))
}

enum Exit {
    Shutdown,
    HubGone,
    Lost(String),
}

enum Step {
    Command(DriverCommand),
    Notification(Result<Option<sqlx::postgres::PgNotification>, sqlx::Error>),
}

/// Owns one dedicated Postgres session used for LISTEN and ad hoc statements.
pub struct PgDriver {
    pool: PgPool,
    config: NotifierConfig,
}

impl PgDriver {
    pub fn new(pool: PgPool, config: NotifierConfig) -> Self {
        Self { pool, config }
    }

    /// Connects, serves the hub until the session drops, then reconnects with
    /// exponential backoff. Returns on shutdown or when the hub goes away.
    pub async fn run(self, mut endpoint: DriverEndpoint, shutdown: CancellationToken) {
        let mut backoff = self.config.reconnect_min;
        let mut generation = 0;

        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => return,
                res = PgListener::connect_with(&self.pool) => res,
            };

            let mut listener = match connected {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_ms = backoff.as_millis() as u64,
                        "Notifier connection failed"
                    );
                    if endpoint
                        .events
                        .send(DriverEvent::Disconnected {
                            reason: e.to_string(),
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    if !reject_queued(&mut endpoint, "not connected").await {
                        return;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(jitter(backoff)) => {}
                    }
                    backoff = (backoff * 2).min(self.config.reconnect_max);
                    continue;
                }
            };

            backoff = self.config.reconnect_min;
            // Leftovers were meant for a session that is gone.
            if !reject_queued(&mut endpoint, "connection replaced").await {
                return;
            }
            generation += 1;
            tracing::info!(generation, "Notifier connection established");
            if endpoint.events.send(DriverEvent::Connected).await.is_err() {
                return;
            }

            match self
                .serve(&mut listener, &mut endpoint, generation, &shutdown)
                .await
            {
                Exit::Shutdown | Exit::HubGone => return,
                Exit::Lost(reason) => {
                    tracing::warn!(reason = %reason, "Notifier connection lost");
                    if endpoint
                        .events
                        .send(DriverEvent::Disconnected {
                            reason: reason.clone(),
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    if !reject_queued(&mut endpoint, &reason).await {
                        return;
                    }
                }
            }
        }
    }

    async fn serve(
        &self,
        listener: &mut PgListener,
        endpoint: &mut DriverEndpoint,
        generation: u64,
        shutdown: &CancellationToken,
    ) -> Exit {
        loop {
            let step = tokio::select! {
                _ = shutdown.cancelled() => return Exit::Shutdown,
                cmd = endpoint.commands.recv() => match cmd {
                    Some(cmd) => Step::Command(cmd),
                    None => return Exit::HubGone,
                },
                note = listener.try_recv() => Step::Notification(note),
            };

            match step {
                Step::Command(DriverCommand::Execute {
                    id,
                    generation: target,
                    sql,
                }) => {
                    let (result, lost) = if target == generation {
                        self.execute(listener, &sql).await
                    } else {
                        tracing::debug!(
                            id,
                            target,
                            generation,
                            "Rejecting command meant for an earlier session"
                        );
                        (Err("connection replaced".to_string()), None)
                    };
                    if endpoint
                        .events
                        .send(DriverEvent::QueryResult { id, result })
                        .await
                        .is_err()
                    {
                        return Exit::HubGone;
                    }
                    if let Some(reason) = lost {
                        return Exit::Lost(reason);
                    }
                }
                Step::Notification(Ok(Some(note))) => {
                    let event = DriverEvent::Notification {
                        channel: note.channel().to_string(),
                        payload: note.payload().to_string(),
                    };
                    if endpoint.events.send(event).await.is_err() {
                        return Exit::HubGone;
                    }
                }
                Step::Notification(Ok(None)) => {
                    return Exit::Lost("connection closed".to_string());
                }
                Step::Notification(Err(e)) => return Exit::Lost(e.to_string()),
            }
        }
    }

    /// Runs `sql`; the second element is set when the session must be dropped.
    async fn execute(
        &self,
        listener: &mut PgListener,
        sql: &str,
    ) -> (Result<QueryResult, String>, Option<String>) {
        let query = run_statement(listener, sql);
        match tokio::time::timeout(self.config.query_timeout, query).await {
            Ok(Ok(rows)) => (Ok(rows_to_result(&rows)), None),
            Ok(Err(e)) => {
                let lost = is_connection_error(&e).then(|| e.to_string());
                (Err(e.to_string()), lost)
            }
            Err(_) => {
                let reason = format!(
                    "query timed out after {}ms",
                    self.config.query_timeout.as_millis()
                );
                (Err(reason.clone()), Some(reason))
            }
        }
    }
}

fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

fn rows_to_result(rows: &[PgRow]) -> QueryResult {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let rows = rows.iter().map(row_values).collect();
    QueryResult { columns, rows }
}

fn row_values(row: &PgRow) -> Vec<Value> {
    row.columns()
        .iter()
        .map(|column| {
            let i = column.ordinal();
            let value = match column.type_info().name() {
                "BOOL" => row.try_get::<Option<bool>, _>(i).ok().flatten().map(Value::from),
                "INT2" => row.try_get::<Option<i16>, _>(i).ok().flatten().map(Value::from),
                "INT4" => row.try_get::<Option<i32>, _>(i).ok().flatten().map(Value::from),
                "INT8" => row.try_get::<Option<i64>, _>(i).ok().flatten().map(Value::from),
                "FLOAT4" => row.try_get::<Option<f32>, _>(i).ok().flatten().map(Value::from),
                "FLOAT8" => row.try_get::<Option<f64>, _>(i).ok().flatten().map(Value::from),
                "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" => {
                    row.try_get::<Option<String>, _>(i).ok().flatten().map(Value::from)
                }
                "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(i).ok().flatten(),
                _ => None,
            };
            value.unwrap_or(Value::Null)
        })
        .collect()
}
