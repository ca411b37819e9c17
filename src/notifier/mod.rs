//! Cross-node notifications over Postgres LISTEN/NOTIFY.
//!
//! A single [`NotificationHub`] per node owns the LISTEN connection and
//! fans notifications out to in-process [`Subscriber`]s:
//!
//! - [`channels`]: the channel/subscriber tables
//! - [`payload`]: channel naming, LISTEN/UNLISTEN batches, payload decoding
//! - [`driver`]: the connection boundary and its Postgres implementation
//! - [`monitor`]: one-shot liveness watches
//! - [`hub`]: the actor and its [`HubHandle`]
//!
//! Publishing does not need the hub; see [`notify`].

pub mod channels;
pub mod driver;
pub mod hub;
pub mod monitor;
pub mod payload;

pub use driver::{DriverChannels, DriverCommand, DriverEndpoint, DriverEvent, PgDriver, QueryResult};
pub use hub::{ConnectionState, HubHandle, HubMessage, Notification, NotificationHub, Subscriber};

use serde_json::Value;
use sqlx::PgPool;

use crate::error::Result;

/// Publishes each payload on `channel` (short name) for every node listening under `prefix`.
pub async fn notify(pool: &PgPool, prefix: &str, channel: &str, payloads: &[Value]) -> Result<()> {
    if payloads.is_empty() {
        return Ok(());
    }
    let encoded = Value::Array(payloads.to_vec());
    sqlx::query("SELECT pg_notify($1, payload) FROM json_array_elements_text($2::json) AS payload")
        .bind(payload::qualify(prefix, channel))
        .bind(encoded)
        .execute(pool)
        .await?;
    tracing::debug!(channel, count = payloads.len(), "Published notifications");
    Ok(())
}
