//! Channel naming and payload codec for the notification wire format.
//!
//! On the wire a channel is `<prefix>.oban_<name>`; subscribers only ever see
//! the short `<name>`.

use serde_json::Value;

use crate::error::{RelayError, Result};

const CHANNEL_MARKER: &str = "oban_";

/// Fully-qualified channel name for `channel` under `prefix`.
pub fn qualify(prefix: &str, channel: &str) -> String {
    format!("{}.{}{}", prefix, CHANNEL_MARKER, channel)
}

/// Strips the namespace from a fully-qualified channel name.
///
/// Names from a foreign prefix are shortened by their last segment so the
/// channel still routes; names without the marker are returned unchanged.
pub fn shorten<'a>(prefix: &str, full: &'a str) -> &'a str {
    let local = full
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_prefix(CHANNEL_MARKER));
    if let Some(short) = local {
        return short;
    }
    let last = full.rsplit('.').next().unwrap_or(full);
    last.strip_prefix(CHANNEL_MARKER).unwrap_or(last)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn batch<'a, I>(directive: &str, prefix: &str, channels: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    channels
        .into_iter()
        .map(|c| format!("{} {};", directive, quote_ident(&qualify(prefix, c))))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One multi-statement block subscribing to every channel.
pub fn listen_sql<'a, I>(prefix: &str, channels: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    batch("LISTEN", prefix, channels)
}

/// One multi-statement block unsubscribing from every channel.
pub fn unlisten_sql<'a, I>(prefix: &str, channels: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    batch("UNLISTEN", prefix, channels)
}

/// Decodes a raw payload. Only JSON objects are valid notifications.
pub fn decode(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw)?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(RelayError::InvalidPayload(format!(
            "expected a JSON object, got {}",
            raw
        )))
    }
}
