//! Identity scoping for notifications.
//!
//! Multi-tenant deployments share channels. A payload may carry an `ident`
//! key naming the node (or `"any"`) that should act on it.

use serde_json::Value;

/// Payload key holding the target identity.
pub const SCOPE_KEY: &str = "ident";

/// Scope value accepted by every node.
pub const ANY_SCOPE: &str = "any";

/// Whether a decoded payload should be delivered on the node identified by `ident`.
///
/// Payloads without a scope (or with a null one) are delivered unconditionally.
/// A scope that is not a string never matches.
pub fn should_deliver(payload: &Value, ident: &str) -> bool {
    match payload.get(SCOPE_KEY) {
        None | Some(Value::Null) => true,
        Some(Value::String(scope)) => scope == ANY_SCOPE || scope == ident,
        Some(_) => false,
    }
}

/// Tags `payload` with `ident`, replacing any existing scope.
pub fn scoped(mut payload: Value, ident: &str) -> Value {
    if let Value::Object(map) = &mut payload {
        map.insert(SCOPE_KEY.to_string(), Value::String(ident.to_string()));
    }
    payload
}
