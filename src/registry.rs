//! In-process naming service.
//!
//! Actors register under `(cluster name, role)` so siblings can find each
//! other by logical role instead of holding direct references.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::notifier::HubHandle;
use crate::peer::PeerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Notifier,
    Peer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Notifier => write!(f, "notifier"),
            Role::Peer => write!(f, "peer"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Registered {
    Notifier(HubHandle),
    Peer(PeerHandle),
}

impl Registered {
    pub fn role(&self) -> Role {
        match self {
            Registered::Notifier(_) => Role::Notifier,
            Registered::Peer(_) => Role::Peer,
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Registered::Notifier(hub) => !hub.is_closed(),
            Registered::Peer(peer) => !peer.is_closed(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Arc<RwLock<HashMap<(String, Role), Registered>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` under `name`, returning whatever it replaced.
    pub async fn register(&self, name: &str, entry: Registered) -> Option<Registered> {
        let key = (name.to_string(), entry.role());
        tracing::debug!(name, role = %key.1, "Registered");
        self.entries.write().await.insert(key, entry)
    }

    pub async fn unregister(&self, name: &str, role: Role) -> Option<Registered> {
        self.entries.write().await.remove(&(name.to_string(), role))
    }

    /// Looks up a live actor. Entries whose actor has exited resolve to `None`.
    pub async fn resolve(&self, name: &str, role: Role) -> Option<Registered> {
        self.entries
            .read()
            .await
            .get(&(name.to_string(), role))
            .filter(|entry| entry.is_alive())
            .cloned()
    }

    pub async fn notifier(&self, name: &str) -> Option<HubHandle> {
        match self.resolve(name, Role::Notifier).await {
            Some(Registered::Notifier(hub)) => Some(hub),
            _ => None,
        }
    }

    pub async fn peer(&self, name: &str) -> Option<PeerHandle> {
        match self.resolve(name, Role::Peer).await {
            Some(Registered::Peer(peer)) => Some(peer),
            _ => None,
        }
    }
}
