use std::net::SocketAddr;
use std::time::Duration;

/// How finished jobs are retained by the pruner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Never prune.
    Disabled,
    /// Keep at most this many finished jobs.
    MaxLen(u64),
    /// Keep finished jobs for at most this many seconds.
    MaxAge(u64),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::MaxAge(60)
    }
}

impl std::fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetentionPolicy::Disabled => write!(f, "disabled"),
            RetentionPolicy::MaxLen(n) => write!(f, "max_len:{}", n),
            RetentionPolicy::MaxAge(secs) => write!(f, "max_age:{}s", secs),
        }
    }
}

/// Leader election timing.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Base period between election rounds while following.
    pub interval: Duration,
    /// Divisor applied to `interval` while leading. Always at least 1.
    pub leader_boost: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            leader_boost: 2,
        }
    }
}

impl PeerConfig {
    /// Base delay before the next round, given the current leadership belief.
    pub fn base_delay(&self, is_leader: bool) -> Duration {
        if is_leader {
            self.interval / self.leader_boost.max(1)
        } else {
            self.interval
        }
    }
}

/// Settings for the shared LISTEN/NOTIFY connection.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Capacity of the hub mailbox and driver channels.
    pub buffer: usize,
    /// Upper bound on a single statement round trip.
    pub query_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            buffer: 100,
            query_timeout: Duration::from_secs(15),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrunerConfig {
    pub interval: Duration,
    /// Maximum rows deleted per sweep.
    pub limit: u64,
    pub retention: RetentionPolicy,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            limit: 10_000,
            retention: RetentionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Cluster name. Every node of one logical cluster shares it.
    pub name: String,
    /// Identifier of this node within the cluster.
    pub node: String,
    /// Schema namespace used for tables and channel names.
    pub prefix: String,
    pub database_url: String,
    pub peer: PeerConfig,
    pub notifier: NotifierConfig,
    pub pruner: PrunerConfig,
    pub dashboard_addr: Option<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "oban".to_string(),
            node: uuid::Uuid::new_v4().simple().to_string(),
            prefix: "public".to_string(),
            database_url: "postgres://localhost/oban".to_string(),
            peer: PeerConfig::default(),
            notifier: NotifierConfig::default(),
            pruner: PrunerConfig::default(),
            dashboard_addr: None,
        }
    }
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_election(mut self, interval: Duration, leader_boost: u32) -> Self {
        self.peer = PeerConfig {
            interval,
            leader_boost: leader_boost.max(1),
        };
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.pruner.retention = retention;
        self
    }

    /// Identity used to scope notifications to this node: `"{name}.{node}"`.
    pub fn ident(&self) -> String {
        format!("{}.{}", self.name, self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.name, "oban");
        assert_eq!(cfg.prefix, "public");
        assert_eq!(cfg.node.len(), 32);
        assert_eq!(cfg.peer.interval, Duration::from_secs(30));
        assert_eq!(cfg.peer.leader_boost, 2);
        assert_eq!(cfg.pruner.retention, RetentionPolicy::MaxAge(60));
        assert!(cfg.dashboard_addr.is_none());
    }

    #[test]
    fn nodes_get_distinct_default_identifiers() {
        assert_ne!(NodeConfig::default().node, NodeConfig::default().node);
    }

    #[test]
    fn ident_joins_name_and_node() {
        let cfg = NodeConfig::new("billing").with_node("web-1");
        assert_eq!(cfg.ident(), "billing.web-1");
    }

    #[test]
    fn with_election_clamps_boost() {
        let cfg = NodeConfig::default().with_election(Duration::from_secs(10), 0);
        assert_eq!(cfg.peer.leader_boost, 1);
        assert_eq!(cfg.peer.base_delay(true), Duration::from_secs(10));
    }

    #[test]
    fn base_delay_shortens_while_leading() {
        let peer = PeerConfig {
            interval: Duration::from_secs(30),
            leader_boost: 2,
        };
        assert_eq!(peer.base_delay(false), Duration::from_secs(30));
        assert_eq!(peer.base_delay(true), Duration::from_secs(15));
    }

    #[test]
    fn retention_display() {
        assert_eq!(RetentionPolicy::Disabled.to_string(), "disabled");
        assert_eq!(RetentionPolicy::MaxLen(5).to_string(), "max_len:5");
        assert_eq!(RetentionPolicy::MaxAge(60).to_string(), "max_age:60s");
    }
}
