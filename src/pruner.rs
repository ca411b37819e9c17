//! Periodic deletion of finished jobs according to the retention policy.
//!
//! Sweeps run only on the current leader so a cluster prunes once per
//! interval instead of once per node.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::config::{PrunerConfig, RetentionPolicy};
use crate::error::Result;
use crate::peer::PeerHandle;

/// Storage capability for deleting finished jobs.
#[async_trait]
pub trait PruneBackend: Send + Sync {
    /// Deletes at most `limit` jobs outside `retention`, returning how many were removed.
    async fn prune(&self, retention: RetentionPolicy, limit: u64) -> Result<u64>;
}

/// Deletion statement for `retention`, or `None` when pruning is disabled.
pub fn prune_sql(prefix: &str, retention: RetentionPolicy, limit: u64) -> Option<String> {
    let table = format!("\"{}\".oban_jobs", prefix.replace('"', "\"\""));
    let finished = "state IN ('completed', 'cancelled', 'discarded')";

    let select = match retention {
        RetentionPolicy::Disabled => return None,
        RetentionPolicy::MaxLen(keep) => format!(
            "SELECT id FROM {table} WHERE {finished} ORDER BY id DESC OFFSET {keep} LIMIT {limit}"
        ),
        RetentionPolicy::MaxAge(secs) => format!(
            "SELECT id FROM {table} WHERE {finished} \
             AND attempted_at < timezone('UTC', now()) - make_interval(secs => {secs}) \
             LIMIT {limit}"
        ),
    };

    Some(format!("DELETE FROM {table} WHERE id IN ({select})"))
}

#[derive(Debug, Clone)]
pub struct PgPruneBackend {
    pool: PgPool,
    prefix: String,
}

impl PgPruneBackend {
    pub fn new(pool: PgPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl PruneBackend for PgPruneBackend {
    async fn prune(&self, retention: RetentionPolicy, limit: u64) -> Result<u64> {
        let Some(sql) = prune_sql(&self.prefix, retention, limit) else {
            return Ok(0);
        };
        let done = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }
}

pub struct PrunerTask<B> {
    pub backend: B,
    pub config: PrunerConfig,
    pub peer: PeerHandle,
}

impl<B> PrunerTask<B>
where
    B: PruneBackend + 'static,
{
    pub async fn run(self, shutdown: tokio_util::sync::CancellationToken) {
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            limit = self.config.limit,
            retention = %self.config.retention,
            "Pruner started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Pruner shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.prune_once().await {
                        tracing::error!(error = %e, "Prune sweep failed");
                    }
                }
            }
        }
    }

    /// One sweep. Followers and disabled policies delete nothing.
    pub async fn prune_once(&self) -> Result<u64> {
        if self.config.retention == RetentionPolicy::Disabled {
            return Ok(0);
        }
        if !self.peer.is_leader() {
            tracing::trace!("Skipping prune, not leader");
            return Ok(0);
        }

        let deleted = self
            .backend
            .prune(self.config.retention, self.config.limit)
            .await?;
        if deleted > 0 {
            tracing::info!(deleted, retention = %self.config.retention, "Pruned finished jobs");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::NodeConfig;
    use crate::peer::LeaderElector;
    use crate::registry::Registry;

    #[derive(Clone, Default)]
    struct StubPruneBackend {
        calls: Arc<Mutex<Vec<(RetentionPolicy, u64)>>>,
    }

    #[async_trait]
    impl PruneBackend for StubPruneBackend {
        async fn prune(&self, retention: RetentionPolicy, limit: u64) -> Result<u64> {
            self.calls.lock().expect("calls poisoned").push((retention, limit));
            Ok(3)
        }
    }

    fn follower_peer() -> (PeerHandle, tokio::sync::mpsc::Receiver<crate::peer::PeerMessage>) {
        let (_elector, peer, rx) = LeaderElector::new(&NodeConfig::default(), Registry::new());
        (peer, rx)
    }

    #[test]
    fn disabled_policy_has_no_sql() {
        assert!(prune_sql("public", RetentionPolicy::Disabled, 10).is_none());
    }

    #[test]
    fn max_len_sql_keeps_newest_rows() {
        let sql = prune_sql("public", RetentionPolicy::MaxLen(500), 10).unwrap();
        assert!(sql.starts_with("DELETE FROM \"public\".oban_jobs WHERE id IN (SELECT id"));
        assert!(sql.contains("ORDER BY id DESC OFFSET 500 LIMIT 10"));
        assert!(sql.contains("state IN ('completed', 'cancelled', 'discarded')"));
    }

    #[test]
    fn max_age_sql_uses_interval() {
        let sql = prune_sql("private", RetentionPolicy::MaxAge(60), 10_000).unwrap();
        assert!(sql.contains("\"private\".oban_jobs"));
        assert!(sql.contains("make_interval(secs => 60)"));
        assert!(sql.ends_with("LIMIT 10000)"));
    }

    #[tokio::test]
    async fn followers_do_not_prune() {
        let backend = StubPruneBackend::default();
        let (peer, _rx) = follower_peer();
        let task = PrunerTask {
            backend: backend.clone(),
            config: PrunerConfig::default(),
            peer,
        };

        assert_eq!(task.prune_once().await.unwrap(), 0);
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_policy_skips_backend() {
        let backend = StubPruneBackend::default();
        let (peer, _rx) = follower_peer();
        let task = PrunerTask {
            backend: backend.clone(),
            config: PrunerConfig {
                retention: RetentionPolicy::Disabled,
                ..PrunerConfig::default()
            },
            peer,
        };

        assert_eq!(task.prune_once().await.unwrap(), 0);
        assert!(backend.calls.lock().unwrap().is_empty());
    }
}
