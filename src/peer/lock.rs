use crate::error::Result;
use crate::notifier::QueryResult;

/// Offset keeping election keys clear of application advisory locks.
pub const LOCK_KEY_BASE: i64 = 1_149_979_257;

/// Advisory lock key contended by every node of the cluster `name`.
///
/// Stable across processes and hosts, so nodes sharing a name always
/// contend for the same lock.
pub fn lock_key(name: &str) -> i64 {
    LOCK_KEY_BASE + i64::from(crc32fast::hash(name.as_bytes()))
}

pub fn try_lock_sql(key: i64) -> String {
    format!("SELECT pg_try_advisory_lock({})", key)
}

pub fn unlock_sql(key: i64) -> String {
    format!("SELECT pg_advisory_unlock({})", key)
}

/// Only an explicit single `true` counts as holding the lock.
pub fn acquired(result: &Result<QueryResult>) -> bool {
    match result {
        Ok(result) => result.as_single_bool() == Some(true),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use serde_json::json;

    #[test]
    fn lock_key_is_stable_per_name() {
        assert_eq!(lock_key("oban"), lock_key("oban"));
        assert_ne!(lock_key("oban"), lock_key("billing"));
        assert!(lock_key("oban") >= LOCK_KEY_BASE);
        assert!(lock_key("oban") <= LOCK_KEY_BASE + i64::from(u32::MAX));
    }

    #[test]
    fn sql_embeds_key() {
        assert_eq!(try_lock_sql(42), "SELECT pg_try_advisory_lock(42)");
        assert_eq!(unlock_sql(42), "SELECT pg_advisory_unlock(42)");
    }

    #[test]
    fn only_true_is_acquired() {
        assert!(acquired(&Ok(QueryResult::single_bool(true))));
        assert!(!acquired(&Ok(QueryResult::single_bool(false))));
        assert!(!acquired(&Ok(QueryResult::default())));
        assert!(!acquired(&Ok(QueryResult::new(
            vec!["pg_try_advisory_lock".into()],
            vec![vec![json!("t")]],
        ))));
        assert!(!acquired(&Err(RelayError::QueryInFlight)));
        assert!(!acquired(&Err(RelayError::Disconnected)));
    }
}
