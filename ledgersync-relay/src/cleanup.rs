//! Background cleanup: prune used nonces and idle rate-limit buckets.

use crate::rate_limit::RateLimiter;
use crate::storage::RelayStorage;
use std::time::Duration;
use tokio::time;

pub fn spawn_cleanup_task(
    storage: RelayStorage,
    limiter: RateLimiter,
    nonce_retention_secs: i64,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now().timestamp();
            match run_cleanup(&storage, &limiter, now, nonce_retention_secs) {
                Ok(nonces) => tracing::debug!(nonces, "Cleanup completed"),
                Err(e) => tracing::error!("Cleanup error: {}", e),
            }
        }
    })
}

fn run_cleanup(
    storage: &RelayStorage,
    limiter: &RateLimiter,
    now: i64,
    nonce_retention_secs: i64,
) -> Result<usize, String> {
    let pruned = storage
        .prune_nonces(now - nonce_retention_secs)
        .map_err(|e| e.to_string())?;
    limiter.prune();
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_nonces_are_pruned() {
        let storage = RelayStorage::in_memory().unwrap();
        let limiter = RateLimiter::new(60);
        storage.remember_nonce("old", "d", 1_000).unwrap();
        storage.remember_nonce("new", "d", 1_550).unwrap();

        assert_eq!(run_cleanup(&storage, &limiter, 1_600, 300).unwrap(), 1);
        assert!(storage.remember_nonce("old", "d", 1_600).unwrap());
        assert!(!storage.remember_nonce("new", "d", 1_600).unwrap());
    }
}
