//! Background refresh loop for replicas.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::replica::Replica;
use crate::store::Replicable;

/// Timing of a replica's refresh loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSettings {
    /// Upper bound between two refreshes, whatever the lease says.
    pub poll_interval: Duration,
    /// How long before the lease ends to refresh.
    pub lease_margin: Duration,
    /// First retry delay after a failure, and the shortest delay overall.
    pub min_backoff: Duration,
    /// Longest retry delay after repeated failures.
    pub max_backoff: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            lease_margin: Duration::from_secs(2),
            min_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RefreshSettings {
    /// Delay before the next refresh of a replica whose lease ends in
    /// `until_lease`.
    pub fn next_delay(&self, until_lease: Duration) -> Duration {
        until_lease
            .saturating_sub(self.lease_margin)
            .min(self.poll_interval)
            .max(self.min_backoff)
    }
}

/// Keeps `replica` fresh until `shutdown` flips to `true` or its sender is
/// dropped.
///
/// Refreshes run ahead of the lease by `lease_margin`, and at least every
/// `poll_interval`. Failures are retried with exponential backoff capped at
/// `max_backoff`.
pub async fn run_refresh_loop<T: Replicable>(
    replica: Arc<Replica<T>>,
    settings: RefreshSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(
        replica = replica.name(),
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        "starting replica refresh loop"
    );

    let mut backoff = settings.min_backoff;

    loop {
        let delay = match replica.refresh().await {
            Ok(_) => {
                backoff = settings.min_backoff;
                let until_lease = (replica.valid_until() - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                settings.next_delay(until_lease)
            }
            Err(e) => {
                tracing::warn!(
                    replica = replica.name(),
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "replica refresh failed"
                );
                let delay = backoff;
                backoff = (backoff * 2).min(settings.max_backoff);
                delay
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!(replica = replica.name(), "replica refresh loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_respects_bounds() {
        let settings = RefreshSettings {
            poll_interval: Duration::from_secs(10),
            lease_margin: Duration::from_secs(2),
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        };
        assert_eq!(
            settings.next_delay(Duration::from_secs(5)),
            Duration::from_secs(3)
        );
        assert_eq!(
            settings.next_delay(Duration::from_secs(60)),
            Duration::from_secs(10)
        );
        assert_eq!(
            settings.next_delay(Duration::from_secs(1)),
            Duration::from_millis(100)
        );
    }
}
