// ============================================================================
// SECTION 8: REFRESH SCHEDULER
// ============================================================================
// Drives a snapshot cache in one of two modes:
// - Interval: one cancellable background task per domain
// - On-demand: the read path refreshes once the snapshot is too old
// ============================================================================

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DomainConfig, RefreshMode};

// ----------------------------------------------------------------------------
// 8.1 Refresh Policy
// ----------------------------------------------------------------------------

/// Scheduling parameters for one domain, resolved from its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub mode: RefreshMode,
    pub period: Duration,
    pub freshness: Duration,
    pub timeout: Duration,
}

impl RefreshPolicy {
    pub fn from_config(config: &DomainConfig) -> Self {
        Self {
            mode: config.refresh_mode,
            period: config.refresh_interval,
            freshness: config.freshness,
            timeout: config.timeout,
        }
    }

    /// Whether a background task owns refreshes.
    pub fn is_background(&self) -> bool {
        self.mode == RefreshMode::Interval
    }

    /// Whether `collect` must refresh before serving.
    pub fn refreshes_on_read(&self) -> bool {
        self.mode == RefreshMode::OnDemand
    }
}

// ----------------------------------------------------------------------------
// 8.2 Refresh Task
// ----------------------------------------------------------------------------

/// A periodic background task with an explicit cancellation token.
///
/// Ticks never overlap: the next tick is awaited only after the previous
/// refresh future completes, and late ticks are delayed rather than bursted.
#[derive(Debug)]
pub struct RefreshTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    /// Spawn `tick` every `period`, starting one period from now.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(target: "sonic::scheduler", domain = name, period_ms = period.as_millis() as u64, "Refresh task started");

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }

            debug!(target: "sonic::scheduler", domain = name, "Refresh task stopped");
        });

        Self { name, cancel, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the task and wait for it to exit. An in-flight refresh is
    /// dropped, so nothing partial is committed.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!(target: "sonic::scheduler", domain = self.name, error = %e, "Refresh task panicked");
            }
        }
        info!(target: "sonic::scheduler", domain = self.name, "Refresh task cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_task_ticks_on_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = {
            let count = count.clone();
            RefreshTask::spawn("vlan", Duration::from_secs(30), move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        task.stop().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_in_flight_tick() {
        let finished = Arc::new(AtomicUsize::new(0));
        let task = {
            let finished = finished.clone();
            RefreshTask::spawn("fdb", Duration::from_secs(1), move || {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        task.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_policy_from_config() {
        let config = DomainConfig::default().with_mode(RefreshMode::OnDemand);
        let policy = RefreshPolicy::from_config(&config);
        assert!(policy.refreshes_on_read());
        assert!(!policy.is_background());
        assert_eq!(policy.freshness, Duration::from_secs(15));
    }
}
