//! Retry policy and the periodic retry timer.
//!
//! `RetryPolicy` is pure; `RetryTimer` is the background task that scans
//! `PartitionState.timeouts` for due retries, following the shape of a
//! periodic-tick background loop.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use backoff::backoff::{Backoff, Constant};
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};

use flowcore_domain::{BackoffType, TimeoutKind, WorkConfig};
use flowcore_store::EventStore;

use crate::partition_state::PartitionAggregate;
use crate::aggregator::Aggregator;

const DEFAULT_BACKOFF_MS: u64 = 1_000;

/// `Linear`'s `InitBackoff * (attempt + 1)` growth has no counterpart among
/// `backoff`'s built-in policies (`Constant`, `ExponentialBackoff`), so this
/// is a minimal implementation of the crate's own `Backoff` trait rather
/// than arithmetic done outside it.
struct LinearBackoff {
    init: StdDuration,
    max: StdDuration,
    attempt: u32,
}

impl Backoff for LinearBackoff {
    fn next_backoff(&mut self) -> Option<StdDuration> {
        let raw = self.init.saturating_mul(self.attempt + 1);
        self.attempt += 1;
        Some(raw.min(self.max))
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub struct RetryPolicy;

impl RetryPolicy {
    /// `ShouldRetry(step, work)`: unlimited when `MaxRetries < 0`, otherwise
    /// the work item's retry count must still be under the bound.
    #[must_use]
    pub fn should_retry(work_config: Option<&WorkConfig>, retry_count: u32) -> bool {
        let Some(config) = work_config else {
            return false;
        };
        config.max_retries < 0 || i64::from(retry_count) < config.max_retries
    }

    /// `backoff(RetryCount, WorkConfig)`, clamped to `MaxBackoff` and
    /// defaulted to 1s for a missing/degenerate config. Driven by the
    /// `backoff` crate's `Backoff` trait: `Fixed` is `backoff::backoff::
    /// Constant`, `Exponential` is `backoff::ExponentialBackoff` with
    /// jitter disabled for determinism, `Linear` is `LinearBackoff` above.
    /// Each policy is stepped forward `retry_count + 1` times from a fresh
    /// instance since this function is pure over `retry_count` rather than
    /// holding a live `Backoff` across calls.
    #[must_use]
    pub fn backoff(work_config: Option<&WorkConfig>, retry_count: u32) -> StdDuration {
        let Some(config) = work_config else {
            return StdDuration::from_millis(DEFAULT_BACKOFF_MS);
        };

        let init = StdDuration::from_millis(config.init_backoff_ms.max(1));
        let max = StdDuration::from_millis(if config.max_backoff_ms == 0 {
            DEFAULT_BACKOFF_MS
        } else {
            config.max_backoff_ms
        });

        match config.backoff_type {
            BackoffType::Fixed => {
                let mut backoff = Constant::new(init);
                backoff.next_backoff().unwrap_or(init).min(max)
            }
            BackoffType::Linear => {
                let mut backoff = LinearBackoff { init, max, attempt: 0 };
                let mut current = init.min(max);
                for _ in 0..=retry_count {
                    current = backoff.next_backoff().unwrap_or(max);
                }
                current
            }
            BackoffType::Exponential => {
                let mut backoff = ExponentialBackoffBuilder::new()
                    .with_initial_interval(init)
                    .with_max_interval(max)
                    .with_multiplier(2.0)
                    .with_randomization_factor(0.0)
                    .with_max_elapsed_time(None)
                    .build();
                let mut current = backoff.next_backoff().unwrap_or(init);
                for _ in 0..retry_count {
                    current = backoff.next_backoff().unwrap_or(max);
                }
                current.min(max)
            }
        }
    }

    #[must_use]
    pub fn next_retry_at(work_config: Option<&WorkConfig>, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(Self::backoff(work_config, retry_count))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(DEFAULT_BACKOFF_MS as i64))
    }
}

/// Periodically scans the partition's sorted timeout schedule for due
/// `Retry` entries and hands each one to `on_due`. Optional-attribute
/// timeouts are handled by the sibling `optional_timer` module; this task
/// only reacts to `TimeoutKind::Retry`.
pub struct RetryTimer {
    partition: Arc<Aggregator<PartitionAggregate>>,
    interval: StdDuration,
}

impl RetryTimer {
    #[must_use]
    pub fn new(store: Arc<dyn EventStore<flowcore_store::PartitionEvent>>, interval: StdDuration) -> Self {
        Self {
            partition: Arc::new(Aggregator::new(store, "partition")),
            interval,
        }
    }

    /// Runs until `shutdown` resolves. `on_due` is invoked once per due
    /// retry entry with `(flow_id, step_id)`; it is expected to re-submit
    /// the work item (delegated to `WorkRunner`), not to mutate state
    /// itself — this task only observes the partition's timeout index.
    pub async fn run<F, Fut>(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>, on_due: F)
    where
        F: Fn(flowcore_domain::FlowId, flowcore_domain::StepId) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("retry timer shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let (state, _version) = match self.partition.load(PartitionAggregate::default()).await {
                        Ok(loaded) => loaded,
                        Err(err) => {
                            tracing::warn!(%err, "retry timer failed to load partition state");
                            continue;
                        }
                    };
                    for entry in &state.0.timeouts {
                        if entry.kind != TimeoutKind::Retry {
                            continue;
                        }
                        if entry.fires_at > now {
                            break; // sorted ascending: nothing further is due yet
                        }
                        on_due(entry.flow_id.clone(), entry.step_id.clone()).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore_domain::BackoffType;

    fn config(max_retries: i64, backoff_type: BackoffType) -> WorkConfig {
        WorkConfig {
            max_retries,
            init_backoff_ms: 200,
            max_backoff_ms: 2_000,
            backoff_type,
            parallelism: 1,
        }
    }

    #[test]
    fn should_retry_is_unlimited_for_negative_max_retries() {
        assert!(RetryPolicy::should_retry(Some(&config(-1, BackoffType::Fixed)), 1_000));
    }

    #[test]
    fn should_retry_stops_at_the_bound() {
        let cfg = config(2, BackoffType::Fixed);
        assert!(RetryPolicy::should_retry(Some(&cfg), 1));
        assert!(!RetryPolicy::should_retry(Some(&cfg), 2));
    }

    #[test]
    fn should_retry_is_false_with_no_work_config() {
        assert!(!RetryPolicy::should_retry(None, 0));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let cfg = config(3, BackoffType::Fixed);
        assert_eq!(RetryPolicy::backoff(Some(&cfg), 0), StdDuration::from_millis(200));
        assert_eq!(RetryPolicy::backoff(Some(&cfg), 5), StdDuration::from_millis(200));
    }

    #[test]
    fn linear_backoff_scales_with_retry_count() {
        let cfg = config(3, BackoffType::Linear);
        assert_eq!(RetryPolicy::backoff(Some(&cfg), 0), StdDuration::from_millis(200));
        assert_eq!(RetryPolicy::backoff(Some(&cfg), 2), StdDuration::from_millis(600));
    }

    #[test]
    fn exponential_backoff_doubles_and_clamps_to_max() {
        let cfg = config(10, BackoffType::Exponential);
        assert_eq!(RetryPolicy::backoff(Some(&cfg), 0), StdDuration::from_millis(200));
        assert_eq!(RetryPolicy::backoff(Some(&cfg), 1), StdDuration::from_millis(400));
        assert_eq!(RetryPolicy::backoff(Some(&cfg), 10), StdDuration::from_millis(2_000));
    }

    #[test]
    fn missing_work_config_defaults_to_one_second() {
        assert_eq!(RetryPolicy::backoff(None, 0), StdDuration::from_millis(DEFAULT_BACKOFF_MS));
    }
}
