//! Per-source request pacing
//!
//! Most sources are never paced. Sources registered with a [`ThrottlePolicy`]
//! get their own limiter, so workers hitting different sources never contend
//! on a shared lock:
//!
//! - **Adaptive** - a cooperative delay between calls that grows after a run
//!   of rapid calls and decays again once the source has been idle
//! - **Quota** - a fixed requests-per-second budget enforced by `governor`

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::models::SourceId;

/// Maximum number of idle periods applied in one decay step
const MAX_DECAY_STEPS: u128 = 16;

/// Largest accepted adaptive growth factor
pub const MAX_GROWTH_FACTOR: f64 = 10.0;

/// Tuning of the adaptive delay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveDelay {
    /// Delay applied to a source that behaves well
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Upper bound of the grown delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied when growing and divisor when decaying
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    /// Consecutive rapid calls before the delay grows
    #[serde(default = "default_rapid_threshold")]
    pub rapid_threshold: u32,

    /// Idle time after which the delay decays one step
    #[serde(default = "default_idle_reset_ms")]
    pub idle_reset_ms: u64,
}

fn default_min_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_growth_factor() -> f64 {
    1.5
}

fn default_rapid_threshold() -> u32 {
    5
}

fn default_idle_reset_ms() -> u64 {
    30_000
}

impl Default for AdaptiveDelay {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            growth_factor: default_growth_factor(),
            rapid_threshold: default_rapid_threshold(),
            idle_reset_ms: default_idle_reset_ms(),
        }
    }
}

/// How requests to one source are paced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThrottlePolicy {
    /// Never paced
    #[default]
    Unlimited,

    /// Delay that adapts to the call rate
    Adaptive(AdaptiveDelay),

    /// Fixed budget of requests per second
    Quota { per_second: u32 },
}

impl ThrottlePolicy {
    /// Adaptive policy with default tuning
    pub fn adaptive_default() -> Self {
        Self::Adaptive(AdaptiveDelay::default())
    }
}

#[derive(Debug)]
struct AdaptiveState {
    delay: Duration,
    streak: u32,
    last: Option<Instant>,
}

enum Limiter {
    Adaptive {
        tuning: AdaptiveDelay,
        state: tokio::sync::Mutex<AdaptiveState>,
    },
    Quota(RateLimiter<NotKeyed, InMemoryState, DefaultClock>),
}

impl Limiter {
    fn from_policy(policy: &ThrottlePolicy) -> Option<Self> {
        match policy {
            ThrottlePolicy::Unlimited => None,
            ThrottlePolicy::Adaptive(tuning) => {
                let min = Duration::from_millis(tuning.min_delay_ms);
                Some(Self::Adaptive {
                    tuning: tuning.clone(),
                    state: tokio::sync::Mutex::new(AdaptiveState {
                        delay: min,
                        streak: 0,
                        last: None,
                    }),
                })
            }
            ThrottlePolicy::Quota { per_second } => {
                let rate = NonZeroU32::new(*per_second).unwrap_or(NonZeroU32::MIN);
                Some(Self::Quota(RateLimiter::direct(Quota::per_second(rate))))
            }
        }
    }

    async fn acquire(&self, source: SourceId) {
        match self {
            Self::Quota(limiter) => limiter.until_ready().await,
            Self::Adaptive { tuning, state } => {
                // Held across the sleep: calls to one source are serialised.
                let mut state = state.lock().await;
                let min = Duration::from_millis(tuning.min_delay_ms);
                let max = Duration::from_millis(tuning.max_delay_ms).max(min);
                let idle = Duration::from_millis(tuning.idle_reset_ms.max(1));
                let factor = tuning.growth_factor.max(1.0);

                if let Some(last) = state.last {
                    let gap = Instant::now().saturating_duration_since(last);

                    if gap >= idle {
                        let periods = (gap.as_millis() / idle.as_millis()).min(MAX_DECAY_STEPS);
                        for _ in 0..periods {
                            state.delay = state.delay.div_f64(factor).max(min);
                        }
                        state.streak = 0;
                        trace!(source = %source, delay_ms = state.delay.as_millis() as u64, "Throttle delay decayed");
                    } else if gap <= state.delay * 2 {
                        state.streak += 1;
                        if state.streak >= tuning.rapid_threshold {
                            state.delay = grown(state.delay, factor, max);
                            state.streak = 0;
                            debug!(source = %source, delay_ms = state.delay.as_millis() as u64, "Throttle delay increased");
                        }
                    } else {
                        state.streak = 0;
                    }

                    tokio::time::sleep_until(last + state.delay).await;
                }

                state.last = Some(Instant::now());
            }
        }
    }
}

/// `delay * factor`, saturating at `max`
fn grown(delay: Duration, factor: f64, max: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).map_or(max, |d| d.min(max))
}

/// Registry of per-source limiters
#[derive(Default)]
pub struct SourceThrottle {
    limiters: Mutex<HashMap<SourceId, Arc<Limiter>>>,
}

impl SourceThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a throttle from a list of policies
    pub fn with_policies(policies: impl IntoIterator<Item = (SourceId, ThrottlePolicy)>) -> Self {
        let throttle = Self::new();
        for (source, policy) in policies {
            throttle.set_policy(source, &policy);
        }
        throttle
    }

    /// Install or replace the policy of a source, resetting its state
    pub fn set_policy(&self, source: SourceId, policy: &ThrottlePolicy) {
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        match Limiter::from_policy(policy) {
            Some(limiter) => {
                limiters.insert(source, Arc::new(limiter));
            }
            None => {
                limiters.remove(&source);
            }
        }
    }

    /// Whether a source is paced at all
    pub fn is_throttled(&self, source: SourceId) -> bool {
        self.limiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&source)
    }

    fn limiter(&self, source: SourceId) -> Option<Arc<Limiter>> {
        self.limiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&source)
            .cloned()
    }

    /// Wait until the next call to `source` is permitted
    pub async fn acquire(&self, source: SourceId) {
        if let Some(limiter) = self.limiter(source) {
            limiter.acquire(source).await;
        }
    }

    /// Current adaptive delay of a source
    pub async fn current_delay(&self, source: SourceId) -> Option<Duration> {
        match self.limiter(source).as_deref() {
            Some(Limiter::Adaptive { state, .. }) => Some(state.lock().await.delay),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> ThrottlePolicy {
        ThrottlePolicy::Adaptive(AdaptiveDelay {
            min_delay_ms: 100,
            max_delay_ms: 1_000,
            growth_factor: 2.0,
            rapid_threshold: 3,
            idle_reset_ms: 5_000,
        })
    }

    #[tokio::test]
    async fn test_unthrottled_source_is_immediate() {
        let throttle = SourceThrottle::new();
        let start = Instant::now();
        for _ in 0..10 {
            throttle.acquire(SourceId(1)).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(!throttle.is_throttled(SourceId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_spacing() {
        let throttle = SourceThrottle::with_policies([(SourceId(1), tuning())]);
        let start = Instant::now();

        throttle.acquire(SourceId(1)).await;
        throttle.acquire(SourceId(1)).await;
        throttle.acquire(SourceId(1)).await;

        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_grows_then_decays() {
        let throttle = SourceThrottle::with_policies([(SourceId(1), tuning())]);

        for _ in 0..4 {
            throttle.acquire(SourceId(1)).await;
        }
        assert_eq!(
            throttle.current_delay(SourceId(1)).await,
            Some(Duration::from_millis(200))
        );

        tokio::time::advance(Duration::from_secs(12)).await;
        throttle.acquire(SourceId(1)).await;
        assert_eq!(
            throttle.current_delay(SourceId(1)).await,
            Some(Duration::from_millis(100))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_capped_at_max() {
        let throttle = SourceThrottle::with_policies([(SourceId(1), tuning())]);
        for _ in 0..40 {
            throttle.acquire(SourceId(1)).await;
        }
        assert_eq!(
            throttle.current_delay(SourceId(1)).await,
            Some(Duration::from_millis(1_000))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_are_independent() {
        let throttle = SourceThrottle::with_policies([(SourceId(1), tuning())]);
        for _ in 0..4 {
            throttle.acquire(SourceId(1)).await;
        }

        let start = Instant::now();
        throttle.acquire(SourceId(2)).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(throttle.current_delay(SourceId(2)).await, None);
    }

    #[tokio::test]
    async fn test_quota_allows_burst() {
        let throttle =
            SourceThrottle::with_policies([(SourceId(1), ThrottlePolicy::Quota { per_second: 5 })]);
        let result = tokio::time::timeout(Duration::from_secs(1), async {
            throttle.acquire(SourceId(1)).await;
            throttle.acquire(SourceId(1)).await;
        })
        .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_growth_saturates_instead_of_overflowing() {
        let max = Duration::from_millis(5_000);
        assert_eq!(grown(Duration::from_millis(250), 2.0, max), Duration::from_millis(500));
        assert_eq!(grown(Duration::from_millis(250), 1e20, max), max);
        assert_eq!(grown(Duration::MAX, 1.5, max), max);
        assert_eq!(grown(Duration::from_millis(250), f64::INFINITY, max), max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_growth_factor_caps_at_max() {
        let throttle = SourceThrottle::with_policies([(
            SourceId(1),
            ThrottlePolicy::Adaptive(AdaptiveDelay {
                min_delay_ms: 100,
                max_delay_ms: 1_000,
                growth_factor: 1e20,
                rapid_threshold: 1,
                idle_reset_ms: 5_000,
            }),
        )]);
        for _ in 0..3 {
            throttle.acquire(SourceId(1)).await;
        }
        assert_eq!(
            throttle.current_delay(SourceId(1)).await,
            Some(Duration::from_millis(1_000))
        );
    }

    #[test]
    fn test_unlimited_policy_removes_limiter() {
        let throttle = SourceThrottle::with_policies([(SourceId(1), tuning())]);
        assert!(throttle.is_throttled(SourceId(1)));
        throttle.set_policy(SourceId(1), &ThrottlePolicy::Unlimited);
        assert!(!throttle.is_throttled(SourceId(1)));
        assert_eq!(tokio_test::block_on(throttle.current_delay(SourceId(1))), None);
    }

    #[test]
    fn test_policy_deserialize() {
        let policy: ThrottlePolicy =
            serde_json::from_str(r#"{ "kind": "adaptive", "min_delay_ms": 500 }"#).unwrap();
        match policy {
            ThrottlePolicy::Adaptive(tuning) => {
                assert_eq!(tuning.min_delay_ms, 500);
                assert_eq!(tuning.rapid_threshold, 5);
            }
            other => panic!("unexpected policy {other:?}"),
        }

        let quota: ThrottlePolicy =
            serde_json::from_str(r#"{ "kind": "quota", "per_second": 2 }"#).unwrap();
        assert_eq!(quota, ThrottlePolicy::Quota { per_second: 2 });
    }
}
