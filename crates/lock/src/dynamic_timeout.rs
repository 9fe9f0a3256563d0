// Copyright 2025 SlateFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of outcome events per adjustment window.
pub const DYNAMIC_TIMEOUT_LOG_SIZE: usize = 256;

/// Hard ceiling no dynamic timeout grows past.
pub const MAX_DYNAMIC_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Adaptive timeout controller fed by lock acquisition outcomes.
///
/// One instance exists per operation category (object read, multipart
/// commit, healing, ...). Acquire paths call [`timeout`](Self::timeout)
/// to bound their wait, then report back with
/// [`log_success`](Self::log_success) or
/// [`log_failure`](Self::log_failure). Every
/// [`DYNAMIC_TIMEOUT_LOG_SIZE`] reported outcomes close a window: a
/// window that saw any failure doubles the timeout (capped at
/// [`MAX_DYNAMIC_TIMEOUT`]); a clean window tightens it toward twice
/// the mean grant latency, never below the configured floor. The
/// controller therefore reacts quickly to overload and slowly to
/// recovery.
#[derive(Debug)]
pub struct DynamicTimeout {
    /// Current timeout in nanoseconds, read lock-free by acquire paths.
    timeout: AtomicU64,
    minimum: u64,
    window: Mutex<OutcomeWindow>,
}

#[derive(Debug)]
struct OutcomeWindow {
    /// Ring of the last `DYNAMIC_TIMEOUT_LOG_SIZE` success latencies in
    /// nanoseconds, seeded with the initial timeout.
    log: [u64; DYNAMIC_TIMEOUT_LOG_SIZE],
    index: usize,
    entries: usize,
    failures: usize,
}

impl DynamicTimeout {
    /// Creates a controller starting at `initial` with floor `minimum`.
    ///
    /// Requires `initial >= minimum > 0`; anything else is a
    /// programming error.
    pub fn new(initial: Duration, minimum: Duration) -> Self {
        assert!(minimum > Duration::ZERO, "dynamic timeout minimum must be positive");
        assert!(initial >= minimum, "dynamic timeout initial must not be below its minimum");
        assert!(minimum <= MAX_DYNAMIC_TIMEOUT, "dynamic timeout minimum exceeds the hard ceiling");

        let initial = initial.min(MAX_DYNAMIC_TIMEOUT);
        let seed = initial.as_nanos() as u64;
        Self {
            timeout: AtomicU64::new(seed),
            minimum: minimum.as_nanos() as u64,
            window: Mutex::new(OutcomeWindow {
                log: [seed; DYNAMIC_TIMEOUT_LOG_SIZE],
                index: 0,
                entries: 0,
                failures: 0,
            }),
        }
    }

    /// Returns the timeout currently in effect.
    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout.load(Ordering::Relaxed))
    }

    /// Records a granted acquire and the time it took.
    pub fn log_success(&self, duration: Duration) {
        let mut window = self.window.lock().unwrap();
        let slot = window.index;
        window.log[slot] = duration.as_nanos().min(u64::MAX as u128) as u64;
        window.index = (window.index + 1) % DYNAMIC_TIMEOUT_LOG_SIZE;
        window.entries += 1;
        if window.entries == DYNAMIC_TIMEOUT_LOG_SIZE {
            self.adjust(&mut window);
        }
    }

    /// Records a timed-out or canceled acquire.
    pub fn log_failure(&self) {
        let mut window = self.window.lock().unwrap();
        window.failures += 1;
        window.entries += 1;
        if window.entries == DYNAMIC_TIMEOUT_LOG_SIZE {
            self.adjust(&mut window);
        }
    }

    /// Recomputes the current timeout at a window boundary. A single
    /// failure dominates any number of successes in the same window.
    fn adjust(&self, window: &mut OutcomeWindow) {
        let current = self.timeout.load(Ordering::Relaxed);
        let ceiling = MAX_DYNAMIC_TIMEOUT.as_nanos() as u64;

        let next = if window.failures > 0 {
            current.saturating_mul(2).min(ceiling)
        } else {
            let mean = (window.log.iter().map(|&v| v as u128).sum::<u128>() / DYNAMIC_TIMEOUT_LOG_SIZE as u128) as u64;
            current.min(mean.saturating_mul(2)).max(self.minimum)
        };

        self.timeout.store(next, Ordering::Relaxed);
        window.entries = 0;
        window.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn feed_successes(timeout: &DynamicTimeout, duration: Duration, windows: usize) {
        for _ in 0..windows * DYNAMIC_TIMEOUT_LOG_SIZE {
            timeout.log_success(duration);
        }
    }

    #[test]
    fn test_single_increase() {
        let timeout = DynamicTimeout::new(Duration::from_secs(60), Duration::from_secs(1));
        let initial = timeout.timeout();

        for _ in 0..DYNAMIC_TIMEOUT_LOG_SIZE {
            timeout.log_failure();
        }

        let adjusted = timeout.timeout();
        assert!(adjusted > initial, "expected {adjusted:?} to be more than {initial:?}");
        assert_eq!(adjusted, Duration::from_secs(120));
    }

    #[test]
    fn test_dual_increase() {
        let timeout = DynamicTimeout::new(Duration::from_secs(60), Duration::from_secs(1));
        let initial = timeout.timeout();

        for _ in 0..DYNAMIC_TIMEOUT_LOG_SIZE {
            timeout.log_failure();
        }
        let adjusted = timeout.timeout();

        for _ in 0..DYNAMIC_TIMEOUT_LOG_SIZE {
            timeout.log_failure();
        }
        let adjusted_again = timeout.timeout();

        assert!(initial < adjusted && adjusted < adjusted_again);
    }

    #[test]
    fn test_single_decrease() {
        let timeout = DynamicTimeout::new(Duration::from_secs(60), Duration::from_secs(1));

        feed_successes(&timeout, Duration::from_secs(20), 1);

        // One clean window tightens to twice the observed mean.
        assert_eq!(timeout.timeout(), Duration::from_secs(40));
    }

    #[test]
    fn test_dual_decrease() {
        let timeout = DynamicTimeout::new(Duration::from_secs(60), Duration::from_secs(1));

        feed_successes(&timeout, Duration::from_secs(20), 1);
        let adjusted = timeout.timeout();

        feed_successes(&timeout, Duration::from_secs(10), 1);
        let adjusted_again = timeout.timeout();

        assert!(adjusted_again < adjusted);
        assert_eq!(adjusted_again, Duration::from_secs(20));
    }

    #[test]
    fn test_steady_stream_is_stable() {
        let timeout = DynamicTimeout::new(Duration::from_secs(60), Duration::from_secs(1));

        feed_successes(&timeout, Duration::from_secs(20), 1);
        assert_eq!(timeout.timeout(), Duration::from_secs(40));

        // Further identical windows do not move the value.
        feed_successes(&timeout, Duration::from_secs(20), 1);
        assert_eq!(timeout.timeout(), Duration::from_secs(40));
    }

    #[test]
    fn test_many_decreases_converge() {
        let timeout = DynamicTimeout::new(Duration::from_secs(60), Duration::from_secs(1));
        let initial = timeout.timeout();
        let success = Duration::from_secs(20);

        feed_successes(&timeout, success, 100);

        let adjusted = timeout.timeout();
        assert!(adjusted < initial && adjusted > success);
        assert_eq!(adjusted, 2 * success);
    }

    #[test]
    fn test_hit_minimum() {
        let minimum = Duration::from_secs(30);
        let timeout = DynamicTimeout::new(Duration::from_secs(60), minimum);

        // Twice the mean latency sits below the floor, so the clamp is
        // what keeps the value up.
        feed_successes(&timeout, Duration::from_secs(10), 100);

        assert_eq!(timeout.timeout(), minimum);
    }

    #[test]
    fn test_failure_dominates_mixed_window() {
        let timeout = DynamicTimeout::new(Duration::from_secs(60), Duration::from_secs(1));

        for _ in 0..DYNAMIC_TIMEOUT_LOG_SIZE - 1 {
            timeout.log_success(Duration::from_secs(20));
        }
        timeout.log_failure();

        assert_eq!(timeout.timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_recovery_after_overload() {
        let timeout = DynamicTimeout::new(Duration::from_secs(60), Duration::from_secs(1));

        feed_successes(&timeout, Duration::from_secs(20), 1);
        assert_eq!(timeout.timeout(), Duration::from_secs(40));

        for _ in 0..DYNAMIC_TIMEOUT_LOG_SIZE - 1 {
            timeout.log_success(Duration::from_secs(20));
        }
        timeout.log_failure();
        assert_eq!(timeout.timeout(), Duration::from_secs(80));
    }

    #[test]
    fn test_failures_saturate_at_ceiling() {
        let timeout = DynamicTimeout::new(Duration::from_secs(60), Duration::from_secs(1));

        for _ in 0..100 * DYNAMIC_TIMEOUT_LOG_SIZE {
            timeout.log_failure();
        }

        assert_eq!(timeout.timeout(), MAX_DYNAMIC_TIMEOUT);
    }

    #[test]
    fn test_concurrent() {
        let timeout = Arc::new(DynamicTimeout::new(Duration::from_secs(1), Duration::from_millis(1)));
        let threads: Vec<_> = (0..8)
            .map(|seed| {
                let timeout = Arc::clone(&timeout);
                std::thread::spawn(move || {
                    use rand::{Rng, SeedableRng};
                    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
                    for _ in 0..100 {
                        timeout.log_failure();
                        for _ in 0..100 {
                            timeout.log_success(Duration::from_nanos(rng.random_range(0..1_000_000_000)));
                        }
                        let current = timeout.timeout();
                        assert!(current >= Duration::from_millis(1));
                        assert!(current <= MAX_DYNAMIC_TIMEOUT);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    #[should_panic(expected = "initial must not be below its minimum")]
    fn test_rejects_initial_below_minimum() {
        let _ = DynamicTimeout::new(Duration::from_millis(1), Duration::from_secs(1));
    }
}
