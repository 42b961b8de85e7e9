//! Adaptive rate controller.
//!
//! Given an operator deadline and a byte target, derives the batch pool size
//! and the inter-batch delay, and re-evaluates both on every completion.
//! The controller trades the two against each other: below one batch per
//! second of required throughput it keeps a single batch and stretches the
//! delay; above it the delay collapses to one tick and the pool grows with
//! the required rate.

use parking_lot::Mutex;
use scour_types::{MAX_BATCH_POOL, PAGE_SIZE, PAGES_PER_RD_BATCH};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Bytes in one full read batch.
pub const BATCH_BYTES: u64 = PAGES_PER_RD_BATCH as u64 * PAGE_SIZE as u64;

/// Smallest non-zero delay.
pub const TICK: Duration = Duration::from_millis(1);

/// Progress deficit (in batches) that triggers the optional I/O boost.
const BOOST_DEFICIT_BATCHES: u64 = 100;

/// Controller output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateTarget {
    pub pool_size: u16,
    pub delay: Duration,
}

/// Compute `(pool_size, delay)` from the remaining work and time.
///
/// Past the deadline the controller stops pacing entirely: maximum pool,
/// zero delay.
#[must_use]
pub fn adjust_rate(used_bytes: u64, total_scrubbed: u64, deadline_secs: u64, elapsed: Duration) -> RateTarget {
    let elapsed_secs = elapsed.as_secs();
    if elapsed_secs >= deadline_secs {
        return RateTarget {
            pool_size: MAX_BATCH_POOL,
            delay: Duration::ZERO,
        };
    }
    let rem_bytes = used_bytes.saturating_sub(total_scrubbed).max(BATCH_BYTES);
    let rem_secs = deadline_secs - elapsed_secs;
    let bytes_per_sec = rem_bytes.div_ceil(rem_secs);

    if bytes_per_sec < BATCH_BYTES {
        RateTarget {
            pool_size: 1,
            delay: Duration::from_secs(BATCH_BYTES / bytes_per_sec),
        }
    } else {
        RateTarget {
            pool_size: u16::try_from(bytes_per_sec.div_ceil(BATCH_BYTES))
                .unwrap_or(MAX_BATCH_POOL)
                .clamp(1, MAX_BATCH_POOL),
            delay: TICK,
        }
    }
}

/// Delay scaled down for a partially filled batch.
#[must_use]
pub fn scaled_delay(delay: Duration, page_count: usize) -> Duration {
    delay * u32::try_from(page_count).unwrap_or(u32::MAX) / PAGES_PER_RD_BATCH as u32
}

/// Remaining pacing interval a completing batch still owes, after crediting
/// its in-flight time and the wasted time carried from its previous lap.
#[must_use]
pub fn pacing_owed(
    delay: Duration,
    page_count: usize,
    in_flight: Duration,
    wasted: Duration,
) -> Duration {
    scaled_delay(delay, page_count).saturating_sub(in_flight + wasted)
}

/// Boost decision relative to the progress goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostAction {
    Boost,
    Restore,
    Keep,
}

/// Pluggable I/O-priority lever for the boost knob. The portable default
/// only records the transition; embedders wire a real ioprio syscall here.
pub trait IoPriorityHook: Send + Sync {
    fn boost(&self);
    fn restore(&self);
}

/// Records boost state and logs transitions.
#[derive(Debug, Default)]
pub struct LogOnlyPriority;

impl IoPriorityHook for LogOnlyPriority {
    fn boost(&self) {
        info!(event = "ioprio_boost", class = "best-effort", level = 4);
    }

    fn restore(&self) {
        info!(event = "ioprio_restore");
    }
}

/// Live rate parameters for one scrub run.
#[derive(Debug)]
pub struct RateState {
    deadline_secs: AtomicU64,
    used_bytes: AtomicU64,
    delay_micros: AtomicU64,
    started: Mutex<Instant>,
    boosted: AtomicBool,
}

impl RateState {
    #[must_use]
    pub fn new(deadline_secs: u64) -> Self {
        Self {
            deadline_secs: AtomicU64::new(deadline_secs),
            used_bytes: AtomicU64::new(0),
            delay_micros: AtomicU64::new(0),
            started: Mutex::new(Instant::now()),
            boosted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn deadline_secs(&self) -> u64 {
        self.deadline_secs.load(Ordering::Relaxed)
    }

    /// True when a deadline drives pacing at all.
    #[must_use]
    pub fn paced(&self) -> bool {
        self.deadline_secs() != 0
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn set_used_bytes(&self, bytes: u64) {
        self.used_bytes.store(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_micros(self.delay_micros.load(Ordering::Relaxed))
    }

    pub fn set_delay(&self, delay: Duration) {
        let old = self.delay();
        if old != delay {
            debug!(event = "rate_delay", old_us = old.as_micros() as u64, new_us = delay.as_micros() as u64);
            self.delay_micros
                .store(u64::try_from(delay.as_micros()).unwrap_or(u64::MAX), Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.lock().elapsed()
    }

    /// Restart the clock after the pre-enumeration pass, charging the time
    /// it took against the deadline.
    pub fn restart_clock_after_enumeration(&self) {
        let mut started = self.started.lock();
        let spent = started.elapsed().as_secs();
        let deadline = self.deadline_secs.load(Ordering::Relaxed);
        self.deadline_secs
            .store(deadline.saturating_sub(spent).max(1), Ordering::Relaxed);
        *started = Instant::now();
    }

    /// Compute the initial target from the current parameters.
    #[must_use]
    pub fn initial_target(&self) -> RateTarget {
        adjust_rate(self.used_bytes(), 0, self.deadline_secs(), Duration::ZERO)
    }

    /// The byte goal for the current wall-clock position.
    #[must_use]
    pub fn goal_bytes(&self, elapsed: Duration) -> u64 {
        let deadline = self.deadline_secs();
        if deadline == 0 {
            return 0;
        }
        elapsed.as_secs().saturating_mul(self.used_bytes()) / deadline
    }

    /// Should the controller re-derive the target? True when past the
    /// deadline or off the goal line by more than one batch either way.
    #[must_use]
    pub fn needs_adjustment(&self, elapsed: Duration, progress: u64) -> bool {
        let deadline = self.deadline_secs();
        if deadline == 0 {
            return false;
        }
        let goal = self.goal_bytes(elapsed);
        elapsed.as_secs() > deadline
            || progress + BATCH_BYTES < goal
            || goal + BATCH_BYTES < progress
    }

    /// Boost decision for the current progress position.
    #[must_use]
    pub fn boost_action(&self, elapsed: Duration, progress: u64) -> BoostAction {
        let goal = self.goal_bytes(elapsed);
        if progress + BOOST_DEFICIT_BATCHES * BATCH_BYTES < goal {
            if !self.boosted.swap(true, Ordering::Relaxed) {
                return BoostAction::Boost;
            }
        } else if progress > goal && self.boosted.swap(false, Ordering::Relaxed) {
            return BoostAction::Restore;
        }
        BoostAction::Keep
    }

    #[must_use]
    pub fn is_boosted(&self) -> bool {
        self.boosted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn fast_target_grows_pool_with_tick_delay() {
        // 600 MiB in 60 s needs 10 MiB/s = 80 batches/s.
        let target = adjust_rate(600 * MIB, 0, 60, Duration::ZERO);
        assert_eq!(target.delay, TICK);
        assert_eq!(target.pool_size, 80);
    }

    #[test]
    fn slow_target_single_batch_with_stretched_delay() {
        // 1 MiB in 100 s: far below one batch per second.
        let target = adjust_rate(MIB, 0, 100, Duration::ZERO);
        assert_eq!(target.pool_size, 1);
        // ceil(1MiB/100) = 10486 B/s; 128 KiB / 10486 = 12 s.
        assert_eq!(target.delay, Duration::from_secs(12));
    }

    #[test]
    fn past_deadline_unclamps_completely() {
        let target = adjust_rate(600 * MIB, 0, 60, Duration::from_secs(60));
        assert_eq!(target.pool_size, MAX_BATCH_POOL);
        assert_eq!(target.delay, Duration::ZERO);
    }

    #[test]
    fn finished_target_falls_back_to_one_batch_floor() {
        // Everything scrubbed already: remaining clamps to one batch.
        let target = adjust_rate(600 * MIB, 600 * MIB, 60, Duration::from_secs(30));
        assert_eq!(target.pool_size, 1);
        // 128 KiB over 30 s: 4370 B/s; delay = 131072/4370 = 29 s.
        assert_eq!(target.delay, Duration::from_secs(29));
    }

    #[test]
    fn pool_clamps_at_max() {
        // Absurd rate requirement.
        let target = adjust_rate(u64::MAX / 2, 0, 1, Duration::ZERO);
        assert_eq!(target.pool_size, MAX_BATCH_POOL);
        assert_eq!(target.delay, TICK);
    }

    #[test]
    fn scaled_delay_is_proportional_to_fill() {
        let full = Duration::from_secs(8);
        assert_eq!(scaled_delay(full, PAGES_PER_RD_BATCH), full);
        assert_eq!(scaled_delay(full, PAGES_PER_RD_BATCH / 2), full / 2);
        assert_eq!(scaled_delay(full, 0), Duration::ZERO);
    }

    #[test]
    fn pacing_credits_in_flight_and_wasted_time() {
        let delay = Duration::from_secs(4);
        // Full batch, 1 s in flight, 1 s carried: owes 2 s.
        assert_eq!(
            pacing_owed(delay, PAGES_PER_RD_BATCH, Duration::from_secs(1), Duration::from_secs(1)),
            Duration::from_secs(2)
        );
        // Credits exceeding the interval owe nothing.
        assert_eq!(
            pacing_owed(delay, PAGES_PER_RD_BATCH, Duration::from_secs(5), Duration::ZERO),
            Duration::ZERO
        );
    }

    #[test]
    fn needs_adjustment_tracks_goal_band() {
        let state = RateState::new(100);
        state.set_used_bytes(100 * BATCH_BYTES * 100);
        // Goal at t=10s is 10% of used bytes.
        let elapsed = Duration::from_secs(10);
        let goal = state.goal_bytes(elapsed);
        assert!(!state.needs_adjustment(elapsed, goal));
        assert!(state.needs_adjustment(elapsed, goal + 2 * BATCH_BYTES));
        assert!(state.needs_adjustment(elapsed, goal.saturating_sub(2 * BATCH_BYTES)));
        assert!(state.needs_adjustment(Duration::from_secs(101), goal));
    }

    #[test]
    fn no_deadline_never_adjusts() {
        let state = RateState::new(0);
        assert!(!state.paced());
        assert!(!state.needs_adjustment(Duration::from_secs(1000), 0));
    }

    #[test]
    fn boost_fires_once_and_restores_once() {
        let state = RateState::new(100);
        state.set_used_bytes(BATCH_BYTES * 100_000);
        let late = Duration::from_secs(50);
        // Way behind goal.
        assert_eq!(state.boost_action(late, 0), BoostAction::Boost);
        assert_eq!(state.boost_action(late, 0), BoostAction::Keep);
        assert!(state.is_boosted());
        // Ahead of goal: restore exactly once.
        let ahead = state.goal_bytes(late) + BATCH_BYTES;
        assert_eq!(state.boost_action(late, ahead), BoostAction::Restore);
        assert_eq!(state.boost_action(late, ahead), BoostAction::Keep);
        assert!(!state.is_boosted());
    }

    #[test]
    fn enumeration_charges_the_deadline() {
        let state = RateState::new(60);
        std::thread::sleep(Duration::from_millis(5));
        state.restart_clock_after_enumeration();
        // Sub-second enumeration rounds to zero charge.
        assert_eq!(state.deadline_secs(), 60);
        assert!(state.elapsed() < Duration::from_secs(1));
    }
}
