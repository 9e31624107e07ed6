use std::time::Duration;

use crate::config::SupervisorSettings;

/// Respawn delays for crashed workers.
///
/// delay = min(initial * 2^(consecutive_exits - 1), max)
///
/// A worker that stayed up for at least `stable_after` resets its slot, so
/// its next exit waits only the initial delay again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespawnPolicy {
    initial: Duration,
    max: Duration,
    stable_after: Duration,
}

impl RespawnPolicy {
    pub fn new(initial: Duration, max: Duration, stable_after: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            stable_after,
        }
    }

    /// Record an exit for `slot` after the worker ran for `lived`, returning
    /// how long to wait before launching its replacement.
    pub fn next_delay(&self, slot: &mut SlotBackoff, lived: Duration) -> Duration {
        if lived >= self.stable_after {
            slot.consecutive_exits = 0;
        }
        slot.consecutive_exits = slot.consecutive_exits.saturating_add(1);

        let exponent = (slot.consecutive_exits - 1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl From<&SupervisorSettings> for RespawnPolicy {
    fn from(settings: &SupervisorSettings) -> Self {
        Self::new(
            settings.respawn_initial_backoff,
            settings.respawn_max_backoff,
            settings.stable_after,
        )
    }
}

/// Per-slot exit history.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlotBackoff {
    consecutive_exits: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RespawnPolicy {
        RespawnPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = policy();
        let mut slot = SlotBackoff::default();
        let delays: Vec<_> = (0..6)
            .map(|_| policy.next_delay(&mut slot, Duration::from_millis(5)))
            .collect();

        assert_eq!(
            delays,
            [100, 200, 400, 800, 1_000, 1_000].map(Duration::from_millis)
        );
    }

    #[test]
    fn stable_worker_resets_its_slot() {
        let policy = policy();
        let mut slot = SlotBackoff::default();
        policy.next_delay(&mut slot, Duration::ZERO);
        policy.next_delay(&mut slot, Duration::ZERO);
        policy.next_delay(&mut slot, Duration::ZERO);

        let delay = policy.next_delay(&mut slot, Duration::from_secs(30));
        assert_eq!(delay, Duration::from_millis(100));
    }

    #[test]
    fn long_crash_loops_stay_capped() {
        let policy = policy();
        let mut slot = SlotBackoff::default();
        let last = (0..200)
            .map(|_| policy.next_delay(&mut slot, Duration::ZERO))
            .last();
        assert_eq!(last, Some(Duration::from_millis(1_000)));
    }
}
