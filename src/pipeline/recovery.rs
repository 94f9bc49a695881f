//! Timeout and overrun handling between frame waits

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Normal,
    /// A timeout restart was issued and no clean cycle has followed yet
    Recovering,
}

/// What the loop must do after consulting the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Carry on with copy and publish
    Proceed,
    /// Issue a timeout restart and skip this cycle
    Restart,
    /// Issue one re-arm restart, then publish this cycle's frame
    Rearm,
}

#[derive(Debug)]
pub struct RecoveryPolicy {
    state: RecoveryState,
    last_timeouts: u64,
    last_overruns: u64,
    overruns: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryPolicy {
    pub fn new() -> Self {
        Self {
            state: RecoveryState::Normal,
            last_timeouts: 0,
            last_overruns: 0,
            overruns: 0,
        }
    }

    /// Start from the device's current counters so earlier history is ignored
    pub fn with_baseline(timeouts: u64, overruns: u64) -> Self {
        Self {
            last_timeouts: timeouts,
            last_overruns: overruns,
            ..Self::new()
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Feed the device-reported cumulative counters for this cycle
    pub fn observe(&mut self, timeouts: u64, overruns: u64) -> RecoveryAction {
        if overruns > self.last_overruns {
            let new = overruns - self.last_overruns;
            self.overruns += new;
            self.last_overruns = overruns;
            warn!("{} buffer overrun(s), {} total", new, self.overruns);
        }

        if timeouts > self.last_timeouts {
            warn!(
                "Frame timeout ({} total), restarting acquisition",
                timeouts
            );
            self.last_timeouts = timeouts;
            self.state = RecoveryState::Recovering;
            return RecoveryAction::Restart;
        }

        match self.state {
            RecoveryState::Normal => RecoveryAction::Proceed,
            RecoveryState::Recovering => {
                info!("Frames flowing again, re-arming");
                self.state = RecoveryState::Normal;
                RecoveryAction::Rearm
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_counters_proceed() {
        let mut policy = RecoveryPolicy::new();
        for _ in 0..3 {
            assert_eq!(policy.observe(0, 0), RecoveryAction::Proceed);
        }
        assert_eq!(policy.state(), RecoveryState::Normal);
    }

    #[test]
    fn timeout_then_clean_cycle_rearms_once() {
        let mut policy = RecoveryPolicy::new();
        assert_eq!(policy.observe(1, 0), RecoveryAction::Restart);
        assert_eq!(policy.state(), RecoveryState::Recovering);
        assert_eq!(policy.observe(1, 0), RecoveryAction::Rearm);
        assert_eq!(policy.state(), RecoveryState::Normal);
        assert_eq!(policy.observe(1, 0), RecoveryAction::Proceed);
    }

    #[test]
    fn consecutive_timeouts_restart_each_time() {
        let mut policy = RecoveryPolicy::new();
        assert_eq!(policy.observe(1, 0), RecoveryAction::Restart);
        assert_eq!(policy.observe(2, 0), RecoveryAction::Restart);
        assert_eq!(policy.observe(2, 0), RecoveryAction::Rearm);
    }

    #[test]
    fn overruns_only_count() {
        let mut policy = RecoveryPolicy::with_baseline(0, 4);
        assert_eq!(policy.observe(0, 4), RecoveryAction::Proceed);
        assert_eq!(policy.observe(0, 6), RecoveryAction::Proceed);
        assert_eq!(policy.overruns(), 2);
        assert_eq!(policy.state(), RecoveryState::Normal);
    }
}
