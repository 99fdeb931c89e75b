use std::time::Duration;

use crate::config::ConnectionTuning;

// ── ConnectionState ──────────────────────────────────────────────

/// Connection state observable by consumers.
///
/// `Idle → Connecting → Connected → Disconnecting → Idle` on the graceful
/// path; an unexpected loss goes `Connected → Reconnecting → Connecting`
/// and ends in `Stopped` once the attempt ceiling is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting { attempt: u32 },
    Stopped,
}

impl ConnectionState {
    /// States in which `connect()` has nothing to do.
    pub(crate) fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Reconnecting { .. }
        )
    }
}

// ── ReconnectPolicy ──────────────────────────────────────────────

/// Exponential backoff without a cap: attempt `n` waits `base * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_tuning(tuning: &ConnectionTuning) -> Self {
        Self {
            base_delay: tuning.reconnect_base_delay,
            max_attempts: tuning.max_reconnect_attempts,
        }
    }

    /// Delay before 1-based `attempt`, or `None` once the ceiling is
    /// passed. Saturates instead of overflowing.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1_u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_attempts,
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let p = policy(1000, 5);
        assert_eq!(p.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(p.delay_for(2), Some(Duration::from_secs(2)));
        assert_eq!(p.delay_for(3), Some(Duration::from_secs(4)));
        assert_eq!(p.delay_for(4), Some(Duration::from_secs(8)));
        assert_eq!(p.delay_for(5), Some(Duration::from_secs(16)));
    }

    #[test]
    fn nothing_past_the_ceiling() {
        let p = policy(1000, 5);
        assert_eq!(p.delay_for(6), None);
        assert_eq!(p.delay_for(0), None);
        assert_eq!(policy(1000, 0).delay_for(1), None);
    }

    #[test]
    fn large_attempts_saturate() {
        let p = policy(1000, u32::MAX);
        assert_eq!(p.delay_for(40), Some(Duration::from_secs(1).saturating_mul(u32::MAX)));
        assert!(p.delay_for(u32::MAX).is_some());
    }

    #[test]
    fn default_tuning_policy() {
        let p = ReconnectPolicy::from_tuning(&ConnectionTuning::default());
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.delay_for(3), Some(Duration::from_secs(4)));
    }

    #[test]
    fn active_states() {
        assert!(ConnectionState::Connected.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Reconnecting { attempt: 2 }.is_active());
        assert!(!ConnectionState::Idle.is_active());
        assert!(!ConnectionState::Stopped.is_active());
        assert!(!ConnectionState::Disconnecting.is_active());
    }
}
