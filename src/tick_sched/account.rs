use super::{TickSched, TickState};
use crate::{platform::AccountKind, CpuId, Platform};
use nohz_util::sync::RateLimit;

/// The accounting bucket that ticks skipped while a CPU's tick is stopped
/// will be charged to when they are flushed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum AccountingReason {
    /// Nothing is pending.
    #[default]
    None,
    /// The tick was stopped by the idle loop.
    Idle,
    /// The tick was stopped while the task ran in user mode.
    User,
    /// The tick was stopped while the task ran in the kernel.
    System,
}

/// Flushed tick counts at or above this are assumed to come from a corrupted
/// snapshot.
const IMPLAUSIBLE_TICKS: u64 = i64::MAX as u64;

static IMPLAUSIBLE: RateLimit = RateLimit::new(1);

impl AccountingReason {
    /// Returns the sink that ticks saved for this reason are charged to.
    #[must_use]
    pub fn kind(self) -> Option<AccountKind> {
        match self {
            Self::None => None,
            Self::Idle => Some(AccountKind::Idle),
            Self::User => Some(AccountKind::User),
            Self::System => Some(AccountKind::System),
        }
    }
}

impl<P: Platform> TickSched<P> {
    /// Charges the ticks that elapsed since `saved_jiffies` to the bucket
    /// selected by `saved_reason`, and re-snapshots `saved_jiffies` so that a
    /// repeated flush charges nothing.
    ///
    /// Returns the number of ticks charged.
    pub(super) fn flush(&self, cpu: CpuId, ts: &mut TickState) -> u64 {
        let jiffies = self.jiffies.get();
        let ticks = jiffies.wrapping_sub(ts.saved_jiffies);
        ts.saved_jiffies = jiffies;

        if ticks == 0 {
            return 0;
        }

        if ticks >= IMPLAUSIBLE_TICKS {
            if IMPLAUSIBLE.allow() {
                tracing::warn!(
                    %cpu,
                    jiffies,
                    saved_jiffies = jiffies.wrapping_sub(ticks),
                    reason = ?ts.saved_reason,
                    "refusing to account an implausible number of skipped ticks"
                );
            }
            return 0;
        }

        let Some(kind) = ts.saved_reason.kind() else {
            return 0;
        };
        tracing::trace!(%cpu, ?kind, ticks, "flushing skipped ticks");
        self.platform.account_ticks(kind, cpu, ticks);
        ticks
    }

    /// Begins saving skipped ticks for `reason` from the current tick count.
    pub(super) fn save_ticks(&self, ts: &mut TickState, reason: AccountingReason) {
        ts.saved_jiffies = self.jiffies.get();
        ts.saved_reason = reason;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_map_to_sinks() {
        assert_eq!(AccountingReason::None.kind(), None);
        assert_eq!(AccountingReason::Idle.kind(), Some(AccountKind::Idle));
        assert_eq!(AccountingReason::User.kind(), Some(AccountKind::User));
        assert_eq!(AccountingReason::System.kind(), Some(AccountKind::System));
        assert_eq!(AccountingReason::default(), AccountingReason::None);
    }
}
