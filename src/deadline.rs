// ============================================================================
// SECTION 10: DEADLINES & CANCELLATION
// ============================================================================
// Cooperative time budget for one request. Analyzers check it between
// independent sub-steps and return partial output with `timed_out: true`
// when it has expired. The CLI cancels the token on Ctrl-C.
// ============================================================================

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Optional wall-clock deadline plus an external cancellation signal.
#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Option<Instant>,
    token: CancellationToken,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

impl Deadline {
    /// Never expires unless cancelled.
    pub fn none() -> Self {
        Self {
            expires_at: None,
            token: CancellationToken::new(),
        }
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now().checked_add(budget),
            token: CancellationToken::new(),
        }
    }

    pub fn from_budget(budget: Option<Duration>) -> Self {
        budget.map_or_else(Self::none, Self::after)
    }

    /// Token shared with whoever may cancel this request.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.is_cancelled() || self.expires_at.map_or(false, |at| Instant::now() >= at)
    }

    /// Time left, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// `true` when `step` may run; logs the skip otherwise.
    pub fn allows(&self, step: &str) -> bool {
        if self.is_expired() {
            warn!(
                target: "forensics::deadline",
                step = step,
                cancelled = self.is_cancelled(),
                "Deadline reached, skipping remaining work"
            );
            false
        } else {
            true
        }
    }
}

#[cfg(test)]
mod deadline_tests {
    use super::*;

    #[test]
    fn test_unbounded_deadline_never_expires() {
        let d = Deadline::none();
        assert!(!d.is_expired());
        assert!(d.remaining().is_none());
        assert!(d.allows("anything"));
    }

    #[test]
    fn test_zero_budget_expires_immediately() {
        let d = Deadline::after(Duration::ZERO);
        assert!(d.is_expired());
        assert!(!d.allows("section"));
    }

    #[test]
    fn test_cancellation_is_shared() {
        let d = Deadline::from_budget(Some(Duration::from_secs(3600)));
        let clone = d.clone();
        d.token().cancel();
        assert!(clone.is_expired());
        assert!(clone.is_cancelled());
    }
}
