use chrono::{DateTime, Duration, Utc};

/// Quota information reported by the remote API alongside a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaHint {
    /// Remaining budget according to the API
    pub remaining: u32,

    /// When the API will restore the budget, if it said so
    pub reset_at: Option<DateTime<Utc>>,
}

/// Tracks the remaining call budget of one credential
///
/// All methods take `now` explicitly so reset behaviour can be tested without
/// waiting on the wall clock.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialState {
    /// Budget restored on every reset
    pub max_budget: u32,

    /// Current estimate of calls left in this window
    pub remaining: u32,

    /// When the current window ends; `None` until the first spend
    pub reset_at: Option<DateTime<Utc>>,

    /// When the budget was last restored
    pub last_reset_at: Option<DateTime<Utc>>,

    /// Window length used when the API does not report a reset time
    pub reset_interval: Duration,
}

impl CredentialState {
    /// Creates a state with a full budget
    pub fn new(max_budget: u32, reset_interval: Duration) -> Self {
        Self {
            max_budget,
            remaining: max_budget,
            reset_at: None,
            last_reset_at: None,
            reset_interval,
        }
    }

    /// Restores the budget if the window has ended
    ///
    /// Returns true if a reset happened.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        match self.reset_at {
            Some(reset_at) if reset_at <= now => {
                self.remaining = self.max_budget;
                self.last_reset_at = Some(reset_at);
                self.reset_at = None;
                true
            }
            _ => false,
        }
    }

    /// Checks if this credential may be handed out
    pub fn is_available(&self, safety_margin: u32) -> bool {
        self.remaining > safety_margin
    }

    /// Decrements the local estimate by `cost`, never below zero
    pub fn apply_spend(&mut self, cost: u32, now: DateTime<Utc>) {
        self.remaining = self.remaining.saturating_sub(cost);
        if self.reset_at.is_none() {
            self.reset_at = Some(now + self.reset_interval);
        }
    }

    /// Replaces the local estimate with the API's authoritative figure
    ///
    /// A hint from a later window than the one we track is taken as-is. A hint
    /// from the same window can only lower the estimate, so responses that
    /// arrive out of order never raise the budget between resets.
    pub fn reconcile(&mut self, hint: QuotaHint, now: DateTime<Utc>) {
        let reported = hint.remaining.min(self.max_budget);

        match (hint.reset_at, self.reset_at) {
            (Some(theirs), None) => {
                self.remaining = reported;
                self.reset_at = Some(theirs);
            }
            (Some(theirs), Some(ours)) if theirs > ours => {
                self.last_reset_at = Some(ours);
                self.remaining = reported;
                self.reset_at = Some(theirs);
            }
            _ => {
                self.remaining = self.remaining.min(reported);
                if self.reset_at.is_none() {
                    self.reset_at = Some(now + self.reset_interval);
                }
            }
        }
    }
}
