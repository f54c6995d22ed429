/// Phase definitions for one orchestrator iteration
///
/// An iteration walks `Idle → AcquiringCredential → Fetching → Merging →
/// CheckpointAdvanced → Idle`. `WaitingForQuota` is entered when no credential
/// is available, and `Draining` ends a pass on cancellation or when the
/// candidate set is exhausted.
use std::fmt;

/// Represents where the orchestrator currently is in its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrawlPhase {
    /// Between iterations; nothing in flight
    Idle,

    /// Asking the quota tracker for a credential
    AcquiringCredential,

    /// All credentials are below the margin; sleeping until a reset
    WaitingForQuota,

    /// A page request is in flight
    Fetching,

    /// Fetched entities are being committed to the store
    Merging,

    /// The cursor for the merged page has been durably saved
    CheckpointAdvanced,

    /// Pass finished (cancelled or candidate set exhausted)
    Draining,
}

impl CrawlPhase {
    /// Returns true if this phase may be followed by `next`
    ///
    /// Failures fall back to `Idle` from `Fetching` or `Merging`, which leaves
    /// the persisted checkpoint untouched.
    pub fn can_transition_to(&self, next: CrawlPhase) -> bool {
        use CrawlPhase::*;
        matches!(
            (self, next),
            (Idle, AcquiringCredential)
                | (Idle, Draining)
                | (AcquiringCredential, Fetching)
                | (AcquiringCredential, WaitingForQuota)
                | (AcquiringCredential, Draining)
                | (WaitingForQuota, AcquiringCredential)
                | (WaitingForQuota, Draining)
                | (Fetching, Merging)
                | (Fetching, Idle)
                | (Merging, CheckpointAdvanced)
                | (Merging, Idle)
                | (CheckpointAdvanced, Idle)
                | (Draining, Idle)
        )
    }

    /// Returns true if the pass has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Draining)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AcquiringCredential => "acquiring_credential",
            Self::WaitingForQuota => "waiting_for_quota",
            Self::Fetching => "fetching",
            Self::Merging => "merging",
            Self::CheckpointAdvanced => "checkpoint_advanced",
            Self::Draining => "draining",
        }
    }
}

impl fmt::Display for CrawlPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
