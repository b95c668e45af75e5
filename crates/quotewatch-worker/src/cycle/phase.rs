use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Where a cycle currently is.
///
/// `Idle → Fetching → Filtering → Persisting → Recording → Idle`. A failed
/// attempt loops back to `Fetching` while retry budget remains; a cycle that
/// gives up goes through `Failed` and is still recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Fetching,
    Filtering,
    Persisting,
    Recording,
    Failed,
}

impl CyclePhase {
    #[must_use]
    pub fn can_transition_to(self, next: CyclePhase) -> bool {
        use CyclePhase::{Failed, Fetching, Filtering, Idle, Persisting, Recording};
        matches!(
            (self, next),
            (Idle | Fetching | Persisting, Fetching)
                | (Fetching, Filtering)
                | (Filtering, Persisting | Recording)
                | (Persisting | Failed, Recording)
                // Idle → Failed only when cancelled before the first fetch.
                | (Idle | Fetching | Persisting, Failed)
                | (Recording, Idle)
        )
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Fetching => "fetching",
            CyclePhase::Filtering => "filtering",
            CyclePhase::Persisting => "persisting",
            CyclePhase::Recording => "recording",
            CyclePhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct ProgressState {
    phase: CyclePhase,
    fetched: u64,
    filtered_out: u64,
}

/// Mutable per-cycle progress shared between the cycle driver and its
/// attempts. Lives for exactly one cycle.
#[derive(Debug)]
pub(crate) struct CycleProgress {
    state: Mutex<ProgressState>,
}

impl CycleProgress {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState {
                phase: CyclePhase::Idle,
                fetched: 0,
                filtered_out: 0,
            }),
        }
    }

    pub(crate) fn advance(&self, next: CyclePhase) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(
            state.phase.can_transition_to(next),
            "illegal cycle transition {} -> {next}",
            state.phase
        );
        tracing::debug!(from = %state.phase, to = %next, "cycle phase");
        state.phase = next;
    }

    /// Remember what the latest successful fetch produced.
    pub(crate) fn note_fetch(&self, fetched: u64, filtered_out: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.fetched = fetched;
        state.filtered_out = filtered_out;
    }

    pub(crate) fn phase(&self) -> CyclePhase {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .phase
    }

    /// `(fetched, filtered_out)` from the latest successful fetch.
    pub(crate) fn fetch_counts(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.fetched, state.filtered_out)
    }
}
