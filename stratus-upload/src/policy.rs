//! Completion decision for an upload session.
//!
//! Pure logic: no I/O, no locks. The session feeds it counters after
//! every state-mutating event.

/// Phase of a session as seen by the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Still accepting field and file events
    Open,
    /// The classifier signaled end-of-stream
    AllPartsObserved { expected_files: usize },
    /// Finished or aborted
    Terminal,
}

/// Everything the policy looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyInput {
    pub phase: Phase,
    pub wait_for_remote: bool,
    pub completed_files: usize,
    pub completed_remote: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionDecision {
    pub is_complete: bool,
}

impl CompletionDecision {
    const PENDING: Self = Self { is_complete: false };
    const COMPLETE: Self = Self { is_complete: true };
}

/// Decide whether a session is done.
///
/// Nothing completes before the classifier's end-of-stream. A form with no
/// files completes right there. Fire-and-forget completes once every file
/// reached local end-of-stream; wait-for-remote also needs every remote leg.
pub fn decide(input: PolicyInput) -> CompletionDecision {
    let expected = match input.phase {
        Phase::Open | Phase::Terminal => return CompletionDecision::PENDING,
        Phase::AllPartsObserved { expected_files } => expected_files,
    };

    if expected == 0 {
        return CompletionDecision::COMPLETE;
    }

    let local_done = input.completed_files >= expected;
    let remote_done = input.completed_remote >= expected;

    if !input.wait_for_remote {
        return CompletionDecision {
            is_complete: local_done,
        };
    }

    CompletionDecision {
        is_complete: local_done && remote_done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(phase: Phase, wait: bool, files: usize, remote: usize) -> PolicyInput {
        PolicyInput {
            phase,
            wait_for_remote: wait,
            completed_files: files,
            completed_remote: remote,
        }
    }

    fn observed(n: usize) -> Phase {
        Phase::AllPartsObserved { expected_files: n }
    }

    #[test]
    fn open_sessions_never_complete() {
        for wait in [true, false] {
            assert!(!decide(input(Phase::Open, wait, 3, 3)).is_complete);
            assert!(!decide(input(Phase::Open, wait, 0, 0)).is_complete);
        }
    }

    #[test]
    fn terminal_sessions_never_complete_again() {
        assert!(!decide(input(Phase::Terminal, true, 1, 1)).is_complete);
    }

    #[test]
    fn fields_only_form_completes_at_end_of_stream() {
        assert!(decide(input(observed(0), true, 0, 0)).is_complete);
        assert!(decide(input(observed(0), false, 0, 0)).is_complete);
    }

    #[test]
    fn fire_and_forget_ignores_remote_progress() {
        assert!(decide(input(observed(3), false, 3, 0)).is_complete);
        assert!(!decide(input(observed(3), false, 2, 3)).is_complete);
    }

    #[test]
    fn wait_for_remote_needs_every_remote_leg() {
        assert!(!decide(input(observed(3), true, 3, 2)).is_complete);
        assert!(!decide(input(observed(3), true, 2, 3)).is_complete);
        assert!(decide(input(observed(3), true, 3, 3)).is_complete);
    }
}
