//! Pure phase lifecycle state machine
//!
//! Every status change a phase goes through is an [`PhaseEvent`] fed to
//! [`transition`]. The function is pure so the legal lifecycle can be tested
//! without a store or workers; [`apply`] layers timestamps on top.
//!
//! ```text
//! pending ──Dispatch──▶ running ──Succeed──▶ completed
//!    ▲                   │  ▲ Retry
//!    │ Recover ◀─────────┤  └──────┘
//!    │                   ├──Fail──▶ failed
//!    │                   └──Gate──▶ waiting_approval ──Approve──▶ completed
//!    └──────────────Reopen───────────────┘      └──Skip──▶ skipped
//! ```
//!
//! `ForceSkip` moves any non-terminal phase to skipped. `Retry` keeps the
//! phase running and bumps its retry count. `Recover` also bumps it, since
//! the interrupted attempt was spent.

use chrono::Utc;
use gantry_core::{GantryError, PhaseState, PhaseStatus, Result};

/// Inputs that drive a phase's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Scheduler handed the phase to a worker
    Dispatch,
    /// Worker attempt failed with retries remaining
    Retry,
    /// Worker succeeded and no gate applies
    Succeed,
    /// Worker succeeded and the phase needs approval
    Gate,
    /// Worker failed with no retries remaining
    Fail,
    /// Reviewer approved (or modified) the gated result
    Approve,
    /// Reviewer asked for the phase to run again
    Reopen,
    /// Reviewer skipped the phase
    Skip,
    /// Workflow cancellation or failure propagation
    ForceSkip,
    /// Restart recovery found the phase mid-flight with retries left
    Recover,
}

impl PhaseEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Retry => "retry",
            Self::Succeed => "succeed",
            Self::Gate => "gate",
            Self::Fail => "fail",
            Self::Approve => "approve",
            Self::Reopen => "reopen",
            Self::Skip => "skip",
            Self::ForceSkip => "force_skip",
            Self::Recover => "recover",
        }
    }
}

/// Pure transition function
///
/// Returns `None` when `event` is not legal in `from`.
pub fn transition(from: PhaseStatus, event: PhaseEvent) -> Option<PhaseStatus> {
    use PhaseEvent as E;
    use PhaseStatus as S;

    match (from, event) {
        (S::Pending, E::Dispatch) => Some(S::Running),
        (S::Running, E::Retry) => Some(S::Running),
        (S::Running, E::Succeed) => Some(S::Completed),
        (S::Running, E::Gate) => Some(S::WaitingApproval),
        (S::Running, E::Fail) => Some(S::Failed),
        (S::Running, E::Recover) => Some(S::Pending),
        (S::WaitingApproval, E::Approve) => Some(S::Completed),
        (S::WaitingApproval, E::Reopen) => Some(S::Pending),
        (S::WaitingApproval, E::Skip) => Some(S::Skipped),
        (status, E::ForceSkip) if !status.is_terminal() => Some(S::Skipped),
        _ => None,
    }
}

/// Apply an event to a phase, maintaining its timestamps
pub fn apply(phase: &mut PhaseState, event: PhaseEvent) -> Result<()> {
    let next = transition(phase.status, event).ok_or_else(|| GantryError::InvalidTransition {
        phase_id: phase.phase_id.clone(),
        from: phase.status.to_string(),
        event: event.as_str().to_string(),
    })?;

    let now = Utc::now();
    match event {
        PhaseEvent::Dispatch => {
            phase.started_at = Some(now);
            phase.finished_at = None;
            phase.error = None;
        }
        PhaseEvent::Retry => {
            phase.retry_count += 1;
        }
        PhaseEvent::Recover => {
            phase.retry_count += 1;
            phase.finished_at = None;
        }
        PhaseEvent::Reopen => {
            phase.finished_at = None;
        }
        _ => {}
    }
    if next.is_terminal() {
        phase.finished_at = Some(now);
    }

    phase.status = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut phase = PhaseState::pending("build");
        apply(&mut phase, PhaseEvent::Dispatch).unwrap();
        assert_eq!(phase.status, PhaseStatus::Running);
        assert!(phase.started_at.is_some());

        apply(&mut phase, PhaseEvent::Succeed).unwrap();
        assert_eq!(phase.status, PhaseStatus::Completed);
        assert!(phase.finished_at.is_some());
    }

    #[test]
    fn test_gate_paths() {
        assert_eq!(
            transition(PhaseStatus::Running, PhaseEvent::Gate),
            Some(PhaseStatus::WaitingApproval)
        );
        assert_eq!(
            transition(PhaseStatus::WaitingApproval, PhaseEvent::Approve),
            Some(PhaseStatus::Completed)
        );
        assert_eq!(
            transition(PhaseStatus::WaitingApproval, PhaseEvent::Reopen),
            Some(PhaseStatus::Pending)
        );
        assert_eq!(
            transition(PhaseStatus::WaitingApproval, PhaseEvent::Skip),
            Some(PhaseStatus::Skipped)
        );
    }

    #[test]
    fn test_terminal_states_are_final() {
        for status in [PhaseStatus::Completed, PhaseStatus::Failed, PhaseStatus::Skipped] {
            for event in [
                PhaseEvent::Dispatch,
                PhaseEvent::Succeed,
                PhaseEvent::Approve,
                PhaseEvent::ForceSkip,
                PhaseEvent::Recover,
            ] {
                assert_eq!(transition(status, event), None, "{:?} on {:?}", status, event);
            }
        }
    }

    #[test]
    fn test_force_skip_from_any_live_state() {
        for status in [
            PhaseStatus::Pending,
            PhaseStatus::Running,
            PhaseStatus::WaitingApproval,
        ] {
            assert_eq!(
                transition(status, PhaseEvent::ForceSkip),
                Some(PhaseStatus::Skipped)
            );
        }
    }

    #[test]
    fn test_invalid_transition_is_error() {
        let mut phase = PhaseState::pending("deploy");
        let err = apply(&mut phase, PhaseEvent::Approve).unwrap_err();
        assert!(matches!(err, GantryError::InvalidTransition { .. }));
        assert_eq!(phase.status, PhaseStatus::Pending);
    }

    #[test]
    fn test_retry_counts_attempts() {
        let mut phase = PhaseState::pending("build");
        apply(&mut phase, PhaseEvent::Dispatch).unwrap();
        apply(&mut phase, PhaseEvent::Retry).unwrap();
        apply(&mut phase, PhaseEvent::Retry).unwrap();
        assert_eq!(phase.status, PhaseStatus::Running);
        assert_eq!(phase.retry_count, 2);
    }

    #[test]
    fn test_recover_returns_to_pending_and_counts_attempt() {
        let mut phase = PhaseState::pending("test");
        apply(&mut phase, PhaseEvent::Dispatch).unwrap();
        phase.retry_count = 2;
        apply(&mut phase, PhaseEvent::Recover).unwrap();
        assert_eq!(phase.status, PhaseStatus::Pending);
        assert_eq!(phase.retry_count, 3);
    }
}
