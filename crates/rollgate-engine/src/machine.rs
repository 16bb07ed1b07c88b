//! Stage transition function.
//!
//! Pure mapping from the current rollout state and an engine event to the
//! next stage. The engine never assigns `state.stage` directly; every change
//! goes through [`next_stage`] so illegal transitions surface as errors.

use std::fmt;

use rollgate_state::{RolloutState, Stage};

/// Something that happened while driving a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Engine picked up a freshly submitted plan.
    Begin,
    /// Target is ready and carries the live label set.
    TargetPromoted,
    /// Final schedule step confirmed and its gates passed.
    ScheduleComplete,
    /// Every verify gate passed.
    GatesPassed,
    /// Source group deleted and reported gone.
    SourceRetired,
    AbortRequested,
    /// Pre-rollout topology restored.
    RollbackConverged,
    /// Unrecoverable error; stop and wait for an operator.
    Halt,
    /// Operator resumed a halted rollout.
    Resume,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Begin => "begin",
            Event::TargetPromoted => "target_promoted",
            Event::ScheduleComplete => "schedule_complete",
            Event::GatesPassed => "gates_passed",
            Event::SourceRetired => "source_retired",
            Event::AbortRequested => "abort_requested",
            Event::RollbackConverged => "rollback_converged",
            Event::Halt => "halt",
            Event::Resume => "resume",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next stage for `event` in `state`, or `None` if the event is illegal there.
pub fn next_stage(state: &RolloutState, event: Event) -> Option<Stage> {
    use Stage::*;

    match (state.stage, event) {
        (Pending, Event::Begin) => Some(Preparing),
        (Preparing, Event::TargetPromoted) => Some(Shifting),
        (Shifting, Event::ScheduleComplete) => Some(Verifying),
        (Verifying, Event::GatesPassed) => Some(Finalizing),
        (Finalizing, Event::SourceRetired) => Some(Completed),

        (Aborting, Event::AbortRequested) => None,
        (stage, Event::AbortRequested) if !stage.is_terminal() => Some(Aborting),
        (Aborting, Event::RollbackConverged) => Some(RolledBack),

        (Preparing | Shifting | Verifying | Finalizing | Aborting, Event::Halt) => Some(Failed),
        (Failed, Event::Resume) => match state.failed_stage {
            Some(stage) if !stage.is_terminal() && stage != Failed && stage != Pending => {
                Some(stage)
            }
            _ => None,
        },

        _ => None,
    }
}
