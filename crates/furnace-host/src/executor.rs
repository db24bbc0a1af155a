//! Program Executor
//!
//! The state machine that advances a firing program through its steps and
//! through pause, cooldown, and fault states. The executor only tracks state
//! and time; driving the actuators to match is the controller's job, which
//! keeps every transition unit-testable with explicit timestamps.
//!
//! Step timing: a step lasts `(ramp + time + hold) × 60` seconds, compared
//! against elapsed seconds. The setpoint is the step's target for the whole
//! step; there is no staged ramp trajectory.

use crate::catalog::{Program, Step};
use crate::state::{ErrorKind, RunState};

pub struct Executor {
    state: RunState,
    active: Option<Program>,
    cooldown_ms: u64,
}

impl Executor {
    /// Creates an idle executor with the given cooldown length.
    pub fn new(cooldown_s: u64) -> Self {
        Self {
            state: RunState::Idle,
            active: None,
            cooldown_ms: cooldown_s * 1000,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// The program of the active or cooling-down run.
    pub fn program(&self) -> Option<&Program> {
        self.active.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn total_steps(&self) -> usize {
        self.active.as_ref().map_or(0, |p| p.steps.len())
    }

    /// Begins a run at step 0. The caller has already checked interlocks and
    /// resolved the program.
    pub fn start(&mut self, program: Program, now_ms: u64) {
        self.active = Some(program);
        self.state = RunState::Running {
            step_idx: 0,
            step_started_ms: now_ms,
        };
    }

    /// Ends the run (or acknowledges a fault) into cooldown.
    ///
    /// Returns false when already idle, which leaves the state untouched.
    pub fn stop(&mut self, now_ms: u64) -> bool {
        if matches!(self.state, RunState::Idle) {
            return false;
        }
        self.state = RunState::Cooldown { since_ms: now_ms };
        true
    }

    /// Drops into a fault state. Only an explicit stop leaves it.
    pub fn fault(&mut self, kind: ErrorKind) {
        self.state = RunState::Fault { kind };
    }

    /// The door opened mid-run: suspend, preserving elapsed step time.
    pub fn door_opened(&mut self, now_ms: u64) {
        if let RunState::Running {
            step_idx,
            step_started_ms,
        } = self.state
        {
            self.state = RunState::Paused {
                step_idx,
                elapsed_in_step_ms: now_ms.saturating_sub(step_started_ms),
            };
        }
    }

    /// Operator pause toggle. Returns whether the run is now paused.
    pub fn toggle_pause(&mut self, now_ms: u64) -> Result<bool, &'static str> {
        match self.state {
            RunState::Running {
                step_idx,
                step_started_ms,
            } => {
                self.state = RunState::Paused {
                    step_idx,
                    elapsed_in_step_ms: now_ms.saturating_sub(step_started_ms),
                };
                Ok(true)
            }
            RunState::Paused { .. } => {
                self.resume(now_ms)?;
                Ok(false)
            }
            _ => Err("no firing in progress"),
        }
    }

    /// Resumes a paused run, back-dating the step start so the elapsed time
    /// in the step is preserved.
    pub fn resume(&mut self, now_ms: u64) -> Result<(), &'static str> {
        match self.state {
            RunState::Paused {
                step_idx,
                elapsed_in_step_ms,
            } => {
                self.state = RunState::Running {
                    step_idx,
                    step_started_ms: now_ms.saturating_sub(elapsed_in_step_ms),
                };
                Ok(())
            }
            _ => Err("not paused"),
        }
    }

    /// Advances time-driven transitions: step completion and cooldown expiry.
    pub fn advance(&mut self, now_ms: u64) {
        match self.state {
            RunState::Running {
                step_idx,
                step_started_ms,
            } => {
                let Some(program) = self.active.as_ref() else {
                    self.state = RunState::Idle;
                    return;
                };
                let Some(step) = program.steps.get(step_idx) else {
                    self.state = RunState::Cooldown { since_ms: now_ms };
                    return;
                };
                let elapsed_s = now_ms.saturating_sub(step_started_ms) / 1000;
                if elapsed_s >= step.total_seconds() {
                    if step_idx + 1 < program.steps.len() {
                        self.state = RunState::Running {
                            step_idx: step_idx + 1,
                            step_started_ms: now_ms,
                        };
                    } else {
                        self.state = RunState::Cooldown { since_ms: now_ms };
                    }
                }
            }
            RunState::Cooldown { since_ms } => {
                if now_ms.saturating_sub(since_ms) >= self.cooldown_ms {
                    self.state = RunState::Idle;
                    self.active = None;
                }
            }
            _ => {}
        }
    }

    /// The index and definition of the step the run is in, if any.
    pub fn current_step(&self) -> Option<(usize, &Step)> {
        let step_idx = match self.state {
            RunState::Running { step_idx, .. } | RunState::Paused { step_idx, .. } => step_idx,
            _ => return None,
        };
        let step = self.active.as_ref()?.steps.get(step_idx)?;
        Some((step_idx, step))
    }

    /// Milliseconds spent in the current step.
    pub fn step_elapsed_ms(&self, now_ms: u64) -> u64 {
        match self.state {
            RunState::Running {
                step_started_ms, ..
            } => now_ms.saturating_sub(step_started_ms),
            RunState::Paused {
                elapsed_in_step_ms, ..
            } => elapsed_in_step_ms,
            _ => 0,
        }
    }
}
