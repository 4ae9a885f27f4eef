//! Debounce/lifecycle state machine for filter-spec updates.
//!
//! Pure state transitions; the owning actor wires the timer (a spawned
//! sleep posting the token back into the fan-in channel). Tokens make stale
//! timer firings harmless, so re-arming never needs to cancel anything.
//!
//! States: `Idle -> Pending(deadline) -> Committing -> Idle`. Search input
//! debounces through `Pending`; discrete equality changes bypass the timer.
//! While `Committing`, new intents queue (latest wins) and are returned by
//! `commit_finished`, so there is never more than one apply in flight and
//! no intent is dropped.

use crate::engine::types::FilterSpec;
use std::time::Duration;

/// Request to (re)arm the quiet-period timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arm {
    pub token: u64,
    pub delay: Duration,
}

enum State {
    Idle,
    Pending { spec: FilterSpec, token: u64 },
    Committing { queued: Option<FilterSpec> },
}

pub struct DebounceController {
    quiet_period: Duration,
    state: State,
    seq: u64,
}

impl DebounceController {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            state: State::Idle,
            seq: 0,
        }
    }

    fn next_token(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Debounced input (keystroke stream). Returns a timer to arm, or
    /// `None` when the change was queued behind an in-flight commit.
    pub fn input(&mut self, spec: FilterSpec) -> Option<Arm> {
        match &mut self.state {
            State::Committing { queued } => {
                *queued = Some(spec);
                None
            }
            State::Idle | State::Pending { .. } => {
                let token = self.next_token();
                self.state = State::Pending { spec, token };
                Some(Arm {
                    token,
                    delay: self.quiet_period,
                })
            }
        }
    }

    /// Immediate commit path (discrete user action). Cancels any pending
    /// keystroke intent, which the immediate spec supersedes. Returns the
    /// spec to apply now, or `None` when queued behind an in-flight commit.
    pub fn commit_now(&mut self, spec: FilterSpec) -> Option<FilterSpec> {
        match &mut self.state {
            State::Committing { queued } => {
                *queued = Some(spec);
                None
            }
            State::Idle | State::Pending { .. } => {
                // Bump the sequence so a pending timer firing is ignored.
                self.next_token();
                self.state = State::Committing { queued: None };
                Some(spec)
            }
        }
    }

    /// Quiet-period timer fired. Stale tokens (superseded by later input or
    /// an immediate commit) return `None`.
    pub fn timer_fired(&mut self, token: u64) -> Option<FilterSpec> {
        let hit = matches!(&self.state, State::Pending { token: armed, .. } if *armed == token);
        if !hit {
            return None;
        }
        match std::mem::replace(&mut self.state, State::Committing { queued: None }) {
            State::Pending { spec, .. } => Some(spec),
            _ => unreachable!(),
        }
    }

    /// The in-flight apply returned. If an intent queued meanwhile, it is
    /// returned for immediate application (the controller stays in
    /// `Committing` until a `commit_finished` finds the queue empty).
    pub fn commit_finished(&mut self) -> Option<FilterSpec> {
        match &mut self.state {
            State::Committing { queued } => match queued.take() {
                Some(spec) => Some(spec),
                None => {
                    self.state = State::Idle;
                    None
                }
            },
            _ => None,
        }
    }
}
