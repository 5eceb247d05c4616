//! State machines with a static transition table.
//!
//! Each state enum declares the `(from, to)` pairs it allows. Every
//! transition names both ends explicitly, so a call site states what it
//! believes the current state is:
//!
//! - a pair missing from the table panics, whatever the current state;
//! - a pair in the table panics if the machine is not in `from`.
//!
//! [`StateMachine::try_transition`] reports the current state instead of
//! panicking for callers that expect contention.
//!
//! The lock states used by the writer and the reader live here too, so the
//! full set of legal sequences can be read in one place.

use std::fmt::Debug;

/// A state enum usable with [`StateMachine`].
pub trait MachineState: Copy + Eq + Debug + 'static {
    /// Every legal `(from, to)` pair.
    const TRANSITIONS: &'static [(Self, Self)];

    /// Whether `from -> to` is in the table.
    fn is_valid_transition(from: Self, to: Self) -> bool {
        Self::TRANSITIONS
            .iter()
            .any(|&(in_state, out_state)| in_state == from && out_state == to)
    }
}

/// States shared by everything that takes the cross-process lock.
pub trait LockState: MachineState {
    /// Not holding the lock.
    const UNLOCKED: Self;
    /// Waiting for (or polling) the OS mutex.
    const TRY_LOCK: Self;
    /// Holding the lock with no operation in progress.
    const LOCKED: Self;
}

/// Runtime-checked finite state machine.
#[derive(Debug)]
pub struct StateMachine<S: MachineState> {
    state: S,
}

impl<S: MachineState> StateMachine<S> {
    /// Create a machine in `initial`.
    pub const fn new(initial: S) -> Self {
        Self { state: initial }
    }

    /// Current state.
    pub const fn get(&self) -> S {
        self.state
    }

    /// Move from `from` to `to`.
    ///
    /// # Panics
    ///
    /// If the pair is not in the table, or the machine is not in `from`.
    #[track_caller]
    pub fn transition(&mut self, from: S, to: S) {
        if let Err(actual) = self.try_transition(from, to) {
            panic!("Unexpected state {actual:?}; expected {from:?} -> {to:?}");
        }
    }

    /// Move from `from` to `to`, or return the current state if the machine
    /// is elsewhere.
    ///
    /// # Panics
    ///
    /// If the pair is not in the table: that is a coding error regardless of
    /// the current state.
    #[track_caller]
    pub fn try_transition(&mut self, from: S, to: S) -> Result<(), S> {
        assert!(
            S::is_valid_transition(from, to),
            "Invalid transition {from:?} -> {to:?}"
        );
        if self.state != from {
            return Err(self.state);
        }
        self.state = to;
        Ok(())
    }

    /// Overwrite the state without consulting the table.
    ///
    /// Only used while unwinding from a panic, to release the OS lock.
    pub(crate) fn force(&mut self, state: S) {
        self.state = state;
    }
}

/// Lock and publish states of a [`Writer`](crate::Writer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Not holding the lock.
    Unlocked,
    /// Acquiring the lock.
    TryLock,
    /// Holding the lock.
    Locked,
    /// `begin_frame` was called; the frame must be submitted.
    FrameInProgress,
    /// Writing a frame into the header.
    SubmittingFrame,
    /// Writing an empty frame into the header.
    SubmittingEmptyFrame,
    /// Resetting the header on detach.
    Detaching,
}

impl MachineState for WriterState {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::Unlocked, Self::TryLock),
        (Self::TryLock, Self::Locked),
        (Self::TryLock, Self::Unlocked),
        (Self::Locked, Self::Unlocked),
        (Self::Locked, Self::FrameInProgress),
        (Self::FrameInProgress, Self::SubmittingFrame),
        (Self::SubmittingFrame, Self::Locked),
        (Self::Locked, Self::SubmittingEmptyFrame),
        (Self::SubmittingEmptyFrame, Self::Locked),
        (Self::Locked, Self::Detaching),
        (Self::Detaching, Self::Locked),
    ];
}

impl LockState for WriterState {
    const UNLOCKED: Self = Self::Unlocked;
    const TRY_LOCK: Self = Self::TryLock;
    const LOCKED: Self = Self::Locked;
}

/// Lock states of a [`Reader`](crate::Reader).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Not holding the lock.
    Unlocked,
    /// Acquiring the lock.
    TryLock,
    /// Holding the lock.
    Locked,
    /// Copying the header out of the mapping.
    CopyingHeader,
}

impl MachineState for ReaderState {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (Self::Unlocked, Self::TryLock),
        (Self::TryLock, Self::Locked),
        (Self::TryLock, Self::Unlocked),
        (Self::Locked, Self::Unlocked),
        (Self::Locked, Self::CopyingHeader),
        (Self::CopyingHeader, Self::Locked),
    ];
}

impl LockState for ReaderState {
    const UNLOCKED: Self = Self::Unlocked;
    const TRY_LOCK: Self = Self::TryLock;
    const LOCKED: Self = Self::Locked;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_cycle() {
        let mut sm = StateMachine::new(WriterState::Unlocked);
        sm.transition(WriterState::Unlocked, WriterState::TryLock);
        sm.transition(WriterState::TryLock, WriterState::Locked);
        sm.transition(WriterState::Locked, WriterState::FrameInProgress);
        sm.transition(WriterState::FrameInProgress, WriterState::SubmittingFrame);
        sm.transition(WriterState::SubmittingFrame, WriterState::Locked);
        sm.transition(WriterState::Locked, WriterState::Unlocked);
        assert_eq!(sm.get(), WriterState::Unlocked);
    }

    #[test]
    fn test_try_transition_reports_current_state() {
        let mut sm = StateMachine::new(ReaderState::Unlocked);
        assert_eq!(
            sm.try_transition(ReaderState::Locked, ReaderState::Unlocked),
            Err(ReaderState::Unlocked)
        );
        assert_eq!(sm.get(), ReaderState::Unlocked);
    }

    #[test]
    #[should_panic(expected = "Invalid transition")]
    fn test_transition_missing_from_table_panics() {
        let mut sm = StateMachine::new(WriterState::Unlocked);
        // Submitting without a lock is never legal.
        sm.transition(WriterState::Unlocked, WriterState::SubmittingFrame);
    }

    #[test]
    #[should_panic(expected = "Unexpected state")]
    fn test_transition_from_wrong_state_panics() {
        let mut sm = StateMachine::new(WriterState::Unlocked);
        sm.transition(WriterState::Locked, WriterState::FrameInProgress);
    }

    #[test]
    fn test_writer_table_has_no_shortcut_to_submit() {
        assert!(!WriterState::is_valid_transition(
            WriterState::Locked,
            WriterState::SubmittingFrame
        ));
        assert!(WriterState::is_valid_transition(
            WriterState::Locked,
            WriterState::SubmittingEmptyFrame
        ));
    }
}
