//! Loader lifecycle states and the transition table

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LoaderState {
    /// Created, nothing allocated
    #[default]
    Idle,
    /// `initialize()` running
    Initializing,
    /// Initialized, no load yet
    Ready,
    /// A load is in flight
    Loading,
    /// Last load succeeded
    Loaded,
    /// Last initialize or load failed
    Error,
    /// `dispose()` running
    Disposing,
    /// Terminal
    Disposed,
}

impl LoaderState {
    /// All states, in declaration order
    pub const ALL: [LoaderState; 8] = [
        LoaderState::Idle,
        LoaderState::Initializing,
        LoaderState::Ready,
        LoaderState::Loading,
        LoaderState::Loaded,
        LoaderState::Error,
        LoaderState::Disposing,
        LoaderState::Disposed,
    ];

    /// Static name of the state
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Initializing => "Initializing",
            Self::Ready => "Ready",
            Self::Loading => "Loading",
            Self::Loaded => "Loaded",
            Self::Error => "Error",
            Self::Disposing => "Disposing",
            Self::Disposed => "Disposed",
        }
    }

    /// `Disposing` or `Disposed`
    #[inline]
    #[must_use]
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Disposing | Self::Disposed)
    }

    /// States from which a load may start
    #[inline]
    #[must_use]
    pub fn can_load(self) -> bool {
        matches!(self, Self::Ready | Self::Loaded | Self::Error)
    }
}

impl fmt::Display for LoaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal loader transition {from} -> {to}")]
pub struct TransitionError {
    /// Current state
    pub from: LoaderState,
    /// Requested state
    pub to: LoaderState,
}

/// Validates a state transition.
pub fn validate_transition(from: LoaderState, to: LoaderState) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// States reachable from `from` in one step.
#[must_use]
pub fn allowed_transitions(from: LoaderState) -> &'static [LoaderState] {
    use LoaderState::*;
    match from {
        Idle => &[Initializing, Disposing],
        Initializing => &[Ready, Error, Disposing],
        Ready => &[Loading, Disposing],
        Loading => &[Loaded, Error, Disposing],
        Loaded => &[Loading, Disposing],
        Error => &[Loading, Initializing, Disposing],
        Disposing => &[Disposed],
        Disposed => &[],
    }
}
