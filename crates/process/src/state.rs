use std::fmt;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Lifecycle state shared by the API and Worker roles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RunningState {
    /// Not prepared; admits no transition.
    #[default]
    None,
    /// Constructed and ready to start.
    Prepared,
    /// `start` in progress.
    Starting,
    /// Serving.
    Running,
    /// `close` or `shutdown` in progress.
    Closing,
    /// Stopped; may be started again.
    Closed,
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Prepared => "prepared",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

/// Whether a requested transition should go ahead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Begin {
    Proceed,
    Ignored,
}

/// The state of one role instance. Only the owning role mutates it.
#[derive(Debug)]
pub(crate) struct StateCell {
    role: &'static str,
    name: String,
    state: Mutex<RunningState>,
}

impl StateCell {
    pub(crate) fn new(role: &'static str, name: impl Into<String>, initial: RunningState) -> Self {
        Self {
            role,
            name: name.into(),
            state: Mutex::new(initial),
        }
    }

    pub(crate) fn get(&self) -> RunningState {
        *self.state.lock()
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set(&self, next: RunningState) {
        let mut state = self.state.lock();
        info!(role = self.role, name = %self.name, from = %*state, to = %next, "state changed");
        *state = next;
    }

    fn not_prepared(&self) -> Error {
        Error::NotPrepared {
            role: self.role,
            name: self.name.clone(),
        }
    }

    /// Prepared or Closed moves to Starting.
    pub(crate) fn begin_start(&self) -> Result<Begin> {
        let mut state = self.state.lock();
        match *state {
            RunningState::None => Err(self.not_prepared()),
            RunningState::Prepared | RunningState::Closed => {
                info!(role = self.role, name = %self.name, from = %*state, "starting");
                *state = RunningState::Starting;
                Ok(Begin::Proceed)
            }
            current @ (RunningState::Starting | RunningState::Running | RunningState::Closing) => {
                warn!(role = self.role, name = %self.name, state = %current, "start ignored");
                Ok(Begin::Ignored)
            }
        }
    }

    /// Starting or Running moves to Closing.
    pub(crate) fn begin_close(&self) -> Result<Begin> {
        let mut state = self.state.lock();
        match *state {
            RunningState::None => Err(self.not_prepared()),
            RunningState::Starting | RunningState::Running => {
                if *state == RunningState::Starting {
                    warn!(role = self.role, name = %self.name, "closing while still starting");
                }
                *state = RunningState::Closing;
                Ok(Begin::Proceed)
            }
            RunningState::Closing => {
                warn!(role = self.role, name = %self.name, "close ignored, already closing");
                Ok(Begin::Ignored)
            }
            current @ (RunningState::Prepared | RunningState::Closed) => {
                info!(role = self.role, name = %self.name, state = %current, "nothing to close");
                Ok(Begin::Ignored)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_none_admits_no_transition() {
        let cell = StateCell::new("worker", "w", RunningState::None);

        assert_matches!(cell.begin_start(), Err(Error::NotPrepared { name, .. }) if name == "w");
        assert_matches!(cell.begin_close(), Err(Error::NotPrepared { .. }));
        assert_eq!(cell.get(), RunningState::None);
    }

    #[test]
    fn test_start_from_prepared_and_closed() {
        let cell = StateCell::new("api", "a", RunningState::Prepared);
        assert_eq!(cell.begin_start().unwrap(), Begin::Proceed);
        assert_eq!(cell.get(), RunningState::Starting);

        cell.set(RunningState::Closed);
        assert_eq!(cell.begin_start().unwrap(), Begin::Proceed);
        assert_eq!(cell.get(), RunningState::Starting);
    }

    #[test]
    fn test_repeated_start_is_ignored() {
        for current in [RunningState::Starting, RunningState::Running, RunningState::Closing] {
            let cell = StateCell::new("api", "a", current);
            assert_eq!(cell.begin_start().unwrap(), Begin::Ignored);
            assert_eq!(cell.get(), current);
        }
    }

    #[test]
    fn test_close_reaches_closing_only_from_starting_or_running() {
        for current in [RunningState::Starting, RunningState::Running] {
            let cell = StateCell::new("worker", "w", current);
            assert_eq!(cell.begin_close().unwrap(), Begin::Proceed);
            assert_eq!(cell.get(), RunningState::Closing);
        }

        for current in [RunningState::Prepared, RunningState::Closing, RunningState::Closed] {
            let cell = StateCell::new("worker", "w", current);
            assert_eq!(cell.begin_close().unwrap(), Begin::Ignored);
            assert_eq!(cell.get(), current);
        }
    }
}
