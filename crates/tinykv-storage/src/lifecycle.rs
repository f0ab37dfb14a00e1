//! Engine lifecycle state machine shared by both storage variants.
//!
//! ```text
//! Uninitialized -> Starting -> Running -> Stopping -> Stopped
//!                     \
//!                      -> Failed
//! ```
//!
//! `start` is a one-shot transition. Once an engine has left
//! `Uninitialized` it can never be started again, whatever the outcome.

use std::fmt;

use parking_lot::Mutex;

use crate::error::{Result, StorageError};

/// Observable lifecycle state of a storage engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Uninitialized => write!(f, "uninitialized"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopping => write!(f, "stopping"),
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Failed => write!(f, "failed"),
        }
    }
}

/// Guards lifecycle transitions of one engine instance
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Uninitialized),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Claim the single start attempt
    pub fn begin_start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != LifecycleState::Uninitialized {
            return Err(StorageError::AlreadyStarted(*state));
        }
        *state = LifecycleState::Starting;
        Ok(())
    }

    /// Record the outcome of the start attempt claimed by `begin_start`
    pub fn finish_start(&self, ok: bool) {
        let mut state = self.state.lock();
        debug_assert_eq!(*state, LifecycleState::Starting);
        *state = if ok {
            LifecycleState::Running
        } else {
            LifecycleState::Failed
        };
    }

    /// Claim the stop transition. Returns false when there is nothing to stop.
    pub fn begin_stop(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Running => {
                *state = LifecycleState::Stopping;
                true
            }
            LifecycleState::Uninitialized | LifecycleState::Failed => {
                *state = LifecycleState::Stopped;
                false
            }
            LifecycleState::Starting | LifecycleState::Stopping | LifecycleState::Stopped => false,
        }
    }

    pub fn finish_stop(&self) {
        *self.state.lock() = LifecycleState::Stopped;
    }

    /// Fail unless the engine is serving
    pub fn ensure_running(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Running => Ok(()),
            other => Err(StorageError::NotRunning(other)),
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
        assert!(lifecycle.ensure_running().is_err());

        lifecycle.begin_start().unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
        assert!(lifecycle.ensure_running().is_err());

        lifecycle.finish_start(true);
        assert_eq!(lifecycle.state(), LifecycleState::Running);
        assert!(lifecycle.ensure_running().is_ok());
    }

    #[test]
    fn test_start_is_one_shot() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_start().unwrap();
        lifecycle.finish_start(false);
        assert_eq!(lifecycle.state(), LifecycleState::Failed);

        let err = lifecycle.begin_start().unwrap_err();
        assert!(matches!(
            err,
            StorageError::AlreadyStarted(LifecycleState::Failed)
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_start().unwrap();
        lifecycle.finish_start(true);

        assert!(lifecycle.begin_stop());
        lifecycle.finish_stop();
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);

        assert!(!lifecycle.begin_stop());
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_stop_before_start() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.begin_stop());
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert!(lifecycle.begin_start().is_err());
    }
}
