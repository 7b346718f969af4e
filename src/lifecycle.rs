//! Worker lifecycle states and the transitions between them.

use color_eyre::{eyre::eyre, Result};
use std::fmt;
use tracing::debug;

/// Lifecycle state of one deployed worker version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerState {
  /// Loaded, no lifecycle event dispatched yet
  #[default]
  Parsed,
  /// Install event running
  Installing,
  /// Installed, waiting to activate
  Installed,
  /// Activate event running
  Activating,
  /// Active and intercepting requests
  Activated,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "parsed" => Some(Self::Parsed),
      "installing" => Some(Self::Installing),
      "installed" => Some(Self::Installed),
      "activating" => Some(Self::Activating),
      "activated" => Some(Self::Activated),
      _ => None,
    }
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Tracks the state of a worker as the host drives it.
#[derive(Debug, Default)]
pub struct Lifecycle {
  state: WorkerState,
}

impl Lifecycle {
  pub fn new() -> Self {
    Self::default()
  }

  /// Pick up a worker whose earlier states happened in a previous run.
  pub fn resume(state: WorkerState) -> Self {
    Self { state }
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn is_active(&self) -> bool {
    self.state == WorkerState::Activated
  }

  pub fn transition(&mut self, to: WorkerState) -> Result<()> {
    let from = self.state;
    if !is_valid_transition(from, to) {
      return Err(eyre!("Invalid worker state transition: {} -> {}", from, to));
    }

    debug!(%from, %to, "worker state change");
    self.state = to;
    Ok(())
  }
}

fn is_valid_transition(from: WorkerState, to: WorkerState) -> bool {
  use WorkerState::*;

  matches!(
    (from, to),
    (Parsed, Installing) | (Installing, Installed) | (Installed, Activating) | (Activating, Activated)
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_full_lifecycle() {
    let mut lifecycle = Lifecycle::new();
    for state in [
      WorkerState::Installing,
      WorkerState::Installed,
      WorkerState::Activating,
      WorkerState::Activated,
    ] {
      lifecycle.transition(state).unwrap();
    }
    assert!(lifecycle.is_active());
  }

  #[test]
  fn test_cannot_skip_install() {
    let mut lifecycle = Lifecycle::new();
    let err = lifecycle.transition(WorkerState::Activating).unwrap_err();
    assert!(err.to_string().contains("parsed -> activating"));
    assert_eq!(lifecycle.state(), WorkerState::Parsed);
  }

  #[test]
  fn test_resume_installed() {
    let mut lifecycle = Lifecycle::resume(WorkerState::Installed);
    assert!(lifecycle.transition(WorkerState::Installing).is_err());
    lifecycle.transition(WorkerState::Activating).unwrap();
  }

  #[test]
  fn test_state_names_round_trip() {
    assert_eq!(WorkerState::parse("installed"), Some(WorkerState::Installed));
    assert_eq!(WorkerState::Activated.as_str(), "activated");
    assert_eq!(WorkerState::parse("redundant"), None);
  }
}
