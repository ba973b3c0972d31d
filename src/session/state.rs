//! Session lifecycle states

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a session is in its lifecycle
///
/// `Listening` → `Connected` → `Launched` → `Terminated`. A failed launch or
/// a disconnect before launch skips straight to `Terminated`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Listener bound, waiting for the front end
    Listening,
    /// Front end connected, nothing launched yet
    Connected,
    /// Process running
    Launched,
    /// No further process interaction
    Terminated,
}

impl SessionState {
    /// Whether a `launch` request is acceptable in this state
    pub fn can_launch(self) -> bool {
        self == SessionState::Connected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Listening => "listening",
            SessionState::Connected => "connected",
            SessionState::Launched => "launched",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}
