use serde::{Deserialize, Serialize};

pub mod cue;
pub mod settings;

pub use cue::{Cue, CueList, GroupMode, Workspace};
pub use settings::{ConnectionSettings, GroupClassifier, SessionSettings, TimingSettings};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ErrorTimeout,
    ErrorDenied,
    ErrorNetwork,
}

impl SessionState {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            SessionState::ErrorTimeout | SessionState::ErrorDenied | SessionState::ErrorNetwork
        )
    }
}
