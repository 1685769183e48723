use serde::{Deserialize, Serialize};

use crate::model::SessionState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "param")]
pub enum UiEvent {
    // Session Events
    StateChanged {
        state: SessionState,
        error: Option<String>,
    },

    // Cue Tree Events
    CueListsUpdated,
    CuesUpdated {
        list_id: String,
    },
    CueListSelected {
        list_id: String,
    },

    // Playback Events
    PlaybackPositionChanged {
        list_id: String,
        cue_id: String,
    },
    RunningChanged {
        running: bool,
    },
}
