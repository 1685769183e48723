use serde::{Deserialize, Serialize};

/// Protocol major assumed when the server's version string has no numeric
/// prefix.
pub const DEFAULT_MAJOR_VERSION: u32 = 4;

/// First major version whose polled playback position carries cue ids
/// instead of cue numbers.
pub const ID_POSITION_MAJOR_VERSION: u32 = 5;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cue {
    pub id: String,
    pub number: String,
    pub name: String,
    pub cue_type: String,
    pub is_group: bool,
    pub group_mode: Option<GroupMode>,
    pub depth: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CueList {
    pub id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum GroupMode {
    #[default]
    Sequential,
    Timeline,
    Simultaneous,
    Random,
}

impl GroupMode {
    pub fn from_code(code: i64) -> Self {
        match code {
            3 => GroupMode::Simultaneous,
            2 => GroupMode::Random,
            1 => GroupMode::Timeline,
            _ => GroupMode::Sequential,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub has_passcode: bool,
    pub major_version: u32,
}

impl Workspace {
    /// Takes everything before the first '.' as the major version.
    pub fn parse_major_version(version: Option<&str>) -> u32 {
        version
            .and_then(|v| v.split('.').next())
            .and_then(|major| major.trim().parse().ok())
            .unwrap_or(DEFAULT_MAJOR_VERSION)
    }

    pub fn positions_carry_ids(&self) -> bool {
        self.major_version >= ID_POSITION_MAJOR_VERSION
    }
}
