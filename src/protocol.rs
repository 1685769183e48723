//! Addresses and reply payloads exchanged with the show-control server.

use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::SessionError,
    osc::{OscArg, OscMessage},
};

pub const REPLY_PREFIX: &str = "/reply";
pub const UPDATE_PREFIX: &str = "/update";

pub const STATUS_OK: &str = "ok";
pub const STATUS_DENIED: &str = "denied";

pub fn connect(password: Option<&str>) -> OscMessage {
    let message = OscMessage::new("/connect");
    match password {
        Some(password) => message.with_arg(OscArg::String(password.to_string())),
        None => message,
    }
}

pub fn workspaces() -> OscMessage {
    OscMessage::new("/workspaces")
}

pub fn always_reply() -> OscMessage {
    OscMessage::new("/alwaysReply").with_arg(OscArg::Int(1))
}

pub fn thump() -> OscMessage {
    OscMessage::new("/thump")
}

pub fn workspace_connect(workspace_id: &str, passcode: Option<&str>) -> OscMessage {
    let message = OscMessage::new(format!("/workspace/{}/connect", workspace_id));
    match passcode {
        Some(passcode) => message.with_arg(OscArg::String(passcode.to_string())),
        None => message,
    }
}

pub fn updates(workspace_id: &str) -> OscMessage {
    OscMessage::new(format!("/workspace/{}/updates", workspace_id)).with_arg(OscArg::Int(1))
}

pub fn cue_lists(workspace_id: &str) -> OscMessage {
    OscMessage::new(format!("/workspace/{}/cueLists", workspace_id))
}

pub fn children(workspace_id: &str, list_id: &str) -> OscMessage {
    OscMessage::new(format!("/workspace/{}/cue_id/{}/children", workspace_id, list_id))
}

pub fn mode(workspace_id: &str, cue_id: &str) -> OscMessage {
    OscMessage::new(format!("/workspace/{}/cue_id/{}/mode", workspace_id, cue_id))
}

pub fn playback_position(workspace_id: &str, list_id: &str) -> OscMessage {
    OscMessage::new(format!(
        "/workspace/{}/cue_id/{}/playbackPosition",
        workspace_id, list_id
    ))
}

pub fn slider_level_address(workspace_id: &str, cue_id: &str) -> String {
    format!("/workspace/{}/cue_id/{}/sliderLevel/0", workspace_id, cue_id)
}

pub fn running_cues(workspace_id: &str) -> OscMessage {
    OscMessage::new(format!("/workspace/{}/runningOrPausedCues", workspace_id))
}

pub fn go(workspace_id: &str) -> OscMessage {
    OscMessage::new(format!("/workspace/{}/go", workspace_id))
}

pub fn panic(workspace_id: &str) -> OscMessage {
    OscMessage::new(format!("/workspace/{}/panic", workspace_id))
}

pub fn select_id(workspace_id: &str, cue_id: &str) -> OscMessage {
    OscMessage::new(format!("/workspace/{}/select_id/{}", workspace_id, cue_id))
}

/// JSON envelope carried as the first argument of every `/reply` message.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ReplyEnvelope {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Denied,
    Other,
}

impl ReplyEnvelope {
    pub fn from_message(message: &OscMessage) -> Result<Self, SessionError> {
        let text = message
            .args
            .first()
            .and_then(OscArg::as_text)
            .ok_or_else(|| SessionError::Parse(format!("{} carries no JSON payload", message.address)))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// `ok` and its authenticated variants (`ok:view|edit|control`) count as
    /// success.
    pub fn status(&self) -> ReplyStatus {
        if self.status == STATUS_DENIED {
            ReplyStatus::Denied
        } else if self.status == STATUS_OK || self.status.starts_with("ok:") {
            ReplyStatus::Ok
        } else {
            ReplyStatus::Other
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct WorkspaceEntry {
    #[serde(rename = "uniqueID")]
    pub unique_id: Option<String>,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "hasPasscode")]
    pub has_passcode: bool,
    pub version: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct CueEntry {
    #[serde(rename = "uniqueID")]
    pub unique_id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub number: String,
    #[serde(deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(rename = "type")]
    pub cue_type: String,
    pub cues: Option<Vec<CueEntry>>,
}

/// Accepts strings, numbers or null where the server is loose about types.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Splits `/workspace/W/<tail>` into `(W, tail)`. A bare `/workspace/W`
/// yields an empty tail.
pub fn split_workspace_address(address: &str) -> Option<(&str, &str)> {
    let rest = address.strip_prefix("/workspace/")?;
    match rest.split_once('/') {
        Some((workspace_id, tail)) => Some((workspace_id, tail)),
        None => Some((rest, "")),
    }
}

/// Splits a workspace tail `cue_id/C/<rest>` into `(C, rest)`.
pub fn split_cue_tail(tail: &str) -> Option<(&str, &str)> {
    tail.strip_prefix("cue_id/")?.split_once('/')
}
