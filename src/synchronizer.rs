use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    manager::{CueCacheHandle, CueCacheManager},
    model::{
        Cue, CueList, GroupClassifier, GroupMode, Workspace, settings::CueKind,
    },
    osc::{OscArg, OscMessage},
    protocol::{
        self, CueEntry, REPLY_PREFIX, ReplyEnvelope, ReplyStatus, UPDATE_PREFIX, WorkspaceEntry,
    },
};

/// Workspace connect replies carry this when the passcode was rejected.
const BAD_PASSCODE: &str = "badpass";

/// Effects of a routed message for the session controller to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    Send(OscMessage),
    Denied,
    WorkspaceConnected,
    WorkspaceClosed,
    CueListsChanged,
    CuesChanged { list_id: String },
    PlaybackPosition { list_id: String, cue_id: String },
    Running(bool),
}

pub struct CueSynchronizer {
    cache: CueCacheManager,
    view: CueCacheHandle,
    classifier: GroupClassifier,
    workspace: Option<Workspace>,
    passcode: Option<String>,
    group_index: HashMap<String, String>,
    pending_levels: HashMap<String, oneshot::Sender<f64>>,
}

impl CueSynchronizer {
    pub fn new(cache: CueCacheManager, classifier: GroupClassifier) -> Self {
        let view = cache.handle();
        Self {
            cache,
            view,
            classifier,
            workspace: None,
            passcode: None,
            group_index: HashMap::new(),
            pending_levels: HashMap::new(),
        }
    }

    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref()
    }

    pub fn workspace_id(&self) -> Option<&str> {
        self.workspace.as_ref().map(|w| w.id.as_str())
    }

    /// Opening messages of a new session.
    pub fn begin(&mut self, password: Option<&str>, passcode: Option<&str>) -> Vec<OscMessage> {
        self.workspace = None;
        self.passcode = passcode.map(str::to_string);

        let mut messages = Vec::with_capacity(3);
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            messages.push(protocol::connect(Some(password)));
        }
        messages.push(protocol::always_reply());
        messages.push(protocol::workspaces());
        messages
    }

    /// Drops the workspace, cache, group index and any pending level
    /// queries. Dropped senders close their receivers without a value.
    pub async fn reset(&mut self) {
        self.workspace = None;
        self.group_index.clear();
        self.pending_levels.clear();
        self.cache.clear().await;
    }

    /// Registers a level query, replacing any earlier one for the same cue,
    /// and returns the read request to send.
    pub fn register_level_query(
        &mut self,
        cue_id: &str,
        reply_tx: oneshot::Sender<f64>,
    ) -> Option<OscMessage> {
        let workspace_id = self.workspace_id()?.to_string();
        if self
            .pending_levels
            .insert(cue_id.to_string(), reply_tx)
            .is_some()
        {
            log::debug!("Level query for {} superseded", cue_id);
        }
        Some(OscMessage::new(protocol::slider_level_address(
            &workspace_id,
            cue_id,
        )))
    }

    pub async fn handle_message(&mut self, message: &OscMessage) -> Vec<SyncAction> {
        if let Some(rest) = message.address.strip_prefix(UPDATE_PREFIX) {
            return self.handle_update(rest, message);
        }
        let Some(rest) = message.address.strip_prefix(REPLY_PREFIX) else {
            log::debug!("Ignoring unsolicited message {}", message.address);
            return Vec::new();
        };

        let envelope = match ReplyEnvelope::from_message(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropping reply to {}: {}", rest, e);
                return Vec::new();
            }
        };
        match envelope.status() {
            ReplyStatus::Denied => {
                log::warn!("Server denied {}", rest);
                vec![SyncAction::Denied]
            }
            ReplyStatus::Other => {
                log::debug!("Dropping reply to {} with status {:?}", rest, envelope.status);
                Vec::new()
            }
            ReplyStatus::Ok => self.handle_reply(rest, envelope.data).await,
        }
    }

    async fn handle_reply(&mut self, address: &str, data: Value) -> Vec<SyncAction> {
        if address == "/workspaces" {
            return self.handle_workspaces(data);
        }
        if address == "/connect" || address == "/thump" || address == "/alwaysReply" {
            return Vec::new();
        }

        let Some((workspace_id, tail)) = protocol::split_workspace_address(address) else {
            log::debug!("Unhandled reply {}", address);
            return Vec::new();
        };
        if self.workspace_id() != Some(workspace_id) {
            log::debug!("Dropping reply for inactive workspace {}", workspace_id);
            return Vec::new();
        }

        match tail {
            "connect" => self.handle_workspace_connected(data),
            "cueLists" => self.handle_cue_lists(data).await,
            "runningOrPausedCues" => {
                let running = data.as_array().is_some_and(|cues| !cues.is_empty());
                vec![SyncAction::Running(running)]
            }
            _ => match protocol::split_cue_tail(tail) {
                Some((list_id, "children")) => match parse_entries(data) {
                    Some(entries) => self.apply_list(list_id, &entries).await,
                    None => Vec::new(),
                },
                Some((cue_id, "mode")) => self.handle_mode(cue_id, data).await,
                Some((list_id, "playbackPosition")) => {
                    self.handle_polled_position(list_id, data).await
                }
                Some((cue_id, "sliderLevel/0")) => {
                    self.handle_level(cue_id, data);
                    Vec::new()
                }
                _ => {
                    log::debug!("Unhandled workspace reply {}", tail);
                    Vec::new()
                }
            },
        }
    }

    fn handle_workspaces(&mut self, data: Value) -> Vec<SyncAction> {
        let entries: Vec<WorkspaceEntry> = match serde_json::from_value(data) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Malformed workspace list: {}", e);
                return Vec::new();
            }
        };
        let Some(first) = entries.into_iter().next() else {
            log::warn!("Server has no open workspaces");
            return Vec::new();
        };
        let Some(id) = first.unique_id else {
            log::warn!("First workspace carries no id");
            return Vec::new();
        };

        let workspace = Workspace {
            major_version: Workspace::parse_major_version(first.version.as_deref()),
            id,
            name: first.display_name,
            has_passcode: first.has_passcode,
        };
        log::info!(
            "Using workspace '{}' ({}), protocol major {}",
            workspace.name,
            workspace.id,
            workspace.major_version
        );

        let passcode = if workspace.has_passcode {
            self.passcode.as_deref()
        } else {
            None
        };
        let request = protocol::workspace_connect(&workspace.id, passcode);
        self.workspace = Some(workspace);
        vec![SyncAction::Send(request)]
    }

    fn handle_workspace_connected(&mut self, data: Value) -> Vec<SyncAction> {
        if data.as_str() == Some(BAD_PASSCODE) {
            log::warn!("Workspace passcode rejected");
            return vec![SyncAction::Denied];
        }
        let Some(workspace_id) = self.workspace_id() else {
            return Vec::new();
        };
        vec![
            SyncAction::WorkspaceConnected,
            SyncAction::Send(protocol::updates(workspace_id)),
            SyncAction::Send(protocol::cue_lists(workspace_id)),
            SyncAction::Send(protocol::running_cues(workspace_id)),
        ]
    }

    async fn handle_cue_lists(&mut self, data: Value) -> Vec<SyncAction> {
        let Some(entries) = parse_entries(data) else {
            return Vec::new();
        };
        let Some(workspace_id) = self.workspace_id().map(str::to_string) else {
            return Vec::new();
        };

        let mut cue_lists = Vec::with_capacity(entries.len());
        let mut actions = Vec::new();
        let mut nested = Vec::new();
        for entry in &entries {
            let Some(id) = entry.unique_id.as_ref() else {
                continue;
            };
            cue_lists.push(CueList {
                id: id.clone(),
                name: entry.name.clone(),
            });
            match &entry.cues {
                Some(children) => nested.push((id.clone(), children)),
                None => actions.push(SyncAction::Send(protocol::children(&workspace_id, id))),
            }
        }

        let known: Vec<String> = cue_lists.iter().map(|l| l.id.clone()).collect();
        self.group_index.retain(|_, list_id| known.contains(list_id));
        self.cache
            .write_with(|cache| {
                cache.cues.retain(|list_id, _| known.contains(list_id));
                cache.cue_lists = cue_lists;
            })
            .await;
        actions.insert(0, SyncAction::CueListsChanged);

        for (list_id, children) in nested {
            actions.extend(self.apply_list(&list_id, children).await);
        }
        actions
    }

    /// Flattens a list's children into the cache and requests group modes
    /// and the list's playback position.
    async fn apply_list(&mut self, list_id: &str, entries: &[CueEntry]) -> Vec<SyncAction> {
        let Some(workspace_id) = self.workspace_id().map(str::to_string) else {
            return Vec::new();
        };

        let mut cues = Vec::new();
        self.flatten(entries, 0, &mut cues);

        self.group_index.retain(|_, owner| owner.as_str() != list_id);
        let mut actions = vec![SyncAction::CuesChanged {
            list_id: list_id.to_string(),
        }];
        for group in cues.iter().filter(|c| c.is_group) {
            self.group_index
                .insert(group.id.clone(), list_id.to_string());
            actions.push(SyncAction::Send(protocol::mode(&workspace_id, &group.id)));
        }
        actions.push(SyncAction::Send(protocol::playback_position(
            &workspace_id,
            list_id,
        )));

        log::debug!("Cached {} cues for list {}", cues.len(), list_id);
        self.cache.replace_cues(list_id, cues).await;
        actions
    }

    fn flatten(&self, entries: &[CueEntry], depth: usize, out: &mut Vec<Cue>) {
        for entry in entries {
            let Some(id) = entry.unique_id.as_ref() else {
                continue;
            };
            let kind = self.classifier.classify(&entry.cue_type);
            out.push(Cue {
                id: id.clone(),
                number: entry.number.clone(),
                name: entry.name.clone(),
                cue_type: entry.cue_type.clone(),
                is_group: kind != CueKind::Leaf,
                group_mode: None,
                depth,
            });
            // Nested cue lists stay collapsed so their cues never land in
            // this list's cache.
            if kind == CueKind::Group {
                if let Some(children) = &entry.cues {
                    self.flatten(children, depth + 1, out);
                }
            }
        }
    }

    async fn handle_mode(&mut self, cue_id: &str, data: Value) -> Vec<SyncAction> {
        let Some(code) = data.as_i64().or_else(|| data.as_f64().map(|f| f as i64)) else {
            log::debug!("Mode reply for {} carries no code", cue_id);
            return Vec::new();
        };
        let Some(list_id) = self.group_index.get(cue_id).cloned() else {
            log::debug!("Mode reply for unknown group {}", cue_id);
            return Vec::new();
        };
        if self
            .cache
            .patch_group_mode(&list_id, cue_id, GroupMode::from_code(code))
            .await
        {
            vec![SyncAction::CuesChanged { list_id }]
        } else {
            Vec::new()
        }
    }

    async fn handle_polled_position(&mut self, list_id: &str, data: Value) -> Vec<SyncAction> {
        let value = match data {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => return Vec::new(),
        };
        if value.is_empty() {
            return Vec::new();
        }

        let carries_ids = self
            .workspace
            .as_ref()
            .is_some_and(Workspace::positions_carry_ids);
        let cue_id = if carries_ids {
            Some(value.clone())
        } else {
            self.view.resolve_number_or_id(list_id, &value).await
        };
        match cue_id {
            Some(cue_id) => vec![SyncAction::PlaybackPosition {
                list_id: list_id.to_string(),
                cue_id,
            }],
            None => {
                log::debug!("Playback position {} not found in list {}", value, list_id);
                Vec::new()
            }
        }
    }

    fn handle_level(&mut self, cue_id: &str, data: Value) {
        let Some(level) = data.as_f64() else {
            return;
        };
        match self.pending_levels.remove(cue_id) {
            Some(reply_tx) => {
                if reply_tx.send(level).is_err() {
                    log::trace!("Level query for {} was abandoned", cue_id);
                }
            }
            None => log::trace!("No pending level query for {}", cue_id),
        }
    }

    fn handle_update(&mut self, address: &str, message: &OscMessage) -> Vec<SyncAction> {
        let Some((workspace_id, tail)) = protocol::split_workspace_address(address) else {
            return Vec::new();
        };
        if self.workspace_id() != Some(workspace_id) {
            return Vec::new();
        }

        if let Some(list_id) = tail
            .strip_prefix("cueList/")
            .and_then(|rest| rest.strip_suffix("/playbackPosition"))
        {
            let cue_id = message
                .args
                .first()
                .and_then(OscArg::as_text)
                .filter(|id| !id.is_empty());
            return match cue_id {
                Some(cue_id) => vec![SyncAction::PlaybackPosition {
                    list_id: list_id.to_string(),
                    cue_id,
                }],
                None => Vec::new(),
            };
        }
        if tail == "disconnect" {
            return vec![SyncAction::WorkspaceClosed];
        }

        // Structural changes are not diffed; just refresh the running flag.
        vec![SyncAction::Send(protocol::running_cues(workspace_id))]
    }
}

fn parse_entries(data: Value) -> Option<Vec<CueEntry>> {
    match serde_json::from_value(data) {
        Ok(entries) => Some(entries),
        Err(e) => {
            log::warn!("Malformed cue payload: {}", e);
            None
        }
    }
}
