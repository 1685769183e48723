use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub timing: TimingSettings,
    pub classifier: GroupClassifier,
}

impl SessionSettings {
    pub async fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = tokio::fs::read_to_string(path).await?;
        let settings = serde_json::from_str(&content)?;
        log::info!("Session settings loaded from: {}", path.display());
        Ok(settings)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TimingSettings {
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub stale_after_ms: u64,
    pub running_poll_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            heartbeat_interval_ms: 5000,
            stale_after_ms: 15000,
            running_poll_ms: 500,
        }
    }
}

impl TimingSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn running_poll(&self) -> Duration {
        Duration::from_millis(self.running_poll_ms)
    }
}

/// Decides which server cue types are containers. Matching is a
/// case-insensitive substring test against each marker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupClassifier {
    pub group_type_markers: Vec<String>,
    pub cue_list_type_markers: Vec<String>,
}

impl Default for GroupClassifier {
    fn default() -> Self {
        Self {
            group_type_markers: vec!["group".to_string()],
            cue_list_type_markers: vec!["cue list".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueKind {
    Leaf,
    Group,
    NestedCueList,
}

impl GroupClassifier {
    pub fn classify(&self, cue_type: &str) -> CueKind {
        let lowered = cue_type.to_lowercase();
        let matches = |markers: &[String]| {
            markers
                .iter()
                .any(|m| !m.is_empty() && lowered.contains(&m.to_lowercase()))
        };
        if matches(&self.cue_list_type_markers) {
            CueKind::NestedCueList
        } else if matches(&self.group_type_markers) {
            CueKind::Group
        } else {
            CueKind::Leaf
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub password: Option<String>,
    pub passcode: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classification() {
        let classifier = GroupClassifier::default();
        assert_eq!(classifier.classify("Group"), CueKind::Group);
        assert_eq!(classifier.classify("group"), CueKind::Group);
        assert_eq!(classifier.classify("Cue List"), CueKind::NestedCueList);
        assert_eq!(classifier.classify("Audio"), CueKind::Leaf);
        assert_eq!(classifier.classify(""), CueKind::Leaf);
    }

    #[test]
    fn settings_deserialize_with_partial_overrides() {
        let settings: SessionSettings = serde_json::from_str(
            r#"{"timing":{"connectTimeoutMs":750},"classifier":{"groupTypeMarkers":["Folder"]}}"#,
        )
        .unwrap();
        assert_eq!(settings.timing.connect_timeout(), Duration::from_millis(750));
        assert_eq!(settings.timing.heartbeat_interval_ms, 5000);
        assert_eq!(settings.classifier.classify("folder"), CueKind::Group);
        assert_eq!(settings.classifier.classify("Cue List"), CueKind::NestedCueList);
    }
}
