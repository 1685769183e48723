use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use crate::model::{Cue, CueList, GroupMode};

#[derive(Debug, Clone, Default)]
pub struct CueCache {
    pub cue_lists: Vec<CueList>,
    pub cues: HashMap<String, Vec<Cue>>,
}

/// Write access to the mirrored cue tree. Only the session controller holds
/// one of these.
#[derive(Clone)]
pub struct CueCacheManager {
    state: Arc<RwLock<CueCache>>,
}

/// Read-only view handed to consumers.
#[derive(Clone)]
pub struct CueCacheHandle {
    state: Arc<RwLock<CueCache>>,
}

impl CueCacheManager {
    pub fn new() -> (Self, CueCacheHandle) {
        let state = Arc::new(RwLock::new(CueCache::default()));
        (
            Self { state: state.clone() },
            CueCacheHandle { state },
        )
    }

    pub async fn write_with<F, R>(&self, updater: F) -> R
    where
        F: FnOnce(&mut CueCache) -> R,
    {
        let mut guard = self.state.write().await;
        updater(&mut guard)
    }

    /// Swaps in a complete list under one write lock.
    pub async fn replace_cues(&self, list_id: &str, cues: Vec<Cue>) {
        self.write_with(|cache| {
            cache.cues.insert(list_id.to_string(), cues);
        })
        .await;
    }

    /// Patches one cue's group mode. Returns false when the list or cue is
    /// not cached.
    pub async fn patch_group_mode(&self, list_id: &str, cue_id: &str, mode: GroupMode) -> bool {
        self.write_with(|cache| {
            let Some(cue) = cache
                .cues
                .get_mut(list_id)
                .and_then(|cues| cues.iter_mut().find(|c| c.id == cue_id))
            else {
                return false;
            };
            cue.group_mode = Some(mode);
            true
        })
        .await
    }

    pub async fn clear(&self) {
        self.write_with(|cache| *cache = CueCache::default()).await;
    }

    pub fn handle(&self) -> CueCacheHandle {
        CueCacheHandle {
            state: self.state.clone(),
        }
    }
}

impl CueCacheHandle {
    pub async fn cue_lists(&self) -> Vec<CueList> {
        self.state.read().await.cue_lists.clone()
    }

    pub async fn cues(&self, list_id: &str) -> Option<Vec<Cue>> {
        self.state.read().await.cues.get(list_id).cloned()
    }

    /// Resolves a display number within a list, falling back to the id for
    /// unnumbered cues.
    pub async fn resolve_number_or_id(&self, list_id: &str, value: &str) -> Option<String> {
        let cache = self.state.read().await;
        let cues = cache.cues.get(list_id)?;
        cues.iter()
            .find(|c| !c.number.is_empty() && c.number == value)
            .or_else(|| cues.iter().find(|c| c.number.is_empty() && c.id == value))
            .map(|c| c.id.clone())
    }
}
