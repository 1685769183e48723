use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::{
    controller::{ControllerCommand, SessionController},
    fader::LevelChannel,
    manager::CueCacheManager,
    synchronizer::CueSynchronizer,
};

pub mod controller;
pub mod error;
pub mod event;
pub mod fader;
pub mod manager;
pub mod model;
pub mod osc;
pub mod protocol;
pub mod synchronizer;
pub mod transport;

pub use controller::SessionView;
pub use event::UiEvent;
pub use manager::CueCacheHandle;
pub use model::{ConnectionSettings, Cue, CueList, GroupMode, SessionSettings, SessionState};
pub use transport::TransportKind;

/// Client-facing side of a running session. Commands never fail; their
/// outcome shows up in the observed state.
pub struct SessionHandle {
    pub cue_cache: CueCacheHandle,

    controller_tx: mpsc::Sender<ControllerCommand>,
    state_rx: watch::Receiver<SessionView>,
    event_tx: broadcast::Sender<UiEvent>,
    levels: LevelChannel,
}

pub async fn start_session(settings: SessionSettings) -> SessionHandle {
    let (controller_tx, controller_rx) = mpsc::channel::<ControllerCommand>(32);
    let (state_tx, state_rx) = watch::channel::<SessionView>(SessionView::default());
    let (event_tx, _) = broadcast::channel::<UiEvent>(64);

    let (cache_manager, cue_cache) = CueCacheManager::new();
    let sync = CueSynchronizer::new(cache_manager, settings.classifier.clone());
    let levels = LevelChannel::spawn();

    let controller = SessionController::new(
        settings,
        sync,
        cue_cache.clone(),
        levels.clone(),
        controller_rx,
        state_tx,
        event_tx.clone(),
    );
    tokio::spawn(controller.run());

    SessionHandle {
        cue_cache,
        controller_tx,
        state_rx,
        event_tx,
        levels,
    }
}

impl SessionHandle {
    async fn command(&self, command: ControllerCommand) {
        if let Err(e) = self.controller_tx.send(command).await {
            log::error!("Session controller is gone: {:?}", e);
        }
    }

    pub async fn connect(&self, settings: ConnectionSettings) {
        self.command(ControllerCommand::Connect(settings)).await;
    }

    /// Resolves once the transport is released and caches are cleared.
    pub async fn disconnect(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.command(ControllerCommand::Disconnect { done: Some(done_tx) })
            .await;
        let _ = done_rx.await;
    }

    pub async fn go(&self) {
        self.command(ControllerCommand::Go).await;
    }

    pub async fn panic(&self) {
        self.command(ControllerCommand::Panic).await;
    }

    pub async fn select_cue(&self, cue_id: &str) {
        self.command(ControllerCommand::SelectCue {
            cue_id: cue_id.to_string(),
        })
        .await;
    }

    pub async fn select_cue_list(&self, list_id: &str) {
        self.command(ControllerCommand::SelectCueList {
            list_id: list_id.to_string(),
        })
        .await;
    }

    /// Resolves with the cue's current level. The receiver closes without a
    /// value if another query for the same cue replaces this one or the
    /// session ends first.
    pub async fn query_level(&self, cue_id: &str) -> oneshot::Receiver<f64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(ControllerCommand::QueryLevel {
            cue_id: cue_id.to_string(),
            reply_tx,
        })
        .await;
        reply_rx
    }

    /// Never blocks; only the latest pending level is transmitted.
    pub fn set_level(&self, cue_id: &str, level: f64) {
        self.levels.set_level(cue_id, level);
    }

    pub fn cancel_level_sends(&self) {
        self.levels.cancel();
    }

    pub fn state(&self) -> watch::Receiver<SessionView> {
        self.state_rx.clone()
    }

    pub fn view(&self) -> SessionView {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.event_tx.subscribe()
    }
}
