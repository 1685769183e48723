use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, sleep_until},
};

use crate::{
    error::SessionError,
    event::UiEvent,
    fader::LevelChannel,
    manager::CueCacheHandle,
    model::{ConnectionSettings, Cue, CueList, SessionSettings, SessionState},
    osc::{self, OscMessage},
    protocol,
    synchronizer::{CueSynchronizer, SyncAction},
    transport::{self, FrameReceiver, FrameSender},
};

#[derive(Debug)]
pub enum ControllerCommand {
    Connect(ConnectionSettings),
    Disconnect { done: Option<oneshot::Sender<()>> },
    Go,
    Panic,
    SelectCue { cue_id: String },
    SelectCueList { list_id: String },
    QueryLevel { cue_id: String, reply_tx: oneshot::Sender<f64> },
}

/// Everything a UI needs to render the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub state: SessionState,
    pub connected: bool,
    pub error: Option<String>,
    pub cues: Vec<Cue>,
    pub cue_lists: Vec<CueList>,
    pub selected_cue_id: Option<String>,
    pub selected_cue_list_id: Option<String>,
    pub anything_running: bool,
}

enum Inbound {
    Opened { generation: u64, sender: FrameSender },
    OpenFailed { generation: u64, error: SessionError },
    Frame { generation: u64, bytes: Vec<u8> },
    Closed { generation: u64, error: Option<String> },
}

pub struct SessionController {
    settings: SessionSettings,
    command_rx: mpsc::Receiver<ControllerCommand>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    state_tx: watch::Sender<SessionView>,
    event_tx: broadcast::Sender<UiEvent>,
    view: SessionView,

    sync: CueSynchronizer,
    cache: CueCacheHandle,
    levels: LevelChannel,

    sender: Option<FrameSender>,
    // Opens the transport, then runs the receive loop.
    reader: Option<JoinHandle<()>>,
    // Bumped on every teardown so events from an old connection are ignored.
    generation: u64,
    handshake: Vec<OscMessage>,

    watchdog: Option<Instant>,
    next_heartbeat: Option<Instant>,
    last_frame: Option<Instant>,
    running_poll: Option<Instant>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_connection<F>(open: F, generation: u64, inbound_tx: mpsc::Sender<Inbound>)
where
    F: Future<Output = Result<(FrameSender, FrameReceiver), SessionError>>,
{
    let receiver = match open.await {
        Ok((sender, receiver)) => {
            if inbound_tx.send(Inbound::Opened { generation, sender }).await.is_err() {
                return;
            }
            receiver
        }
        Err(error) => {
            let _ = inbound_tx.send(Inbound::OpenFailed { generation, error }).await;
            return;
        }
    };
    read_frames(receiver, generation, inbound_tx).await;
}

async fn read_frames(mut receiver: FrameReceiver, generation: u64, inbound_tx: mpsc::Sender<Inbound>) {
    log::debug!("Receive loop {} started.", generation);
    let error = loop {
        match receiver.next_frame().await {
            Ok(Some(bytes)) => {
                if inbound_tx.send(Inbound::Frame { generation, bytes }).await.is_err() {
                    return;
                }
            }
            Ok(None) => break None,
            Err(e) => break Some(e.to_string()),
        }
    };
    let _ = inbound_tx.send(Inbound::Closed { generation, error }).await;
    log::debug!("Receive loop {} finished.", generation);
}

impl SessionController {
    pub fn new(
        settings: SessionSettings,
        sync: CueSynchronizer,
        cache: CueCacheHandle,
        levels: LevelChannel,
        command_rx: mpsc::Receiver<ControllerCommand>,
        state_tx: watch::Sender<SessionView>,
        event_tx: broadcast::Sender<UiEvent>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(64);
        Self {
            settings,
            command_rx,
            inbound_tx,
            inbound_rx,
            state_tx,
            event_tx,
            view: SessionView::default(),
            sync,
            cache,
            levels,
            sender: None,
            reader: None,
            generation: 0,
            handshake: Vec::new(),
            watchdog: None,
            next_heartbeat: None,
            last_frame: None,
            running_poll: None,
        }
    }

    pub async fn run(mut self) {
        log::info!("SessionController run loop started.");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    if let Err(e) = self.handle_command(command).await {
                        log::error!("Error handling controller command: {:?}", e);
                    }
                },
                Some(inbound) = self.inbound_rx.recv() => {
                    self.handle_inbound(inbound).await;
                },
                _ = wait_until(self.watchdog) => {
                    self.handle_watchdog().await;
                },
                _ = wait_until(self.next_heartbeat) => {
                    self.handle_heartbeat().await;
                },
                _ = wait_until(self.running_poll) => {
                    self.running_poll = None;
                    if let Some(workspace_id) = self.sync.workspace_id() {
                        let message = protocol::running_cues(workspace_id);
                        self.send(&message).await;
                    }
                },
            }
        }
        self.teardown().await;
        self.levels.shutdown();
        log::info!("SessionController run loop finished.");
    }

    async fn handle_command(&mut self, command: ControllerCommand) -> Result<(), anyhow::Error> {
        match command {
            ControllerCommand::Connect(settings) => self.handle_connect(settings).await,
            ControllerCommand::Disconnect { done } => {
                self.teardown().await;
                self.set_state(SessionState::Disconnected, None);
                if let Some(done) = done {
                    let _ = done.send(());
                }
                Ok(())
            }
            ControllerCommand::Go => self.send_workspace(protocol::go).await,
            ControllerCommand::Panic => self.send_workspace(protocol::panic).await,
            ControllerCommand::SelectCue { cue_id } => {
                let workspace_id = self.active_workspace()?;
                self.send(&protocol::select_id(&workspace_id, &cue_id)).await;
                self.view.selected_cue_id = Some(cue_id);
                self.publish();
                Ok(())
            }
            ControllerCommand::SelectCueList { list_id } => {
                let workspace_id = self.active_workspace()?;
                self.select_list(list_id.clone()).await;
                self.send(&protocol::playback_position(&workspace_id, &list_id))
                    .await;
                self.publish();
                Ok(())
            }
            ControllerCommand::QueryLevel { cue_id, reply_tx } => {
                // Without a workspace the sender is dropped and the caller
                // sees a closed channel.
                if let Some(message) = self.sync.register_level_query(&cue_id, reply_tx) {
                    self.send(&message).await;
                }
                Ok(())
            }
        }
    }

    fn active_workspace(&self) -> Result<String, anyhow::Error> {
        self.sync
            .workspace_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("no workspace connected"))
    }

    async fn send_workspace(&mut self, build: fn(&str) -> OscMessage) -> Result<(), anyhow::Error> {
        let workspace_id = self.active_workspace()?;
        self.send(&build(&workspace_id)).await;
        Ok(())
    }

    async fn handle_connect(&mut self, settings: ConnectionSettings) -> Result<(), anyhow::Error> {
        log::info!(
            "Connecting to {}:{} over {:?}",
            settings.host,
            settings.port,
            settings.transport
        );
        let ConnectionSettings {
            host,
            port,
            transport: kind,
            password,
            passcode,
        } = settings;
        let connect_timeout = self.settings.timing.connect_timeout();
        let open = async move { transport::open(kind, &host, port, connect_timeout).await };
        self.start_connection(password.as_deref(), passcode.as_deref(), open)
            .await;
        Ok(())
    }

    /// Opens the transport on its own task so commands, `Disconnect`
    /// included, are still served while resolution or connect is pending.
    /// The watchdog covers the open as well as the first reply.
    async fn start_connection<F>(&mut self, password: Option<&str>, passcode: Option<&str>, open: F)
    where
        F: Future<Output = Result<(FrameSender, FrameReceiver), SessionError>> + Send + 'static,
    {
        self.teardown().await;
        self.set_state(SessionState::Connecting, None);
        self.handshake = self.sync.begin(password, passcode);
        self.watchdog = Some(Instant::now() + self.settings.timing.connect_timeout());
        self.reader = Some(tokio::spawn(run_connection(
            open,
            self.generation,
            self.inbound_tx.clone(),
        )));
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Opened { generation, sender } if generation == self.generation => {
                self.sender = Some(sender);
                for message in std::mem::take(&mut self.handshake) {
                    self.send(&message).await;
                }
            }
            Inbound::OpenFailed { generation, error } if generation == self.generation => {
                log::warn!("Transport open failed: {}", error);
                self.fail(error).await;
            }
            Inbound::Frame { generation, bytes } if generation == self.generation => {
                let now = Instant::now();
                self.last_frame = Some(now);
                if self.watchdog.take().is_some() {
                    log::debug!("First frame received, watchdog cleared");
                }
                if self.next_heartbeat.is_none() {
                    self.next_heartbeat = Some(now + self.settings.timing.heartbeat_interval());
                }

                let packet = match osc::decode_packet(&bytes) {
                    Ok(packet) => packet,
                    Err(e) => {
                        log::warn!("Dropping malformed frame: {}", e);
                        return;
                    }
                };
                for message in packet.into_messages() {
                    log::debug!("Received {}", message.address);
                    let actions = self.sync.handle_message(&message).await;
                    self.apply(actions).await;
                    if self.sender.is_none() {
                        // The session was torn down by one of the actions.
                        break;
                    }
                }
                self.publish();
            }
            Inbound::Closed { generation, error } if generation == self.generation => {
                if self.sender.is_none() {
                    return;
                }
                let reason = error.unwrap_or_else(|| "connection closed by server".to_string());
                self.fail(SessionError::Network(reason)).await;
            }
            _ => log::trace!("Ignoring inbound event from a stale connection"),
        }
    }

    async fn apply(&mut self, actions: Vec<SyncAction>) {
        for action in actions {
            match action {
                SyncAction::Send(message) => self.send(&message).await,
                SyncAction::Denied => {
                    self.set_state(SessionState::ErrorDenied, Some(SessionError::Denied.to_string()));
                }
                SyncAction::WorkspaceConnected => {
                    if let (Some(sender), Some(workspace_id)) = (&self.sender, self.sync.workspace_id()) {
                        self.levels.attach(sender.clone(), workspace_id);
                    }
                    if self.next_heartbeat.is_none() {
                        self.next_heartbeat =
                            Some(Instant::now() + self.settings.timing.heartbeat_interval());
                    }
                    self.set_state(SessionState::Connected, None);
                }
                SyncAction::WorkspaceClosed => {
                    self.fail(SessionError::Network("server closed the workspace".to_string()))
                        .await;
                    return;
                }
                SyncAction::CueListsChanged => {
                    self.view.cue_lists = self.cache.cue_lists().await;
                    self.emit(UiEvent::CueListsUpdated);
                    let selected_exists = self.view.selected_cue_list_id.as_ref().is_some_and(|id| {
                        self.view.cue_lists.iter().any(|l| &l.id == id)
                    });
                    if !selected_exists {
                        if let Some(first) = self.view.cue_lists.first().map(|l| l.id.clone()) {
                            self.select_list(first).await;
                        }
                    }
                }
                SyncAction::CuesChanged { list_id } => {
                    if self.view.selected_cue_list_id.as_deref() == Some(list_id.as_str()) {
                        self.view.cues = self.cache.cues(&list_id).await.unwrap_or_default();
                    }
                    self.emit(UiEvent::CuesUpdated { list_id });
                }
                SyncAction::PlaybackPosition { list_id, cue_id } => {
                    if self.view.selected_cue_list_id.is_none() {
                        self.select_list(list_id.clone()).await;
                    }
                    if self.view.selected_cue_list_id.as_deref() == Some(list_id.as_str()) {
                        self.view.selected_cue_id = Some(cue_id.clone());
                    }
                    self.emit(UiEvent::PlaybackPositionChanged { list_id, cue_id });
                }
                SyncAction::Running(running) => {
                    self.running_poll = running
                        .then(|| Instant::now() + self.settings.timing.running_poll());
                    if self.view.anything_running != running {
                        self.view.anything_running = running;
                        self.emit(UiEvent::RunningChanged { running });
                    }
                }
            }
        }
    }

    async fn select_list(&mut self, list_id: String) {
        self.view.cues = self.cache.cues(&list_id).await.unwrap_or_default();
        self.view.selected_cue_list_id = Some(list_id.clone());
        self.emit(UiEvent::CueListSelected { list_id });
    }

    async fn handle_watchdog(&mut self) {
        let window = self.settings.timing.connect_timeout_ms;
        log::warn!("No response from server within {}ms", window);
        self.fail(SessionError::Timeout(format!(
            "no response from server within {}ms",
            window
        )))
        .await;
    }

    async fn handle_heartbeat(&mut self) {
        let now = Instant::now();
        let stale_after = self.settings.timing.stale_after();
        let stale = self
            .last_frame
            .is_none_or(|last| now.duration_since(last) > stale_after);
        if stale {
            log::warn!("Heartbeat: nothing received for over {:?}", stale_after);
            self.fail(SessionError::Network("server stopped responding".to_string()))
                .await;
            return;
        }
        self.send(&protocol::thump()).await;
        self.next_heartbeat = Some(now + self.settings.timing.heartbeat_interval());
    }

    /// Sends on the shared output path. Failures are logged, never raised.
    async fn send(&self, message: &OscMessage) {
        let Some(sender) = &self.sender else {
            log::debug!("Not connected, dropping {}", message.address);
            return;
        };
        if let Err(e) = sender.send(&message.encode()).await {
            log::error!("Failed to send {}: {:?}", message.address, e);
        }
    }

    /// Tears the session down and lands in the failure's error state.
    async fn fail(&mut self, error: SessionError) {
        self.teardown().await;
        let state = error.state().unwrap_or(SessionState::ErrorNetwork);
        self.set_state(state, Some(error.to_string()));
    }

    /// Stops the connection task and timers, releases the transport and clears
    /// every cache and registry.
    async fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        self.generation += 1;
        self.handshake.clear();
        if self.sender.take().is_some() {
            log::info!("Transport released");
        }
        self.watchdog = None;
        self.next_heartbeat = None;
        self.last_frame = None;
        self.running_poll = None;
        self.levels.detach();
        self.sync.reset().await;

        let state = self.view.state;
        let error = self.view.error.take();
        self.view = SessionView {
            state,
            error,
            ..SessionView::default()
        };
    }

    fn set_state(&mut self, state: SessionState, error: Option<String>) {
        if self.view.state != state {
            log::info!("Session state: {:?} -> {:?}", self.view.state, state);
        }
        self.view.state = state;
        self.view.connected = state == SessionState::Connected;
        self.view.error = error.clone();
        self.emit(UiEvent::StateChanged { state, error });
        self.publish();
    }

    fn emit(&self, event: UiEvent) {
        if self.event_tx.send(event).is_err() {
            log::trace!("No UI clients are listening to events.");
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.view.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::net::{TcpListener, UdpSocket};

    use super::*;
    use crate::{
        manager::CueCacheManager,
        osc::{OscArg, decode_packet},
        transport::TransportKind,
    };

    struct Harness {
        command_tx: mpsc::Sender<ControllerCommand>,
        state_rx: watch::Receiver<SessionView>,
    }

    fn build(settings: SessionSettings) -> (SessionController, Harness) {
        let (command_tx, command_rx) = mpsc::channel::<ControllerCommand>(32);
        let (state_tx, state_rx) = watch::channel::<SessionView>(SessionView::default());
        let (event_tx, _) = broadcast::channel::<UiEvent>(32);
        let (manager, handle) = CueCacheManager::new();
        let sync = CueSynchronizer::new(manager, settings.classifier.clone());

        let controller = SessionController::new(
            settings,
            sync,
            handle,
            LevelChannel::spawn(),
            command_rx,
            state_tx,
            event_tx,
        );
        (controller, Harness { command_tx, state_rx })
    }

    fn start(settings: SessionSettings) -> Harness {
        let (controller, harness) = build(settings);
        tokio::spawn(controller.run());
        harness
    }

    async fn stalled_open(settings: SessionSettings) -> Harness {
        let (mut controller, harness) = build(settings);
        let open = std::future::pending::<Result<(FrameSender, FrameReceiver), SessionError>>();
        controller.start_connection(None, None, open).await;
        tokio::spawn(controller.run());
        harness
    }

    fn connection(port: u16, transport: TransportKind) -> ConnectionSettings {
        ConnectionSettings {
            host: "127.0.0.1".to_string(),
            port,
            transport,
            password: None,
            passcode: None,
        }
    }

    fn ok_reply(address: &str, data: serde_json::Value) -> Vec<u8> {
        OscMessage::new(format!("/reply{}", address))
            .with_arg(OscArg::String(json!({ "status": "ok", "data": data }).to_string()))
            .encode()
    }

    async fn wait_for_state(harness: &mut Harness, state: SessionState) -> SessionView {
        tokio::time::timeout(
            Duration::from_secs(5),
            harness.state_rx.wait_for(|view| view.state == state),
        )
        .await
        .expect("state not reached")
        .unwrap()
        .clone()
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let mut harness = start(SessionSettings::default());

        let started = Instant::now();
        harness
            .command_tx
            .send(ControllerCommand::Connect(connection(port, TransportKind::Udp)))
            .await
            .unwrap();

        let view = wait_for_state(&mut harness, SessionState::ErrorTimeout).await;
        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert!(!view.connected);
        assert!(view.error.unwrap().contains("2000ms"));

        // With the transport released, commands become no-ops.
        harness.command_tx.send(ControllerCommand::Go).await.unwrap();
        assert_eq!(harness.state_rx.borrow().state, SessionState::ErrorTimeout);
    }

    #[tokio::test]
    async fn timeout_closes_stream_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut settings = SessionSettings::default();
        settings.timing.connect_timeout_ms = 150;
        let mut harness = start(settings);

        harness
            .command_tx
            .send(ControllerCommand::Connect(connection(port, TransportKind::Tcp)))
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut receiver = FrameReceiver::stream(stream);

        // Handshake frames arrive, then the client hangs up.
        assert!(receiver.next_frame().await.unwrap().is_some());
        wait_for_state(&mut harness, SessionState::ErrorTimeout).await;
        loop {
            match receiver.next_frame().await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut harness = start(SessionSettings::default());

        harness
            .command_tx
            .send(ControllerCommand::Connect(connection(port, TransportKind::Tcp)))
            .await
            .unwrap();
        let view = wait_for_state(&mut harness, SessionState::ErrorNetwork).await;
        assert!(view.error.is_some());
    }

    #[tokio::test]
    async fn denial_moves_to_denied() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let mut harness = start(SessionSettings::default());

        harness
            .command_tx
            .send(ControllerCommand::Connect(connection(port, TransportKind::Udp)))
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (_, client) = server.recv_from(&mut buf).await.unwrap();
        let denied = OscMessage::new("/reply/workspaces")
            .with_arg(OscArg::String(json!({ "status": "denied" }).to_string()))
            .encode();
        server.send_to(&denied, client).await.unwrap();

        let view = wait_for_state(&mut harness, SessionState::ErrorDenied).await;
        assert_eq!(view.error.as_deref(), Some("access denied by server"));
    }

    /// Minimal SLIP/TCP server that walks a client through the handshake.
    async fn serve_show(listener: TcpListener, seen_tx: mpsc::UnboundedSender<OscMessage>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut receiver = FrameReceiver::stream(read_half);
        let sender = FrameSender::stream(write_half);

        while let Ok(Some(frame)) = receiver.next_frame().await {
            let Ok(packet) = decode_packet(&frame) else { continue };
            for message in packet.into_messages() {
                let reply = match message.address.as_str() {
                    "/workspaces" => Some(ok_reply(
                        "/workspaces",
                        json!([{ "uniqueID": "W", "displayName": "Show", "version": "4.6.3" }]),
                    )),
                    "/workspace/W/connect" => Some(ok_reply("/workspace/W/connect", json!("ok"))),
                    "/workspace/W/cueLists" => Some(ok_reply(
                        "/workspace/W/cueLists",
                        json!([{ "uniqueID": "L", "name": "Main", "type": "Cue List", "cues": [
                            { "uniqueID": "X1", "number": "5", "name": "a", "type": "Audio" },
                            { "uniqueID": "X7", "number": "6", "name": "b", "type": "Group", "cues": [] }
                        ]}]),
                    )),
                    "/workspace/W/cue_id/X7/mode" => {
                        Some(ok_reply("/workspace/W/cue_id/X7/mode", json!(3)))
                    }
                    "/workspace/W/cue_id/L/playbackPosition" => Some(ok_reply(
                        "/workspace/W/cue_id/L/playbackPosition",
                        json!("6"),
                    )),
                    "/workspace/W/runningOrPausedCues" => Some(ok_reply(
                        "/workspace/W/runningOrPausedCues",
                        json!([{ "uniqueID": "X1" }]),
                    )),
                    "/workspace/W/cue_id/X1/sliderLevel/0" if message.args.is_empty() => Some(
                        ok_reply("/workspace/W/cue_id/X1/sliderLevel/0", json!(-12.0)),
                    ),
                    _ => None,
                };
                let _ = seen_tx.send(message);
                if let Some(reply) = reply {
                    sender.send(&reply).await.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn full_handshake_mirrors_show() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve_show(listener, seen_tx));
        let mut harness = start(SessionSettings::default());

        harness
            .command_tx
            .send(ControllerCommand::Connect(connection(port, TransportKind::Tcp)))
            .await
            .unwrap();

        let view = tokio::time::timeout(
            Duration::from_secs(5),
            harness.state_rx.wait_for(|view| {
                view.connected
                    && view.selected_cue_id.as_deref() == Some("X7")
                    && view.cues.iter().any(|c| c.group_mode.is_some())
            }),
        )
        .await
        .expect("show not mirrored")
        .unwrap()
        .clone();

        assert_eq!(view.state, SessionState::Connected);
        assert_eq!(view.selected_cue_list_id.as_deref(), Some("L"));
        assert_eq!(view.cue_lists.len(), 1);
        assert_eq!(view.cues.len(), 2);
        assert_eq!(
            view.cues[1].group_mode,
            Some(crate::model::GroupMode::Simultaneous)
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .command_tx
            .send(ControllerCommand::QueryLevel { cue_id: "X1".to_string(), reply_tx })
            .await
            .unwrap();
        assert_eq!(reply_rx.await.unwrap(), -12.0);

        harness.command_tx.send(ControllerCommand::Go).await.unwrap();
        loop {
            let message = seen_rx.recv().await.unwrap();
            if message.address == "/workspace/W/go" {
                break;
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        harness
            .command_tx
            .send(ControllerCommand::Disconnect { done: Some(done_tx) })
            .await
            .unwrap();
        done_rx.await.unwrap();
        let view = harness.state_rx.borrow().clone();
        assert_eq!(view.state, SessionState::Disconnected);
        assert!(view.cues.is_empty());
        assert!(view.cue_lists.is_empty());
        assert!(view.selected_cue_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_open_times_out() {
        let mut harness = stalled_open(SessionSettings::default()).await;
        assert_eq!(harness.state_rx.borrow().state, SessionState::Connecting);

        let view = wait_for_state(&mut harness, SessionState::ErrorTimeout).await;
        assert!(view.error.unwrap().contains("2000ms"));
    }

    #[tokio::test]
    async fn disconnect_is_served_while_opening() {
        let harness = stalled_open(SessionSettings::default()).await;

        let (done_tx, done_rx) = oneshot::channel();
        harness
            .command_tx
            .send(ControllerCommand::Disconnect { done: Some(done_tx) })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_millis(500), done_rx)
            .await
            .expect("disconnect blocked behind the open")
            .unwrap();
        assert_eq!(harness.state_rx.borrow().state, SessionState::Disconnected);
    }

    /// Answers the workspace handshake over UDP and nothing else.
    async fn serve_handshake_then_go_quiet(server: UdpSocket) {
        let mut buf = vec![0u8; 4096];
        while let Ok((n, client)) = server.recv_from(&mut buf).await {
            let Ok(packet) = decode_packet(&buf[..n]) else { continue };
            for message in packet.into_messages() {
                let reply = match message.address.as_str() {
                    "/workspaces" => ok_reply(
                        "/workspaces",
                        json!([{ "uniqueID": "W", "displayName": "Show", "version": "4.6.3" }]),
                    ),
                    "/workspace/W/connect" => ok_reply("/workspace/W/connect", json!("ok")),
                    _ => continue,
                };
                let _ = server.send_to(&reply, client).await;
            }
        }
    }

    #[tokio::test]
    async fn silent_server_goes_stale() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(serve_handshake_then_go_quiet(server));

        let mut settings = SessionSettings::default();
        settings.timing.heartbeat_interval_ms = 50;
        settings.timing.stale_after_ms = 120;
        let mut harness = start(settings);

        harness
            .command_tx
            .send(ControllerCommand::Connect(connection(port, TransportKind::Udp)))
            .await
            .unwrap();
        wait_for_state(&mut harness, SessionState::Connected).await;

        let view = wait_for_state(&mut harness, SessionState::ErrorNetwork).await;
        assert_eq!(view.error.as_deref(), Some("network error: server stopped responding"));
        assert!(!view.connected);
        assert!(view.cue_lists.is_empty());
    }

    #[tokio::test]
    async fn server_hangup_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (hangup_tx, hangup_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut receiver = FrameReceiver::stream(read_half);
            let sender = FrameSender::stream(write_half);
            while let Ok(Some(frame)) = receiver.next_frame().await {
                let Ok(packet) = decode_packet(&frame) else { continue };
                for message in packet.into_messages() {
                    let reply = match message.address.as_str() {
                        "/workspaces" => ok_reply(
                            "/workspaces",
                            json!([{ "uniqueID": "W", "displayName": "Show" }]),
                        ),
                        "/workspace/W/connect" => ok_reply("/workspace/W/connect", json!("ok")),
                        _ => continue,
                    };
                    sender.send(&reply).await.unwrap();
                    if message.address == "/workspace/W/connect" {
                        let _ = hangup_rx.await;
                        return;
                    }
                }
            }
        });
        let mut harness = start(SessionSettings::default());

        harness
            .command_tx
            .send(ControllerCommand::Connect(connection(port, TransportKind::Tcp)))
            .await
            .unwrap();
        wait_for_state(&mut harness, SessionState::Connected).await;
        hangup_tx.send(()).unwrap();

        let view = wait_for_state(&mut harness, SessionState::ErrorNetwork).await;
        assert_eq!(view.error.as_deref(), Some("network error: connection closed by server"));
    }

    #[tokio::test]
    async fn running_cues_are_polled_while_anything_runs() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve_show(listener, seen_tx));

        let mut settings = SessionSettings::default();
        settings.timing.running_poll_ms = 30;
        let mut harness = start(settings);

        harness
            .command_tx
            .send(ControllerCommand::Connect(connection(port, TransportKind::Tcp)))
            .await
            .unwrap();

        // The seed poll after the workspace connects, then a timer re-poll.
        let mut polls = 0;
        tokio::time::timeout(Duration::from_secs(5), async {
            while polls < 2 {
                let message = seen_rx.recv().await.unwrap();
                if message.address == "/workspace/W/runningOrPausedCues" {
                    polls += 1;
                }
            }
        })
        .await
        .expect("running cues were not re-polled");

        let view = tokio::time::timeout(
            Duration::from_secs(5),
            harness.state_rx.wait_for(|view| view.anything_running),
        )
        .await
        .expect("running flag not set")
        .unwrap()
        .clone();
        assert!(view.connected);
    }
}
