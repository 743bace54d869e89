//! `VoiceEngine`: async handle around the session controller.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceEngine::start(config)
//!     └─► connect()      → devices open, status = Connecting
//!         └─► (Open)     → microphone streaming, status = Connected
//!             └─► disconnect() / toggle() → teardown, status = Disconnected
//! shutdown().await       → teardown, event loop exits
//! ```
//!
//! ## Threading
//!
//! The controller lives on a single tokio task. User commands, transport
//! events and captured frames are all delivered to it over channels, so
//! session state is never shared or locked. Only a small status snapshot
//! and the diagnostics counters are readable from other threads.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    audio::host::{AudioBackend, CpalBackend},
    error::{Result, VoiceError},
    ipc::events::{PlaybackEvent, SessionState, SessionStatusEvent, VolumeEvent},
    meter::{VolumeMeter, DEFAULT_DISPLAY_SCALE},
    session::{DiagnosticsSnapshot, SessionChannels, SessionController, SessionDiagnostics},
    transport::{Connector, GeminiLiveConfig, GeminiLiveConnector},
};

/// Broadcast channel capacity for UI events.
const BROADCAST_CAP: usize = 256;

/// Configuration for `VoiceEngine`.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Input device name; `None` uses the system default.
    pub preferred_input_device: Option<String>,
    /// Output device name; `None` uses the system default.
    pub preferred_output_device: Option<String>,
    /// Multiplier applied to frame RMS for volume events. Default: 100.
    pub volume_scale: f32,
    pub live: GeminiLiveConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            volume_scale: DEFAULT_DISPLAY_SCALE,
            live: GeminiLiveConfig::default(),
        }
    }
}

#[derive(Debug)]
enum EngineCommand {
    Connect,
    Disconnect,
    Toggle,
    Shutdown,
}

#[derive(Debug, Clone, Default)]
struct StatusSnapshot {
    state: SessionState,
    last_error: Option<String>,
}

/// Handle to a running voice engine. Cheap to share behind an `Arc`.
pub struct VoiceEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
    channels: SessionChannels,
    snapshot: Arc<Mutex<StatusSnapshot>>,
    diagnostics: Arc<SessionDiagnostics>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceEngine {
    /// Start an engine on the system audio devices and Gemini Live.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: VoiceConfig) -> Self {
        let backend = CpalBackend::new(
            config.preferred_input_device.clone(),
            config.preferred_output_device.clone(),
        );
        let connector = GeminiLiveConnector::new(config.live.clone());
        Self::spawn_with(&config, Box::new(backend), Box::new(connector))
    }

    /// Start an engine with explicit audio and transport implementations.
    pub fn spawn_with(
        config: &VoiceConfig,
        backend: Box<dyn AudioBackend>,
        connector: Box<dyn Connector>,
    ) -> Self {
        let channels = SessionChannels::new(BROADCAST_CAP);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let controller = SessionController::new(
            backend,
            connector,
            events_tx,
            channels.clone(),
            VolumeMeter::new(config.volume_scale),
        );
        let diagnostics = controller.diagnostics();
        let snapshot = Arc::new(Mutex::new(StatusSnapshot::default()));

        let task = tokio::spawn(run_loop(
            controller,
            commands_rx,
            events_rx,
            Arc::clone(&snapshot),
        ));

        Self {
            commands: commands_tx,
            channels,
            snapshot,
            diagnostics,
            task: Mutex::new(Some(task)),
        }
    }

    /// Request a new session. Progress is reported through status events.
    ///
    /// # Errors
    /// `VoiceError::EngineClosed` after [`shutdown`](Self::shutdown).
    pub fn connect(&self) -> Result<()> {
        self.send(EngineCommand::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(EngineCommand::Disconnect)
    }

    /// Disconnect when live, connect otherwise.
    pub fn toggle(&self) -> Result<()> {
        self.send(EngineCommand::Toggle)
    }

    /// Current session state (snapshot).
    pub fn status(&self) -> SessionState {
        self.snapshot.lock().state
    }

    /// Message of the most recent failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.snapshot.lock().last_error.clone()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.channels.status.subscribe()
    }

    pub fn subscribe_volume(&self) -> broadcast::Receiver<VolumeEvent> {
        self.channels.volume.subscribe()
    }

    pub fn subscribe_playback(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.channels.playback.subscribe()
    }

    /// Snapshot of session counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Tear down any live session and stop the event loop.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("voice engine task failed: {e}");
            }
        }
    }

    fn send(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| VoiceError::EngineClosed)
    }
}

async fn run_loop(
    mut controller: SessionController,
    mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    mut events: mpsc::UnboundedReceiver<crate::session::SessionEvent>,
    snapshot: Arc<Mutex<StatusSnapshot>>,
) {
    info!("voice engine started");
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(EngineCommand::Connect) => {
                    if let Err(e) = controller.connect() {
                        debug!("connect failed: {e}");
                    }
                }
                Some(EngineCommand::Disconnect) => controller.disconnect(),
                Some(EngineCommand::Toggle) => {
                    if let Err(e) = controller.toggle() {
                        debug!("toggle failed: {e}");
                    }
                }
                Some(EngineCommand::Shutdown) | None => {
                    controller.disconnect();
                    publish(&controller, &snapshot);
                    break;
                }
            },
            Some(event) = events.recv() => controller.handle_event(event),
        }
        publish(&controller, &snapshot);
    }
    info!("voice engine stopped");
}

fn publish(controller: &SessionController, snapshot: &Mutex<StatusSnapshot>) {
    let mut snap = snapshot.lock();
    snap.state = controller.state();
    snap.last_error = controller.last_error().map(str::to_owned);
}
