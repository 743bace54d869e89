//! Session controller: connection lifecycle and the barge-in protocol.
//!
//! ## State machine
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──Open──► Connected
//!      ▲                          │                    │ interrupted → flush playback
//!      │                    error │              close │ toggle off
//!      │                          ▼                    │
//!      └────── teardown ◄──── Error ◄──────── error ───┘
//! ```
//!
//! The controller is driven from one task. Transport callbacks and captured
//! frames arrive as [`SessionEvent`]s tagged with the generation of the
//! session that produced them; anything from an older generation, or arriving
//! while no matching session is live, is dropped on the spot.
//!
//! Teardown is the only exit path. It is idempotent and attempts every step
//! even when an earlier one fails.

mod diagnostics;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, info_span, trace, warn, Span};

use crate::{
    audio::{
        host::{AudioBackend, AudioRequest, AudioSession},
        resample::RateConverter,
    },
    buffering::frame::AudioFrame,
    capture::CapturedChunk,
    codec,
    error::{Result, VoiceError},
    ipc::events::{
        PlaybackEvent, PlaybackEventKind, SessionState, SessionStatusEvent, VolumeEvent,
    },
    meter::VolumeMeter,
    transport::{
        messages::Blob, Connector, LiveServerMessage, ModelTransport, RealtimeInput,
        TransportEvent, TransportLink,
    },
    PLAYBACK_SAMPLE_RATE,
};

pub use diagnostics::{DiagnosticsSnapshot, SessionDiagnostics};

/// Shown to the user when the microphone cannot be acquired.
pub const PERMISSION_ERROR_MESSAGE: &str = "Connection failed. Please allow microphone access.";

/// Input chunk for converting model audio to the output device rate (20 ms at 24 kHz).
const PLAYBACK_CONVERT_CHUNK: usize = 480;

/// Everything that can wake the session loop besides user commands.
#[derive(Debug)]
pub enum SessionEvent {
    Transport { generation: u64, event: TransportEvent },
    Captured(CapturedChunk),
}

/// Broadcast senders for UI-facing events.
#[derive(Debug, Clone)]
pub struct SessionChannels {
    pub status: broadcast::Sender<SessionStatusEvent>,
    pub volume: broadcast::Sender<VolumeEvent>,
    pub playback: broadcast::Sender<PlaybackEvent>,
}

impl SessionChannels {
    pub fn new(capacity: usize) -> Self {
        let (status, _) = broadcast::channel(capacity);
        let (volume, _) = broadcast::channel(capacity);
        let (playback, _) = broadcast::channel(capacity);
        Self {
            status,
            volume,
            playback,
        }
    }
}

/// Devices and model session owned by one live generation.
struct LiveLink {
    generation: u64,
    audio: Box<dyn AudioSession>,
    transport: Option<Box<dyn ModelTransport>>,
    /// Model rate → output device rate.
    converter: RateConverter,
}

enum Phase {
    Idle,
    Connecting(LiveLink),
    Connected(LiveLink),
}

impl Phase {
    fn is_live(&self) -> bool {
        !matches!(self, Phase::Idle)
    }

    fn link_mut(&mut self) -> Option<&mut LiveLink> {
        match self {
            Phase::Idle => None,
            Phase::Connecting(link) | Phase::Connected(link) => Some(link),
        }
    }

    fn into_link(self) -> Option<LiveLink> {
        match self {
            Phase::Idle => None,
            Phase::Connecting(link) | Phase::Connected(link) => Some(link),
        }
    }
}

/// Owns the live session and reacts to commands and events.
pub struct SessionController {
    backend: Box<dyn AudioBackend>,
    connector: Box<dyn Connector>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    meter: VolumeMeter,
    channels: SessionChannels,
    diagnostics: Arc<SessionDiagnostics>,
    phase: Phase,
    state: SessionState,
    generation: u64,
    last_error: Option<String>,
    span: Span,
    volume_seq: u64,
    playback_seq: u64,
}

impl SessionController {
    /// `events_tx` is the sending half of the channel the caller drains into
    /// [`handle_event`](Self::handle_event).
    pub fn new(
        backend: Box<dyn AudioBackend>,
        connector: Box<dyn Connector>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        channels: SessionChannels,
        meter: VolumeMeter,
    ) -> Self {
        Self {
            backend,
            connector,
            events_tx,
            meter,
            channels,
            diagnostics: Arc::new(SessionDiagnostics::default()),
            phase: Phase::Idle,
            state: SessionState::Disconnected,
            generation: 0,
            last_error: None,
            span: Span::none(),
            volume_seq: 0,
            playback_seq: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Message from the most recent failure, cleared by the next `connect()`.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn diagnostics(&self) -> Arc<SessionDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    /// Open devices and start establishing a model session.
    ///
    /// A live session is torn down first. On failure the controller passes
    /// through `Error` and ends `Disconnected`; the error is also returned.
    pub fn connect(&mut self) -> Result<()> {
        if self.phase.is_live() {
            info!("connect requested while live, tearing down first");
            self.teardown();
        }

        self.generation += 1;
        let generation = self.generation;
        self.span = info_span!("voice_session", generation);
        let _enter = self.span.clone().entered();

        self.last_error = None;
        SessionDiagnostics::bump(&self.diagnostics.sessions_started);
        self.set_state(SessionState::Connecting, None);

        let mut audio = match self.backend.open(AudioRequest {
            generation,
            events: self.events_tx.clone(),
            meter: self.meter,
        }) {
            Ok(audio) => audio,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let output_rate = audio.scheduler().lock().sample_rate();
        let converter =
            match RateConverter::new(PLAYBACK_SAMPLE_RATE, output_rate, PLAYBACK_CONVERT_CHUNK) {
                Ok(converter) => converter,
                Err(e) => {
                    release_audio(audio.as_mut());
                    self.fail(&e);
                    return Err(e);
                }
            };

        self.phase = Phase::Connecting(LiveLink {
            generation,
            audio,
            transport: None,
            converter,
        });

        match self
            .connector
            .connect(TransportLink::new(generation, self.events_tx.clone()))
        {
            Ok(transport) => {
                if let Some(link) = self.phase.link_mut() {
                    link.transport = Some(transport);
                }
                info!(output_rate, "devices open, waiting for model session");
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// User-initiated disconnect. Safe in any state.
    pub fn disconnect(&mut self) {
        let _enter = self.span.clone().entered();
        if self.phase.is_live() {
            info!("disconnect requested");
        }
        self.teardown();
    }

    /// Disconnect when live, connect otherwise.
    pub fn toggle(&mut self) -> Result<()> {
        if self.phase.is_live() {
            self.disconnect();
            Ok(())
        } else {
            self.connect()
        }
    }

    /// Apply one transport event or captured frame.
    pub fn handle_event(&mut self, event: SessionEvent) {
        let _enter = self.span.clone().entered();
        match event {
            SessionEvent::Transport { generation, event } => {
                if generation != self.generation || !self.phase.is_live() {
                    debug!(
                        generation,
                        current = self.generation,
                        "dropping stale transport event"
                    );
                    return;
                }
                self.handle_transport(event);
            }
            SessionEvent::Captured(chunk) => self.forward_capture(chunk),
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Message(message) => self.on_message(message),
            TransportEvent::Close { reason } => {
                info!(?reason, "model session closed");
                self.teardown();
            }
            TransportEvent::Error(message) => self.fail(&VoiceError::Transport(message)),
        }
    }

    fn on_open(&mut self) {
        let mut link = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connecting(link) => link,
            other => {
                self.phase = other;
                debug!("open event while not connecting, ignoring");
                return;
            }
        };

        // Capture starts only once the model session is up.
        if let Err(e) = link.audio.begin_capture() {
            self.phase = Phase::Connecting(link);
            self.fail(&e);
            return;
        }
        self.phase = Phase::Connected(link);
        self.set_state(SessionState::Connected, None);
        info!("model session open, microphone streaming");
    }

    fn on_message(&mut self, message: LiveServerMessage) {
        if !matches!(self.phase, Phase::Connected(_)) {
            debug!("server message while not connected, ignoring");
            return;
        }

        if message.is_interrupted() {
            self.interrupt();
            return;
        }
        if let Some(blob) = message.first_audio() {
            self.play(blob);
        }
        if message.is_turn_complete() {
            self.complete_turn();
        }
    }

    /// Barge-in: drop everything queued and resync the cursor to now.
    fn interrupt(&mut self) {
        let Some(link) = self.phase.link_mut() else {
            return;
        };
        link.converter.reset();
        let scheduler = link.audio.scheduler();
        let now = link.audio.clock().now_secs();
        let stopped = scheduler.lock().flush(now);

        SessionDiagnostics::bump(&self.diagnostics.interruptions);
        info!(stopped, now, "interrupted, playback flushed");
        self.emit_playback(PlaybackEventKind::Interrupted, 0, None);
    }

    fn play(&mut self, blob: &Blob) {
        SessionDiagnostics::bump(&self.diagnostics.chunks_received);

        let samples = match codec::decode(&blob.data) {
            Ok(samples) => samples,
            Err(e) => {
                SessionDiagnostics::bump(&self.diagnostics.decode_errors);
                warn!("dropping malformed audio chunk: {e}");
                return;
            }
        };

        let Some(link) = self.phase.link_mut() else {
            return;
        };

        let rate = codec::parse_pcm_rate(&blob.mime_type).unwrap_or(PLAYBACK_SAMPLE_RATE);
        if rate != link.converter.input_rate() {
            let output_rate = link.converter.output_rate();
            match RateConverter::new(rate, output_rate, PLAYBACK_CONVERT_CHUNK) {
                Ok(converter) => {
                    info!(rate, output_rate, "model audio rate changed");
                    link.converter = converter;
                }
                Err(e) => {
                    warn!(rate, "cannot convert model audio: {e}");
                    return;
                }
            }
        }

        let converted = link.converter.process(&samples);
        self.schedule(converted);
    }

    fn complete_turn(&mut self) {
        SessionDiagnostics::bump(&self.diagnostics.turns_completed);
        let tail = match self.phase.link_mut() {
            Some(link) => link.converter.flush(),
            None => return,
        };
        self.schedule(tail);

        let active = self.active_buffers();
        debug!(active, "model turn complete");
        self.emit_playback(PlaybackEventKind::TurnComplete, active, None);
    }

    fn schedule(&mut self, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        let Some(link) = self.phase.link_mut() else {
            return;
        };
        let scheduler = link.audio.scheduler();
        let now = link.audio.clock().now_frames();

        let (placed, active) = {
            let mut guard = scheduler.lock();
            let frame = AudioFrame::new(samples, guard.sample_rate());
            let placed = guard.enqueue_at_frame(frame, now);
            (placed, guard.active_len())
        };
        match placed {
            Ok(placed) => {
                SessionDiagnostics::bump(&self.diagnostics.chunks_scheduled);
                trace!(
                    id = placed.id,
                    start = placed.start_time,
                    end = placed.end_time,
                    "chunk scheduled"
                );
                self.emit_playback(PlaybackEventKind::Scheduled, active, Some(placed.start_time));
            }
            Err(e) => warn!("failed to schedule chunk: {e}"),
        }
    }

    fn forward_capture(&mut self, captured: CapturedChunk) {
        let link = match &mut self.phase {
            Phase::Connected(link) if link.generation == captured.generation => link,
            _ => {
                SessionDiagnostics::bump(&self.diagnostics.stale_frames_dropped);
                trace!(generation = captured.generation, "dropping stale capture frame");
                return;
            }
        };
        let Some(transport) = link.transport.as_mut() else {
            SessionDiagnostics::bump(&self.diagnostics.stale_frames_dropped);
            return;
        };

        match transport.send_realtime_input(RealtimeInput::from(captured.chunk)) {
            Ok(()) => SessionDiagnostics::bump(&self.diagnostics.frames_sent),
            Err(e) => warn!("failed to send capture frame: {e}"),
        }

        self.volume_seq += 1;
        let _ = self.channels.volume.send(VolumeEvent {
            seq: self.volume_seq,
            level: captured.level,
        });
    }

    /// Record the failure, surface it, then tear everything down.
    fn fail(&mut self, error: &VoiceError) {
        let message = if error.is_permission() {
            PERMISSION_ERROR_MESSAGE.to_string()
        } else {
            error.to_string()
        };
        error!(%error, "voice session failed");
        self.last_error = Some(message.clone());
        self.set_state(SessionState::Error, Some(message));
        self.teardown();
    }

    /// Release every resource of the live generation and land in
    /// `Disconnected`. Idempotent.
    fn teardown(&mut self) {
        let was_live = self.phase.is_live();
        if let Some(mut link) = std::mem::replace(&mut self.phase, Phase::Idle).into_link() {
            let stopped = release_audio(link.audio.as_mut());
            if let Some(mut transport) = link.transport.take() {
                if let Err(e) = transport.close() {
                    warn!("failed to close model session: {e}");
                }
            }
            info!(generation = link.generation, stopped, "session torn down");
        }

        if was_live {
            self.volume_seq += 1;
            let _ = self.channels.volume.send(VolumeEvent {
                seq: self.volume_seq,
                level: 0.0,
            });
        }
        self.set_state(SessionState::Disconnected, None);
        self.span = Span::none();
    }

    fn active_buffers(&mut self) -> usize {
        self.phase
            .link_mut()
            .map(|link| link.audio.scheduler().lock().active_len())
            .unwrap_or(0)
    }

    fn set_state(&mut self, state: SessionState, detail: Option<String>) {
        if self.state == state && detail.is_none() {
            return;
        }
        debug!(from = ?self.state, to = ?state, "session state change");
        self.state = state;
        let _ = self.channels.status.send(SessionStatusEvent {
            status: state,
            detail,
        });
    }

    fn emit_playback(
        &mut self,
        kind: PlaybackEventKind,
        active_buffers: usize,
        start_time: Option<f64>,
    ) {
        self.playback_seq += 1;
        let _ = self.channels.playback.send(PlaybackEvent {
            seq: self.playback_seq,
            kind,
            active_buffers,
            start_time,
        });
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Best-effort device release in teardown order. Returns how many playing
/// buffers were stopped.
fn release_audio(audio: &mut dyn AudioSession) -> usize {
    log_step("stop microphone", audio.stop_microphone());
    log_step("detach capture", audio.detach_capture());
    log_step("close input", audio.close_input());

    let scheduler = audio.scheduler();
    let now = audio.clock().now_secs();
    let stopped = scheduler.lock().flush(now);

    log_step("close output", audio.close_output());
    scheduler.lock().reset();
    stopped
}

fn log_step(step: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!(step, "teardown step failed: {e}");
    }
}
