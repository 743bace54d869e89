use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use approx::assert_abs_diff_eq;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use wander_core::audio::host::{AudioBackend, AudioRequest, AudioSession};
use wander_core::audio::output::OutputClock;
use wander_core::capture::CapturedChunk;
use wander_core::codec;
use wander_core::error::Result;
use wander_core::playback::{PlaybackScheduler, SharedScheduler};
use wander_core::session::{SessionChannels, PERMISSION_ERROR_MESSAGE};
use wander_core::transport::{
    Connector, LiveServerMessage, ModelTransport, RealtimeInput, TransportEvent, TransportLink,
};
use wander_core::{
    SessionController, SessionEvent, SessionState, SessionStatusEvent, VoiceConfig, VoiceEngine,
    VoiceError, VolumeMeter,
};

const OUTPUT_RATE: u32 = 24_000;

// ── Fakes ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    steps: Mutex<Vec<&'static str>>,
    sent: Mutex<Vec<RealtimeInput>>,
    links: Mutex<Vec<TransportLink>>,
    transport_closes: Mutex<usize>,
}

impl Recorder {
    fn step(&self, step: &'static str) {
        self.steps.lock().push(step);
    }

    fn steps(&self) -> Vec<&'static str> {
        self.steps.lock().clone()
    }
}

struct FakeBackend {
    recorder: Arc<Recorder>,
    scheduler: SharedScheduler,
    clock: OutputClock,
    gate: Arc<AtomicBool>,
    deny_microphone: bool,
}

impl AudioBackend for FakeBackend {
    fn open(&mut self, _request: AudioRequest) -> Result<Box<dyn AudioSession>> {
        self.recorder.step("open");
        if self.deny_microphone {
            return Err(VoiceError::PermissionDenied("denied by test".into()));
        }
        Ok(Box::new(FakeAudio {
            recorder: Arc::clone(&self.recorder),
            scheduler: Arc::clone(&self.scheduler),
            clock: self.clock.clone(),
            gate: Arc::clone(&self.gate),
        }))
    }
}

struct FakeAudio {
    recorder: Arc<Recorder>,
    scheduler: SharedScheduler,
    clock: OutputClock,
    gate: Arc<AtomicBool>,
}

impl AudioSession for FakeAudio {
    fn scheduler(&self) -> SharedScheduler {
        Arc::clone(&self.scheduler)
    }

    fn clock(&self) -> OutputClock {
        self.clock.clone()
    }

    fn begin_capture(&mut self) -> Result<()> {
        self.recorder.step("begin_capture");
        self.gate.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_microphone(&mut self) -> Result<()> {
        self.recorder.step("stop_microphone");
        self.gate.store(false, Ordering::SeqCst);
        // A failing step must not prevent the rest of teardown.
        Err(VoiceError::AudioStream("mic already gone".into()))
    }

    fn detach_capture(&mut self) -> Result<()> {
        self.recorder.step("detach_capture");
        Ok(())
    }

    fn close_input(&mut self) -> Result<()> {
        self.recorder.step("close_input");
        Ok(())
    }

    fn close_output(&mut self) -> Result<()> {
        self.recorder.step("close_output");
        Ok(())
    }
}

struct FakeConnector {
    recorder: Arc<Recorder>,
}

impl Connector for FakeConnector {
    fn connect(&mut self, link: TransportLink) -> Result<Box<dyn ModelTransport>> {
        self.recorder.step("connect_transport");
        self.recorder.links.lock().push(link);
        Ok(Box::new(FakeTransport {
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

struct FakeTransport {
    recorder: Arc<Recorder>,
}

impl ModelTransport for FakeTransport {
    fn send_realtime_input(&mut self, input: RealtimeInput) -> Result<()> {
        self.recorder.sent.lock().push(input);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        *self.recorder.transport_closes.lock() += 1;
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    controller: SessionController,
    recorder: Arc<Recorder>,
    scheduler: SharedScheduler,
    clock: OutputClock,
    gate: Arc<AtomicBool>,
    status_rx: broadcast::Receiver<SessionStatusEvent>,
    _events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

fn harness(deny_microphone: bool) -> Harness {
    let recorder = Arc::new(Recorder::default());
    let scheduler = PlaybackScheduler::shared(OUTPUT_RATE);
    let clock = OutputClock::new(OUTPUT_RATE);
    let gate = Arc::new(AtomicBool::new(false));
    let backend = FakeBackend {
        recorder: Arc::clone(&recorder),
        scheduler: Arc::clone(&scheduler),
        clock: clock.clone(),
        gate: Arc::clone(&gate),
        deny_microphone,
    };
    let connector = FakeConnector {
        recorder: Arc::clone(&recorder),
    };
    let channels = SessionChannels::new(64);
    let status_rx = channels.status.subscribe();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let controller = SessionController::new(
        Box::new(backend),
        Box::new(connector),
        events_tx,
        channels,
        VolumeMeter::default(),
    );
    Harness {
        controller,
        recorder,
        scheduler,
        clock,
        gate,
        status_rx,
        _events_rx: events_rx,
    }
}

fn transport(generation: u64, event: TransportEvent) -> SessionEvent {
    SessionEvent::Transport { generation, event }
}

fn server(json: &str) -> TransportEvent {
    let message: LiveServerMessage = serde_json::from_str(json).expect("valid server json");
    TransportEvent::Message(message)
}

/// Server message carrying `samples` of 24 kHz model audio.
fn audio_message(samples: usize) -> TransportEvent {
    let data = codec::encode(&vec![0.25; samples]);
    server(&format!(
        r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{data}"}}}}]}}}}}}"#
    ))
}

fn captured(generation: u64) -> SessionEvent {
    let samples = vec![0.1; wander_core::CAPTURE_BLOCK_SIZE];
    SessionEvent::Captured(CapturedChunk {
        generation,
        level: VolumeMeter::default().level_of(&samples),
        samples: samples.len(),
        chunk: codec::encode_chunk(&samples, wander_core::CAPTURE_SAMPLE_RATE),
    })
}

fn statuses(rx: &mut broadcast::Receiver<SessionStatusEvent>) -> Vec<SessionState> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event.status);
    }
    seen
}

fn connect_and_open(h: &mut Harness) -> u64 {
    h.controller.connect().expect("connect");
    let generation = h.controller.generation();
    h.controller.handle_event(transport(generation, TransportEvent::Open));
    assert_eq!(h.controller.state(), SessionState::Connected);
    generation
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[test]
fn capture_starts_only_after_remote_open() {
    let mut h = harness(false);
    h.controller.connect().unwrap();
    assert_eq!(h.controller.state(), SessionState::Connecting);
    assert!(!h.gate.load(Ordering::SeqCst));
    assert_eq!(h.recorder.steps(), vec!["open", "connect_transport"]);

    let generation = h.controller.generation();
    h.controller.handle_event(transport(generation, TransportEvent::Open));
    assert_eq!(h.controller.state(), SessionState::Connected);
    assert!(h.gate.load(Ordering::SeqCst));
    assert_eq!(
        statuses(&mut h.status_rx),
        vec![SessionState::Connecting, SessionState::Connected]
    );
}

#[test]
fn remote_close_while_connected_releases_everything() {
    let mut h = harness(false);
    let generation = connect_and_open(&mut h);

    h.controller.handle_event(transport(generation, audio_message(2_400)));
    h.controller.handle_event(transport(generation, audio_message(2_400)));
    assert_eq!(h.scheduler.lock().active_len(), 2);

    h.controller
        .handle_event(transport(generation, TransportEvent::Close { reason: None }));

    assert_eq!(h.controller.state(), SessionState::Disconnected);
    assert!(!h.gate.load(Ordering::SeqCst), "microphone must be stopped");
    assert_eq!(h.scheduler.lock().active_len(), 0);
    assert_eq!(h.scheduler.lock().next_start_time(), 0.0);
    assert_eq!(*h.recorder.transport_closes.lock(), 1);

    let steps = h.recorder.steps();
    let tail = &steps[steps.len() - 4..];
    assert_eq!(
        tail,
        ["stop_microphone", "detach_capture", "close_input", "close_output"],
        "every teardown step runs even when stopping the mic fails"
    );
}

#[test]
fn error_while_connecting_never_reaches_connected() {
    let mut h = harness(false);
    h.controller.connect().unwrap();
    let generation = h.controller.generation();

    h.controller.handle_event(transport(
        generation,
        TransportEvent::Error("handshake rejected".into()),
    ));
    // A late open from the dead session must not resurrect it.
    h.controller.handle_event(transport(generation, TransportEvent::Open));

    assert_eq!(h.controller.state(), SessionState::Disconnected);
    assert!(!h.gate.load(Ordering::SeqCst));
    assert!(h
        .controller
        .last_error()
        .is_some_and(|e| e.contains("handshake rejected")));
    assert_eq!(
        statuses(&mut h.status_rx),
        vec![
            SessionState::Connecting,
            SessionState::Error,
            SessionState::Disconnected
        ]
    );
}

#[test]
fn microphone_denial_surfaces_permission_message() {
    let mut h = harness(true);
    let err = h.controller.connect().unwrap_err();
    assert!(err.is_permission());
    assert_eq!(h.controller.state(), SessionState::Disconnected);
    assert_eq!(h.controller.last_error(), Some(PERMISSION_ERROR_MESSAGE));
    assert!(h.recorder.links.lock().is_empty(), "no model session without a mic");
}

#[test]
fn teardown_is_idempotent() {
    let mut h = harness(false);
    connect_and_open(&mut h);
    h.controller.disconnect();
    h.controller.disconnect();
    assert_eq!(h.controller.state(), SessionState::Disconnected);
    assert_eq!(*h.recorder.transport_closes.lock(), 1);
    assert_eq!(
        statuses(&mut h.status_rx),
        vec![
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Disconnected
        ]
    );
}

#[test]
fn toggle_alternates_connect_and_disconnect() {
    let mut h = harness(false);
    h.controller.toggle().unwrap();
    assert_eq!(h.controller.state(), SessionState::Connecting);
    h.controller.toggle().unwrap();
    assert_eq!(h.controller.state(), SessionState::Disconnected);
}

// ── Capture forwarding ──────────────────────────────────────────────────────

#[test]
fn captured_frame_after_teardown_is_not_sent() {
    let mut h = harness(false);
    let generation = connect_and_open(&mut h);

    h.controller.handle_event(captured(generation));
    assert_eq!(h.recorder.sent.lock().len(), 1);
    let sent = h.recorder.sent.lock()[0].clone();
    assert_eq!(sent.media.mime_type, wander_core::CAPTURE_MIME_TYPE);

    h.controller.disconnect();
    h.controller.handle_event(captured(generation));

    assert_eq!(h.recorder.sent.lock().len(), 1);
    let diag = h.controller.diagnostics().snapshot();
    assert_eq!(diag.frames_sent, 1);
    assert_eq!(diag.stale_frames_dropped, 1);
}

#[test]
fn frames_before_open_are_dropped() {
    let mut h = harness(false);
    h.controller.connect().unwrap();
    let generation = h.controller.generation();
    h.controller.handle_event(captured(generation));
    assert!(h.recorder.sent.lock().is_empty());
}

#[test]
fn reconnect_ignores_previous_generation() {
    let mut h = harness(false);
    let old = connect_and_open(&mut h);

    h.controller.connect().unwrap();
    let new = h.controller.generation();
    assert!(new > old);

    // The old socket's open and frames arrive late.
    h.controller.handle_event(transport(old, TransportEvent::Open));
    assert_eq!(h.controller.state(), SessionState::Connecting);
    h.controller.handle_event(transport(new, TransportEvent::Open));
    h.controller.handle_event(captured(old));
    assert!(h.recorder.sent.lock().is_empty());

    h.controller.handle_event(captured(new));
    assert_eq!(h.recorder.sent.lock().len(), 1);
}

// ── Playback ────────────────────────────────────────────────────────────────

#[test]
fn audio_chunks_play_back_to_back() {
    let mut h = harness(false);
    let generation = connect_and_open(&mut h);

    for _ in 0..3 {
        h.controller.handle_event(transport(generation, audio_message(2_400)));
    }
    // 3 × 100 ms at 24 kHz
    assert_abs_diff_eq!(h.scheduler.lock().next_start_time(), 0.3, epsilon = 1e-9);
    assert_eq!(h.controller.diagnostics().snapshot().chunks_scheduled, 3);
}

#[test]
fn audio_while_connecting_is_ignored() {
    let mut h = harness(false);
    h.controller.connect().unwrap();
    let generation = h.controller.generation();
    h.controller.handle_event(transport(generation, audio_message(2_400)));
    assert!(h.scheduler.lock().is_idle());
}

#[test]
fn interruption_flushes_and_resyncs_to_now() {
    let mut h = harness(false);
    let generation = connect_and_open(&mut h);

    for _ in 0..3 {
        h.controller.handle_event(transport(generation, audio_message(4_800)));
    }
    h.clock.advance(6_000); // 0.25 s into the first chunk

    h.controller
        .handle_event(transport(generation, server(r#"{"serverContent":{"interrupted":true}}"#)));

    assert_eq!(h.controller.state(), SessionState::Connected);
    assert!(h.scheduler.lock().is_idle());
    assert_abs_diff_eq!(h.scheduler.lock().next_start_time(), 0.25, epsilon = 1e-9);

    // The next chunk starts right at the interruption point.
    h.controller.handle_event(transport(generation, audio_message(2_400)));
    assert_abs_diff_eq!(h.scheduler.lock().next_start_time(), 0.35, epsilon = 1e-9);
    assert_eq!(h.controller.diagnostics().snapshot().interruptions, 1);
}

#[test]
fn malformed_audio_is_dropped_without_teardown() {
    let mut h = harness(false);
    let generation = connect_and_open(&mut h);

    h.controller.handle_event(transport(
        generation,
        server(r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAE"}}]}}}"#),
    ));

    assert_eq!(h.controller.state(), SessionState::Connected);
    assert!(h.scheduler.lock().is_idle());
    assert_eq!(h.controller.diagnostics().snapshot().decode_errors, 1);
}

// ── Engine ──────────────────────────────────────────────────────────────────

async fn wait_for(rx: &mut broadcast::Receiver<SessionStatusEvent>, want: SessionState) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if event.status == want => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("status channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
}

#[tokio::test]
async fn engine_commands_drive_the_session() {
    let recorder = Arc::new(Recorder::default());
    let scheduler = PlaybackScheduler::shared(OUTPUT_RATE);
    let gate = Arc::new(AtomicBool::new(false));
    let backend = FakeBackend {
        recorder: Arc::clone(&recorder),
        scheduler: Arc::clone(&scheduler),
        clock: OutputClock::new(OUTPUT_RATE),
        gate: Arc::clone(&gate),
        deny_microphone: false,
    };
    let connector = FakeConnector {
        recorder: Arc::clone(&recorder),
    };

    let engine = VoiceEngine::spawn_with(
        &VoiceConfig::default(),
        Box::new(backend),
        Box::new(connector),
    );
    let mut status = engine.subscribe_status();
    let mut volume = engine.subscribe_volume();

    engine.connect().unwrap();
    wait_for(&mut status, SessionState::Connecting).await;

    let link = recorder.links.lock()[0].clone();
    assert!(link.emit(TransportEvent::Open));
    wait_for(&mut status, SessionState::Connected).await;
    assert!(gate.load(Ordering::SeqCst));
    assert_eq!(engine.status(), SessionState::Connected);

    // Captured frames reach the engine through the same event channel.
    link.events
        .send(captured(link.generation))
        .expect("engine loop alive");
    let level = tokio::time::timeout(Duration::from_secs(2), volume.recv())
        .await
        .expect("volume event")
        .expect("volume channel open")
        .level;
    assert_abs_diff_eq!(level, 10.0, epsilon = 1e-3);

    engine.toggle().unwrap();
    wait_for(&mut status, SessionState::Disconnected).await;
    assert!(!gate.load(Ordering::SeqCst));
    assert_eq!(engine.diagnostics_snapshot().frames_sent, 1);

    engine.shutdown().await;
    assert!(matches!(engine.connect(), Err(VoiceError::EngineClosed)));
}
