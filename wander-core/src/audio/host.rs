//! Per-session audio host: owns both cpal streams on one blocking thread.
//!
//! ```text
//! session loop ──HostCommand──► host thread (spawn_blocking)
//!                                 ├─ AudioOutput  (renders the scheduler)
//!                                 ├─ AudioCapture (callback → SPSC ring)
//!                                 └─ CapturePump  (ring → frames → SessionEvent)
//! ```
//!
//! The session never touches a `cpal::Stream` directly. It drives the host
//! through [`AudioSession`], whose methods translate into [`HostCommand`]s.
//! Dropping the session handle disconnects the command channel, and the host
//! thread drops both streams on its way out.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{output::AudioOutput, output::OutputClock, AudioCapture};
use crate::{
    buffering::create_audio_ring,
    capture::{idle_sleep_ms, CaptureFramer, CapturePump},
    error::{Result, VoiceError},
    meter::VolumeMeter,
    playback::SharedScheduler,
    session::SessionEvent,
};

/// Everything the host needs to stream capture for one session generation.
#[derive(Debug, Clone)]
pub struct AudioRequest {
    pub generation: u64,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub meter: VolumeMeter,
}

/// Acquires the microphone and speaker for a session.
pub trait AudioBackend: Send + 'static {
    /// Open input and output devices. Capture stays gated off until
    /// [`AudioSession::begin_capture`].
    ///
    /// # Errors
    /// `VoiceError::PermissionDenied` / `NoDefaultInputDevice` when the
    /// microphone cannot be acquired; other device errors as they occur.
    fn open(&mut self, request: AudioRequest) -> Result<Box<dyn AudioSession>>;
}

/// Live device handles for one session. Every step is idempotent.
pub trait AudioSession: Send {
    fn scheduler(&self) -> SharedScheduler;
    fn clock(&self) -> OutputClock;
    /// Start forwarding captured frames.
    fn begin_capture(&mut self) -> Result<()>;
    /// Stop the microphone at the device level.
    fn stop_microphone(&mut self) -> Result<()>;
    /// Disconnect the framing path and discard anything still buffered.
    fn detach_capture(&mut self) -> Result<()>;
    fn close_input(&mut self) -> Result<()>;
    fn close_output(&mut self) -> Result<()>;
}

/// Commands from the session to the host thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    PauseInput,
    DetachCapture,
    CloseInput,
    CloseOutput,
}

/// [`AudioBackend`] backed by the system's cpal devices.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    pub preferred_input: Option<String>,
    pub preferred_output: Option<String>,
}

impl CpalBackend {
    pub fn new(preferred_input: Option<String>, preferred_output: Option<String>) -> Self {
        Self {
            preferred_input,
            preferred_output,
        }
    }
}

struct HostReady {
    scheduler: SharedScheduler,
    clock: OutputClock,
}

impl AudioBackend for CpalBackend {
    fn open(&mut self, request: AudioRequest) -> Result<Box<dyn AudioSession>> {
        let gate = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = crossbeam_channel::unbounded::<HostCommand>();

        // Sync oneshot: the host thread reports device open success/failure.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<HostReady>>();

        let preferred_input = self.preferred_input.clone();
        let preferred_output = self.preferred_output.clone();
        let host_gate = Arc::clone(&gate);

        tokio::task::spawn_blocking(move || {
            host_main(HostContext {
                preferred_input,
                preferred_output,
                request,
                gate: host_gate,
                commands: command_rx,
                ready: ready_tx,
            })
        });

        match ready_rx.recv() {
            Ok(Ok(ready)) => Ok(Box::new(CpalAudioSession {
                gate,
                commands: command_tx,
                scheduler: ready.scheduler,
                clock: ready.clock,
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::Other(anyhow::anyhow!(
                "audio host thread died before reporting"
            ))),
        }
    }
}

struct CpalAudioSession {
    gate: Arc<AtomicBool>,
    commands: Sender<HostCommand>,
    scheduler: SharedScheduler,
    clock: OutputClock,
}

impl CpalAudioSession {
    fn send(&self, command: HostCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| VoiceError::AudioStream("audio host thread has exited".into()))
    }
}

impl AudioSession for CpalAudioSession {
    fn scheduler(&self) -> SharedScheduler {
        Arc::clone(&self.scheduler)
    }

    fn clock(&self) -> OutputClock {
        self.clock.clone()
    }

    fn begin_capture(&mut self) -> Result<()> {
        self.gate.store(true, Ordering::Release);
        Ok(())
    }

    fn stop_microphone(&mut self) -> Result<()> {
        self.gate.store(false, Ordering::Release);
        self.send(HostCommand::PauseInput)
    }

    fn detach_capture(&mut self) -> Result<()> {
        self.gate.store(false, Ordering::Release);
        self.send(HostCommand::DetachCapture)
    }

    fn close_input(&mut self) -> Result<()> {
        self.send(HostCommand::CloseInput)
    }

    fn close_output(&mut self) -> Result<()> {
        self.send(HostCommand::CloseOutput)
    }
}

struct HostContext {
    preferred_input: Option<String>,
    preferred_output: Option<String>,
    request: AudioRequest,
    gate: Arc<AtomicBool>,
    commands: Receiver<HostCommand>,
    ready: std::sync::mpsc::Sender<Result<HostReady>>,
}

/// Host thread body. Both streams are created and dropped here.
fn host_main(ctx: HostContext) {
    let HostContext {
        preferred_input,
        preferred_output,
        request,
        gate,
        commands,
        ready,
    } = ctx;

    let output = match AudioOutput::open_with_preference(preferred_output.as_deref()) {
        Ok(output) => output,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let (producer, consumer) = create_audio_ring();
    let capture = match AudioCapture::open_with_preference(
        producer,
        Arc::clone(&gate),
        preferred_input.as_deref(),
    ) {
        Ok(capture) => capture,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let framer = match CaptureFramer::new(capture.sample_rate) {
        Ok(framer) => framer,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    info!(
        generation = request.generation,
        input_rate = capture.sample_rate,
        output_rate = output.sample_rate,
        "audio host ready"
    );

    let mut pump = Some(CapturePump::new(
        consumer,
        framer,
        Arc::clone(&gate),
        request.generation,
        request.events,
        request.meter,
    ));
    let _ = ready.send(Ok(HostReady {
        scheduler: output.scheduler(),
        clock: output.clock(),
    }));

    let mut capture = Some(capture);
    let mut output = Some(output);
    let idle = Duration::from_millis(idle_sleep_ms());

    loop {
        let sent = pump.as_mut().map(CapturePump::pump).unwrap_or(0);
        let wait = if sent == 0 { idle } else { Duration::ZERO };

        match commands.recv_timeout(wait) {
            Ok(HostCommand::PauseInput) => {
                if let Some(capture) = capture.as_ref() {
                    if let Err(e) = capture.pause() {
                        warn!("failed to pause input stream: {e}");
                    }
                }
            }
            Ok(HostCommand::DetachCapture) => {
                if let Some(mut detached) = pump.take() {
                    detached.discard_pending();
                }
            }
            Ok(HostCommand::CloseInput) => {
                pump = None;
                if let Some(capture) = capture.take() {
                    capture.stop();
                    drop(capture);
                    debug!("input stream closed");
                }
            }
            Ok(HostCommand::CloseOutput) => {
                if output.take().is_some() {
                    debug!("output stream closed");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if capture.is_none() && output.is_none() {
            break;
        }
    }

    // Streams drop here, releasing the devices on this thread.
    drop(capture);
    drop(output);
    info!(generation = request.generation, "audio host exited");
}

