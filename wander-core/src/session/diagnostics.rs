use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters updated by the session loop, readable from any thread.
#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub sessions_started: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub stale_frames_dropped: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub chunks_scheduled: AtomicUsize,
    pub decode_errors: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub turns_completed: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            stale_frames_dropped: self.stale_frames_dropped.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub sessions_started: usize,
    pub frames_sent: usize,
    pub stale_frames_dropped: usize,
    pub chunks_received: usize,
    pub chunks_scheduled: usize,
    pub decode_errors: usize,
    pub interruptions: usize,
    pub turns_completed: usize,
}
