//! The seam between the session controller and the remote model.
//!
//! A [`Connector`] opens a link for one session generation. Everything the
//! remote side does afterwards (open, messages, close, error) arrives as a
//! [`TransportEvent`] on the session's event channel, tagged with that
//! generation. The controller only ever talks back through
//! [`ModelTransport`].

pub mod gemini;
pub mod messages;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::session::SessionEvent;

pub use gemini::{GeminiLiveConfig, GeminiLiveConnector};
pub use messages::{LiveServerMessage, RealtimeInput};

/// Something the remote session did.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Session established; capture may begin.
    Open,
    Message(LiveServerMessage),
    Close { reason: Option<String> },
    Error(String),
}

/// Where a transport reports its events.
#[derive(Debug, Clone)]
pub struct TransportLink {
    pub generation: u64,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

impl TransportLink {
    pub fn new(generation: u64, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, events }
    }

    /// Deliver an event to the session loop. Returns `false` once the loop is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events
            .send(SessionEvent::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// An open (or opening) model session.
pub trait ModelTransport: Send {
    /// Fire-and-forget send of one realtime input chunk.
    fn send_realtime_input(&mut self, input: RealtimeInput) -> Result<()>;

    /// Close the session. Must be safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

/// Opens model sessions.
pub trait Connector: Send + 'static {
    /// Begin establishing a session. Completion is reported later as
    /// [`TransportEvent::Open`] (or `Error`) through `link`.
    fn connect(&mut self, link: TransportLink) -> Result<Box<dyn ModelTransport>>;
}
