//! Gemini Live over a WebSocket.
//!
//! One socket task per session generation. The task sends the `setup` frame,
//! then multiplexes outbound realtime input with inbound server frames until
//! either side closes. `setupComplete` from the server is reported as
//! [`TransportEvent::Open`].

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::messages::{ClientMessage, LiveServerMessage, RealtimeInput, SetupMessage};
use super::{Connector, ModelTransport, TransportEvent, TransportLink};
use crate::error::{Result, VoiceError};

pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE_NAME: &str = "Kore";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are WanderAI, a conversational and enthusiastic travel assistant. \
When the mic turns on, open with: 'Hey there, I am your travel plan assistant, just tell me which place you are planning about.' \
Your voice responses should be concise, engaging, and friendly. Avoid long monologues. \
Feel free to ask questions to keep the conversation flowing.";

/// Connection settings for a Live session.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeminiLiveConfig {
    /// WebSocket endpoint without the `key` query parameter.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: Option<String>,
}

impl Default for GeminiLiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            api_key: String::new(),
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice_name: DEFAULT_VOICE_NAME.to_string(),
            system_instruction: Some(DEFAULT_SYSTEM_INSTRUCTION.to_string()),
        }
    }
}

impl std::fmt::Debug for GeminiLiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiLiveConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<redacted>" })
            .field("model", &self.model)
            .field("voice_name", &self.voice_name)
            .field("system_instruction", &self.system_instruction.is_some())
            .finish()
    }
}

impl GeminiLiveConfig {
    /// Full socket URL including the API key.
    pub fn url(&self) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{sep}key={}", self.endpoint, self.api_key)
    }

    /// Model resource name; bare ids get the `models/` prefix.
    pub fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    fn setup_message(&self) -> ClientMessage {
        ClientMessage::Setup(SetupMessage::audio(
            &self.model_path(),
            &self.voice_name,
            self.system_instruction.as_deref(),
        ))
    }
}

/// Opens Live sessions, one socket task per call.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    config: GeminiLiveConfig,
}

impl GeminiLiveConnector {
    pub fn new(config: GeminiLiveConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeminiLiveConfig {
        &self.config
    }
}

impl Connector for GeminiLiveConnector {
    fn connect(&mut self, link: TransportLink) -> Result<Box<dyn ModelTransport>> {
        if self.config.api_key.trim().is_empty() {
            return Err(VoiceError::Transport("no API key configured".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| VoiceError::Transport(format!("no async runtime: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let span = info_span!("live_socket", generation = link.generation);
        runtime.spawn(run_socket(self.config.clone(), link, rx).instrument(span));

        Ok(Box::new(LiveTransport {
            outbound: tx,
            closed: false,
        }))
    }
}

enum Outbound {
    Input(RealtimeInput),
    Close,
}

struct LiveTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: bool,
}

impl ModelTransport for LiveTransport {
    fn send_realtime_input(&mut self, input: RealtimeInput) -> Result<()> {
        if self.closed {
            return Err(VoiceError::Transport("session already closed".into()));
        }
        self.outbound
            .send(Outbound::Input(input))
            .map_err(|_| VoiceError::Transport("socket task has exited".into()))
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            // The socket task may already be gone after a remote close.
            let _ = self.outbound.send(Outbound::Close);
        }
        Ok(())
    }
}

async fn run_socket(
    config: GeminiLiveConfig,
    link: TransportLink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let (socket, _) = match connect_async(config.url()).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!("live connect failed: {e}");
            link.emit(TransportEvent::Error(format!("connect failed: {e}")));
            return;
        }
    };
    info!(model = config.model_path().as_str(), "live socket connected");

    let (mut writer, mut reader) = socket.split();

    let setup = match serde_json::to_string(&config.setup_message()) {
        Ok(json) => json,
        Err(e) => {
            link.emit(TransportEvent::Error(format!("setup encode failed: {e}")));
            return;
        }
    };
    if let Err(e) = writer.send(Message::Text(setup)).await {
        link.emit(TransportEvent::Error(format!("setup send failed: {e}")));
        return;
    }

    let mut opened = false;
    loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Input(input)) => {
                    let json = match serde_json::to_string(&ClientMessage::from(input)) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("realtime input encode failed: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = writer.send(Message::Text(json)).await {
                        link.emit(TransportEvent::Error(format!("send failed: {e}")));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!("closing live socket");
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = reader.next() => {
                let payload = match frame {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        info!(?reason, "live socket closed by server");
                        link.emit(TransportEvent::Close { reason });
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("live socket error: {e}");
                        link.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        link.emit(TransportEvent::Close { reason: None });
                        break;
                    }
                };

                let message: LiveServerMessage = match serde_json::from_slice(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("ignoring unparseable server frame: {e}");
                        continue;
                    }
                };
                let event = if message.is_setup_complete() && !opened {
                    opened = true;
                    TransportEvent::Open
                } else {
                    TransportEvent::Message(message)
                };
                if !link.emit(event) {
                    debug!("session loop gone, dropping socket");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EncodedChunk;
    use crate::session::SessionEvent;
    use tokio::net::TcpListener;

    fn test_config(endpoint: String) -> GeminiLiveConfig {
        GeminiLiveConfig {
            endpoint,
            api_key: "test-key".into(),
            model: "test-model".into(),
            ..GeminiLiveConfig::default()
        }
    }

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) -> (u64, TransportEvent) {
        match rx.recv().await {
            Some(SessionEvent::Transport { generation, event }) => (generation, event),
            other => panic!("expected a transport event, got {other:?}"),
        }
    }

    #[test]
    fn url_carries_api_key() {
        let config = test_config("wss://example.test/live".into());
        assert_eq!(config.url(), "wss://example.test/live?key=test-key");
        let config = test_config("wss://example.test/live?alt=json".into());
        assert_eq!(config.url(), "wss://example.test/live?alt=json&key=test-key");
    }

    #[test]
    fn model_path_is_prefixed_once() {
        let config = test_config(String::new());
        assert_eq!(config.model_path(), "models/test-model");
        assert_eq!(GeminiLiveConfig::default().model_path(), DEFAULT_LIVE_MODEL);
    }

    #[test]
    fn debug_redacts_api_key() {
        let rendered = format!("{:?}", test_config(String::new()));
        assert!(!rendered.contains("test-key"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn connect_without_key_fails_immediately() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut connector = GeminiLiveConnector::new(GeminiLiveConfig::default());
        let err = connector.connect(TransportLink::new(1, tx)).err().unwrap();
        assert!(matches!(err, VoiceError::Transport(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_error_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connector = GeminiLiveConnector::new(test_config(format!("ws://{addr}/live")));
        let _transport = connector.connect(TransportLink::new(4, tx)).unwrap();

        let (generation, event) = next_event(&mut rx).await;
        assert_eq!(generation, 4);
        assert!(matches!(event, TransportEvent::Error(_)));
    }

    #[tokio::test]
    async fn socket_session_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let first = ws.next().await.unwrap().unwrap();
            let setup: serde_json::Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
            assert_eq!(setup["setup"]["model"], "models/test-model");
            ws.send(Message::Text(r#"{"setupComplete":{}}"#.into()))
                .await
                .unwrap();

            let input = ws.next().await.unwrap().unwrap();
            let input: serde_json::Value = serde_json::from_str(input.to_text().unwrap()).unwrap();
            assert_eq!(input["realtimeInput"]["mediaChunks"][0]["data"], "AAA=");

            ws.send(Message::Binary(
                br#"{"serverContent":{"interrupted":true}}"#.to_vec(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connector = GeminiLiveConnector::new(test_config(format!("ws://{addr}/live")));
        let mut transport = connector.connect(TransportLink::new(9, tx)).unwrap();

        let (generation, event) = next_event(&mut rx).await;
        assert_eq!(generation, 9);
        assert!(matches!(event, TransportEvent::Open));

        transport
            .send_realtime_input(RealtimeInput::from(EncodedChunk {
                data: "AAA=".into(),
                mime_type: crate::codec::CAPTURE_MIME_TYPE.into(),
            }))
            .unwrap();

        match next_event(&mut rx).await {
            (9, TransportEvent::Message(msg)) => assert!(msg.is_interrupted()),
            (_, other) => panic!("expected interruption message, got {other:?}"),
        }
        assert!(matches!(
            next_event(&mut rx).await,
            (9, TransportEvent::Close { .. })
        ));

        server.await.unwrap();
        transport.close().unwrap();
        transport.close().unwrap();
        assert!(transport
            .send_realtime_input(RealtimeInput::from(EncodedChunk {
                data: String::new(),
                mime_type: String::new(),
            }))
            .is_err());
    }
}
