//! WebSocket Mock Server for the speech-synthesis service
//!
//! Simulates a Deepgram Aura style streaming TTS endpoint:
//! - `{"type":"Speak","text":..}` accumulates text
//! - `{"type":"Flush"}` streams the text back as binary PCM frames, then `Flushed`
//! - `{"type":"Clear"}` abandons the frames not yet sent, then `Cleared`
//!
//! Every frame is filled with the first byte of the utterance's text, except
//! byte 1 which carries the frame index, so tests can tell utterances apart
//! and check ordering.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tokio_util::sync::CancellationToken;

type WsWriter = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>;

/// Mock behaviour
#[derive(Clone, Debug)]
pub struct AuraMockConfig {
    /// Binary frames produced per flushed utterance
    pub frames_per_utterance: usize,
    /// Bytes per binary frame
    pub frame_size: usize,
    /// Delay between Flush and the first frame
    pub first_frame_delay: Duration,
    /// Delay between consecutive frames
    pub frame_interval: Duration,
    /// When set, handshakes without `Authorization: <scheme> <token>` ending
    /// in this token are rejected with 401
    pub required_token: Option<String>,
    /// Close the socket after the first `Flushed`
    pub close_after_flush: bool,
    /// Text frames sent verbatim after each Flush, before the audio
    pub preamble: Vec<String>,
}

impl Default for AuraMockConfig {
    fn default() -> Self {
        Self {
            frames_per_utterance: 3,
            frame_size: 8000,
            first_frame_delay: Duration::from_millis(30),
            frame_interval: Duration::from_millis(10),
            required_token: None,
            close_after_flush: false,
            preamble: Vec::new(),
        }
    }
}

/// What the mock observed, for assertions
#[derive(Debug, Default)]
pub struct AuraMockState {
    pub connections: AtomicU64,
    pub rejected: AtomicU64,
    pub frames_sent: AtomicU64,
    /// Control frames received, as `Clear`, `Flush` or `Speak:<text>`
    pub received: SyncMutex<Vec<String>>,
    /// Authorization header of every handshake
    pub authorizations: SyncMutex<Vec<String>>,
}

impl AuraMockState {
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
}

/// A running mock server
pub struct AuraMock {
    pub url: String,
    pub state: Arc<AuraMockState>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for AuraMock {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start the mock on an ephemeral port
pub async fn spawn_aura_mock(config: AuraMockConfig) -> AuraMock {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = Arc::new(AuraMockState::default());

    let server_state = state.clone();
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = server_state.clone();
            let config = config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_tts_connection(stream, state, config).await {
                    eprintln!("TTS mock connection error: {}", e);
                }
            });
        }
    });

    AuraMock {
        url: format!(
            "ws://127.0.0.1:{port}/v1/speak?encoding=linear16&sample_rate=48000&model=aura-asteria-en"
        ),
        state,
        task,
    }
}

/// Handle a TTS WebSocket connection (Deepgram Aura style)
async fn handle_tts_connection(
    stream: TcpStream,
    state: Arc<AuraMockState>,
    config: AuraMockConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handshake_state = state.clone();
    let required_token = config.required_token.clone();
    let check_auth = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let authorization = request
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        handshake_state.authorizations.lock().push(authorization.clone());

        let authorized = required_token
            .as_deref()
            .is_none_or(|token| authorization.split_whitespace().nth(1) == Some(token));
        if authorized {
            Ok(response)
        } else {
            handshake_state.rejected.fetch_add(1, Ordering::SeqCst);
            let mut rejection = ErrorResponse::new(Some("invalid credentials".to_string()));
            *rejection.status_mut() = http::StatusCode::UNAUTHORIZED;
            Err(rejection)
        }
    };

    let ws_stream = match accept_hdr_async(stream, check_auth).await {
        Ok(ws_stream) => ws_stream,
        // Rejected handshakes end here
        Err(_) => return Ok(()),
    };
    let (write, mut read) = ws_stream.split();
    let write: WsWriter = Arc::new(Mutex::new(write));

    state.connections.fetch_add(1, Ordering::SeqCst);
    let conn_id = state.connections.load(Ordering::SeqCst);

    let metadata = json!({
        "type": "Metadata",
        "request_id": format!("req-{}", conn_id),
        "model_name": "aura-asteria-en",
        "model_version": "mock",
        "model_uuid": format!("mock-{}", conn_id),
    });
    write
        .lock()
        .await
        .send(Message::Text(metadata.to_string().into()))
        .await?;

    let mut pending_text = String::new();
    let mut generation = CancellationToken::new();
    let mut sequence_id = 0u64;

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                match request.get("type").and_then(|t| t.as_str()) {
                    Some("Speak") => {
                        let text = request.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        state.received.lock().push(format!("Speak:{text}"));
                        pending_text.push_str(text);
                    }
                    Some("Flush") => {
                        state.received.lock().push("Flush".to_string());
                        let utterance = std::mem::take(&mut pending_text);
                        tokio::spawn(stream_utterance(
                            utterance,
                            write.clone(),
                            generation.clone(),
                            state.clone(),
                            config.clone(),
                            sequence_id,
                        ));
                        sequence_id += 1;
                    }
                    Some("Clear") => {
                        state.received.lock().push("Clear".to_string());
                        generation.cancel();
                        generation = CancellationToken::new();
                        pending_text.clear();
                        let cleared = json!({"type": "Cleared", "sequence_id": sequence_id});
                        write
                            .lock()
                            .await
                            .send(Message::Text(cleared.to_string().into()))
                            .await?;
                    }
                    Some(other) => {
                        state.received.lock().push(other.to_string());
                    }
                    None => {}
                }
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    generation.cancel();
    Ok(())
}

/// Stream one utterance as binary frames, stopping early when cleared
async fn stream_utterance(
    text: String,
    write: WsWriter,
    cancel: CancellationToken,
    state: Arc<AuraMockState>,
    config: AuraMockConfig,
    sequence_id: u64,
) {
    let tag = text.as_bytes().first().copied().unwrap_or(0);

    for raw in &config.preamble {
        let mut write = write.lock().await;
        if cancel.is_cancelled() {
            return;
        }
        if write.send(Message::Text(raw.clone().into())).await.is_err() {
            return;
        }
    }

    for index in 0..config.frames_per_utterance {
        let delay = if index == 0 {
            config.first_frame_delay
        } else {
            config.frame_interval
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let mut frame = vec![tag; config.frame_size];
        if frame.len() > 1 {
            frame[1] = index as u8;
        }

        let mut write = write.lock().await;
        if cancel.is_cancelled() {
            return;
        }
        if write.send(Message::Binary(frame.into())).await.is_err() {
            return;
        }
        state.frames_sent.fetch_add(1, Ordering::SeqCst);
    }

    let mut write = write.lock().await;
    if cancel.is_cancelled() {
        return;
    }
    let flushed = json!({"type": "Flushed", "sequence_id": sequence_id});
    if write
        .send(Message::Text(flushed.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    if config.close_after_flush {
        let _ = write.close().await;
    }
}
