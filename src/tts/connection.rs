//! A single pooled TTS connection.
//!
//! Each connection is a tiny state machine: `Disconnected → Connecting →
//! Connected`, then back to `Disconnected` on error or close. While
//! connected it runs a heartbeat task pinging the server every 20 s; three
//! consecutive ping failures mark the connection unhealthy and the pool
//! discards it instead of reusing it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as PlMutex;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::protocol::{self, MessageType};
use super::{TtsConfig, MAX_AUDIO_BYTES};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Heartbeat cadence while connected.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
/// Consecutive ping failures before the connection is declared unhealthy.
const MAX_PING_FAILURES: u32 = 3;
/// A connection with no successful activity for this long is unhealthy.
const IDLE_UNHEALTHY_AFTER: Duration = Duration::from_secs(60);
/// Per-message read deadline while assembling a response.
const READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Write deadline for request and control frames.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for the goodbye close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared health flags, visible to both the owner and the heartbeat task.
struct Health {
    healthy: AtomicBool,
    ping_failures: AtomicU32,
    last_activity: PlMutex<Instant>,
}

impl Health {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            ping_failures: AtomicU32::new(0),
            last_activity: PlMutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn record_ping_success(&self) {
        self.ping_failures.store(0, Ordering::Release);
        self.touch();
    }

    /// Count one ping failure; returns true once the failure budget is
    /// spent and the connection has been marked unhealthy.
    fn record_ping_failure(&self) -> bool {
        let failures = self.ping_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= MAX_PING_FAILURES {
            self.healthy.store(false, Ordering::Release);
            return true;
        }
        false
    }
}

// ── Response assembly ──────────────────────────────────────────────

/// What to do after folding one decoded server message into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssemblyStep {
    /// Keep reading.
    Continue,
    /// Terminal chunk seen; the buffer is complete.
    Done,
}

/// Accumulates `AudioOnlyServer` payloads until the negative-sequence
/// terminator, enforcing the per-utterance size cap.
struct ResponseAssembly {
    audio: Vec<u8>,
    messages: u32,
}

impl ResponseAssembly {
    fn new() -> Self {
        Self {
            audio: Vec::new(),
            messages: 0,
        }
    }

    fn absorb(&mut self, msg: protocol::ServerMessage) -> anyhow::Result<AssemblyStep> {
        self.messages += 1;
        match msg.msg_type {
            MessageType::AudioOnlyServer => {
                self.audio.extend_from_slice(&msg.payload);
                if self.audio.len() > MAX_AUDIO_BYTES {
                    anyhow::bail!(
                        "assembled audio too large: {} bytes (cap {MAX_AUDIO_BYTES})",
                        self.audio.len()
                    );
                }
                if msg.sequence < 0 {
                    return Ok(AssemblyStep::Done);
                }
                Ok(AssemblyStep::Continue)
            }
            MessageType::FrontEndResultServer => {
                tracing::debug!(
                    payload = %String::from_utf8_lossy(&msg.payload),
                    "tts front-end result skipped"
                );
                Ok(AssemblyStep::Continue)
            }
            MessageType::Error => {
                anyhow::bail!(
                    "server error {}: {}",
                    msg.error_code.unwrap_or(0),
                    String::from_utf8_lossy(&msg.payload)
                );
            }
            MessageType::FullClientRequest => {
                tracing::warn!("unexpected client-type frame from tts server, skipped");
                Ok(AssemblyStep::Continue)
            }
        }
    }

    fn into_audio(self) -> Vec<u8> {
        self.audio
    }
}

/// One live connection to the TTS service.
pub struct TtsConnection {
    writer: Arc<Mutex<WsSink>>,
    reader: WsSource,
    health: Arc<Health>,
    heartbeat: tokio::task::JoinHandle<()>,
}

impl TtsConnection {
    /// Dial the service and start the heartbeat task.
    pub async fn connect(config: &TtsConfig) -> anyhow::Result<Self> {
        let mut request = config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| anyhow::anyhow!("invalid tts endpoint: {e}"))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer;{}", config.access_key)
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid auth header: {e}"))?,
        );

        tracing::debug!(endpoint = %config.endpoint, "connecting to tts service");
        let (ws_stream, _response) = tokio::time::timeout(
            Duration::from_secs(15),
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| anyhow::anyhow!("tts connect timed out"))?
        .map_err(|e| anyhow::anyhow!("tts connect failed: {e}"))?;

        let (sink, source) = ws_stream.split();
        let writer = Arc::new(Mutex::new(sink));
        let health = Arc::new(Health::new());

        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            Arc::clone(&writer),
            Arc::clone(&health),
        ));

        tracing::info!("tts connection established");
        Ok(Self {
            writer,
            reader: source,
            health,
            heartbeat,
        })
    }

    async fn heartbeat_loop(writer: Arc<Mutex<WsSink>>, health: Arc<Health>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; skip that first tick.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let send = async {
                let mut sender = writer.lock().await;
                sender.send(WsMessage::Ping(b"heartbeat".to_vec())).await
            };

            match tokio::time::timeout(WRITE_TIMEOUT, send).await {
                Ok(Ok(())) => health.record_ping_success(),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "tts heartbeat ping failed");
                    if health.record_ping_failure() {
                        return;
                    }
                }
                Err(_) => {
                    tracing::warn!("tts heartbeat ping timed out");
                    if health.record_ping_failure() {
                        return;
                    }
                }
            }
        }
    }

    /// Healthy iff the socket has not errored and the last successful
    /// activity is recent enough.
    pub fn is_healthy(&self) -> bool {
        self.health.healthy.load(Ordering::Acquire)
            && self.health.last_activity.lock().elapsed() <= IDLE_UNHEALTHY_AFTER
    }

    fn mark_unhealthy(&self) {
        self.health.healthy.store(false, Ordering::Release);
    }

    /// Send one framed submit payload and assemble the chunked response.
    pub async fn request(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let frame = protocol::encode_full_client_request(payload);

        let send = async {
            let mut sender = self.writer.lock().await;
            sender.send(WsMessage::Binary(frame)).await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.mark_unhealthy();
                anyhow::bail!("failed to send tts request: {e}");
            }
            Err(_) => {
                self.mark_unhealthy();
                anyhow::bail!("tts request write timed out");
            }
        }

        self.receive_response().await
    }

    async fn receive_response(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut assembly = ResponseAssembly::new();

        loop {
            let next = tokio::time::timeout(READ_TIMEOUT, self.reader.next()).await;
            let msg = match next {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => {
                    self.mark_unhealthy();
                    anyhow::bail!("tts read failed: {e}");
                }
                Ok(None) => {
                    self.mark_unhealthy();
                    anyhow::bail!("tts connection closed mid-response");
                }
                Err(_) => {
                    self.mark_unhealthy();
                    anyhow::bail!("tts read timed out");
                }
            };

            self.health.touch();

            let data = match msg {
                WsMessage::Binary(data) => data,
                WsMessage::Ping(data) => {
                    let mut sender = self.writer.lock().await;
                    let _ = sender.send(WsMessage::Pong(data)).await;
                    continue;
                }
                WsMessage::Pong(_) => continue,
                WsMessage::Close(frame) => {
                    self.mark_unhealthy();
                    anyhow::bail!("tts connection closed by server: {frame:?}");
                }
                other => {
                    tracing::debug!(?other, "non-binary tts message skipped");
                    continue;
                }
            };

            let server_msg = protocol::decode_server_message(&data)?;
            match assembly.absorb(server_msg)? {
                AssemblyStep::Continue => {}
                AssemblyStep::Done => {
                    tracing::debug!(
                        messages = assembly.messages,
                        bytes = assembly.audio.len(),
                        "tts response complete"
                    );
                    return Ok(assembly.into_audio());
                }
            }
        }
    }

    /// Attempt a polite close; the heartbeat task stops either way.
    pub async fn close(self) {
        self.heartbeat.abort();
        let close = async {
            let mut sender = self.writer.lock().await;
            let _ = sender.send(WsMessage::Close(None)).await;
        };
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, close).await;
    }
}

impl Drop for TtsConnection {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

// ── Tests ──────────────────────────────────────────────────────────
