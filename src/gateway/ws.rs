//! Persistent gateway WebSocket: framing, auth, health, reconnection.
//!
//! ## Protocol Overview
//!
//! 1. **Connect** — binary WebSocket to the wss link returned by the start
//!    call
//! 2. **Auth** — send `operation = 7` with the opaque auth body; a reply
//!    with `operation = 8` and `{"code": 0}` authenticates the session
//! 3. **Heartbeat** — `operation = 2` (empty body) every 20 s after auth
//! 4. **Events** — `operation = 5` frames carry JSON bodies dispatched to
//!    the event sink
//!
//! The connection manager redials with exponential backoff (plus a
//! circuit-breaker term and an abnormal-closure multiplier) up to 10 times;
//! a successful connect resets the attempt counter. Close codes
//! `PolicyViolation` and `UnsupportedData`, and auth rejection, stop
//! reconnection entirely.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as PlMutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::frame::{self, Frame};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Maximum redial attempts before giving up.
const MAX_RECONNECTS: u32 = 10;
/// Backoff cap.
const MAX_DELAY: Duration = Duration::from_secs(30);
/// Read deadline per frame.
const READ_TIMEOUT: Duration = Duration::from_secs(120);
/// Consecutive read timeouts tolerated via ping-probe recovery.
const MAX_READ_TIMEOUTS: u32 = 3;
/// Write deadline for frames and control messages.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Heartbeat / health cadence.
const HEALTH_INTERVAL: Duration = Duration::from_secs(20);
/// No inbound activity for this long → the connection is dead.
const DEAD_AFTER: Duration = Duration::from_secs(150);
/// No inbound activity for this long → probe with an extra ping.
const PROBE_AFTER: Duration = Duration::from_secs(90);
/// Budget for worker tasks to exit after the connection ends.
const WORKER_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Connection state ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::ShuttingDown => "ShuttingDown",
        };
        f.write_str(s)
    }
}

// ── Quality counters ───────────────────────────────────────────────

/// Monotonic connection-quality counters; all atomically updated.
#[derive(Default)]
pub struct ConnectionQuality {
    pub total_connections: AtomicU64,
    pub successful_connects: AtomicU64,
    pub failed_connects: AtomicU64,
    pub abnormal_closures: AtomicU64,
    pub timeout_errors: AtomicU64,
    pub network_errors: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub consecutive_errors: AtomicU64,
    pub ping_latency_ms: AtomicU64,
}

impl ConnectionQuality {
    fn connect_attempt(&self) {
        self.total_connections.fetch_add(1, Ordering::AcqRel);
    }

    fn connect_success(&self) {
        self.successful_connects.fetch_add(1, Ordering::AcqRel);
        self.consecutive_errors.store(0, Ordering::Release);
    }

    fn connect_failed(&self) {
        self.failed_connects.fetch_add(1, Ordering::AcqRel);
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel);
    }

    fn abnormal_closure(&self) {
        self.abnormal_closures.fetch_add(1, Ordering::AcqRel);
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel);
    }

    fn timeout_error(&self) {
        self.timeout_errors.fetch_add(1, Ordering::AcqRel);
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel);
    }

    fn network_error(&self) {
        self.network_errors.fetch_add(1, Ordering::AcqRel);
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel);
    }

    /// Share of connection attempts that ended in abnormal closure.
    pub fn abnormal_rate(&self) -> f64 {
        let total = self.total_connections.load(Ordering::Acquire);
        if total == 0 {
            return 0.0;
        }
        self.abnormal_closures.load(Ordering::Acquire) as f64 / total as f64
    }

    fn log(&self) {
        tracing::info!(
            total = self.total_connections.load(Ordering::Acquire),
            successful = self.successful_connects.load(Ordering::Acquire),
            abnormal = self.abnormal_closures.load(Ordering::Acquire),
            timeouts = self.timeout_errors.load(Ordering::Acquire),
            network = self.network_errors.load(Ordering::Acquire),
            reconnects = self.reconnect_attempts.load(Ordering::Acquire),
            consecutive = self.consecutive_errors.load(Ordering::Acquire),
            ping_ms = self.ping_latency_ms.load(Ordering::Acquire),
            "gateway connection quality"
        );
    }
}

// ── Event sink seam ────────────────────────────────────────────────

/// Receiver for decoded `operation = 5` event bodies.
pub trait EventSink: Send + Sync {
    fn on_event(&self, body: &[u8]) -> anyhow::Result<()>;
}

// ── How a connection ended ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    /// Root cancellation: stop entirely.
    Shutdown,
    /// Transient failure: back off and redial.
    Reconnect,
    /// Policy violation / unsupported data / auth rejection: never redial.
    Fatal,
}

// ── Client ─────────────────────────────────────────────────────────

pub struct GatewayWsClient {
    ws_url: String,
    auth_body: String,
    sink: Arc<dyn EventSink>,
    state: PlMutex<ConnectionState>,
    quality: Arc<ConnectionQuality>,
    base_delay: PlMutex<Duration>,
    reconnect_count: AtomicU32,
    sequence_id: AtomicU32,
    authed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl GatewayWsClient {
    pub fn new(
        ws_url: String,
        auth_body: String,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            ws_url,
            auth_body,
            sink,
            state: PlMutex::new(ConnectionState::Disconnected),
            quality: Arc::new(ConnectionQuality::default()),
            base_delay: PlMutex::new(Duration::from_secs(1)),
            reconnect_count: AtomicU32::new(0),
            sequence_id: AtomicU32::new(0),
            authed: Arc::new(AtomicBool::new(false)),
            cancel,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn quality(&self) -> Arc<ConnectionQuality> {
        Arc::clone(&self.quality)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::info!(from = %*state, to = %next, "gateway state changed");
            *state = next;
        }
    }

    /// Spawn the connection manager. Runs until root cancel or a fatal
    /// condition.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.connection_manager().await })
    }

    async fn connection_manager(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() || self.state() == ConnectionState::ShuttingDown {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            self.quality.connect_attempt();
            tracing::info!(
                url = %self.ws_url,
                attempt = self.reconnect_count.load(Ordering::Acquire) + 1,
                max = MAX_RECONNECTS,
                "dialing gateway"
            );

            let ws_stream = match tokio::time::timeout(
                Duration::from_secs(15),
                tokio_tungstenite::connect_async(self.ws_url.as_str()),
            )
            .await
            {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "gateway dial failed");
                    self.quality.connect_failed();
                    if !self.bump_reconnect_or_give_up().await {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    tracing::warn!("gateway dial timed out");
                    self.quality.connect_failed();
                    self.quality.timeout_error();
                    if !self.bump_reconnect_or_give_up().await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ConnectionState::Connected);
            self.quality.connect_success();
            self.reconnect_count.store(0, Ordering::Release);
            tracing::info!("gateway connected");

            let end = Arc::clone(&self).run_connection(ws_stream).await;
            self.authed.store(false, Ordering::Release);

            match end {
                ConnectionEnd::Shutdown => break,
                ConnectionEnd::Fatal => {
                    self.set_state(ConnectionState::ShuttingDown);
                    self.quality.log();
                    break;
                }
                ConnectionEnd::Reconnect => {
                    if !self.bump_reconnect_or_give_up().await {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("gateway connection manager stopped");
    }

    /// Count a reconnect attempt and wait out the backoff. Returns false
    /// when the budget is spent or shutdown raced in.
    async fn bump_reconnect_or_give_up(&self) -> bool {
        let count = self.reconnect_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= MAX_RECONNECTS {
            tracing::error!(max = MAX_RECONNECTS, "max reconnection attempts reached, giving up");
            self.set_state(ConnectionState::ShuttingDown);
            return false;
        }

        self.set_state(ConnectionState::Reconnecting);
        self.quality.reconnect_attempts.fetch_add(1, Ordering::AcqRel);
        if count % 3 == 0 {
            self.quality.log();
        }

        let delay = self.reconnect_delay(count - 1);
        tracing::info!(
            delay_ms = delay.as_millis() as u64,
            attempt = count,
            max = MAX_RECONNECTS,
            "waiting before reconnect"
        );

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Exponential backoff with ±10 % jitter, a circuit-breaker additive
    /// term past 5 consecutive errors, and a ×2 multiplier when more than
    /// half of all attempts ended abnormally.
    fn reconnect_delay(&self, exponent: u32) -> Duration {
        let base = *self.base_delay.lock();
        let mut delay = base
            .saturating_mul(2u32.saturating_pow(exponent.min(16)))
            .min(MAX_DELAY);

        let consecutive = self.quality.consecutive_errors.load(Ordering::Acquire);
        if consecutive > 5 {
            let breaker = Duration::from_secs(5) * (consecutive - 5) as u32;
            tracing::info!(
                breaker_ms = breaker.as_millis() as u64,
                consecutive,
                "adding circuit-breaker delay"
            );
            delay += breaker;
        }

        if self.quality.total_connections.load(Ordering::Acquire) > 10
            && self.quality.abnormal_rate() > 0.5
        {
            tracing::warn!(
                rate = self.quality.abnormal_rate(),
                "doubling reconnect delay for high abnormal-closure rate"
            );
            delay *= 2;
        }

        use rand::Rng;
        let jitter = delay.as_secs_f64() * 0.1 * (2.0 * rand::thread_rng().gen::<f64>() - 1.0);
        Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
    }

    // ── One established connection ────────────────────────────────

    async fn run_connection(
        self: Arc<Self>,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> ConnectionEnd {
        let (ws_sink, mut ws_source) = ws_stream.split();
        let writer = Arc::new(Mutex::new(ws_sink));
        let conn_cancel = self.cancel.child_token();
        let last_pong = Arc::new(PlMutex::new(Instant::now()));
        let ping_sent = Arc::new(PlMutex::new(None::<Instant>));
        let auth_failed = Arc::new(AtomicBool::new(false));

        // Auth goes out first; events only flow after the code-0 reply.
        if let Err(e) = self
            .send_frame(&writer, frame::OP_AUTH, self.auth_body.as_bytes())
            .await
        {
            tracing::error!(error = %e, "failed to send auth frame");
            self.quality.network_error();
            return ConnectionEnd::Reconnect;
        }

        // Dispatcher: every decoded frame is handled off the read loop.
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(1024);
        let dispatcher = tokio::spawn(Self::dispatch_loop(
            frame_rx,
            Arc::clone(&self.sink),
            Arc::clone(&self.authed),
            Arc::clone(&auth_failed),
            conn_cancel.clone(),
        ));

        // Health monitor: heartbeats, ping probes, dead-connection watch.
        let health = tokio::spawn(Self::health_loop(
            Arc::clone(&self),
            Arc::clone(&writer),
            Arc::clone(&last_pong),
            Arc::clone(&ping_sent),
            conn_cancel.clone(),
        ));

        let end = self
            .read_loop(
                &mut ws_source,
                &writer,
                &frame_tx,
                &last_pong,
                &ping_sent,
                &conn_cancel,
                &auth_failed,
            )
            .await;

        // Wind the connection down: close frame, cancel workers, join.
        if end == ConnectionEnd::Shutdown {
            let close = async {
                let mut sender = writer.lock().await;
                let _ = sender
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "shutting down".into(),
                    })))
                    .await;
            };
            let _ = tokio::time::timeout(Duration::from_secs(5), close).await;
        }
        conn_cancel.cancel();
        drop(frame_tx);

        let join = async {
            let _ = dispatcher.await;
            let _ = health.await;
        };
        if tokio::time::timeout(WORKER_EXIT_TIMEOUT, join).await.is_err() {
            tracing::warn!("gateway workers did not exit within the shutdown budget");
        }

        end
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_loop(
        &self,
        ws_source: &mut (impl futures_util::Stream<
            Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
        > + Unpin),
        writer: &Arc<Mutex<WsSink>>,
        frame_tx: &mpsc::Sender<Frame>,
        last_pong: &Arc<PlMutex<Instant>>,
        ping_sent: &Arc<PlMutex<Option<Instant>>>,
        conn_cancel: &CancellationToken,
        auth_failed: &Arc<AtomicBool>,
    ) -> ConnectionEnd {
        let mut timeout_count = 0u32;

        loop {
            if auth_failed.load(Ordering::Acquire) {
                return ConnectionEnd::Fatal;
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ConnectionEnd::Shutdown,
                _ = conn_cancel.cancelled() => {
                    // The health monitor declared the connection dead.
                    self.quality.network_error();
                    return ConnectionEnd::Reconnect;
                }
                next = tokio::time::timeout(READ_TIMEOUT, ws_source.next()) => next,
            };

            let msg = match next {
                Err(_) => {
                    timeout_count += 1;
                    tracing::warn!(
                        timeouts = timeout_count,
                        max = MAX_READ_TIMEOUTS,
                        "gateway read timeout, probing"
                    );
                    // Up to 3 consecutive timeouts recover via ping probe;
                    // the next one surfaces as a read error.
                    if timeout_count <= MAX_READ_TIMEOUTS {
                        if self.send_ping(writer, ping_sent).await.is_err() {
                            self.quality.timeout_error();
                            return ConnectionEnd::Reconnect;
                        }
                        continue;
                    }
                    self.quality.timeout_error();
                    return ConnectionEnd::Reconnect;
                }
                Ok(None) => {
                    // Stream ended without a close frame: abnormal closure.
                    tracing::warn!("gateway stream ended without close frame (1006)");
                    self.adjust_base_delay_for_abnormal(true);
                    self.quality.abnormal_closure();
                    return ConnectionEnd::Reconnect;
                }
                Ok(Some(Err(e))) => {
                    return self.classify_read_error(e);
                }
                Ok(Some(Ok(msg))) => msg,
            };

            timeout_count = 0;
            *last_pong.lock() = Instant::now();

            match msg {
                WsMessage::Binary(data) => {
                    if let Some(decoded) = frame::decode(&data) {
                        match frame_tx.try_send(decoded) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::warn!("gateway frame buffer full, dropping frame");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                return ConnectionEnd::Reconnect;
                            }
                        }
                    }
                }
                WsMessage::Ping(data) => {
                    let mut sender = writer.lock().await;
                    let _ = sender.send(WsMessage::Pong(data)).await;
                }
                WsMessage::Pong(_) => {
                    if let Some(sent) = ping_sent.lock().take() {
                        let latency = sent.elapsed();
                        self.quality
                            .ping_latency_ms
                            .store(latency.as_millis() as u64, Ordering::Release);
                        tracing::debug!(latency_ms = latency.as_millis() as u64, "gateway pong");
                    }
                }
                WsMessage::Close(close_frame) => {
                    return self.classify_close_frame(close_frame);
                }
                other => {
                    tracing::debug!(?other, "unexpected gateway message type, skipped");
                }
            }
        }
    }

    fn classify_close_frame(&self, close_frame: Option<CloseFrame<'_>>) -> ConnectionEnd {
        match close_frame {
            Some(cf) => {
                tracing::info!(code = %cf.code, reason = %cf.reason, "gateway closed by server");
                match cf.code {
                    CloseCode::Policy | CloseCode::Unsupported => {
                        tracing::error!("close code forbids reconnection");
                        ConnectionEnd::Fatal
                    }
                    CloseCode::Abnormal => {
                        self.adjust_base_delay_for_abnormal(false);
                        self.quality.abnormal_closure();
                        ConnectionEnd::Reconnect
                    }
                    _ => ConnectionEnd::Reconnect,
                }
            }
            None => {
                self.quality.abnormal_closure();
                ConnectionEnd::Reconnect
            }
        }
    }

    fn classify_read_error(&self, e: tokio_tungstenite::tungstenite::Error) -> ConnectionEnd {
        use tokio_tungstenite::tungstenite::error::ProtocolError;
        use tokio_tungstenite::tungstenite::Error;

        tracing::warn!(error = %e, "gateway read error");
        match &e {
            Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                // 1006 territory: no close handshake.
                self.adjust_base_delay_for_abnormal(true);
                self.quality.abnormal_closure();
                ConnectionEnd::Reconnect
            }
            Error::Io(io_err) => {
                let eof_like = matches!(
                    io_err.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::BrokenPipe
                );
                if eof_like {
                    self.adjust_base_delay_for_abnormal(true);
                    self.quality.abnormal_closure();
                } else if io_err.kind() == std::io::ErrorKind::TimedOut {
                    self.quality.timeout_error();
                } else {
                    self.quality.network_error();
                }
                ConnectionEnd::Reconnect
            }
            Error::ConnectionClosed | Error::AlreadyClosed => {
                self.quality.abnormal_closure();
                ConnectionEnd::Reconnect
            }
            _ => {
                self.quality.network_error();
                ConnectionEnd::Reconnect
            }
        }
    }

    /// After a 1006, shorten the base delay for EOF-like causes (2 s),
    /// lengthen otherwise (5 s), and raise to 10 s when the abnormal rate
    /// is high.
    fn adjust_base_delay_for_abnormal(&self, eof_like: bool) {
        let mut base = self.base_delay.lock();
        *base = if eof_like {
            Duration::from_secs(2)
        } else {
            Duration::from_secs(5)
        };
        if self.quality.abnormal_closures.load(Ordering::Acquire) > 5
            && self.quality.abnormal_rate() > 0.5
        {
            *base = Duration::from_secs(10);
        }
    }

    // ── Dispatcher ────────────────────────────────────────────────

    async fn dispatch_loop(
        mut frame_rx: mpsc::Receiver<Frame>,
        sink: Arc<dyn EventSink>,
        authed: Arc<AtomicBool>,
        auth_failed: Arc<AtomicBool>,
        conn_cancel: CancellationToken,
    ) {
        loop {
            let decoded = tokio::select! {
                _ = conn_cancel.cancelled() => break,
                decoded = frame_rx.recv() => match decoded {
                    Some(decoded) => decoded,
                    None => break,
                },
            };

            // Panic guard: a buggy handler must not kill the loop.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                Self::dispatch_frame(&decoded, &sink, &authed, &auth_failed, &conn_cancel)
            }));

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(operation = decoded.operation, error = %e, "handler failed");
                }
                Err(panic) => {
                    tracing::error!(
                        operation = decoded.operation,
                        panic = ?panic_message(&panic),
                        "handler panicked, continuing"
                    );
                }
            }
        }
        tracing::debug!("gateway dispatcher exiting");
    }

    fn dispatch_frame(
        decoded: &Frame,
        sink: &Arc<dyn EventSink>,
        authed: &AtomicBool,
        auth_failed: &AtomicBool,
        conn_cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        match decoded.operation {
            frame::OP_AUTH_REPLY => {
                #[derive(serde::Deserialize)]
                struct AuthReply {
                    #[serde(default)]
                    code: i64,
                }
                let reply: AuthReply = serde_json::from_slice(&decoded.body)
                    .map_err(|e| anyhow::anyhow!("undecodable auth reply: {e}"))?;
                if reply.code == 0 {
                    authed.store(true, Ordering::Release);
                    tracing::info!("gateway authenticated");
                } else {
                    tracing::error!(code = reply.code, "gateway auth rejected");
                    auth_failed.store(true, Ordering::Release);
                    conn_cancel.cancel();
                }
                Ok(())
            }
            frame::OP_HEARTBEAT_REPLY => {
                tracing::debug!(seq = decoded.sequence_id, "gateway heartbeat reply");
                Ok(())
            }
            frame::OP_EVENT => sink.on_event(&decoded.body),
            other => {
                tracing::warn!(operation = other, "unknown gateway operation, dropped");
                Ok(())
            }
        }
    }

    // ── Health monitor ────────────────────────────────────────────

    async fn health_loop(
        client: Arc<Self>,
        writer: Arc<Mutex<WsSink>>,
        last_pong: Arc<PlMutex<Instant>>,
        ping_sent: Arc<PlMutex<Option<Instant>>>,
        conn_cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = conn_cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if client.state() != ConnectionState::Connected {
                continue;
            }

            let idle = last_pong.lock().elapsed();
            if idle > DEAD_AFTER {
                tracing::warn!(
                    idle_secs = idle.as_secs(),
                    "no gateway activity, declaring connection dead"
                );
                conn_cancel.cancel();
                break;
            }

            if idle > PROBE_AFTER {
                tracing::warn!(idle_secs = idle.as_secs(), "long gateway idle, extra ping");
                if client.send_ping(&writer, &ping_sent).await.is_err() {
                    conn_cancel.cancel();
                    break;
                }
            }

            // Regular cadence: protocol ping plus application heartbeat.
            if client.send_ping(&writer, &ping_sent).await.is_err() {
                conn_cancel.cancel();
                break;
            }
            if client.authed.load(Ordering::Acquire) {
                if let Err(e) = client.send_frame(&writer, frame::OP_HEARTBEAT, &[]).await {
                    tracing::warn!(error = %e, "gateway heartbeat send failed");
                    conn_cancel.cancel();
                    break;
                }
            }
        }
        tracing::debug!("gateway health monitor exiting");
    }

    // ── Send helpers ──────────────────────────────────────────────

    async fn send_frame(
        &self,
        writer: &Arc<Mutex<WsSink>>,
        operation: u32,
        body: &[u8],
    ) -> anyhow::Result<()> {
        let seq = self.sequence_id.fetch_add(1, Ordering::AcqRel) + 1;
        let encoded = frame::encode(operation, seq, 0, body);

        let send = async {
            let mut sender = writer.lock().await;
            sender.send(WsMessage::Binary(encoded)).await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, send).await {
            Ok(Ok(())) => {
                tracing::debug!(operation, seq, "gateway frame sent");
                Ok(())
            }
            Ok(Err(e)) => anyhow::bail!("gateway send failed (op {operation}, seq {seq}): {e}"),
            Err(_) => anyhow::bail!("gateway send timed out (op {operation}, seq {seq})"),
        }
    }

    async fn send_ping(
        &self,
        writer: &Arc<Mutex<WsSink>>,
        ping_sent: &Arc<PlMutex<Option<Instant>>>,
    ) -> anyhow::Result<()> {
        let send = async {
            let mut sender = writer.lock().await;
            sender.send(WsMessage::Ping(b"ping".to_vec())).await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, send).await {
            Ok(Ok(())) => {
                *ping_sent.lock() = Some(Instant::now());
                Ok(())
            }
            Ok(Err(e)) => anyhow::bail!("gateway ping failed: {e}"),
            Err(_) => anyhow::bail!("gateway ping timed out"),
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
