//! TTS connection pool: request dispatcher, retry policy, network health.
//!
//! Callers hand a request to the dispatcher and wait on a oneshot reply.
//! The dispatcher owns up to `pool_size` connections; each request borrows
//! one (creating it on demand), runs to completion, and returns the
//! connection to the idle set only when it is still healthy.
//!
//! Retry classification:
//! - *abnormal close / broken pipe* → fast schedule (100 ms, 500 ms, then
//!   exponential) with ±20 % jitter;
//! - *other connection errors and timeouts* → exponential 1/2/4/8 s with
//!   ±50 % jitter; timeouts additionally feed the health gate;
//! - *validation and server errors* → no retry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as PlMutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use super::connection::TtsConnection;
use super::{build_submit_payload, validate_text, TtsConfig, TtsRequest};
use crate::voices::VoiceRef;

/// Per-request retry budget.
const MAX_RETRIES: u32 = 3;
/// How long a caller waits to hand a request to the dispatcher.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a caller waits for the finished audio.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a request waits for an idle connection when the pool is full.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

// ── Error classification ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    /// Bad input; retrying cannot help.
    Validation,
    /// The service reported an error; retrying repeats it.
    Server,
    /// Abnormal closure / broken-pipe class: fast retry.
    AbnormalClose,
    /// Deadline expired: retried as a connection error, counted separately.
    Timeout,
    /// Everything else transient.
    Connection,
}

fn classify_error(err: &anyhow::Error) -> ErrorClass {
    if let Some(ws_err) = err.downcast_ref::<tokio_tungstenite::tungstenite::Error>() {
        use tokio_tungstenite::tungstenite::error::ProtocolError;
        use tokio_tungstenite::tungstenite::Error;
        return match ws_err {
            Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                ErrorClass::AbnormalClose
            }
            Error::Io(io_err) if matches!(
                io_err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ) => ErrorClass::AbnormalClose,
            Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::TimedOut => {
                ErrorClass::Timeout
            }
            _ => ErrorClass::Connection,
        };
    }

    let text = err.to_string();
    if text.starts_with("validation") {
        ErrorClass::Validation
    } else if text.starts_with("server error") {
        ErrorClass::Server
    } else if text.contains("timed out") || text.contains("deadline") {
        ErrorClass::Timeout
    } else if text.contains("broken pipe")
        || text.contains("connection reset")
        || text.contains("closed mid-response")
        || text.contains("closed by server")
    {
        ErrorClass::AbnormalClose
    } else {
        ErrorClass::Connection
    }
}

// ── Network health ─────────────────────────────────────────────────

/// Observability counters feeding the retry-schedule choice. This gate
/// never hard-stops a request.
#[derive(Default)]
pub struct NetworkStats {
    total: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    consecutive_errors: AtomicU64,
    recent_failures: PlMutex<VecDeque<Instant>>,
}

impl NetworkStats {
    fn record_success(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
        // The gate auto-heals: success resets the consecutive counter.
        self.consecutive_errors.store(0, Ordering::Release);
    }

    fn record_failure(&self, class: ErrorClass) {
        self.total.fetch_add(1, Ordering::AcqRel);
        self.failed.fetch_add(1, Ordering::AcqRel);
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel);
        if class == ErrorClass::Timeout {
            self.timeouts.fetch_add(1, Ordering::AcqRel);
        }

        let mut recent = self.recent_failures.lock();
        recent.push_back(Instant::now());
        while recent.len() > 64 {
            recent.pop_front();
        }
    }

    fn failures_in_last_30s(&self) -> usize {
        let cutoff = Instant::now() - Duration::from_secs(30);
        self.recent_failures
            .lock()
            .iter()
            .filter(|t| **t >= cutoff)
            .count()
    }

    /// (healthy, reason). Unhealthy when the failure rate exceeds 50 %, the
    /// timeout rate exceeds 30 %, or more than 3 failures landed in the
    /// last 30 s.
    pub fn health(&self) -> (bool, String) {
        let total = self.total.load(Ordering::Acquire);
        if total == 0 {
            return (true, "no requests yet".to_string());
        }

        let failed = self.failed.load(Ordering::Acquire);
        let timeouts = self.timeouts.load(Ordering::Acquire);
        let failure_rate = failed as f64 / total as f64;
        let timeout_rate = timeouts as f64 / total as f64;

        if failure_rate > 0.5 {
            return (false, format!("high failure rate: {:.0}%", failure_rate * 100.0));
        }
        if timeout_rate > 0.3 {
            return (false, format!("high timeout rate: {:.0}%", timeout_rate * 100.0));
        }
        if self.failures_in_last_30s() > 3 {
            return (false, "recent failures detected".to_string());
        }
        (true, "network healthy".to_string())
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.consecutive_errors.load(Ordering::Acquire)
    }
}

// ── Backoff schedules ──────────────────────────────────────────────

fn with_jitter(base: Duration, fraction: f64) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter = base.as_secs_f64() * fraction * (2.0 * rng.gen::<f64>() - 1.0);
    Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.0))
}

/// 100 ms, 500 ms, then 1 s · 2^(n-2), ±20 % jitter.
fn fast_retry_delay(attempt: u32) -> Duration {
    let base = match attempt {
        0 => Duration::from_millis(100),
        1 => Duration::from_millis(500),
        n => Duration::from_secs(1 << (n - 2).min(4)),
    };
    with_jitter(base, 0.2)
}

/// 1/2/4/8 s exponential, ±50 % jitter.
fn conservative_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1 << attempt.min(3));
    with_jitter(base, 0.5)
}

// ── Pool ───────────────────────────────────────────────────────────

struct PoolRequest {
    request: TtsRequest,
    reply: oneshot::Sender<anyhow::Result<Vec<u8>>>,
}

struct PoolShared {
    config: TtsConfig,
    idle_tx: mpsc::Sender<TtsConnection>,
    idle_rx: Mutex<mpsc::Receiver<TtsConnection>>,
    created: AtomicUsize,
    stats: Arc<NetworkStats>,
    cancel: CancellationToken,
}

/// Public synthesis entry point backed by the pooled dispatcher.
pub struct TtsPool {
    request_tx: mpsc::Sender<PoolRequest>,
    shared: Arc<PoolShared>,
    encoding: String,
}

impl TtsPool {
    pub fn new(config: TtsConfig, cancel: CancellationToken) -> Arc<Self> {
        let pool_size = config.pool_size.clamp(1, 5);
        let (idle_tx, idle_rx) = mpsc::channel(pool_size);
        let (request_tx, request_rx) = mpsc::channel::<PoolRequest>(100);
        let encoding = config.encoding.clone();

        let shared = Arc::new(PoolShared {
            config,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            created: AtomicUsize::new(0),
            stats: Arc::new(NetworkStats::default()),
            cancel: cancel.clone(),
        });

        tokio::spawn(Self::dispatcher(Arc::clone(&shared), request_rx));

        Arc::new(Self {
            request_tx,
            shared,
            encoding,
        })
    }

    pub fn stats(&self) -> Arc<NetworkStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Synthesize `text` with `voice`. Validates input, then round-trips
    /// through the dispatcher with the configured deadlines.
    pub async fn synthesize(&self, text: &str, voice: &VoiceRef) -> anyhow::Result<Vec<u8>> {
        validate_text(text)?;

        let request = TtsRequest::new(text, voice.voice_type.clone(), &self.encoding);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.request_tx
            .send_timeout(
                PoolRequest {
                    request,
                    reply: reply_tx,
                },
                SUBMIT_TIMEOUT,
            )
            .await
            .map_err(|_| anyhow::anyhow!("timed out submitting request to tts pool"))?;

        match tokio::time::timeout(RESPONSE_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => anyhow::bail!("tts pool dropped the request"),
            Err(_) => anyhow::bail!("timed out waiting for tts response"),
        }
    }

    // ── Dispatcher ────────────────────────────────────────────────

    async fn dispatcher(shared: Arc<PoolShared>, mut request_rx: mpsc::Receiver<PoolRequest>) {
        tracing::debug!("tts pool dispatcher started");
        loop {
            let req = tokio::select! {
                _ = shared.cancel.cancelled() => break,
                req = request_rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            };

            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let result = Self::handle_request(&shared, &req.request).await;
                let _ = req.reply.send(result);
            });
        }

        // Drain and close idle connections on the way out.
        let mut idle = shared.idle_rx.lock().await;
        while let Ok(conn) = idle.try_recv() {
            conn.close().await;
        }
        tracing::debug!("tts pool dispatcher stopped");
    }

    async fn handle_request(
        shared: &Arc<PoolShared>,
        request: &TtsRequest,
    ) -> anyhow::Result<Vec<u8>> {
        let payload = serde_json::to_vec(&build_submit_payload(request, &shared.config))?;
        let mut last_err = anyhow::anyhow!("no attempts made");

        for attempt in 0..=MAX_RETRIES {
            if shared.cancel.is_cancelled() {
                anyhow::bail!("tts request cancelled");
            }

            match Self::attempt(shared, &payload).await {
                Ok(audio) => {
                    shared.stats.record_success();
                    return Ok(audio);
                }
                Err(e) => {
                    let class = classify_error(&e);
                    if class != ErrorClass::Validation && class != ErrorClass::Server {
                        shared.stats.record_failure(class);
                    }
                    tracing::warn!(
                        attempt = attempt + 1,
                        class = ?class,
                        error = %e,
                        "tts attempt failed"
                    );

                    match class {
                        ErrorClass::Validation | ErrorClass::Server => return Err(e),
                        _ if attempt == MAX_RETRIES => {
                            last_err = e;
                            break;
                        }
                        class => {
                            let (healthy, reason) = shared.stats.health();
                            let delay = if !healthy {
                                tracing::warn!(reason, "network unhealthy, conservative retry");
                                conservative_delay(attempt)
                            } else if class == ErrorClass::AbnormalClose {
                                fast_retry_delay(attempt)
                            } else {
                                conservative_delay(attempt)
                            };

                            last_err = e;
                            tokio::select! {
                                _ = shared.cancel.cancelled() => {
                                    anyhow::bail!("tts request cancelled");
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }

        Err(anyhow::anyhow!(
            "tts request failed after {} retries: {last_err}",
            MAX_RETRIES
        ))
    }

    async fn attempt(shared: &Arc<PoolShared>, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut conn = Self::acquire(shared).await?;
        let result = conn.request(payload).await;

        // Healthy connections go back to the idle set; unhealthy ones are
        // discarded so a fresh dial replaces them.
        if conn.is_healthy() {
            if let Err(returned) = shared.idle_tx.try_send(conn) {
                let conn = match returned {
                    mpsc::error::TrySendError::Full(conn)
                    | mpsc::error::TrySendError::Closed(conn) => conn,
                };
                shared.created.fetch_sub(1, Ordering::AcqRel);
                conn.close().await;
            }
        } else {
            shared.created.fetch_sub(1, Ordering::AcqRel);
            conn.close().await;
        }

        result
    }

    async fn acquire(shared: &Arc<PoolShared>) -> anyhow::Result<TtsConnection> {
        // Fast path: an idle connection is waiting.
        {
            let mut idle = shared.idle_rx.lock().await;
            while let Ok(conn) = idle.try_recv() {
                if conn.is_healthy() {
                    return Ok(conn);
                }
                shared.created.fetch_sub(1, Ordering::AcqRel);
                conn.close().await;
            }
        }

        // Room to grow: dial a new connection.
        let max = shared.config.pool_size.clamp(1, 5);
        if shared.created.load(Ordering::Acquire) < max {
            shared.created.fetch_add(1, Ordering::AcqRel);
            match TtsConnection::connect(&shared.config).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    shared.created.fetch_sub(1, Ordering::AcqRel);
                    return Err(e);
                }
            }
        }

        // Pool exhausted: wait for a connection to come back.
        let mut idle = shared.idle_rx.lock().await;
        match tokio::time::timeout(ACQUIRE_TIMEOUT, idle.recv()).await {
            Ok(Some(conn)) => Ok(conn),
            Ok(None) => anyhow::bail!("tts pool closed"),
            Err(_) => anyhow::bail!("timed out waiting for an idle tts connection"),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_never_retry() {
        let err = anyhow::anyhow!("validation: text is empty");
        assert_eq!(classify_error(&err), ErrorClass::Validation);
    }

    #[test]
    fn server_errors_never_retry() {
        let err = anyhow::anyhow!("server error 3003: quota exceeded");
        assert_eq!(classify_error(&err), ErrorClass::Server);
    }

    #[test]
    fn timeout_classification() {
        let err = anyhow::anyhow!("tts read timed out");
        assert_eq!(classify_error(&err), ErrorClass::Timeout);
    }

    #[test]
    fn abnormal_close_classification() {
        for text in [
            "broken pipe while writing",
            "connection reset by peer",
            "tts connection closed mid-response",
            "tts connection closed by server: None",
        ] {
            let err = anyhow::anyhow!("{text}");
            assert_eq!(classify_error(&err), ErrorClass::AbnormalClose, "{text}");
        }
    }

    #[test]
    fn unknown_errors_are_connection_class() {
        let err = anyhow::anyhow!("something odd happened");
        assert_eq!(classify_error(&err), ErrorClass::Connection);
    }

    #[test]
    fn tungstenite_reset_is_abnormal() {
        use tokio_tungstenite::tungstenite::error::ProtocolError;
        let err: anyhow::Error =
            tokio_tungstenite::tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
                .into();
        assert_eq!(classify_error(&err), ErrorClass::AbnormalClose);
    }

    #[test]
    fn fast_schedule_starts_sub_second() {
        for _ in 0..20 {
            assert!(fast_retry_delay(0) <= Duration::from_millis(120));
            assert!(fast_retry_delay(1) <= Duration::from_millis(600));
            let third = fast_retry_delay(2);
            assert!(third >= Duration::from_millis(800) && third <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn conservative_schedule_is_exponential() {
        for _ in 0..20 {
            assert!(conservative_delay(0) <= Duration::from_millis(1500));
            let last = conservative_delay(3);
            assert!(last >= Duration::from_secs(4) && last <= Duration::from_secs(12));
        }
    }

    #[test]
    fn stats_health_thresholds() {
        let stats = NetworkStats::default();
        assert!(stats.health().0);

        // 2 failures out of 3 → failure rate > 50%.
        stats.record_success();
        stats.record_failure(ErrorClass::Connection);
        stats.record_failure(ErrorClass::Connection);
        let (healthy, reason) = stats.health();
        assert!(!healthy);
        assert!(reason.contains("failure rate"));
    }

    #[test]
    fn stats_timeout_rate_gate() {
        let stats = NetworkStats::default();
        for _ in 0..6 {
            stats.record_success();
        }
        for _ in 0..4 {
            stats.record_failure(ErrorClass::Timeout);
        }
        let (healthy, reason) = stats.health();
        assert!(!healthy);
        // 40% failures and timeouts: timeout gate trips at >30%, but the
        // recent-failures gate may trip first; either reason is unhealthy.
        assert!(!reason.is_empty());
    }

    #[test]
    fn consecutive_errors_reset_on_success() {
        let stats = NetworkStats::default();
        stats.record_failure(ErrorClass::Connection);
        stats.record_failure(ErrorClass::Connection);
        assert_eq!(stats.consecutive_errors(), 2);

        stats.record_success();
        assert_eq!(stats.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn synthesize_rejects_invalid_text_without_io() {
        let pool = TtsPool::new(TtsConfig::default(), CancellationToken::new());
        let voice = VoiceRef {
            id: 1,
            name: "v".to_string(),
            voice_type: "tt_v1".to_string(),
            gender: String::new(),
            api_resource_id: String::new(),
        };

        assert!(pool.synthesize("", &voice).await.is_err());
        let too_long = "啊".repeat(super::super::MAX_TEXT_LEN + 1);
        assert!(pool.synthesize(&too_long, &voice).await.is_err());
    }
}
