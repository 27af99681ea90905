//! Gateway session: the open-platform session lifecycle.
//!
//! `start` opens an application session over the REST sub-protocol, then
//! launches the persistent WebSocket (see [`ws`]) with the returned wss
//! link and auth blob, plus a 20 s heartbeat task echoing the session's
//! `game_id`. `stop` sends the end call and tears the socket down.
//!
//! The signed HTTP layer is a black box behind [`OpenApiTransport`]:
//! `POST(path, body) → {code, message, data}` where `code == 0` means
//! success.

pub mod frame;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as PlMutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use ws::{EventSink, GatewayWsClient};

/// Open-platform API host.
pub const OPEN_PLATFORM_HOST: &str = "https://live-open.biliapi.com";

/// Session heartbeat cadence.
const SESSION_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

// ── REST sub-protocol ──────────────────────────────────────────────

/// Unified response envelope for every signed POST.
#[derive(Debug, Clone, Deserialize)]
pub struct BaseResp {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Signed-request black box. Implementations own request signing; the
/// session logic only sees the unified envelope.
#[async_trait]
pub trait OpenApiTransport: Send + Sync {
    async fn post(&self, path: &str, body: String) -> anyhow::Result<BaseResp>;
}

/// Plain HTTPS transport carrying the credential headers. The signature
/// scheme itself is the deployment's integration seam.
pub struct HttpTransport {
    http: reqwest::Client,
    host: String,
    access_key: String,
}

impl HttpTransport {
    pub fn new(host: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            host: host.into(),
            access_key: access_key.into(),
        }
    }
}

#[async_trait]
impl OpenApiTransport for HttpTransport {
    async fn post(&self, path: &str, body: String) -> anyhow::Result<BaseResp> {
        let url = format!("{}{}", self.host, path);
        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-bili-accesskeyid", &self.access_key)
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("open-api request failed: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("open-api request to {path} failed with status {status}");
        }

        let parsed: BaseResp = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("undecodable open-api response: {e}"))?;
        Ok(parsed)
    }
}

// ── Start-call response shapes ─────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GameInfo {
    #[serde(default)]
    pub game_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebSocketInfo {
    #[serde(default)]
    pub auth_body: String,
    #[serde(default)]
    pub wss_link: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnchorInfo {
    #[serde(default)]
    pub room_id: i64,
    #[serde(default)]
    pub uname: String,
    #[serde(default)]
    pub uface: String,
    #[serde(default)]
    pub uid: i64,
    #[serde(default)]
    pub open_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartData {
    #[serde(default)]
    pub game_info: GameInfo,
    #[serde(default)]
    pub websocket_info: WebSocketInfo,
    #[serde(default)]
    pub anchor_info: AnchorInfo,
}

// ── Session manager ────────────────────────────────────────────────

/// Owns the gateway session: REST lifecycle calls plus the WebSocket.
pub struct GatewaySession {
    transport: Arc<dyn OpenApiTransport>,
    sink: Arc<dyn EventSink>,
    app_id: i64,
    room_id_code: String,
    cancel: CancellationToken,
    game_id: PlMutex<String>,
    ws_client: PlMutex<Option<Arc<GatewayWsClient>>>,
    tasks: PlMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl GatewaySession {
    pub fn new(
        transport: Arc<dyn OpenApiTransport>,
        sink: Arc<dyn EventSink>,
        app_id: i64,
        room_id_code: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            sink,
            app_id,
            room_id_code,
            // Session-local token: `stop` cancels it directly, and it still
            // follows the root token the supervisor owns.
            cancel: cancel.child_token(),
            game_id: PlMutex::new(String::new()),
            ws_client: PlMutex::new(None),
            tasks: PlMutex::new(Vec::new()),
        }
    }

    pub fn game_id(&self) -> String {
        self.game_id.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.game_id.lock().is_empty()
    }

    /// Open the session: start call, heartbeat task, WebSocket subsystem.
    pub async fn start(&self) -> anyhow::Result<AnchorInfo> {
        if self.is_running() {
            anyhow::bail!("gateway session already running");
        }

        tracing::info!(app_id = self.app_id, "starting gateway session");
        let data = self.start_app().await?;

        if data.websocket_info.wss_link.is_empty() {
            anyhow::bail!("start call returned no wss links");
        }

        *self.game_id.lock() = data.game_info.game_id.clone();
        tracing::info!(
            game_id = %data.game_info.game_id,
            room_id = data.anchor_info.room_id,
            anchor = %data.anchor_info.uname,
            "gateway session opened"
        );

        self.spawn_heartbeat();

        let ws_client = GatewayWsClient::new(
            data.websocket_info.wss_link[0].clone(),
            data.websocket_info.auth_body.clone(),
            Arc::clone(&self.sink),
            self.cancel.child_token(),
        );
        let ws_task = Arc::clone(&ws_client).start();
        *self.ws_client.lock() = Some(ws_client);
        self.tasks.lock().push(ws_task);

        Ok(data.anchor_info)
    }

    async fn start_app(&self) -> anyhow::Result<StartData> {
        let body = serde_json::json!({
            "code": self.room_id_code,
            "app_id": self.app_id,
        })
        .to_string();

        let resp = self.transport.post("/v2/app/start", body).await?;
        if resp.code != 0 {
            anyhow::bail!(
                "authentication failed: start call returned code {} ({}) — \
                 check the room id-code and platform credentials",
                resp.code,
                resp.message
            );
        }
        if resp.data.is_null() {
            anyhow::bail!("start call returned empty data");
        }

        let data: StartData = serde_json::from_value(resp.data)
            .map_err(|e| anyhow::anyhow!("undecodable start data: {e}"))?;
        if data.game_info.game_id.is_empty() {
            anyhow::bail!("start call returned an empty game_id");
        }
        Ok(data)
    }

    fn spawn_heartbeat(&self) {
        let transport = Arc::clone(&self.transport);
        let cancel = self.cancel.clone();
        let game_id = self.game_id.lock().clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let body = serde_json::json!({"game_id": game_id}).to_string();
                match transport.post("/v2/app/heartbeat", body).await {
                    Ok(resp) if resp.code == 0 => {
                        tracing::debug!("session heartbeat ok");
                    }
                    Ok(resp) => {
                        tracing::warn!(
                            code = resp.code,
                            message = %resp.message,
                            "session heartbeat rejected"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "session heartbeat failed");
                    }
                }
            }
            tracing::debug!("session heartbeat task exiting");
        });

        self.tasks.lock().push(task);
    }

    /// Close the session: end call, then wait for the workers.
    pub async fn stop(&self) {
        let game_id = {
            let mut guard = self.game_id.lock();
            std::mem::take(&mut *guard)
        };
        if game_id.is_empty() {
            return;
        }

        tracing::info!(game_id = %game_id, "stopping gateway session");
        self.cancel.cancel();
        let body = serde_json::json!({
            "game_id": game_id,
            "app_id": self.app_id,
        })
        .to_string();

        match self.transport.post("/v2/app/end", body).await {
            Ok(resp) if resp.code == 0 => tracing::info!("gateway session ended"),
            Ok(resp) => {
                tracing::warn!(code = resp.code, message = %resp.message, "end call rejected")
            }
            Err(e) => tracing::warn!(error = %e, "end call failed"),
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .is_err()
            {
                tracing::warn!("gateway worker did not exit in time");
            }
        }
        *self.ws_client.lock() = None;
    }

    /// Current WebSocket connection state, if the socket was launched.
    pub fn ws_state(&self) -> Option<ws::ConnectionState> {
        self.ws_client.lock().as_ref().map(|c| c.state())
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport stub that scripts responses per path and records calls.
    struct ScriptedTransport {
        start_resp: BaseResp,
        calls: PlMutex<Vec<(String, String)>>,
        heartbeats: AtomicUsize,
    }

    impl ScriptedTransport {
        fn ok_start() -> BaseResp {
            BaseResp {
                code: 0,
                message: "ok".to_string(),
                data: serde_json::json!({
                    "game_info": {"game_id": "game-123"},
                    "websocket_info": {
                        "auth_body": "{\"token\":\"t\"}",
                        "wss_link": ["wss://example.invalid/sub"],
                    },
                    "anchor_info": {"room_id": 7734200, "uname": "主播"},
                }),
            }
        }
    }

    #[async_trait]
    impl OpenApiTransport for ScriptedTransport {
        async fn post(&self, path: &str, body: String) -> anyhow::Result<BaseResp> {
            self.calls.lock().push((path.to_string(), body));
            match path {
                "/v2/app/start" => Ok(self.start_resp.clone()),
                "/v2/app/heartbeat" => {
                    self.heartbeats.fetch_add(1, Ordering::AcqRel);
                    Ok(BaseResp {
                        code: 0,
                        message: String::new(),
                        data: serde_json::Value::Null,
                    })
                }
                "/v2/app/end" => Ok(BaseResp {
                    code: 0,
                    message: String::new(),
                    data: serde_json::Value::Null,
                }),
                other => anyhow::bail!("unexpected path {other}"),
            }
        }
    }

    struct NoopSink;

    impl EventSink for NoopSink {
        fn on_event(&self, _body: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn noop_sink() -> Arc<dyn EventSink> {
        Arc::new(NoopSink)
    }

    fn session_with(start_resp: BaseResp) -> (GatewaySession, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport {
            start_resp,
            calls: PlMutex::new(Vec::new()),
            heartbeats: AtomicUsize::new(0),
        });
        let session = GatewaySession::new(
            Arc::clone(&transport) as Arc<dyn OpenApiTransport>,
            noop_sink(),
            1761135457345,
            "IDCODE".to_string(),
            CancellationToken::new(),
        );
        (session, transport)
    }

    #[tokio::test]
    async fn start_parses_session_and_spawns_workers() {
        let (session, transport) = session_with(ScriptedTransport::ok_start());

        let anchor = session.start().await.unwrap();
        assert_eq!(anchor.room_id, 7734200);
        assert_eq!(session.game_id(), "game-123");
        assert!(session.is_running());

        // The start body carries the id-code and app id.
        let calls = transport.calls.lock();
        let (path, body) = &calls[0];
        assert_eq!(path, "/v2/app/start");
        assert!(body.contains("IDCODE"));
        assert!(body.contains("1761135457345"));
    }

    #[tokio::test]
    async fn start_rejects_nonzero_code_as_auth_error() {
        let (session, _) = session_with(BaseResp {
            code: 401,
            message: "bad credentials".to_string(),
            data: serde_json::Value::Null,
        });

        let err = session.start().await.unwrap_err();
        assert!(err.to_string().contains("authentication failed"));
        assert!(!session.is_running());
        // No WebSocket was launched.
        assert!(session.ws_state().is_none());
    }

    #[tokio::test]
    async fn start_rejects_empty_data() {
        let (session, _) = session_with(BaseResp {
            code: 0,
            message: String::new(),
            data: serde_json::Value::Null,
        });
        assert!(session.start().await.is_err());
    }

    #[tokio::test]
    async fn start_requires_wss_links() {
        let (session, _) = session_with(BaseResp {
            code: 0,
            message: String::new(),
            data: serde_json::json!({
                "game_info": {"game_id": "game-123"},
                "websocket_info": {"auth_body": "{}", "wss_link": []},
            }),
        });

        let err = session.start().await.unwrap_err();
        assert!(err.to_string().contains("wss"));
    }

    #[tokio::test]
    async fn start_requires_game_id() {
        let (session, _) = session_with(BaseResp {
            code: 0,
            message: String::new(),
            data: serde_json::json!({
                "game_info": {"game_id": ""},
                "websocket_info": {"auth_body": "{}", "wss_link": ["wss://x"]},
            }),
        });
        assert!(session.start().await.is_err());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (session, _) = session_with(ScriptedTransport::ok_start());
        session.start().await.unwrap();
        assert!(session.start().await.is_err());
        session.stop().await;
    }

    #[tokio::test]
    async fn stop_sends_end_call_and_clears_session() {
        let (session, transport) = session_with(ScriptedTransport::ok_start());
        session.start().await.unwrap();

        session.stop().await;
        assert!(!session.is_running());

        let calls = transport.calls.lock();
        let (path, body) = calls.last().unwrap();
        assert_eq!(path, "/v2/app/end");
        assert!(body.contains("game-123"));
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let (session, transport) = session_with(ScriptedTransport::ok_start());
        session.stop().await;
        assert!(transport.calls.lock().is_empty());
    }
}
