//! App supervisor: wires the pipeline together and manages lifecycle.
//!
//! Startup order: config → voice catalog → registry (cleanup-on-load) →
//! audio / TTS / LLM → sequencer → gateway session. Everything hangs off a
//! single root cancellation token; shutdown cancels it, stops the gateway
//! session (end call, socket close), persists the voice registry, and
//! abandons anything that exceeds the 30 s budget.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::audio::AudioSink;
use crate::classifier::EventClassifier;
use crate::config::{find_file_upwards, AppConfig};
use crate::gateway::{GatewaySession, HttpTransport, OpenApiTransport, OPEN_PLATFORM_HOST};
use crate::llm::{LlmClient, LlmConfig, Provider};
use crate::memory::MemoryRing;
use crate::pipeline::{CohostRenderer, PipelineSequencer};
use crate::queue::UtteranceQueue;
use crate::tts::{TtsConfig, TtsPool};
use crate::voices::{VoiceCatalog, VoiceRegistry};

/// Hard cap on orderly shutdown.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

pub struct App {
    config: AppConfig,
    start_dir: PathBuf,
}

impl App {
    pub fn new(config: AppConfig, start_dir: PathBuf) -> Self {
        Self { config, start_dir }
    }

    /// Run until an exit signal or a fatal error. Returns an error when
    /// startup fails (the process should exit non-zero).
    pub async fn run(self) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let user = &self.config.user;
        let env = &self.config.env;

        // Voice catalog and per-user registry.
        let catalog_path = find_file_upwards(&self.start_dir, "voices.json")
            .unwrap_or_else(|| self.start_dir.join("voices.json"));
        let catalog = VoiceCatalog::load(&catalog_path)?;

        let registry_path = find_file_upwards(&self.start_dir, "user_voices.yaml")
            .unwrap_or_else(|| self.start_dir.join("user_voices.yaml"));
        let registry = Arc::new(VoiceRegistry::load(
            Arc::clone(&catalog),
            registry_path,
            user.max_user_data_len,
            user.cleanup_interval,
        ));

        // Core stages.
        let queue = UtteranceQueue::new();
        let audio = Arc::new(AudioSink::new(cancel.child_token()));
        let tts = TtsPool::new(
            TtsConfig {
                app_id: env.tts_app_id.clone(),
                access_key: env.tts_access_key.clone(),
                ..TtsConfig::default()
            },
            cancel.child_token(),
        );
        let llm = LlmClient::new(
            LlmConfig {
                provider: Provider::Volcengine,
                api_key: env.llm_api_key.clone(),
                model: env.llm_model.clone(),
                ..LlmConfig::default()
            },
            cancel.child_token(),
        );

        if env.llm_mock_enabled {
            tracing::info!("llm mock mode enabled, replies are canned");
        } else if !llm.is_ready() {
            tracing::warn!("llm client has no api key; Normal drafts will fail");
        }

        let memory = Arc::new(MemoryRing::new(user.assistant_memory_size));
        let renderer = Arc::new(CohostRenderer::new(
            Arc::clone(&llm),
            Arc::clone(&tts),
            Arc::clone(&audio),
            Arc::clone(&memory),
            user.assistant_name.clone(),
            user.room_description.clone(),
            user.volume(),
            env.llm_mock_enabled,
            cancel.child_token(),
        ));
        let sequencer_task =
            PipelineSequencer::new(Arc::clone(&queue), renderer, cancel.child_token()).start();

        // Event path: gateway frames → classifier → queue.
        let classifier = Arc::new(EventClassifier::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            Arc::clone(&queue),
            user.assistant_name.clone(),
            user.use_llm_replay,
        ));

        let transport: Arc<dyn OpenApiTransport> = Arc::new(HttpTransport::new(
            OPEN_PLATFORM_HOST,
            env.bili_access_key.clone(),
        ));
        let session = Arc::new(GatewaySession::new(
            transport,
            classifier,
            env.bili_app_id,
            user.room_id_code.clone(),
            cancel.clone(),
        ));

        // Fail fast with actionable diagnostics if the session won't open.
        let anchor = session.start().await.map_err(|e| {
            anyhow::anyhow!(
                "{e}\nthe co-host cannot start without a gateway session; \
                 verify room_id_code in user.json and the platform credentials in .env"
            )
        })?;
        tracing::info!(
            room_id = anchor.room_id,
            anchor = %anchor.uname,
            "co-host is live"
        );

        // Fatal-error watch: the ws client giving up permanently should
        // bring the process down rather than leave a silent husk.
        let (fatal_tx, mut fatal_rx) = tokio::sync::mpsc::channel::<anyhow::Error>(1);
        {
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                    if session.ws_state() == Some(crate::gateway::ws::ConnectionState::ShuttingDown)
                    {
                        let _ = fatal_tx
                            .send(anyhow::anyhow!("gateway connection permanently lost"))
                            .await;
                        return;
                    }
                }
            });
        }

        // Block until a signal or a fatal error.
        let outcome = tokio::select! {
            _ = wait_for_exit_signal() => Ok(()),
            fatal = fatal_rx.recv() => match fatal {
                Some(e) => Err(e),
                None => Ok(()),
            },
        };

        // Orderly shutdown under a hard budget.
        tracing::info!("shutting down");
        cancel.cancel();
        let shutdown = async {
            session.stop().await;
            llm.close();
            let _ = sequencer_task.await;
        };
        if tokio::time::timeout(SHUTDOWN_BUDGET, shutdown).await.is_err() {
            tracing::error!(
                budget_secs = SHUTDOWN_BUDGET.as_secs(),
                "shutdown budget exceeded, abandoning remaining workers"
            );
        }

        if let Err(e) = registry.save() {
            tracing::error!(error = %e, "failed to persist user voices");
        }

        tracing::info!("shutdown complete");
        outcome
    }
}

/// Resolve the directory config files are searched from.
pub fn working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| Path::new(".").to_path_buf())
}

#[cfg(unix)]
async fn wait_for_exit_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "cannot install SIGINT handler");
            return std::future::pending().await;
        }
    };
    let mut terminate = signal(SignalKind::terminate()).ok();
    let mut quit = signal(SignalKind::quit()).ok();
    let mut hangup = signal(SignalKind::hangup()).ok();

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                tracing::info!("received SIGINT");
                return;
            }
            _ = async { match terminate.as_mut() { Some(s) => s.recv().await, None => std::future::pending().await } } => {
                tracing::info!("received SIGTERM");
                return;
            }
            _ = async { match quit.as_mut() { Some(s) => s.recv().await, None => std::future::pending().await } } => {
                tracing::info!("received SIGQUIT");
                return;
            }
            _ = async { match hangup.as_mut() { Some(s) => s.recv().await, None => std::future::pending().await } } => {
                tracing::info!("received SIGHUP, ignoring");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_exit_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot wait for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("received ctrl-c");
}
