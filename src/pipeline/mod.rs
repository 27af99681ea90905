//! Pipeline sequencer: drains the utterance queue and renders each draft
//! through LLM → TTS → playback, strictly in order.
//!
//! The sequencer never polls: it waits on the queue's notify signal (or
//! root cancel), then processes complete batches until the queue is empty
//! again. Within a batch the playback order equals the enqueue order, and
//! each draft's audio finishes before the next draft starts. Errors skip
//! the draft and continue.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioSink;
use crate::llm::{prompt, LlmClient, Message};
use crate::memory::MemoryRing;
use crate::queue::{DraftKind, UtteranceDraft, UtteranceQueue};
use crate::tts::TtsPool;

// ── Renderer seam ──────────────────────────────────────────────────

/// Renders one draft to completion (LLM, synthesis, playback).
#[async_trait]
pub trait UtteranceRenderer: Send + Sync {
    async fn render(&self, draft: &UtteranceDraft) -> anyhow::Result<()>;
}

// ── Sequencer ──────────────────────────────────────────────────────

/// Single consumer of the utterance queue.
pub struct PipelineSequencer {
    queue: Arc<UtteranceQueue>,
    renderer: Arc<dyn UtteranceRenderer>,
    cancel: CancellationToken,
}

impl PipelineSequencer {
    pub fn new(
        queue: Arc<UtteranceQueue>,
        renderer: Arc<dyn UtteranceRenderer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            renderer,
            cancel,
        }
    }

    /// Spawn the drain loop.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tracing::info!("pipeline sequencer started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.queue.notified() => {}
            }

            // Spurious wake-ups land here with an empty queue and fall
            // straight back into the wait.
            while self.queue.is_running() {
                let batch = self.queue.drain();
                if batch.is_empty() {
                    break;
                }

                tracing::info!(drafts = batch.len(), "processing utterance batch");
                for draft in &batch {
                    if self.cancel.is_cancelled() {
                        tracing::info!("sequencer cancelled mid-batch");
                        return;
                    }
                    if let Err(e) = self.renderer.render(draft).await {
                        tracing::error!(
                            kind = ?draft.kind,
                            text = %draft.text,
                            error = %e,
                            "draft skipped"
                        );
                    }
                }
            }
        }
        tracing::info!("pipeline sequencer stopped");
    }
}

// ── Production renderer ────────────────────────────────────────────

/// The real LLM → TTS → audio renderer.
pub struct CohostRenderer {
    llm: Arc<LlmClient>,
    tts: Arc<TtsPool>,
    audio: Arc<AudioSink>,
    memory: Arc<MemoryRing>,
    assistant_name: String,
    room_description: String,
    volume: i32,
    llm_mock_enabled: bool,
    cancel: CancellationToken,
}

impl CohostRenderer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<LlmClient>,
        tts: Arc<TtsPool>,
        audio: Arc<AudioSink>,
        memory: Arc<MemoryRing>,
        assistant_name: String,
        room_description: String,
        volume: i32,
        llm_mock_enabled: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            llm,
            tts,
            audio,
            memory,
            assistant_name,
            room_description,
            volume,
            llm_mock_enabled,
            cancel,
        }
    }

    /// Resolve the text that will actually be spoken. Normal drafts run
    /// through the LLM (or the mock); the others are spoken verbatim.
    async fn resolve_text(&self, draft: &UtteranceDraft) -> anyhow::Result<String> {
        match draft.kind {
            DraftKind::NoLlmReply | DraftKind::Command => Ok(draft.text.clone()),
            DraftKind::Normal => {
                let full_prompt = prompt::build_prompt(
                    &self.assistant_name,
                    &self.room_description,
                    &draft.text,
                    &self.memory.snapshot(),
                );

                let mut rx = if self.llm_mock_enabled {
                    self.llm.chat_stream_mock()
                } else {
                    Arc::clone(&self.llm).chat_stream(&[Message::user(full_prompt)])?
                };

                let mut reply = String::new();
                loop {
                    let chunk = tokio::select! {
                        _ = self.cancel.cancelled() => anyhow::bail!("llm reception cancelled"),
                        chunk = rx.recv() => chunk,
                    };
                    let Some(chunk) = chunk else { break };
                    if let Some(err) = chunk.error {
                        anyhow::bail!("llm stream error: {err}");
                    }
                    reply.push_str(&chunk.content);
                    if chunk.done {
                        break;
                    }
                }

                // The event description joins the short-term memory once it
                // has been answered.
                self.memory.push(draft.text.clone());

                if reply.is_empty() {
                    anyhow::bail!("llm returned an empty reply");
                }
                Ok(reply)
            }
        }
    }
}

#[async_trait]
impl UtteranceRenderer for CohostRenderer {
    async fn render(&self, draft: &UtteranceDraft) -> anyhow::Result<()> {
        let text = self.resolve_text(draft).await?;
        tracing::info!(voice = %draft.voice.name, text = %text, "speaking");

        let audio_bytes = self.tts.synthesize(&text, &draft.voice).await?;
        tracing::debug!(bytes = audio_bytes.len(), "synthesis complete");

        let completion = self
            .audio
            .play_with_completion(audio_bytes, self.volume)
            .await?;

        // Strictly serial: the next draft waits for this playback.
        tokio::select! {
            _ = self.cancel.cancelled() => anyhow::bail!("playback wait cancelled"),
            _ = completion => Ok(()),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmConfig;
    use crate::voices::VoiceRef;
    use parking_lot::Mutex as PlMutex;
    use std::time::Duration;

    fn voice() -> VoiceRef {
        VoiceRef {
            id: 1,
            name: "测试".to_string(),
            voice_type: "tt_v1".to_string(),
            gender: "female".to_string(),
            api_resource_id: "seed-tts-1.0".to_string(),
        }
    }

    fn draft(text: &str, kind: DraftKind) -> UtteranceDraft {
        UtteranceDraft::new(text, kind, voice())
    }

    /// Renderer that records render order and can stall to simulate slow
    /// LLM + TTS + playback.
    struct RecordingRenderer {
        rendered: PlMutex<Vec<String>>,
        delay: Duration,
    }

    #[async_trait]
    impl UtteranceRenderer for RecordingRenderer {
        async fn render(&self, draft: &UtteranceDraft) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.rendered.lock().push(draft.text.clone());
            Ok(())
        }
    }

    /// Renderer that fails on marked drafts.
    struct FlakyRenderer {
        rendered: PlMutex<Vec<String>>,
    }

    #[async_trait]
    impl UtteranceRenderer for FlakyRenderer {
        async fn render(&self, draft: &UtteranceDraft) -> anyhow::Result<()> {
            if draft.text.starts_with("fail") {
                anyhow::bail!("synthetic failure");
            }
            self.rendered.lock().push(draft.text.clone());
            Ok(())
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn renders_batch_in_enqueue_order() {
        let queue = UtteranceQueue::new();
        let renderer = Arc::new(RecordingRenderer {
            rendered: PlMutex::new(Vec::new()),
            delay: Duration::ZERO,
        });
        let cancel = CancellationToken::new();
        let handle = PipelineSequencer::new(queue.clone(), renderer.clone(), cancel.clone()).start();

        queue.enqueue(draft("a", DraftKind::Normal));
        queue.enqueue(draft("b", DraftKind::NoLlmReply));
        queue.enqueue(draft("c", DraftKind::Command));

        wait_until(|| renderer.rendered.lock().len() == 3).await;
        assert_eq!(*renderer.rendered.lock(), vec!["a", "b", "c"]);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn drafts_enqueued_mid_batch_play_after_current() {
        let queue = UtteranceQueue::new();
        let renderer = Arc::new(RecordingRenderer {
            rendered: PlMutex::new(Vec::new()),
            delay: Duration::from_millis(60),
        });
        let cancel = CancellationToken::new();
        let handle = PipelineSequencer::new(queue.clone(), renderer.clone(), cancel.clone()).start();

        queue.enqueue(draft("A", DraftKind::Normal));
        // While A renders, B and C arrive.
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(draft("B", DraftKind::Normal));
        queue.enqueue(draft("C", DraftKind::Normal));

        wait_until(|| renderer.rendered.lock().len() == 3).await;
        assert_eq!(*renderer.rendered.lock(), vec!["A", "B", "C"]);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn render_errors_skip_to_next_draft() {
        let queue = UtteranceQueue::new();
        let renderer = Arc::new(FlakyRenderer {
            rendered: PlMutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();
        let handle = PipelineSequencer::new(queue.clone(), renderer.clone(), cancel.clone()).start();

        queue.enqueue(draft("ok-1", DraftKind::Normal));
        queue.enqueue(draft("fail-2", DraftKind::Normal));
        queue.enqueue(draft("ok-3", DraftKind::Normal));

        wait_until(|| renderer.rendered.lock().len() == 2).await;
        assert_eq!(*renderer.rendered.lock(), vec!["ok-1", "ok-3"]);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn cancel_stops_the_loop() {
        let queue = UtteranceQueue::new();
        let renderer = Arc::new(RecordingRenderer {
            rendered: PlMutex::new(Vec::new()),
            delay: Duration::ZERO,
        });
        let cancel = CancellationToken::new();
        let handle = PipelineSequencer::new(queue.clone(), renderer, cancel.clone()).start();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sequencer must exit on cancel")
            .unwrap();
    }

    // ── CohostRenderer text resolution ────────────────────────────

    fn cohost_renderer(mock: bool) -> CohostRenderer {
        let cancel = CancellationToken::new();
        CohostRenderer::new(
            LlmClient::new(LlmConfig::default(), cancel.clone()),
            TtsPool::new(crate::tts::TtsConfig::default(), cancel.clone()),
            Arc::new(AudioSink::new(cancel.clone())),
            Arc::new(MemoryRing::new(3)),
            "小七".to_string(),
            "测试直播间".to_string(),
            80,
            mock,
            cancel,
        )
    }

    #[tokio::test]
    async fn verbatim_kinds_bypass_the_llm() {
        let renderer = cohost_renderer(false);

        let text = renderer
            .resolve_text(&draft("欢迎Ann进入直播间", DraftKind::NoLlmReply))
            .await
            .unwrap();
        assert_eq!(text, "欢迎Ann进入直播间");

        let text = renderer
            .resolve_text(&draft("Ben 的播报音色已随机切换为 测试", DraftKind::Command))
            .await
            .unwrap();
        assert_eq!(text, "Ben 的播报音色已随机切换为 测试");

        // Verbatim drafts never touch the memory ring.
        assert!(renderer.memory.is_empty());
    }

    #[tokio::test]
    async fn normal_draft_with_mock_produces_canned_reply() {
        let renderer = cohost_renderer(true);

        let text = renderer
            .resolve_text(&draft(
                "【弹幕消息】用户 Ann 发送了弹幕：hi",
                DraftKind::Normal,
            ))
            .await
            .unwrap();
        assert!(text.contains("模拟回复"));

        // The event description entered the memory ring.
        assert_eq!(
            renderer.memory.snapshot(),
            vec!["【弹幕消息】用户 Ann 发送了弹幕：hi"]
        );
    }

    #[tokio::test]
    async fn memory_feeds_subsequent_prompts() {
        let renderer = cohost_renderer(true);

        renderer
            .resolve_text(&draft("【点赞】用户 B 为直播间点了 3 个赞", DraftKind::Normal))
            .await
            .unwrap();
        renderer
            .resolve_text(&draft("【礼物】用户 C 送出了 小花花", DraftKind::Normal))
            .await
            .unwrap();

        assert_eq!(renderer.memory.len(), 2);
        let built = prompt::build_prompt(
            "小七",
            "测试直播间",
            "【弹幕消息】用户 D 发送了弹幕：hi",
            &renderer.memory.snapshot(),
        );
        assert!(built.contains("【点赞】用户 B 为直播间点了 3 个赞"));
        assert!(built.contains("【礼物】用户 C 送出了 小花花"));
    }
}
