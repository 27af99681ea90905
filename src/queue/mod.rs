//! Utterance queue: single-consumer batched queue with drain-notify
//! semantics.
//!
//! Producers (`Enqueue`) never block. The consumer waits on the notify
//! signal, then repeatedly drains the whole buffer; everything enqueued
//! before a drain is visible to that drain, which is what preserves
//! playback order across batches. At most one notification is pending at
//! any time, and the consumer must tolerate spurious wake-ups.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::voices::VoiceRef;

/// Soft limit on buffered drafts; beyond it the newest draft is dropped.
const SOFT_CAP: usize = 256;

// ── Draft ──────────────────────────────────────────────────────────

/// What to do with a draft's text downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftKind {
    /// Run the text through the LLM before synthesis.
    Normal,
    /// Speak the text verbatim.
    NoLlmReply,
    /// Speak verbatim; the triggering command already mutated registry state.
    Command,
}

/// A single utterance waiting to be rendered.
#[derive(Debug, Clone)]
pub struct UtteranceDraft {
    /// Event description (Normal) or the final utterance (others).
    pub text: String,
    pub kind: DraftKind,
    pub voice: VoiceRef,
    pub enqueued_at: Instant,
}

impl UtteranceDraft {
    pub fn new(text: impl Into<String>, kind: DraftKind, voice: VoiceRef) -> Self {
        Self {
            text: text.into(),
            kind,
            voice,
            enqueued_at: Instant::now(),
        }
    }
}

// ── Queue ──────────────────────────────────────────────────────────

/// FIFO of drafts paired with a 1-capacity notify signal.
pub struct UtteranceQueue {
    buffer: Mutex<VecDeque<UtteranceDraft>>,
    notify: Notify,
}

impl UtteranceQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    /// Append a draft and post a notification token. Never blocks; on
    /// overflow the newest draft is dropped with a warning.
    pub fn enqueue(&self, draft: UtteranceDraft) {
        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= SOFT_CAP {
                tracing::warn!(
                    len = buffer.len(),
                    text = %draft.text,
                    "utterance queue full, dropping newest draft"
                );
                return;
            }
            buffer.push_back(draft);
        }
        // notify_one stores at most one permit, so repeated enqueues
        // between drains collapse into a single wake-up.
        self.notify.notify_one();
    }

    /// Atomically take every pending draft in insertion order.
    pub fn drain(&self) -> Vec<UtteranceDraft> {
        let mut buffer = self.buffer.lock();
        buffer.drain(..).collect()
    }

    /// Whether any drafts are pending.
    pub fn is_running(&self) -> bool {
        !self.buffer.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Wait until a notification token is available (or a spurious wake-up).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
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

    fn draft(text: &str) -> UtteranceDraft {
        UtteranceDraft::new(text, DraftKind::Normal, voice())
    }

    #[test]
    fn drain_preserves_insertion_order() {
        let queue = UtteranceQueue::new();
        queue.enqueue(draft("a"));
        queue.enqueue(draft("b"));
        queue.enqueue(draft("c"));

        let batch = queue.drain();
        let texts: Vec<_> = batch.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn drain_empties_and_second_drain_is_empty() {
        let queue = UtteranceQueue::new();
        queue.enqueue(draft("a"));

        assert_eq!(queue.drain().len(), 1);
        assert!(queue.drain().is_empty());
        assert!(!queue.is_running());
    }

    #[test]
    fn is_running_reflects_buffer_state() {
        let queue = UtteranceQueue::new();
        assert!(!queue.is_running());
        queue.enqueue(draft("a"));
        assert!(queue.is_running());
        queue.drain();
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn enqueue_wakes_waiting_consumer() {
        let queue = UtteranceQueue::new();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.notified().await;
                queue.drain().len()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(draft("a"));

        let drained = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(drained, 1);
    }

    #[tokio::test]
    async fn repeated_enqueues_store_a_single_token() {
        let queue = UtteranceQueue::new();
        queue.enqueue(draft("a"));
        queue.enqueue(draft("b"));
        queue.enqueue(draft("c"));

        // One stored permit wakes the first wait immediately.
        tokio::time::timeout(Duration::from_millis(100), queue.notified())
            .await
            .expect("first wait should complete from the stored token");

        // No second token: the next wait must block.
        let second = tokio::time::timeout(Duration::from_millis(100), queue.notified()).await;
        assert!(second.is_err(), "only one token may be stored");
    }

    #[test]
    fn overflow_drops_newest_with_buffer_intact() {
        let queue = UtteranceQueue::new();
        for i in 0..SOFT_CAP + 10 {
            queue.enqueue(draft(&format!("d{i}")));
        }
        assert_eq!(queue.len(), SOFT_CAP);

        let batch = queue.drain();
        assert_eq!(batch[0].text, "d0");
        assert_eq!(batch[SOFT_CAP - 1].text, format!("d{}", SOFT_CAP - 1));
    }
}
