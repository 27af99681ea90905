//! Live-stream co-host core.
//!
//! Ingests the open-platform event feed (chat, gifts, subscriptions,
//! likes, room enters, stream start/end), turns selected events into short
//! utterances through an LLM and a streaming TTS service, and plays the
//! audio locally in strict event order.
//!
//! Data flow: gateway → classifier → queue → sequencer → (memory, LLM) →
//! TTS → audio sink. The supervisor in [`app`] wires everything and owns
//! the root cancellation token.

pub mod app;
pub mod audio;
pub mod classifier;
pub mod config;
pub mod events;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod tts;
pub mod voices;

pub use app::App;
pub use audio::AudioSink;
pub use classifier::EventClassifier;
pub use config::AppConfig;
pub use gateway::{GatewaySession, HttpTransport, OpenApiTransport};
pub use llm::LlmClient;
pub use memory::MemoryRing;
pub use pipeline::{CohostRenderer, PipelineSequencer};
pub use queue::{DraftKind, UtteranceDraft, UtteranceQueue};
pub use tts::TtsPool;
pub use voices::{VoiceCatalog, VoiceRef, VoiceRegistry};
