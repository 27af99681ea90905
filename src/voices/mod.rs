//! Voice catalog: the static set of TTS voices available to the co-host.
//!
//! Loaded once at startup from `voices.json`. Every utterance draft carries
//! a reference into this catalog; the per-user registry
//! ([`registry::VoiceRegistry`]) only stores engine voice codes and resolves
//! them back through the catalog.

pub mod registry;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

pub use registry::VoiceRegistry;

// ── Voice reference ────────────────────────────────────────────────

/// A single catalog voice. Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceRef {
    /// Catalog-local numeric id.
    pub id: u32,
    /// Human-facing display name ("软萌团子" etc.), used by chat commands.
    pub name: String,
    /// Engine-specific voice code sent to the TTS service.
    pub voice_type: String,
    /// "male" / "female" / other engine categories.
    #[serde(default)]
    pub gender: String,
    /// TTS resource id the engine bills the synthesis against.
    #[serde(default)]
    pub api_resource_id: String,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    voices: Vec<VoiceRef>,
}

// ── Catalog ────────────────────────────────────────────────────────

/// Indexed, immutable voice catalog.
pub struct VoiceCatalog {
    voices: Vec<VoiceRef>,
    by_name: HashMap<String, usize>,
    by_type: HashMap<String, usize>,
}

impl VoiceCatalog {
    /// Build a catalog from an explicit voice list.
    pub fn new(voices: Vec<VoiceRef>) -> anyhow::Result<Arc<Self>> {
        if voices.is_empty() {
            anyhow::bail!("voice catalog is empty");
        }

        let mut by_name = HashMap::new();
        let mut by_type = HashMap::new();
        for (i, voice) in voices.iter().enumerate() {
            by_name.insert(voice.name.clone(), i);
            by_type.insert(voice.voice_type.clone(), i);
        }

        Ok(Arc::new(Self {
            voices,
            by_name,
            by_type,
        }))
    }

    /// Load `voices.json` from disk.
    pub fn load(path: &Path) -> anyhow::Result<Arc<Self>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let file: CatalogFile = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;

        let catalog = Self::new(file.voices)?;
        tracing::info!(
            path = %path.display(),
            voices = catalog.len(),
            "voice catalog loaded"
        );
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    pub fn all(&self) -> &[VoiceRef] {
        &self.voices
    }

    /// Look up by display name (exact match).
    pub fn by_name(&self, name: &str) -> Option<&VoiceRef> {
        self.by_name.get(name).map(|&i| &self.voices[i])
    }

    /// Look up by engine voice code.
    pub fn by_type(&self, voice_type: &str) -> Option<&VoiceRef> {
        self.by_type.get(voice_type).map(|&i| &self.voices[i])
    }

    /// Pick a uniformly random voice.
    pub fn random(&self) -> &VoiceRef {
        let mut rng = rand::thread_rng();
        self.voices
            .choose(&mut rng)
            .unwrap_or(&self.voices[0])
    }

    /// Up to `count` distinct random voices, for recommendation lines.
    pub fn random_sample(&self, count: usize) -> Vec<&VoiceRef> {
        let mut rng = rand::thread_rng();
        self.voices
            .choose_multiple(&mut rng, count.min(self.voices.len()))
            .collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
