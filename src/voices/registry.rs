//! Per-user voice bindings with YAML persistence.
//!
//! Every chat user is bound to a stable catalog voice: first sighting picks
//! a random one, chat commands can change it, and bindings survive restarts
//! via `user_voices.yaml`. A legacy file shape (name → voice code string)
//! is still read and upgraded to the current shape on the next write.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{VoiceCatalog, VoiceRef};

// ── Persistence shapes ─────────────────────────────────────────────

/// One binding as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserVoiceBinding {
    pub voice_type: String,
    pub last_active_time: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    user_voices: HashMap<String, UserVoiceBinding>,
}

/// Pre-upgrade shape: user name mapped directly to a voice code.
#[derive(Debug, Deserialize)]
struct LegacyRegistryFile {
    user_voices: HashMap<String, String>,
}

// ── Registry ───────────────────────────────────────────────────────

/// Concurrent user → voice map backed by a YAML file.
pub struct VoiceRegistry {
    catalog: Arc<VoiceCatalog>,
    bindings: RwLock<HashMap<String, UserVoiceBinding>>,
    path: PathBuf,
    max_len: usize,
    cleanup_days: i64,
}

impl VoiceRegistry {
    /// Load the registry file (or start empty), running cleanup-on-load
    /// when the binding count exceeds `max_len`.
    pub fn load(
        catalog: Arc<VoiceCatalog>,
        path: PathBuf,
        max_len: usize,
        cleanup_days: i64,
    ) -> Self {
        let mut bindings = match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no user-voice file yet, starting empty");
                HashMap::new()
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to read user voices");
                HashMap::new()
            }
        };

        if bindings.len() > max_len {
            let evicted = Self::evict_inactive(&mut bindings, cleanup_days);
            if evicted > 0 {
                tracing::info!(evicted, remaining = bindings.len(), "evicted inactive user voices");
            }
        }

        tracing::info!(users = bindings.len(), "user-voice registry loaded");

        Self {
            catalog,
            bindings: RwLock::new(bindings),
            path,
            max_len,
            cleanup_days,
        }
    }

    fn parse(content: &str) -> HashMap<String, UserVoiceBinding> {
        match serde_yaml::from_str::<RegistryFile>(content) {
            Ok(file) => file.user_voices,
            Err(new_err) => match serde_yaml::from_str::<LegacyRegistryFile>(content) {
                Ok(legacy) => {
                    tracing::info!(
                        users = legacy.user_voices.len(),
                        "legacy user-voice file detected, converting"
                    );
                    let now = Utc::now();
                    legacy
                        .user_voices
                        .into_iter()
                        .map(|(name, voice_type)| {
                            (
                                name,
                                UserVoiceBinding {
                                    voice_type,
                                    last_active_time: now,
                                },
                            )
                        })
                        .collect()
                }
                Err(_) => {
                    tracing::error!(error = %new_err, "failed to parse user-voice file");
                    HashMap::new()
                }
            },
        }
    }

    fn evict_inactive(bindings: &mut HashMap<String, UserVoiceBinding>, days: i64) -> usize {
        let days = if days <= 0 { 30 } else { days };
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let before = bindings.len();
        bindings.retain(|_, b| b.last_active_time >= cutoff);
        before - bindings.len()
    }

    /// Resolve the voice for `user_name`, creating a random binding on
    /// first sighting. Existing bindings get their activity bumped.
    pub fn get_voice(&self, user_name: &str) -> VoiceRef {
        let mut bindings = self.bindings.write();

        if let Some(binding) = bindings.get_mut(user_name) {
            binding.last_active_time = Utc::now();
            if let Some(voice) = self.catalog.by_type(&binding.voice_type) {
                return voice.clone();
            }
            // Bound voice no longer in the catalog: rebind below.
            tracing::warn!(
                user = user_name,
                voice_type = %binding.voice_type,
                "bound voice missing from catalog, rebinding"
            );
        }

        let voice = self.catalog.random().clone();
        bindings.insert(
            user_name.to_string(),
            UserVoiceBinding {
                voice_type: voice.voice_type.clone(),
                last_active_time: Utc::now(),
            },
        );
        voice
    }

    /// Bind `user_name` to the voice identified by `voice_type` and persist
    /// the whole registry.
    pub fn set_voice(&self, user_name: &str, voice_type: &str) -> anyhow::Result<()> {
        let voice = self
            .catalog
            .by_type(voice_type)
            .ok_or_else(|| anyhow::anyhow!("unknown voice code: {voice_type}"))?
            .clone();

        {
            let mut bindings = self.bindings.write();
            bindings.insert(
                user_name.to_string(),
                UserVoiceBinding {
                    voice_type: voice.voice_type.clone(),
                    last_active_time: Utc::now(),
                },
            );
        }

        self.save()?;
        tracing::info!(user = user_name, voice = %voice.name, "user voice switched and saved");
        Ok(())
    }

    /// Bump a user's last-active timestamp without changing the binding.
    pub fn touch(&self, user_name: &str) {
        let mut bindings = self.bindings.write();
        if let Some(binding) = bindings.get_mut(user_name) {
            binding.last_active_time = Utc::now();
        }
    }

    /// Evict bindings older than the configured interval. Returns the
    /// number of evicted entries.
    pub fn cleanup(&self) -> usize {
        let mut bindings = self.bindings.write();
        Self::evict_inactive(&mut bindings, self.cleanup_days)
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Write the whole registry to disk, atomically replacing the previous
    /// file contents.
    pub fn save(&self) -> anyhow::Result<()> {
        let snapshot = RegistryFile {
            user_voices: self.bindings.read().clone(),
        };
        let yaml = serde_yaml::to_string(&snapshot)?;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let tmp_path = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, yaml)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────
