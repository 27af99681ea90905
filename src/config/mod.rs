//! Layered configuration: embedded defaults → `.env` file → `user.json`.
//!
//! Three sources feed the runtime configuration:
//!
//! 1. **User config** (`user.json`, searched upward from the working
//!    directory, falling back to `user.example.json`) — room identity,
//!    co-host persona, playback volume, memory size.
//! 2. **Env config** (`.env`, searched upward) — runtime mode and service
//!    credentials. An optional *embedded* env layer shadows the local file
//!    for credential-type keys, so a packaged build cannot have its
//!    platform credentials overridden from disk.
//! 3. **Voice catalog** (`voices.json`) — loaded separately by
//!    [`crate::voices::VoiceCatalog`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ── File discovery ─────────────────────────────────────────────────

/// Walk from `start` towards the filesystem root looking for `filename`.
///
/// Returns the first existing regular file. Mirrors how the config files
/// are found regardless of where the binary was launched from.
pub fn find_file_upwards(start: &Path, filename: &str) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(filename);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

// ── User config (user.json) ────────────────────────────────────────

/// Per-streamer settings loaded from `user.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Room id-code: the per-streamer opaque credential for `/v2/app/start`.
    #[serde(default)]
    pub room_id_code: String,
    /// Free-form description of the room, injected into the LLM prompt.
    #[serde(default)]
    pub room_description: String,
    /// Display name of the co-host persona.
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
    /// Registry size above which cleanup-on-load runs.
    #[serde(default = "default_max_user_data_len")]
    pub max_user_data_len: usize,
    /// Days of inactivity before a user-voice binding is evicted.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: i64,
    /// Playback volume, clamped to 1..=100 on read.
    #[serde(default = "default_volume")]
    pub volume: i32,
    /// Speech rate, clamped to -50..=100 on read.
    #[serde(default)]
    pub speech_rate: i32,
    /// Capacity of the short-term memory ring.
    #[serde(default = "default_memory_size")]
    pub assistant_memory_size: usize,
    /// true → events go through the LLM; false → canned replies.
    #[serde(default = "default_true")]
    pub use_llm_replay: bool,
    /// Set on the very first launch to drive one-time initialization.
    #[serde(default)]
    pub first_start: bool,
}

fn default_assistant_name() -> String {
    "小七".to_string()
}
fn default_max_user_data_len() -> usize {
    1000
}
fn default_cleanup_interval() -> i64 {
    30
}
fn default_volume() -> i32 {
    80
}
fn default_memory_size() -> usize {
    5
}
fn default_true() -> bool {
    true
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            room_id_code: String::new(),
            room_description: String::new(),
            assistant_name: default_assistant_name(),
            max_user_data_len: default_max_user_data_len(),
            cleanup_interval: default_cleanup_interval(),
            volume: default_volume(),
            speech_rate: 0,
            assistant_memory_size: default_memory_size(),
            use_llm_replay: true,
            first_start: false,
        }
    }
}

impl UserConfig {
    /// Load `user.json`, falling back to `user.example.json`.
    pub fn load(start_dir: &Path) -> anyhow::Result<Self> {
        let path = find_file_upwards(start_dir, "user.json")
            .or_else(|| {
                tracing::warn!("user.json not found, falling back to user.example.json");
                find_file_upwards(start_dir, "user.example.json")
            })
            .ok_or_else(|| anyhow::anyhow!("neither user.json nor user.example.json found"))?;

        let content = std::fs::read_to_string(&path)?;
        let config: UserConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
        tracing::info!(path = %path.display(), "user config loaded");
        Ok(config)
    }

    /// Volume clamped to the valid playback range.
    pub fn volume(&self) -> i32 {
        self.volume.clamp(1, 100)
    }

    /// Speech rate clamped to the engine's accepted range.
    pub fn speech_rate(&self) -> i32 {
        self.speech_rate.clamp(-50, 100)
    }
}

// ── Env config (.env) ──────────────────────────────────────────────

/// Runtime mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Dev,
    Release,
}

impl Mode {
    fn from_str_value(s: &str) -> Self {
        match s {
            "release" => Mode::Release,
            _ => Mode::Dev,
        }
    }
}

/// Credentials and switches loaded from `.env`.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub mode: Mode,
    pub tts_app_id: String,
    pub tts_access_key: String,
    pub bili_app_id: i64,
    pub bili_access_key: String,
    pub bili_secret_key: String,
    pub llm_mock_enabled: bool,
    pub llm_api_key: String,
    pub llm_model: String,
}

/// Keys that a packaged (embedded) env layer is allowed to pin.
const CREDENTIAL_KEYS: [&str; 3] = ["bili_app_id", "bili_access_key", "bili_secret_key"];

fn parse_env_source(content: &str) -> HashMap<String, String> {
    dotenvy::from_read_iter(content.as_bytes())
        .filter_map(|item| item.ok())
        .collect()
}

impl EnvConfig {
    /// Load the env config from a local `.env` (searched upward, falling
    /// back to `.env.example`), optionally shadowed by an embedded layer.
    ///
    /// When `embedded` is present, credential keys are read from it
    /// exclusively; a local file cannot override them. Without an embedded
    /// layer the local file is the only source.
    pub fn load(start_dir: &Path, embedded: Option<&str>) -> Self {
        let local = find_file_upwards(start_dir, ".env")
            .or_else(|| find_file_upwards(start_dir, ".env.example"))
            .and_then(|path| std::fs::read_to_string(&path).ok())
            .map(|content| parse_env_source(&content))
            .unwrap_or_default();

        let embedded_map = embedded.map(|c| parse_env_source(c)).unwrap_or_default();
        let has_embedded = embedded.is_some();

        let get = |key: &str| -> String {
            if let Some(v) = embedded_map.get(key) {
                if !v.is_empty() {
                    return v.clone();
                }
            }
            if has_embedded && CREDENTIAL_KEYS.contains(&key) {
                // Credentials are pinned by the embedded layer.
                return String::new();
            }
            local.get(key).cloned().unwrap_or_default()
        };

        let config = Self {
            mode: Mode::from_str_value(&get("mode")),
            tts_app_id: get("tts_x_api_app_id"),
            tts_access_key: get("tts_x_api_access_key"),
            bili_app_id: get("bili_app_id").parse().unwrap_or(0),
            bili_access_key: get("bili_access_key"),
            bili_secret_key: get("bili_secret_key"),
            llm_mock_enabled: matches!(
                get("llm_mock_enabled").to_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            ),
            llm_api_key: get("llm_volcengine_api_key"),
            llm_model: get("llm_volcengine_model"),
        };

        if config.bili_app_id == 0 {
            tracing::warn!("no platform app credentials found; check .env or the packaged build");
        }

        config
    }

    pub fn is_dev(&self) -> bool {
        self.mode == Mode::Dev
    }
}

// ── Combined app config ────────────────────────────────────────────

/// Everything the supervisor needs to wire the pipeline.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub user: UserConfig,
    pub env: EnvConfig,
}

impl AppConfig {
    pub fn load(start_dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            user: UserConfig::load(start_dir)?,
            env: EnvConfig::load(start_dir, None),
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn find_file_walks_upward() {
        let tmp = tempfile::TempDir::new().unwrap();
        let nested = tmp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        write(tmp.path(), "marker.json", "{}");

        let found = find_file_upwards(&nested, "marker.json").unwrap();
        assert_eq!(found, tmp.path().join("marker.json"));
    }

    #[test]
    fn find_file_missing_returns_none() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(find_file_upwards(tmp.path(), "nope.json").is_none());
    }

    #[test]
    fn user_config_defaults_fill_missing_fields() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(tmp.path(), "user.json", r#"{"room_id_code": "ABC123"}"#);

        let config = UserConfig::load(tmp.path()).unwrap();
        assert_eq!(config.room_id_code, "ABC123");
        assert_eq!(config.volume(), 80);
        assert_eq!(config.max_user_data_len, 1000);
        assert_eq!(config.cleanup_interval, 30);
        assert!(config.use_llm_replay);
    }

    #[test]
    fn user_config_falls_back_to_example() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(
            tmp.path(),
            "user.example.json",
            r#"{"room_id_code": "EXAMPLE", "volume": 55}"#,
        );

        let config = UserConfig::load(tmp.path()).unwrap();
        assert_eq!(config.room_id_code, "EXAMPLE");
        assert_eq!(config.volume(), 55);
    }

    #[test]
    fn user_config_missing_both_files_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(UserConfig::load(tmp.path()).is_err());
    }

    #[test]
    fn volume_and_rate_are_clamped() {
        let config = UserConfig {
            volume: 300,
            speech_rate: -200,
            ..Default::default()
        };
        assert_eq!(config.volume(), 100);
        assert_eq!(config.speech_rate(), -50);

        let config = UserConfig {
            volume: 0,
            speech_rate: 150,
            ..Default::default()
        };
        assert_eq!(config.volume(), 1);
        assert_eq!(config.speech_rate(), 100);
    }

    #[test]
    fn env_config_reads_local_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(
            tmp.path(),
            ".env",
            "mode=release\nbili_app_id=42\nllm_mock_enabled=true\ntts_x_api_app_id=app1\n",
        );

        let config = EnvConfig::load(tmp.path(), None);
        assert_eq!(config.mode, Mode::Release);
        assert_eq!(config.bili_app_id, 42);
        assert!(config.llm_mock_enabled);
        assert_eq!(config.tts_app_id, "app1");
        assert!(!config.is_dev());
    }

    #[test]
    fn embedded_layer_shadows_credentials() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(
            tmp.path(),
            ".env",
            "bili_app_id=999\nbili_access_key=stolen\ntts_x_api_app_id=local-app\n",
        );

        let embedded = "bili_app_id=42\nbili_access_key=official\n";
        let config = EnvConfig::load(tmp.path(), Some(embedded));

        // Credentials come from the embedded layer only.
        assert_eq!(config.bili_app_id, 42);
        assert_eq!(config.bili_access_key, "official");
        // Secret key absent from embedded → empty, local value ignored.
        assert_eq!(config.bili_secret_key, "");
        // Non-credential keys still come from the local file.
        assert_eq!(config.tts_app_id, "local-app");
    }

    #[test]
    fn env_config_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = EnvConfig::load(tmp.path(), None);
        assert_eq!(config.mode, Mode::Dev);
        assert_eq!(config.bili_app_id, 0);
        assert!(!config.llm_mock_enabled);
    }

    #[test]
    fn quoted_env_values_are_unquoted() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(tmp.path(), ".env", "llm_volcengine_model=\"doubao-pro\"\n");
        let config = EnvConfig::load(tmp.path(), None);
        assert_eq!(config.llm_model, "doubao-pro");
    }
}
