//! Streaming TTS client over a binary WebSocket.
//!
//! One JSON "submit" request goes out wrapped in the service's binary
//! framing; the reply is a stream of audio chunks terminated by a
//! negative-sequence marker. Connections are pooled and reused; requests
//! are serialized per connection.
//!
//! ## Protocol Overview
//!
//! 1. **Connect** — WebSocket with `Authorization: Bearer;<token>`
//! 2. **Submit** — one framed JSON payload (`operation: "submit"`)
//! 3. **Assemble** — append `AudioOnlyServer` payloads in sequence order
//! 4. **Terminate** — any message with `sequence < 0` completes the buffer

pub mod connection;
pub mod pool;
pub mod protocol;

use serde::{Deserialize, Serialize};

pub use pool::TtsPool;

/// Maximum accepted input length in code units.
pub const MAX_TEXT_LEN: usize = 5000;

/// Cap on the assembled audio buffer per utterance.
pub const MAX_AUDIO_BYTES: usize = 50 * 1024 * 1024;

/// Default synthesis endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://openspeech.bytedance.com/api/v1/tts/ws_binary";

/// Default audio encoding.
pub const DEFAULT_ENCODING: &str = "mp3";

// ── Config and request ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub app_id: String,
    pub access_key: String,
    pub endpoint: String,
    /// `mp3` | `wav` | `pcm`.
    pub encoding: String,
    /// Size of the connection pool.
    pub pool_size: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            access_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            encoding: DEFAULT_ENCODING.to_string(),
            pool_size: 5,
        }
    }
}

/// One synthesis request as handed to the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    pub voice_type: String,
    pub encoding: String,
    pub cluster: String,
}

impl TtsRequest {
    pub fn new(text: impl Into<String>, voice_type: impl Into<String>, encoding: &str) -> Self {
        let voice_type = voice_type.into();
        let cluster = voice_to_cluster(&voice_type).to_string();
        Self {
            text: text.into(),
            voice_type,
            encoding: encoding.to_string(),
            cluster,
        }
    }
}

/// Cluster routing is derived from the voice code prefix.
pub fn voice_to_cluster(voice_type: &str) -> &'static str {
    if voice_type.starts_with("ICL_") || voice_type.starts_with("S_") {
        "volcano_icl"
    } else {
        "volcano_tts"
    }
}

/// The JSON payload wrapped by the binary framing.
pub fn build_submit_payload(req: &TtsRequest, config: &TtsConfig) -> serde_json::Value {
    serde_json::json!({
        "app": {
            "appid": config.app_id,
            "token": config.access_key,
            "cluster": req.cluster,
        },
        "user": {
            "uid": uuid::Uuid::new_v4().to_string(),
        },
        "audio": {
            "voice_type": req.voice_type,
            "encoding": req.encoding,
        },
        "request": {
            "reqid": uuid::Uuid::new_v4().to_string(),
            "text": req.text,
            "operation": "submit",
            "with_timestamp": "1",
            "extra_param": serde_json::json!({
                "disable_markdown_filter": false,
            })
            .to_string(),
        },
    })
}

/// Validate request text before any I/O happens.
pub fn validate_text(text: &str) -> anyhow::Result<()> {
    if text.is_empty() {
        anyhow::bail!("validation: text is empty");
    }
    let len = text.chars().count();
    if len > MAX_TEXT_LEN {
        anyhow::bail!("validation: text too long ({len} > {MAX_TEXT_LEN} code units)");
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_from_voice_prefix() {
        assert_eq!(voice_to_cluster("ICL_zh_female_qiuling_v1_tob"), "volcano_icl");
        assert_eq!(voice_to_cluster("S_custom_clone"), "volcano_icl");
        assert_eq!(voice_to_cluster("zh_male_sunwukong_mars_bigtts"), "volcano_tts");
        assert_eq!(voice_to_cluster(""), "volcano_tts");
    }

    #[test]
    fn submit_payload_shape() {
        let config = TtsConfig {
            app_id: "app1".to_string(),
            access_key: "key1".to_string(),
            ..Default::default()
        };
        let req = TtsRequest::new("你好", "ICL_zh_female_qiuling_v1_tob", "mp3");
        let payload = build_submit_payload(&req, &config);

        assert_eq!(payload["app"]["appid"], "app1");
        assert_eq!(payload["app"]["cluster"], "volcano_icl");
        assert_eq!(payload["audio"]["voice_type"], "ICL_zh_female_qiuling_v1_tob");
        assert_eq!(payload["audio"]["encoding"], "mp3");
        assert_eq!(payload["request"]["operation"], "submit");
        assert_eq!(payload["request"]["text"], "你好");
        // reqid is a fresh uuid each time.
        let other = build_submit_payload(&req, &config);
        assert_ne!(payload["request"]["reqid"], other["request"]["reqid"]);
    }

    #[test]
    fn text_validation_boundaries() {
        assert!(validate_text("").is_err());
        assert!(validate_text("你好").is_ok());

        let exactly_max: String = "啊".repeat(MAX_TEXT_LEN);
        assert!(validate_text(&exactly_max).is_ok());

        let over: String = "啊".repeat(MAX_TEXT_LEN + 1);
        let err = validate_text(&over).unwrap_err();
        assert!(err.to_string().contains("validation"));
    }
}
