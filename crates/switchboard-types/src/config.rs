//! Provider keys, per-provider credentials and the persisted system configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::{GatewayError, Result};

// ---------------------------------------------------------------------------
// PlatformKey
// ---------------------------------------------------------------------------

/// Lookup key selecting one upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKey {
    OpenAi,
    Wenxin,
    Qwen,
}

impl PlatformKey {
    pub const ALL: [PlatformKey; 3] = [PlatformKey::OpenAi, PlatformKey::Wenxin, PlatformKey::Qwen];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKey::OpenAi => "openai",
            PlatformKey::Wenxin => "wenxin",
            PlatformKey::Qwen => "qwen",
        }
    }
}

impl fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformKey {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(PlatformKey::OpenAi),
            "wenxin" | "ernie" | "qianfan" => Ok(PlatformKey::Wenxin),
            "qwen" | "dashscope" => Ok(PlatformKey::Qwen),
            other => Err(GatewayError::UnknownPlatform(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformConfig
// ---------------------------------------------------------------------------

/// Credentials and tunables for a single provider.
///
/// `api_key`/`base_path` serve OpenAI-style and Qwen-style providers;
/// `client_id`/`client_secret` serve the Wenxin OAuth exchange.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    #[serde(alias = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(alias = "basePath", skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    #[serde(alias = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(alias = "clientSecret", skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    pub round_max_tokens: usize,
    /// Characters per chunk when splitting long text for embedding.
    pub splitter_chunk_size: usize,
    pub splitter_chunk_overlap: usize,
    /// Expected embedding vector length; 0 skips the check.
    pub dimension: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_speed: Option<f32>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_path: None,
            client_id: None,
            client_secret: None,
            round_max_tokens: 2048,
            splitter_chunk_size: 500,
            splitter_chunk_overlap: 50,
            dimension: 1536,
            tts_model: None,
            tts_voice: None,
            tts_speed: None,
        }
    }
}

impl PlatformConfig {
    /// Defaults appropriate to `key` (embedding dimension differs per provider).
    pub fn defaults_for(key: PlatformKey) -> Self {
        let mut config = Self::default();
        if key == PlatformKey::Wenxin {
            config.dimension = 384;
        }
        config
    }

    /// Build a config for `key` from environment variables only.
    pub fn from_env(key: PlatformKey) -> Self {
        let mut config = Self::defaults_for(key);
        config.overlay_env(key);
        config
    }

    /// Overwrite credential fields with any provider environment variables that are set.
    pub fn overlay_env(&mut self, key: PlatformKey) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        match key {
            PlatformKey::OpenAi => {
                if let Some(v) = var("OPENAI_API_KEY") {
                    self.api_key = Some(v);
                }
                if let Some(v) = var("OPENAI_BASE_URL") {
                    self.base_path = Some(v);
                }
            }
            PlatformKey::Qwen => {
                if let Some(v) = var("DASHSCOPE_API_KEY") {
                    self.api_key = Some(v);
                }
                if let Some(v) = var("DASHSCOPE_BASE_URL") {
                    self.base_path = Some(v);
                }
            }
            PlatformKey::Wenxin => {
                if let Some(v) = var("QIANFAN_CLIENT_ID") {
                    self.client_id = Some(v);
                }
                if let Some(v) = var("QIANFAN_CLIENT_SECRET") {
                    self.client_secret = Some(v);
                }
                if let Some(v) = var("QIANFAN_BASE_URL") {
                    self.base_path = Some(v);
                }
            }
        }
    }

    /// Returns `true` when the credentials `key` needs are present.
    pub fn has_credentials(&self, key: PlatformKey) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        match key {
            PlatformKey::OpenAi | PlatformKey::Qwen => present(&self.api_key),
            PlatformKey::Wenxin => present(&self.client_id) && present(&self.client_secret),
        }
    }
}

impl fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("PlatformConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_path", &self.base_path)
            .field("client_id", &redact(&self.client_id))
            .field("client_secret", &redact(&self.client_secret))
            .field("round_max_tokens", &self.round_max_tokens)
            .field("splitter_chunk_size", &self.splitter_chunk_size)
            .field("splitter_chunk_overlap", &self.splitter_chunk_overlap)
            .field("dimension", &self.dimension)
            .field("tts_model", &self.tts_model)
            .field("tts_voice", &self.tts_voice)
            .field("tts_speed", &self.tts_speed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SystemConfig
// ---------------------------------------------------------------------------

/// Persisted gateway configuration: one [`PlatformConfig`] per provider plus
/// the caller's current selections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub openai: PlatformConfig,
    pub wenxin: PlatformConfig,
    pub qwen: PlatformConfig,
    /// Platform used for completions.
    pub platform: PlatformKey,
    pub model: String,
    /// Platform used for embeddings.
    pub embedding: PlatformKey,
    /// Earlier messages carried into a completion request.
    #[serde(alias = "maxRelatedMessageNum")]
    pub max_related_message_num: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            openai: PlatformConfig::defaults_for(PlatformKey::OpenAi),
            wenxin: PlatformConfig::defaults_for(PlatformKey::Wenxin),
            qwen: PlatformConfig::defaults_for(PlatformKey::Qwen),
            platform: PlatformKey::OpenAi,
            model: String::new(),
            embedding: PlatformKey::OpenAi,
            max_related_message_num: 5,
        }
    }
}

impl SystemConfig {
    pub fn platform_config(&self, key: PlatformKey) -> &PlatformConfig {
        match key {
            PlatformKey::OpenAi => &self.openai,
            PlatformKey::Wenxin => &self.wenxin,
            PlatformKey::Qwen => &self.qwen,
        }
    }

    pub fn platform_config_mut(&mut self, key: PlatformKey) -> &mut PlatformConfig {
        match key {
            PlatformKey::OpenAi => &mut self.openai,
            PlatformKey::Wenxin => &mut self.wenxin,
            PlatformKey::Qwen => &mut self.qwen,
        }
    }

    /// Configuration assembled purely from provider environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.overlay_env();
        config
    }

    /// Let environment variables override credentials loaded from disk.
    pub fn overlay_env(&mut self) {
        for key in PlatformKey::ALL {
            self.platform_config_mut(key).overlay_env(key);
        }
    }

    /// Serialize this config to pretty JSON and write it to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a config from a JSON file at `path`. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        tracing::debug!(path = %path.display(), platform = %config.platform, "loaded system config");
        Ok(config)
    }
}
