use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml_ng::{Mapping, Value};

use crate::error::{RecitalError, Result};

fn default_backend() -> String {
    "gemini".to_string()
}

const fn default_max_request_chars() -> usize {
    1500
}

const fn default_timeout_secs() -> u64 {
    60
}

const fn default_true() -> bool {
    true
}

const fn default_chunk_chars() -> usize {
    1000
}

const fn default_prefetch_depth() -> usize {
    2
}

const fn default_lead_in_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub synthesis: SynthesisConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "default_backend")]
    pub backend: String,

    pub api_key: Option<String>,

    /// Backend-specific model name; each backend has its own default.
    pub model: Option<String>,

    pub voice: Option<String>,

    /// Text prepended to every request, e.g. a speaking-style instruction.
    pub instruction: Option<String>,

    /// Base URL override, for proxies and self-hosted gateways.
    pub endpoint: Option<String>,

    #[serde(default = "default_max_request_chars")]
    pub max_request_chars: usize,

    #[serde(default = "default_true")]
    pub strip_markup: bool,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            api_key: None,
            model: None,
            voice: None,
            instruction: None,
            endpoint: None,
            max_request_chars: default_max_request_chars(),
            strip_markup: true,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    /// Character budget per chunk. Must stay below `synthesis.max_request_chars`.
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,

    /// Segments allowed to be buffered beyond the one currently audible.
    #[serde(default = "default_prefetch_depth")]
    pub prefetch_depth: usize,

    #[serde(default = "default_lead_in_ms")]
    pub lead_in_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            prefetch_depth: default_prefetch_depth(),
            lead_in_ms: default_lead_in_ms(),
        }
    }
}

impl PlaybackConfig {
    #[must_use]
    pub fn lead_in_secs(&self) -> f64 {
        self.lead_in_ms as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AudioConfig {
    /// Output device name; the host default is used when unset.
    pub device: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RecitalError::Config(format!(
                "config file not found: {} (create it or use --config to specify a path)",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            RecitalError::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: Self = serde_yaml_ng::from_str(&contents).map_err(|e| {
            RecitalError::Config(format!(
                "failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load the default config file if present, otherwise fall back to defaults.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.playback.chunk_chars == 0 {
            return Err(RecitalError::Config(
                "playback.chunk_chars must be greater than zero".to_string(),
            ));
        }

        if self.playback.chunk_chars >= self.synthesis.max_request_chars {
            return Err(RecitalError::Config(format!(
                "playback.chunk_chars ({}) must be below synthesis.max_request_chars ({})",
                self.playback.chunk_chars, self.synthesis.max_request_chars
            )));
        }

        if self.playback.prefetch_depth == 0 {
            return Err(RecitalError::Config(
                "playback.prefetch_depth must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        config_dir.join("recital/config.yaml")
    }

    /// Expand `~` in a path string to the user's home directory.
    #[must_use]
    pub fn expand_path(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        PathBuf::from(path)
    }

    /// Write `audio.device` into the config file, creating the file if needed.
    ///
    /// Other keys in the file are preserved.
    pub fn set_audio_device(path: &Path, device: &str) -> Result<()> {
        let mut root = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                RecitalError::Config(format!(
                    "failed to read config file {}: {e}",
                    path.display()
                ))
            })?;
            match serde_yaml_ng::from_str::<Value>(&contents) {
                Ok(Value::Mapping(m)) => m,
                Ok(Value::Null) => Mapping::new(),
                Ok(_) => {
                    return Err(RecitalError::Config(format!(
                        "config file {} is not a mapping",
                        path.display()
                    )));
                }
                Err(e) => {
                    return Err(RecitalError::Config(format!(
                        "failed to parse config file {}: {e}",
                        path.display()
                    )));
                }
            }
        } else {
            Mapping::new()
        };

        let audio = root
            .entry(Value::String("audio".to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()))
            .as_mapping_mut()
            .ok_or_else(|| RecitalError::Config("audio section is not a mapping".to_string()))?;
        audio.insert(
            Value::String("device".to_string()),
            Value::String(device.to_string()),
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RecitalError::Config(format!(
                    "failed to create config directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let yaml = serde_yaml_ng::to_string(&Value::Mapping(root))
            .map_err(|e| RecitalError::Config(format!("failed to serialize config: {e}")))?;

        std::fs::write(path, yaml).map_err(|e| {
            RecitalError::Config(format!(
                "failed to write config file {}: {e}",
                path.display()
            ))
        })
    }
}
