//! YAML application configuration.
//!
//! Every section has serde defaults, so the file is a partial overlay.
//! Secrets may be left out of the file and supplied through the environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::asr::{BusinessParams, RecognizerConfig};
use crate::audio::endpoint::AmplitudeMetric;
use crate::audio::wake::WakeConfirmer;
use crate::audio::{BLOCK_SIZE, SAMPLE_RATE};
use crate::auth::Credentials;
use crate::dialogue::DialogueConfig;
use crate::error::{Error, Result};
use crate::tts::VoiceParams;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub recorder: RecorderConfig,
    pub asr: AsrConfig,
    pub tts: TtsConfig,
    pub dialogue: DialogueConfig,
    pub cache: CacheConfig,
    pub playback: PlaybackConfig,
    pub wake: WakeConfig,
    /// Named prompts synthesized at start-up, `tag → text`.
    pub prompts: BTreeMap<String, String>,
    /// Recognized text containing any of these ends the conversation.
    pub endwords: Vec<String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub sample_rate: u32,
    pub block_size: usize,
    /// Capture ring buffer length.
    pub buffer_secs: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            sample_rate: SAMPLE_RATE,
            block_size: BLOCK_SIZE,
            buffer_secs: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    #[serde(deserialize_with = "secs")]
    pub max_duration: Duration,
    /// Raw i16 amplitude.
    pub silence_threshold: f32,
    #[serde(deserialize_with = "secs")]
    pub silence_duration: Duration,
    pub metric: AmplitudeMetric,
    #[serde(deserialize_with = "secs")]
    pub read_timeout: Duration,
    pub diagnostics_path: Option<PathBuf>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(15),
            silence_threshold: 500.0,
            silence_duration: Duration::from_secs(1),
            metric: AmplitudeMetric::Mean,
            read_timeout: Duration::from_secs(2),
            diagnostics_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    pub endpoint: String,
    pub credentials: Credentials,
    pub business: BusinessParams,
    #[serde(flatten)]
    pub recognizer: RecognizerConfig,
    #[serde(deserialize_with = "secs")]
    pub connect_timeout: Duration,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://iat-api.xfyun.cn/v2/iat".into(),
            credentials: Credentials::default(),
            business: BusinessParams::default(),
            recognizer: RecognizerConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub endpoint: String,
    pub credentials: Credentials,
    #[serde(flatten)]
    pub voice: VoiceParams,
    /// Play replies as PCM arrives instead of through the cache.
    pub streaming: bool,
    pub temp_dir: PathBuf,
    pub max_attempts: u32,
    #[serde(deserialize_with = "secs")]
    pub retry_wait: Duration,
    #[serde(deserialize_with = "secs")]
    pub timeout: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://tts-api.xfyun.cn/v2/tts".into(),
            credentials: Credentials::default(),
            voice: VoiceParams::default(),
            streaming: false,
            temp_dir: std::env::temp_dir().join("aispeaker"),
            max_attempts: 3,
            retry_wait: Duration::from_secs(2),
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_entries: usize,
    pub max_total_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("audio_out/tts_cache"),
            max_entries: 50,
            max_total_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    #[serde(deserialize_with = "millis")]
    pub poll_interval: Duration,
    /// How long a turn waits for earlier playback before recording.
    #[serde(deserialize_with = "secs")]
    pub idle_timeout: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    pub spike_ratio: f32,
    #[serde(flatten)]
    pub confirmer: WakeConfirmer,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            spike_ratio: 3.0,
            confirmer: WakeConfirmer::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "aispeaker=debug,info".into(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load from `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_yaml(&text)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        // An empty document deserializes as unit, not as an empty map.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Environment values win over the file when set and non-empty.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let asr = &mut self.asr.credentials;
        if let Some(v) = get("AISPEAKER_ASR_APP_ID") {
            asr.app_id = v;
        }
        if let Some(v) = get("AISPEAKER_ASR_API_KEY") {
            asr.api_key = v;
        }
        if let Some(v) = get("AISPEAKER_ASR_API_SECRET") {
            asr.api_secret = v;
        }

        let tts = &mut self.tts.credentials;
        if let Some(v) = get("AISPEAKER_TTS_APP_ID") {
            tts.app_id = v;
        }
        if let Some(v) = get("AISPEAKER_TTS_API_KEY") {
            tts.api_key = v;
        }
        if let Some(v) = get("AISPEAKER_TTS_API_SECRET") {
            tts.api_secret = v;
        }

        if let Some(v) = get("DEEPSEEK_API_KEY") {
            self.dialogue.api_key = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be positive".into()));
        }
        if self.audio.block_size == 0 {
            return Err(Error::Config("audio.block_size must be positive".into()));
        }
        if self.recorder.silence_threshold < 0.0 {
            return Err(Error::Config("recorder.silence_threshold must not be negative".into()));
        }
        Ok(())
    }
}

fn secs<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    f64::deserialize(d).map(|s| Duration::from_secs_f64(s.max(0.0)))
}

fn millis<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}
