use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::model::SynthesisParams;
use crate::core::retry::RetryPolicy;
use crate::services::llm::LlmConfig;
use crate::services::tts::gpt_sovits::GptSovitsConfig;
use crate::services::tts::openai::OpenAiTtsConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_input")]
    pub input_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub speakers: SpeakerConfig,

    #[serde(default)]
    pub transitions: TransitionConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    /// Voice used for narration and for any speaker without a mapping.
    #[serde(default = "default_voice")]
    pub default_voice: String,

    /// Canonical (or alias) speaker name → provider voice ID.
    #[serde(default)]
    pub voices: BTreeMap<String, String>,

    #[serde(default)]
    pub model: SynthesisParams,

    #[serde(default = "default_tts_timeout")]
    pub timeout_seconds: u64,

    pub openai: Option<OpenAiTtsConfig>,
    pub gpt_sovits: Option<GptSovitsConfig>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            default_voice: default_voice(),
            voices: BTreeMap::new(),
            model: SynthesisParams::default(),
            timeout_seconds: default_tts_timeout(),
            openai: None,
            gpt_sovits: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_chunk_budget")]
    pub chunk_budget_bytes: usize,

    #[serde(default = "default_attribution_concurrency")]
    pub attribution_concurrency: usize,

    #[serde(default = "default_synthesis_concurrency")]
    pub synthesis_concurrency: usize,

    #[serde(default = "default_cache")]
    pub cache_folder: String,

    #[serde(default)]
    pub attribution_retry: RetryPolicy,

    #[serde(default = "default_synthesis_retry")]
    pub synthesis_retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_budget_bytes: default_chunk_budget(),
            attribution_concurrency: default_attribution_concurrency(),
            synthesis_concurrency: default_synthesis_concurrency(),
            cache_folder: default_cache(),
            attribution_retry: RetryPolicy::default(),
            synthesis_retry: default_synthesis_retry(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SpeakerConfig {
    #[serde(default = "default_narrator")]
    pub narrator: String,

    #[serde(default = "default_system_speaker")]
    pub system: String,

    /// Extra surface names that always mean the narrator.
    #[serde(default = "default_narrator_names")]
    pub narrator_names: Vec<String>,

    /// Surface name → canonical speaker ID.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            narrator: default_narrator(),
            system: default_system_speaker(),
            narrator_names: default_narrator_names(),
            aliases: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransitionConfig {
    #[serde(default = "default_intro_pause")]
    pub intro_pause_ms: u64,

    /// WAV clip played after the last segment, e.g. "End of chapter".
    #[serde(default)]
    pub announcement: Option<String>,

    #[serde(default = "default_outro_pause")]
    pub outro_pause_ms: u64,

    #[serde(default = "default_tolerance")]
    pub duration_tolerance_ms: u64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            intro_pause_ms: default_intro_pause(),
            announcement: None,
            outro_pause_ms: default_outro_pause(),
            duration_tolerance_ms: default_tolerance(),
        }
    }
}

fn default_input() -> String {
    "input".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_cache() -> String {
    "cache".to_string()
}
fn default_tts_provider() -> String {
    "openai".to_string()
}
fn default_voice() -> String {
    "alloy".to_string()
}
fn default_tts_timeout() -> u64 {
    120
}
fn default_chunk_budget() -> usize {
    8 * 1024
}
fn default_attribution_concurrency() -> usize {
    3
}
fn default_synthesis_concurrency() -> usize {
    5
}
fn default_synthesis_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        initial_delay_ms: 1000,
        jitter_ms: 250,
        ..RetryPolicy::default()
    }
}
fn default_narrator() -> String {
    "narrator".to_string()
}
fn default_system_speaker() -> String {
    "system".to_string()
}
fn default_narrator_names() -> Vec<String> {
    vec!["Narrator".to_string(), "旁白".to_string()]
}
fn default_intro_pause() -> u64 {
    1000
}
fn default_outro_pause() -> u64 {
    2000
}
fn default_tolerance() -> u64 {
    50
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.input_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        fs::create_dir_all(&self.pipeline.cache_folder)?;
        Ok(())
    }
}
