use crate::core::config::Config;
use crate::core::error::SynthesisError;
use crate::core::model::SynthesisParams;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

pub mod gpt_sovits;
pub mod openai;

/// Everything a provider needs to voice one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice_id: String,
    pub params: SynthesisParams,
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    fn name(&self) -> &str;

    /// Returns WAV bytes for `request`.
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError>;

    fn max_concurrency(&self) -> usize {
        5
    }
}

pub fn create_tts_client(config: &Config) -> Result<Arc<dyn TtsClient>> {
    info!("Initializing TTS Client for provider: {}", config.audio.provider);
    match config.audio.provider.as_str() {
        "openai" => {
            let openai_config = config
                .audio
                .openai
                .clone()
                .ok_or_else(|| anyhow!("OpenAI TTS config missing"))?;
            Ok(Arc::new(openai::OpenAiTtsClient::new(openai_config)?))
        }
        "gpt_sovits" => {
            let gpt_config = config
                .audio
                .gpt_sovits
                .clone()
                .ok_or_else(|| anyhow!("GPT-Sovits config missing"))?;
            Ok(Arc::new(gpt_sovits::GptSovitsClient::new(gpt_config)?))
        }
        _ => Err(anyhow!("Unknown TTS provider: {}", config.audio.provider)),
    }
}

/// Maps a non-success HTTP status onto the error taxonomy.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: String) -> SynthesisError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        SynthesisError::RateLimited(body)
    } else {
        SynthesisError::Provider {
            status: status.as_u16(),
            body,
        }
    }
}

pub(crate) fn classify_transport(err: reqwest::Error) -> SynthesisError {
    if err.is_timeout() {
        SynthesisError::Timeout(0)
    } else {
        SynthesisError::Transport(err.to_string())
    }
}
