use super::{classify_status, classify_transport, SynthesisRequest, TtsClient};
use crate::core::error::SynthesisError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAiTtsConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_concurrency() -> usize {
    4
}

/// OpenAI-compatible `/audio/speech` endpoint.
pub struct OpenAiTtsClient {
    config: OpenAiTtsConfig,
    client: reqwest::Client,
}

impl OpenAiTtsClient {
    pub fn new(config: OpenAiTtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, client })
    }

    fn payload(request: &SynthesisRequest) -> Value {
        let mut payload = json!({
            "model": request.params.model,
            "input": request.text,
            "voice": request.voice_id,
            "response_format": "wav",
            "speed": request.params.speed,
        });
        if let Value::Object(map) = &mut payload {
            for (k, v) in &request.params.extra {
                map.insert(k.clone(), v.clone());
            }
        }
        payload
    }
}

#[async_trait]
impl TtsClient for OpenAiTtsClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError> {
        let url = format!("{}/audio/speech", self.config.base_url.trim_end_matches('/'));
        debug!("POST {} voice={} chars={}", url, request.voice_id, request.text.len());

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&Self::payload(request))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let bytes = resp.bytes().await.map_err(classify_transport)?;
        Ok(bytes.to_vec())
    }

    fn max_concurrency(&self) -> usize {
        self.config.concurrency.max(1)
    }
}
