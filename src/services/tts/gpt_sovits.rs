use super::{classify_status, classify_transport, SynthesisRequest, TtsClient};
use crate::core::error::SynthesisError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const SYNTHESIS_OK: &str = "合成成功";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GptSovitsConfig {
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f64,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_base_url() -> String {
    "https://gsv2p.acgnai.top/".to_string()
}
fn default_top_k() -> i32 {
    10
}
fn default_top_p() -> f32 {
    1.0
}
fn default_temperature() -> f32 {
    1.0
}
fn default_repetition_penalty() -> f64 {
    1.35
}
fn default_concurrency() -> usize {
    2
}

#[derive(Deserialize)]
struct GptSovitsDownloadResponse {
    msg: String,
    #[serde(default)]
    audio_url: String,
}

pub struct GptSovitsClient {
    config: GptSovitsConfig,
    client: reqwest::Client,
}

impl GptSovitsClient {
    pub fn new(config: GptSovitsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn payload(&self, request: &SynthesisRequest) -> Value {
        let lang = match request.params.language.as_str() {
            "zh" => "中文",
            "ja" => "日文",
            _ => "英文",
        };
        let emotion = request
            .params
            .extra
            .get("emotion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        json!({
            "batch_size": 10,
            "batch_threshold": 0.75,
            "emotion": emotion,
            "fragment_interval": 0.3,
            "if_sr": false,
            "media_type": "wav",
            "model_name": request.voice_id,
            "parallel_infer": true,
            "prompt_text_lang": lang,
            "repetition_penalty": self.config.repetition_penalty,
            "sample_steps": 16,
            // Fixed seed so a regeneration of the same text is reproducible.
            "seed": "0",
            "speed_facter": request.params.speed,
            "split_bucket": true,
            "version": request.params.model,
            "text": request.text,
            "text_lang": lang,
            "top_k": self.config.top_k,
            "top_p": self.config.top_p,
            "temperature": self.config.temperature,
            "text_split_method": "按标点符号切",
        })
    }

    /// The server reports download URLs with its internal host; point them
    /// back at the configured base URL.
    fn rewrite_download_url(&self, audio_url: &str) -> Result<String, SynthesisError> {
        let malformed = |e: String| SynthesisError::MalformedAudio(format!("bad audio_url: {}", e));
        let mut durl = url::Url::parse(audio_url).map_err(|e| malformed(e.to_string()))?;
        let burl = url::Url::parse(&self.config.base_url).map_err(|e| malformed(e.to_string()))?;
        durl.set_host(burl.host_str())
            .map_err(|e| malformed(e.to_string()))?;
        let _ = durl.set_port(burl.port());
        Ok(durl.to_string())
    }
}

#[async_trait]
impl TtsClient for GptSovitsClient {
    fn name(&self) -> &str {
        "gpt_sovits"
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError> {
        let mut req = self
            .client
            .post(self.endpoint("infer_single"))
            .json(&self.payload(request));
        if !self.config.token.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.config.token));
        }

        let resp = req.send().await.map_err(classify_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let body_text = resp.text().await.map_err(classify_transport)?;
        // Handle cases where it might be quoted
        let response = body_text.trim().trim_matches('"');
        let download: GptSovitsDownloadResponse = serde_json::from_str(response)
            .map_err(|e| SynthesisError::Transport(format!("unexpected reply {}: {}", response, e)))?;
        if download.msg != SYNTHESIS_OK {
            return Err(SynthesisError::Rejected(download.msg));
        }

        let url = self.rewrite_download_url(&download.audio_url)?;
        debug!("Downloading GPT-SoVITS audio from {}", url);
        let wav_resp = self.client.get(&url).send().await.map_err(classify_transport)?;
        let status = wav_resp.status();
        if !status.is_success() {
            let body = wav_resp.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }
        let wav_bytes = wav_resp.bytes().await.map_err(classify_transport)?;
        Ok(wav_bytes.to_vec())
    }

    fn max_concurrency(&self) -> usize {
        self.config.concurrency.max(1)
    }
}
