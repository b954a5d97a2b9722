use crate::core::error::SynthesisError;
use crate::core::retry::RetryPolicy;
use crate::services::tts::{SynthesisRequest, TtsClient};
use crate::utils::audio::WavInfo;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Fills cache misses through a [`TtsClient`], with bounded concurrency,
/// per-call timeouts and retries for transient failures.
#[derive(Clone)]
pub struct VoiceSynthesizer {
    client: Arc<dyn TtsClient>,
    retry: RetryPolicy,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
}

impl VoiceSynthesizer {
    pub fn new(
        client: Arc<dyn TtsClient>,
        retry: RetryPolicy,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        let permits = concurrency.min(client.max_concurrency()).max(1);
        Self {
            client,
            retry,
            timeout,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError> {
        let label = format!("{} synthesis with voice {}", self.client.name(), request.voice_id);
        let result = self
            .retry
            .run(&label, |attempt| self.attempt(request, attempt), SynthesisError::is_transient)
            .await;

        result.map_err(|e| {
            if e.attempts > 1 {
                SynthesisError::Exhausted {
                    attempts: e.attempts,
                    last: Box::new(e.last),
                }
            } else {
                e.last
            }
        })
    }

    async fn attempt(&self, request: &SynthesisRequest, attempt: u32) -> Result<Vec<u8>, SynthesisError> {
        // Held per attempt, so backoff sleeps do not occupy a slot.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| SynthesisError::Transport(e.to_string()))?;

        debug!(
            "Synthesizing {} chars with voice {} (attempt {})",
            request.text.len(),
            request.voice_id,
            attempt
        );
        let audio = tokio::time::timeout(self.timeout, self.client.synthesize(request))
            .await
            .map_err(|_| SynthesisError::Timeout(self.timeout.as_secs()))??;

        WavInfo::parse(&audio).map_err(|e| SynthesisError::MalformedAudio(e.to_string()))?;
        Ok(audio)
    }
}
