//! Per-chapter state machine: chunk, attribute, synthesize, merge.
//!
//! Every stage publishes its artifact under `<build>/<chapter>/` and records
//! the new stage in `state.json` before the next stage starts, so a restarted
//! run resumes where the last one stopped instead of repeating paid calls.
//! Attribution is additionally journaled per chunk, so a failed chunk is the
//! only one asked again.

use crate::core::config::Config;
use crate::core::error::{PipelineError, SegmentFailure, SynthesisError};
use crate::core::io::{self, Storage};
use crate::core::model::{Chapter, SpeakerSegment, SynthesisParams, TextChunk, VoiceMap};
use crate::core::progress::{Phase, ProgressHandle, ProgressTracker};
use crate::core::state::{FailureRecord, PipelineState, Stage};
use crate::services::alias::AliasResolver;
use crate::services::attribution::{self, AttributedSpan, AttributionClient};
use crate::services::cache::{CacheEntry, CacheRequest, SegmentCache};
use crate::services::chunker::Chunker;
use crate::services::llm::LlmClient;
use crate::services::merger::{AudioMerger, MergedChapterAudio, TransitionSet};
use crate::services::synthesizer::VoiceSynthesizer;
use crate::services::tts::{SynthesisRequest, TtsClient};
use anyhow::Result;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A finished chapter: the merged audio and the segment list it was built from.
#[derive(Debug, Clone)]
pub struct ChapterAudio {
    pub merged: MergedChapterAudio,
    pub segments: Vec<SpeakerSegment>,
}

#[derive(Debug, Clone)]
pub struct SegmentRegeneration {
    pub entry: CacheEntry,
    /// Present when the chapter had already been merged and was merged again.
    pub merged: Option<MergedChapterAudio>,
}

pub struct ChapterPipeline {
    storage: Arc<dyn Storage>,
    chunker: Chunker,
    aliases: Arc<AliasResolver>,
    attribution: AttributionClient,
    synthesizer: VoiceSynthesizer,
    cache: SegmentCache,
    merger: AudioMerger,
    transitions: TransitionSet,
    params: SynthesisParams,
    build_folder: String,
    output_folder: String,
    attribution_concurrency: usize,
    synthesis_concurrency: usize,
    trackers: Mutex<HashMap<String, ProgressTracker>>,
    cancel: CancellationToken,
}

impl ChapterPipeline {
    pub fn from_config(
        config: &Config,
        llm: Arc<dyn LlmClient>,
        tts: Arc<dyn TtsClient>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let aliases = Arc::new(AliasResolver::new(&config.speakers)?);
        let pipeline = &config.pipeline;
        Ok(Self {
            chunker: Chunker::new(pipeline.chunk_budget_bytes)?,
            attribution: AttributionClient::new(
                llm,
                aliases.clone(),
                pipeline.attribution_retry.clone(),
                Duration::from_secs(config.llm.timeout_seconds),
            ),
            synthesizer: VoiceSynthesizer::new(
                tts,
                pipeline.synthesis_retry.clone(),
                Duration::from_secs(config.audio.timeout_seconds),
                pipeline.synthesis_concurrency,
            ),
            cache: SegmentCache::new(storage.clone(), pipeline.cache_folder.clone()),
            merger: AudioMerger::new(
                storage.clone(),
                Duration::from_millis(config.transitions.duration_tolerance_ms),
            ),
            transitions: TransitionSet::from_config(&config.transitions),
            params: config.audio.model.clone(),
            build_folder: config.build_folder.clone(),
            output_folder: config.output_folder.clone(),
            attribution_concurrency: pipeline.attribution_concurrency.max(1),
            synthesis_concurrency: pipeline.synthesis_concurrency.max(1),
            trackers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            aliases,
            storage,
        })
    }

    /// Stops the pipeline at the next stage boundary once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn aliases(&self) -> &AliasResolver {
        &self.aliases
    }

    /// Live progress of a chapter this pipeline has started.
    pub fn progress(&self, chapter_id: &str) -> Option<ProgressHandle> {
        self.trackers.lock().get(chapter_id).map(ProgressTracker::handle)
    }

    /// Persisted state of a chapter, if it was ever started.
    pub async fn status(&self, chapter_id: &str) -> Result<Option<PipelineState>> {
        self.load_optional(&self.state_path(chapter_id)).await
    }

    /// Drives `chapter` to `merged`, resuming from its persisted stage.
    pub async fn process(&self, chapter: &Chapter) -> Result<ChapterAudio, PipelineError> {
        let tracker = self.tracker(&chapter.id);
        let result = self.drive(chapter, &tracker).await;
        match &result {
            Ok(_) => tracker.set_phase(Phase::Done),
            Err(e) => tracker.fail(e.to_string()),
        }
        result
    }

    /// Synthesizes one segment again (typically the one a previous run failed
    /// on) and resumes the chapter. Other segments are served from the cache.
    pub async fn retry_segment(
        &self,
        chapter: &Chapter,
        segment_index: usize,
    ) -> Result<ChapterAudio, PipelineError> {
        let (mut state, segments) = self.attributed(chapter).await?;
        let voices = self.canonical_voices(chapter);
        let segment = segment_at(&chapter.id, &segments, segment_index)?;

        info!("Retrying segment {} of chapter {}", segment_index, chapter.id);
        if let Err(error) = self.synthesize_one(segment, &voices).await {
            let err = PipelineError::Synthesis {
                chapter_id: chapter.id.clone(),
                failures: vec![SegmentFailure {
                    segment_index,
                    error,
                }],
            };
            return Err(self.halt(&mut state, Stage::SegmentsReady, err).await);
        }
        self.process(chapter).await
    }

    /// Replaces one segment's cached audio with a fresh synthesis. If the
    /// chapter was already merged it is merged again.
    pub async fn regenerate_segment(
        &self,
        chapter: &Chapter,
        segment_index: usize,
    ) -> Result<SegmentRegeneration, PipelineError> {
        let (mut state, segments) = self.attributed(chapter).await?;
        let voices = self.canonical_voices(chapter);
        let segment = segment_at(&chapter.id, &segments, segment_index)?;

        if state.voices_hash != voices.fingerprint() {
            state.rewind(Stage::Attributed);
            state.voices_hash = voices.fingerprint();
            self.save_state(&state).await?;
        }

        let request = self.cache_request(segment, &voices);
        let existed = self.cache.regenerate(&request.key).await?;
        info!(
            "Regenerating segment {} of chapter {} (previous entry: {})",
            segment_index,
            chapter.id,
            if existed { "replaced" } else { "none" }
        );

        let entry = match self.synthesize_one(segment, &voices).await {
            Ok(entry) => entry,
            Err(error) => {
                state.rewind(Stage::Attributed);
                let err = PipelineError::Synthesis {
                    chapter_id: chapter.id.clone(),
                    failures: vec![SegmentFailure {
                        segment_index,
                        error,
                    }],
                };
                return Err(self.halt(&mut state, Stage::SegmentsReady, err).await);
            }
        };

        let merged = if state.stage == Stage::Merged {
            let tracker = self.tracker(&chapter.id);
            Some(self.merge_stage(chapter, &segments, &voices, &mut state, &tracker).await?)
        } else {
            None
        };
        Ok(SegmentRegeneration { entry, merged })
    }

    async fn drive(
        &self,
        chapter: &Chapter,
        tracker: &ProgressTracker,
    ) -> Result<ChapterAudio, PipelineError> {
        let voices = self.canonical_voices(chapter);
        let mut state = self.resume_state(chapter, &voices).await?;

        // Chunking
        self.checkpoint(&chapter.id, Stage::Chunked)?;
        let mut chunks: Option<Vec<TextChunk>> = None;
        if state.stage >= Stage::Chunked {
            chunks = self.load_optional(&self.chunks_path(&chapter.id)).await?;
            if chunks.is_none() {
                warn!("Chapter {}: chunks.json is missing, chunking again", chapter.id);
                state.rewind(Stage::New);
            }
        }
        let chunks = match chunks {
            Some(chunks) => chunks,
            None => {
                tracker.set_phase(Phase::Chunking);
                let chunks = match self.chunker.split(&chapter.id, &chapter.text) {
                    Ok(chunks) => chunks,
                    Err(e) => return Err(self.halt(&mut state, Stage::Chunked, e.into()).await),
                };
                io::write_json(self.storage.as_ref(), &self.chunks_path(&chapter.id), &chunks).await?;
                self.transition(&mut state, Stage::Chunked).await?;
                info!("Chapter {}: {} chunk(s)", chapter.id, chunks.len());
                chunks
            }
        };

        // Attribution
        self.checkpoint(&chapter.id, Stage::Attributed)?;
        let mut segments: Option<Vec<SpeakerSegment>> = None;
        if state.stage >= Stage::Attributed {
            segments = self.load_optional(&self.segments_path(&chapter.id)).await?;
            match &segments {
                Some(segments) => replay_attribution(tracker, chunks.len(), segments),
                None => {
                    warn!("Chapter {}: segments.json is missing, attributing again", chapter.id);
                    state.rewind(Stage::Chunked);
                }
            }
        }
        let segments = match segments {
            Some(segments) => segments,
            None => self.attribution_stage(chapter, &chunks, &voices, &mut state, tracker).await?,
        };

        // Synthesis
        self.checkpoint(&chapter.id, Stage::SegmentsReady)?;
        if state.stage < Stage::SegmentsReady {
            self.synthesis_stage(chapter, &segments, &voices, &mut state, tracker).await?;
        }

        // Merge
        self.checkpoint(&chapter.id, Stage::Merged)?;
        if state.stage >= Stage::Merged {
            let manifest: Option<MergedChapterAudio> =
                self.load_optional(&self.manifest_path(&chapter.id)).await?;
            if let Some(merged) = manifest {
                if self.storage.exists(&merged.path).await? {
                    info!("Chapter {} is already merged", chapter.id);
                    return Ok(ChapterAudio { merged, segments });
                }
            }
            warn!("Chapter {}: merged output is missing, merging again", chapter.id);
        }
        let merged = self.merge_stage(chapter, &segments, &voices, &mut state, tracker).await?;
        Ok(ChapterAudio { merged, segments })
    }

    /// Loads the persisted state and reconciles it with the chapter as given.
    async fn resume_state(
        &self,
        chapter: &Chapter,
        voices: &VoiceMap,
    ) -> Result<PipelineState, PipelineError> {
        let text_hash = chapter.text_hash();
        let voices_hash = voices.fingerprint();
        let state = match self.status(&chapter.id).await? {
            Some(state) if state.text_hash == text_hash => {
                let mut state = state;
                if state.voices_hash != voices_hash {
                    info!("Chapter {}: voice mapping changed, resynthesizing", chapter.id);
                    state.rewind(Stage::Attributed);
                    state.voices_hash = voices_hash;
                }
                state
            }
            Some(_) => {
                info!("Chapter {}: text changed, starting over", chapter.id);
                self.storage.delete(&self.journal_dir(&chapter.id)).await?;
                PipelineState::new(&chapter.id, &text_hash, &voices_hash)
            }
            None => PipelineState::new(&chapter.id, &text_hash, &voices_hash),
        };
        self.save_state(&state).await?;
        Ok(state)
    }

    async fn attribution_stage(
        &self,
        chapter: &Chapter,
        chunks: &[TextChunk],
        voices: &VoiceMap,
        state: &mut PipelineState,
        tracker: &ProgressTracker,
    ) -> Result<Vec<SpeakerSegment>, PipelineError> {
        tracker.begin_attribution(chunks.len(), 0);

        let mut results: Vec<Option<Vec<AttributedSpan>>> = vec![None; chunks.len()];
        for (i, slot) in results.iter_mut().enumerate() {
            *slot = self.load_optional(&self.journal_path(&chapter.id, i)).await?;
            if let Some(spans) = slot {
                tracker.chunk_completed(spans.iter().map(|s| s.speaker_id.as_str()));
            }
        }

        let mut known: BTreeSet<String> = voices.voices.keys().cloned().collect();
        known.extend(results.iter().flatten().flatten().map(|s| s.speaker_id.clone()));
        known.remove(self.aliases.narrator());
        known.remove(self.aliases.system());
        let known: Vec<String> = known.into_iter().collect();

        let pending: Vec<usize> = (0..chunks.len()).filter(|i| results[*i].is_none()).collect();
        if !pending.is_empty() {
            info!(
                "Chapter {}: attributing {} of {} chunk(s)",
                chapter.id,
                pending.len(),
                chunks.len()
            );
        }

        let known = &known;
        let outcomes = stream::iter(pending)
            .map(|i| async move {
                let outcome = match self.attribution.attribute_chunk(&chunks[i], known).await {
                    Ok(spans) => {
                        let path = self.journal_path(&chapter.id, i);
                        match io::write_json(self.storage.as_ref(), &path, &spans).await {
                            Ok(()) => {
                                tracker.chunk_completed(spans.iter().map(|s| s.speaker_id.as_str()));
                                Ok(spans)
                            }
                            Err(e) => Err(PipelineError::Storage(e)),
                        }
                    }
                    Err(e) => Err(PipelineError::Attribution(e)),
                };
                (i, outcome)
            })
            .buffer_unordered(self.attribution_concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut first_error: Option<(usize, PipelineError)> = None;
        for (i, outcome) in outcomes {
            match outcome {
                Ok(spans) => results[i] = Some(spans),
                Err(e) => {
                    if first_error.as_ref().map_or(true, |(j, _)| i < *j) {
                        first_error = Some((i, e));
                    }
                }
            }
        }
        if let Some((_, err)) = first_error {
            return Err(self.halt(state, Stage::Attributed, err).await);
        }

        let per_chunk: Vec<Vec<AttributedSpan>> = results.into_iter().flatten().collect();
        let segments = attribution::assemble_segments(&chapter.id, &per_chunk);
        let flagged = segments.iter().filter(|s| s.needs_review).count();
        if flagged > 0 {
            warn!(
                "Chapter {}: {} segment(s) flagged for review (unpaired quotes)",
                chapter.id, flagged
            );
        }

        io::write_json(self.storage.as_ref(), &self.segments_path(&chapter.id), &segments).await?;
        self.transition(state, Stage::Attributed).await?;
        info!("Chapter {}: {} segment(s) attributed", chapter.id, segments.len());
        Ok(segments)
    }

    async fn synthesis_stage(
        &self,
        chapter: &Chapter,
        segments: &[SpeakerSegment],
        voices: &VoiceMap,
        state: &mut PipelineState,
        tracker: &ProgressTracker,
    ) -> Result<(), PipelineError> {
        tracker.begin_synthesis(segments.len());

        let outcomes = stream::iter(segments.iter().enumerate())
            .map(|(i, segment)| async move {
                let outcome = self.synthesize_one(segment, voices).await;
                if outcome.is_ok() {
                    tracker.segment_completed();
                }
                (i, outcome)
            })
            .buffer_unordered(self.synthesis_concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut failures: Vec<SegmentFailure> = outcomes
            .into_iter()
            .filter_map(|(segment_index, outcome)| {
                outcome.err().map(|error| SegmentFailure {
                    segment_index,
                    error,
                })
            })
            .collect();
        if !failures.is_empty() {
            failures.sort_by_key(|f| f.segment_index);
            let err = PipelineError::Synthesis {
                chapter_id: chapter.id.clone(),
                failures,
            };
            return Err(self.halt(state, Stage::SegmentsReady, err).await);
        }

        self.transition(state, Stage::SegmentsReady).await?;
        Ok(())
    }

    async fn merge_stage(
        &self,
        chapter: &Chapter,
        segments: &[SpeakerSegment],
        voices: &VoiceMap,
        state: &mut PipelineState,
        tracker: &ProgressTracker,
    ) -> Result<MergedChapterAudio, PipelineError> {
        tracker.set_phase(Phase::Merging);
        let keys: Vec<_> = segments
            .iter()
            .map(|s| self.cache_request(s, voices).key)
            .collect();
        let output = self.output_path(&chapter.id);

        let merged = match self
            .merger
            .merge(&chapter.id, &keys, &self.cache, &self.transitions, &output)
            .await
        {
            Ok(merged) => merged,
            Err(e) => {
                if matches!(e, PipelineError::Incomplete(_)) {
                    state.rewind(Stage::Attributed);
                }
                return Err(self.halt(state, Stage::Merged, e).await);
            }
        };

        io::write_json(self.storage.as_ref(), &self.manifest_path(&chapter.id), &merged).await?;
        self.transition(state, Stage::Merged).await?;
        Ok(merged)
    }

    async fn synthesize_one(
        &self,
        segment: &SpeakerSegment,
        voices: &VoiceMap,
    ) -> Result<CacheEntry, SynthesisError> {
        let request = self.cache_request(segment, voices);
        let synthesis = SynthesisRequest {
            text: request.text.clone(),
            voice_id: request.voice_id.clone(),
            params: request.params.clone(),
        };
        let synthesizer = self.synthesizer.clone();
        self.cache
            .get_or_create(request, move || async move {
                synthesizer.synthesize(&synthesis).await
            })
            .await
    }

    fn cache_request(&self, segment: &SpeakerSegment, voices: &VoiceMap) -> CacheRequest {
        CacheRequest::new(
            &segment.text,
            &segment.speaker_id,
            voices.voice_for(&segment.speaker_id),
            &self.params,
        )
    }

    fn canonical_voices(&self, chapter: &Chapter) -> VoiceMap {
        chapter.voices.canonicalize(|name| self.aliases.resolve(name))
    }

    /// Loads state and segments for a chapter that has been attributed.
    async fn attributed(
        &self,
        chapter: &Chapter,
    ) -> Result<(PipelineState, Vec<SpeakerSegment>), PipelineError> {
        let not_attributed = || PipelineError::NotAttributed {
            chapter_id: chapter.id.clone(),
        };
        let state = self.status(&chapter.id).await?.ok_or_else(not_attributed)?;
        if state.stage < Stage::Attributed || state.text_hash != chapter.text_hash() {
            return Err(not_attributed());
        }
        let segments: Vec<SpeakerSegment> = self
            .load_optional(&self.segments_path(&chapter.id))
            .await?
            .ok_or_else(not_attributed)?;
        Ok((state, segments))
    }

    fn checkpoint(&self, chapter_id: &str, next: Stage) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            info!("Chapter {}: cancelled before {}", chapter_id, next);
            return Err(PipelineError::Cancelled {
                chapter_id: chapter_id.to_string(),
                stage: next,
            });
        }
        Ok(())
    }

    async fn transition(&self, state: &mut PipelineState, stage: Stage) -> Result<()> {
        state.advance(stage);
        self.save_state(state).await?;
        info!("Chapter {} -> {}", state.chapter_id, stage);
        Ok(())
    }

    /// Records why the chapter stopped and hands the error back.
    async fn halt(&self, state: &mut PipelineState, target: Stage, err: PipelineError) -> PipelineError {
        let chunk_index = match &err {
            PipelineError::Attribution(e) => Some(e.chunk_index),
            _ => None,
        };
        state.record_failure(FailureRecord {
            target,
            chunk_index,
            segment_indices: err.failed_segments(),
            message: err.to_string(),
            at: Utc::now(),
        });
        if let Err(e) = self.save_state(state).await {
            warn!("Chapter {}: could not persist failure record: {:#}", state.chapter_id, e);
        }
        error!(
            "Chapter {} halted at {} (before {}): {}",
            state.chapter_id, state.stage, target, err
        );
        err
    }

    fn tracker(&self, chapter_id: &str) -> ProgressTracker {
        self.trackers
            .lock()
            .entry(chapter_id.to_string())
            .or_default()
            .clone()
    }

    async fn load_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        if !self.storage.exists(path).await? {
            return Ok(None);
        }
        Ok(Some(io::read_json(self.storage.as_ref(), path).await?))
    }

    async fn save_state(&self, state: &PipelineState) -> Result<()> {
        io::write_json(self.storage.as_ref(), &self.state_path(&state.chapter_id), state).await
    }

    fn chapter_dir(&self, chapter_id: &str) -> String {
        io::join(&self.build_folder, &[chapter_id])
    }

    fn state_path(&self, chapter_id: &str) -> String {
        io::join(&self.chapter_dir(chapter_id), &["state.json"])
    }

    fn chunks_path(&self, chapter_id: &str) -> String {
        io::join(&self.chapter_dir(chapter_id), &["chunks.json"])
    }

    fn journal_dir(&self, chapter_id: &str) -> String {
        io::join(&self.chapter_dir(chapter_id), &["attribution"])
    }

    fn journal_path(&self, chapter_id: &str, chunk_index: usize) -> String {
        io::join(
            &self.journal_dir(chapter_id),
            &[&format!("chunk_{:04}.json", chunk_index)],
        )
    }

    fn segments_path(&self, chapter_id: &str) -> String {
        io::join(&self.chapter_dir(chapter_id), &["segments.json"])
    }

    fn manifest_path(&self, chapter_id: &str) -> String {
        io::join(&self.chapter_dir(chapter_id), &["manifest.json"])
    }

    pub fn output_path(&self, chapter_id: &str) -> String {
        io::join(&self.output_folder, &[&format!("{}.wav", chapter_id)])
    }
}

fn segment_at<'a>(
    chapter_id: &str,
    segments: &'a [SpeakerSegment],
    segment_index: usize,
) -> Result<&'a SpeakerSegment, PipelineError> {
    segments
        .get(segment_index)
        .ok_or_else(|| PipelineError::UnknownSegment {
            chapter_id: chapter_id.to_string(),
            segment_index,
        })
}

/// Rebuilds attribution progress from a persisted segment list.
fn replay_attribution(tracker: &ProgressTracker, total_chunks: usize, segments: &[SpeakerSegment]) {
    tracker.begin_attribution(total_chunks, 0);
    for chunk_index in 0..total_chunks {
        tracker.chunk_completed(
            segments
                .iter()
                .filter(|s| s.chunk_index == chunk_index)
                .map(|s| s.speaker_id.as_str()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ChunkingError;
    use crate::core::io::NativeStorage;
    use crate::services::llm::ChatRequest;
    use crate::utils::audio::test_wav;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Answers every span listed in the prompt: quotes go to `speaker`,
    /// everything else to the narrator.
    #[derive(Debug)]
    struct EchoLlm {
        speaker: String,
        calls: Arc<StdMutex<usize>>,
    }

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn chat(&self, request: &ChatRequest) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            let listing = request.user.split("Spans:\n").nth(1).unwrap_or_default();
            let segments: Vec<serde_json::Value> = listing
                .lines()
                .filter_map(|line| {
                    let (head, text) = line.split_once(") ")?;
                    let id: usize = head.trim_start_matches('[').split(']').next()?.parse().ok()?;
                    let quote = head.ends_with("(quote");
                    Some(serde_json::json!({
                        "id": id,
                        "speaker": if quote { self.speaker.as_str() } else { "Narrator" },
                        "text": text,
                        "kind": if quote { "dialogue" } else { "narration" },
                    }))
                })
                .collect();
            Ok(serde_json::json!({ "segments": segments }).to_string())
        }
    }

    struct MockTts {
        calls: Arc<StdMutex<Vec<String>>>,
        failing: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl TtsClient for MockTts {
        fn name(&self) -> &str {
            "mock"
        }

        async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError> {
            self.calls.lock().unwrap().push(request.text.clone());
            if self.failing.lock().unwrap().contains(&request.text) {
                return Err(SynthesisError::Provider {
                    status: 400,
                    body: "rejected".into(),
                });
            }
            Ok(test_wav(240, 24_000, (request.text.len() % 200) as u8 + 1))
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        llm_calls: Arc<StdMutex<usize>>,
        tts_calls: Arc<StdMutex<Vec<String>>>,
        failing: Arc<StdMutex<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                llm_calls: Arc::new(StdMutex::new(0)),
                tts_calls: Arc::new(StdMutex::new(Vec::new())),
                failing: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn config(&self) -> Config {
            let root = self.dir.path().to_string_lossy();
            let mut config = Config::from_yaml("llm:\n  provider: ollama\n").unwrap();
            config.build_folder = format!("{}/build", root);
            config.output_folder = format!("{}/output", root);
            config.pipeline.cache_folder = format!("{}/cache", root);
            config.pipeline.synthesis_retry.initial_delay_ms = 1;
            config.pipeline.synthesis_retry.jitter_ms = 0;
            config.pipeline.attribution_retry.initial_delay_ms = 1;
            config.transitions.intro_pause_ms = 10;
            config.transitions.outro_pause_ms = 10;
            config
                .speakers
                .aliases
                .insert("Villy".into(), "vilastromoz".into());
            config
        }

        fn pipeline(&self) -> ChapterPipeline {
            self.pipeline_speaking("mage")
        }

        fn pipeline_speaking(&self, speaker: &str) -> ChapterPipeline {
            let llm = Arc::new(EchoLlm {
                speaker: speaker.into(),
                calls: self.llm_calls.clone(),
            });
            let tts = Arc::new(MockTts {
                calls: self.tts_calls.clone(),
                failing: self.failing.clone(),
            });
            ChapterPipeline::from_config(&self.config(), llm, tts, Arc::new(NativeStorage::new()))
                .unwrap()
        }

        fn tts_count(&self) -> usize {
            self.tts_calls.lock().unwrap().len()
        }
    }

    fn chapter(text: &str) -> Chapter {
        Chapter::new("ch1", text, VoiceMap::new("alloy").with_voice("mage", "onyx"))
    }

    const TEXT: &str = "\"It won't!\" he slammed the table. \"Eleven Primas are coming!\"\n\nThe hall fell silent.\n";

    #[tokio::test]
    async fn test_process_runs_all_stages_and_persists_artifacts() -> Result<()> {
        let h = Harness::new();
        let pipeline = h.pipeline();
        let audio = pipeline.process(&chapter(TEXT)).await?;

        let speakers: Vec<&str> = audio.segments.iter().map(|s| s.speaker_id.as_str()).collect();
        assert_eq!(speakers, vec!["mage", "narrator", "mage", "narrator"]);
        assert_eq!(audio.merged.duration_ms, 10 + 4 * 10 + 10);

        let state = pipeline.status("ch1").await?.unwrap();
        assert_eq!(state.stage, Stage::Merged);
        assert!(state.failure.is_none());
        let storage = NativeStorage::new();
        for file in ["chunks.json", "segments.json", "manifest.json"] {
            assert!(storage.exists(&io::join(&pipeline.chapter_dir("ch1"), &[file])).await?);
        }
        assert!(storage.exists(&pipeline.output_path("ch1")).await?);

        let progress = pipeline.progress("ch1").unwrap().snapshot();
        assert_eq!(progress.phase, Phase::Done);
        assert_eq!(progress.speaker_counts.get("mage"), Some(&2));
        assert_eq!(progress.segments_done, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_run_makes_no_external_calls() -> Result<()> {
        let h = Harness::new();
        h.pipeline().process(&chapter(TEXT)).await?;
        let (llm, tts) = (*h.llm_calls.lock().unwrap(), h.tts_count());

        // A fresh pipeline, as after a restart.
        h.pipeline().process(&chapter(TEXT)).await?;
        assert_eq!(*h.llm_calls.lock().unwrap(), llm);
        assert_eq!(h.tts_count(), tts);
        Ok(())
    }

    #[tokio::test]
    async fn test_voice_change_resynthesizes_without_attribution() -> Result<()> {
        let h = Harness::new();
        let pipeline = h.pipeline();
        pipeline.process(&chapter(TEXT)).await?;
        let llm = *h.llm_calls.lock().unwrap();
        let tts = h.tts_count();

        let recast = Chapter::new("ch1", TEXT, VoiceMap::new("alloy").with_voice("mage", "echo"));
        pipeline.process(&recast).await?;
        assert_eq!(*h.llm_calls.lock().unwrap(), llm);
        // Only the two mage lines have new cache keys.
        assert_eq!(h.tts_count(), tts + 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_text_change_starts_over() -> Result<()> {
        let h = Harness::new();
        let pipeline = h.pipeline();
        pipeline.process(&chapter(TEXT)).await?;
        let llm = *h.llm_calls.lock().unwrap();

        let audio = pipeline.process(&chapter("A new beginning.\n")).await?;
        assert_eq!(*h.llm_calls.lock().unwrap(), llm + 1);
        assert_eq!(audio.segments.len(), 1);
        assert_eq!(audio.segments[0].text, "A new beginning.");
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_pipeline_stops_at_stage_boundary() -> Result<()> {
        let h = Harness::new();
        let token = CancellationToken::new();
        token.cancel();
        let pipeline = h.pipeline().with_cancellation(token);

        let err = pipeline.process(&chapter(TEXT)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { stage: Stage::Chunked, .. }));
        assert_eq!(*h.llm_calls.lock().unwrap(), 0);
        assert_eq!(pipeline.status("ch1").await?.unwrap().stage, Stage::New);
        Ok(())
    }

    #[tokio::test]
    async fn test_regenerate_segment_remerges_merged_chapter() -> Result<()> {
        let h = Harness::new();
        let pipeline = h.pipeline();
        let ch = chapter(TEXT);
        pipeline.process(&ch).await?;
        let before = h.tts_count();

        let result = pipeline.regenerate_segment(&ch, 1).await?;
        assert!(result.entry.metadata.regenerated);
        assert_eq!(result.entry.metadata.source_text, "he slammed the table.");
        assert!(result.merged.is_some());
        assert_eq!(h.tts_count(), before + 1);
        assert_eq!(pipeline.status("ch1").await?.unwrap().stage, Stage::Merged);
        Ok(())
    }

    #[tokio::test]
    async fn test_targeted_operations_validate_input() -> Result<()> {
        let h = Harness::new();
        let pipeline = h.pipeline();
        let ch = chapter(TEXT);

        let err = pipeline.retry_segment(&ch, 0).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotAttributed { .. }));

        pipeline.process(&ch).await?;
        let err = pipeline.regenerate_segment(&ch, 99).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownSegment { segment_index: 99, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_attribution_failure_is_recorded() -> Result<()> {
        #[derive(Debug)]
        struct BrokenLlm;

        #[async_trait]
        impl LlmClient for BrokenLlm {
            async fn chat(&self, _request: &ChatRequest) -> Result<String> {
                Ok("I cannot help with that.".to_string())
            }
        }

        let h = Harness::new();
        let tts = Arc::new(MockTts {
            calls: h.tts_calls.clone(),
            failing: h.failing.clone(),
        });
        let pipeline = ChapterPipeline::from_config(
            &h.config(),
            Arc::new(BrokenLlm),
            tts,
            Arc::new(NativeStorage::new()),
        )?;

        let err = pipeline.process(&chapter(TEXT)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Attribution(_)));
        let state = pipeline.status("ch1").await?.unwrap();
        assert_eq!(state.stage, Stage::Chunked);
        let failure = state.failure.unwrap();
        assert_eq!(failure.target, Stage::Attributed);
        assert_eq!(failure.chunk_index, Some(0));
        assert_eq!(pipeline.progress("ch1").unwrap().snapshot().phase, Phase::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_blank_chapter_is_rejected_before_attribution() -> Result<()> {
        let h = Harness::new();
        let pipeline = h.pipeline();

        let err = pipeline.process(&chapter("  \n\n \t\n")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Chunking(ChunkingError::EmptyChapter)));
        assert_eq!(*h.llm_calls.lock().unwrap(), 0);
        assert_eq!(h.tts_count(), 0);
        let state = pipeline.status("ch1").await?.unwrap();
        assert_eq!(state.stage, Stage::New);
        assert_eq!(state.failure.unwrap().target, Stage::Chunked);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_segment_retry_only_resynthesizes_it() -> Result<()> {
        let h = Harness::new();
        let pipeline = h.pipeline();
        let text: String = (0..20).map(|i| format!("Line number {}.\n", i)).collect();
        let ch = chapter(&text);
        h.failing.lock().unwrap().push("Line number 5.".into());

        let err = pipeline.process(&ch).await.unwrap_err();
        assert_eq!(err.failed_segments(), vec![5]);
        assert_eq!(h.tts_count(), 20);
        let state = pipeline.status("ch1").await?.unwrap();
        assert_eq!(state.stage, Stage::Attributed);
        assert_eq!(state.failure.as_ref().unwrap().segment_indices, vec![5]);
        assert!(!NativeStorage::new().exists(&pipeline.output_path("ch1")).await?);

        h.failing.lock().unwrap().clear();
        let audio = pipeline.retry_segment(&ch, 5).await?;
        assert_eq!(h.tts_count(), 21);
        assert_eq!(h.tts_calls.lock().unwrap()[20], "Line number 5.");
        assert_eq!(audio.merged.parts.len(), 22);
        let state = pipeline.status("ch1").await?.unwrap();
        assert_eq!(state.stage, Stage::Merged);
        assert!(state.failure.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_rerun_keeps_speaker_counts() -> Result<()> {
        let h = Harness::new();
        let pipeline = h.pipeline();
        let ch = chapter(TEXT);
        pipeline.process(&ch).await?;
        pipeline.process(&ch).await?;
        pipeline.regenerate_segment(&ch, 0).await?;
        pipeline.process(&ch).await?;

        let progress = pipeline.progress("ch1").unwrap().snapshot();
        assert_eq!(progress.speaker_counts.get("mage"), Some(&2));
        assert_eq!(progress.speaker_counts.get("narrator"), Some(&2));
        assert_eq!(progress.current_chunk, progress.total_chunks);
        Ok(())
    }

    #[tokio::test]
    async fn test_segments_follow_chapter_order_despite_completion_order() -> Result<()> {
        /// Answers later lines first: each call sleeps less the further
        /// into the chapter its chunk sits.
        #[derive(Debug)]
        struct SlowEarlyLlm(EchoLlm);

        #[async_trait]
        impl LlmClient for SlowEarlyLlm {
            async fn chat(&self, request: &ChatRequest) -> Result<String> {
                let line: u64 = request
                    .user
                    .split("Line number ")
                    .nth(1)
                    .and_then(|rest| rest.split('.').next())
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis((12 - line.min(12)) * 10)).await;
                self.0.chat(request).await
            }
        }

        let h = Harness::new();
        let mut config = h.config();
        config.pipeline.chunk_budget_bytes = 20;
        config.pipeline.attribution_concurrency = 8;
        let llm = Arc::new(SlowEarlyLlm(EchoLlm {
            speaker: "mage".into(),
            calls: h.llm_calls.clone(),
        }));
        let tts = Arc::new(MockTts {
            calls: h.tts_calls.clone(),
            failing: h.failing.clone(),
        });
        let pipeline = ChapterPipeline::from_config(&config, llm, tts, Arc::new(NativeStorage::new()))?;

        let text: String = (0..12).map(|i| format!("Line number {}.\n\n", i)).collect();
        let audio = pipeline.process(&chapter(&text)).await?;

        assert_eq!(*h.llm_calls.lock().unwrap(), 12);
        let texts: Vec<String> = audio.segments.iter().map(|s| s.text.clone()).collect();
        let expected: Vec<String> = (0..12).map(|i| format!("Line number {}.", i)).collect();
        assert_eq!(texts, expected);
        for (i, segment) in audio.segments.iter().enumerate() {
            assert_eq!(segment.index, i);
            assert_eq!(segment.chunk_index, i);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_aliases_share_cached_audio() -> Result<()> {
        let h = Harness::new();
        let text = "\"Run!\"\n";
        let first = h.pipeline_speaking("Villy").process(&chapter(text)).await?;
        assert_eq!(first.segments[0].speaker_id, "vilastromoz");
        assert_eq!(h.tts_count(), 1);

        let second = Chapter::new("ch2", text, VoiceMap::new("alloy").with_voice("mage", "onyx"));
        let second = h.pipeline_speaking("vilastromoz").process(&second).await?;
        assert_eq!(second.segments[0].speaker_id, "vilastromoz");
        assert_eq!(h.tts_count(), 1);
        assert_eq!(first.merged.parts[1].key, second.merged.parts[1].key);
        Ok(())
    }
}
