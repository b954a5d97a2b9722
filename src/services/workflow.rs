use crate::core::config::Config;
use crate::core::error::PipelineError;
use crate::core::io::{self, Storage};
use crate::core::model::{Chapter, VoiceMap};
use crate::core::progress::{Phase, ProgressSnapshot};
use crate::services::pipeline::{ChapterAudio, ChapterPipeline};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const VOICE_MAP_FILE: &str = "voice_map.json";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub stopped_early: bool,
}

/// Runs every chapter in the input folder through a [`ChapterPipeline`].
pub struct WorkflowManager {
    config: Config,
    pipeline: Arc<ChapterPipeline>,
    storage: Arc<dyn Storage>,
    voice_map: VoiceMap,
}

impl WorkflowManager {
    pub async fn new(
        config: Config,
        pipeline: Arc<ChapterPipeline>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let voice_map = Self::load_voice_map(&config, storage.as_ref()).await?;
        Ok(Self {
            config,
            pipeline,
            storage,
            voice_map,
        })
    }

    pub fn pipeline(&self) -> &ChapterPipeline {
        &self.pipeline
    }

    pub fn voice_map(&self) -> &VoiceMap {
        &self.voice_map
    }

    /// The map saved by earlier runs, with configured voices on top.
    async fn load_voice_map(config: &Config, storage: &dyn Storage) -> Result<VoiceMap> {
        let mut map = VoiceMap::new(config.audio.default_voice.clone());
        let path = io::join(&config.build_folder, &[VOICE_MAP_FILE]);
        if storage.exists(&path).await? {
            let saved: VoiceMap = io::read_json(storage, &path).await?;
            map.voices.extend(saved.voices);
        }
        map.voices
            .extend(config.audio.voices.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(map)
    }

    async fn save_voice_map(&self) -> Result<()> {
        let path = io::join(&self.config.build_folder, &[VOICE_MAP_FILE]);
        io::write_json(self.storage.as_ref(), &path, &self.voice_map).await
    }

    /// Chapter IDs in the input folder, in file-name order.
    pub async fn chapter_ids(&self) -> Result<Vec<String>> {
        let entries = self.storage.list(&self.config.input_folder).await?;
        let mut ids: Vec<String> = entries
            .iter()
            .filter(|e| e.ends_with(".txt"))
            .filter_map(|e| Path::new(e).file_stem())
            .map(|stem| stem.to_string_lossy().to_string())
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub async fn load_chapter(&self, chapter_id: &str) -> Result<Chapter> {
        let path = io::join(&self.config.input_folder, &[&format!("{}.txt", chapter_id)]);
        let bytes = self
            .storage
            .read(&path)
            .await
            .with_context(|| format!("Chapter {} not found in {}", chapter_id, self.config.input_folder))?;
        let text = String::from_utf8(bytes).with_context(|| format!("{} is not UTF-8", path))?;
        Ok(Chapter::new(chapter_id, text, self.voice_map.clone()))
    }

    pub async fn run(&mut self) -> Result<RunSummary> {
        let ids = self.chapter_ids().await?;
        let mut summary = RunSummary::default();
        if ids.is_empty() {
            warn!("No .txt chapters found in {}", self.config.input_folder);
            return Ok(summary);
        }

        for (i, id) in ids.iter().enumerate() {
            let chapter = self.load_chapter(id).await?;
            println!("Processing chapter: {}", id);

            match self.process_with_progress(&chapter).await {
                Ok(audio) => {
                    println!("Chapter complete: {}", audio.merged.path);
                    self.register_speakers(&audio).await?;
                    summary.completed.push(id.clone());
                }
                Err(PipelineError::Cancelled { .. }) => {
                    println!("Cancelled, stopping.");
                    summary.stopped_early = true;
                    break;
                }
                Err(e) => {
                    error!("Chapter {} failed: {}", id, e);
                    let failed = e.failed_segments();
                    if !failed.is_empty() {
                        println!(
                            "Chapter {} has {} failed segment(s): {:?}. Use `retry {} <segment>` once the cause is fixed.",
                            id,
                            failed.len(),
                            failed,
                            id
                        );
                    }
                    summary.failed.push(id.clone());
                }
            }

            if !self.config.unattended && i + 1 < ids.len() {
                let ans = inquire::Confirm::new("Continue to next chapter?")
                    .with_default(true)
                    .prompt();
                match ans {
                    Ok(true) => {}
                    Ok(false) => {
                        println!("Stopping as requested.");
                        summary.stopped_early = true;
                        break;
                    }
                    Err(_) => {
                        println!("Error reading input, stopping.");
                        summary.stopped_early = true;
                        break;
                    }
                }
            }
        }

        info!(
            "Run finished: {} completed, {} failed",
            summary.completed.len(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Drives one chapter while a progress bar polls its live snapshot.
    pub async fn process_with_progress(&self, chapter: &Chapter) -> Result<ChapterAudio, PipelineError> {
        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {msg:14} [{bar:40.cyan/blue}] {pos}/{len}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let process = self.pipeline.process(chapter);
        tokio::pin!(process);
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        let result = loop {
            tokio::select! {
                result = &mut process => break result,
                _ = ticker.tick() => {
                    if let Some(handle) = self.pipeline.progress(&chapter.id) {
                        render(&pb, &handle.snapshot());
                    }
                }
            }
        };

        if let Some(handle) = self.pipeline.progress(&chapter.id) {
            render(&pb, &handle.snapshot());
        }
        match &result {
            Ok(_) => pb.finish_with_message("done"),
            Err(_) => pb.abandon_with_message("failed"),
        }
        result
    }

    /// Adds speakers seen for the first time to the saved voice map, mapped
    /// to the default voice, so they can be recast by editing the file.
    async fn register_speakers(&mut self, audio: &ChapterAudio) -> Result<()> {
        let aliases = self.pipeline.aliases();
        let known: Vec<String> = self
            .voice_map
            .voices
            .keys()
            .map(|name| aliases.resolve(name))
            .collect();

        let mut added = Vec::new();
        for segment in &audio.segments {
            let speaker = &segment.speaker_id;
            if speaker == aliases.narrator()
                || speaker == aliases.system()
                || known.contains(speaker)
                || added.contains(speaker)
            {
                continue;
            }
            added.push(speaker.clone());
        }
        if added.is_empty() {
            return Ok(());
        }

        info!("New speakers: {}", added.join(", "));
        for speaker in added {
            let voice = self.voice_map.default_voice.clone();
            self.voice_map.voices.insert(speaker, voice);
        }
        self.save_voice_map().await
    }
}

fn render(pb: &ProgressBar, snapshot: &ProgressSnapshot) {
    match snapshot.phase {
        Phase::Attributing => {
            pb.set_length(snapshot.total_chunks as u64);
            pb.set_position(snapshot.current_chunk as u64);
            pb.set_message("attributing");
        }
        Phase::Synthesizing => {
            pb.set_length(snapshot.segments_total as u64);
            pb.set_position(snapshot.segments_done as u64);
            pb.set_message("synthesizing");
        }
        Phase::Chunking => pb.set_message("chunking"),
        Phase::Merging => pb.set_message("merging"),
        Phase::Idle | Phase::Done | Phase::Failed => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SynthesisError;
    use crate::core::io::NativeStorage;
    use crate::services::llm::{ChatRequest, LlmClient};
    use crate::services::tts::{SynthesisRequest, TtsClient};
    use crate::utils::audio::test_wav;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct MockLlmClient {
        call_count: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn chat(&self, request: &ChatRequest) -> Result<String> {
            *self.call_count.lock().unwrap() += 1;
            if request.user.contains("Hello there") {
                return Ok(r#"{"segments": [
                    {"id": 0, "speaker": "Jake", "text": "\"Hello there.\"", "kind": "dialogue"},
                    {"id": 1, "speaker": "Narrator", "text": "Jake waved.", "kind": "narration"}
                ]}"#
                .to_string());
            }
            Ok(r#"{"segments": [{"id": 0, "speaker": "Narrator", "text": "Rain fell.", "kind": "narration"}]}"#.to_string())
        }
    }

    struct MockTtsClient {
        fail_on: Option<String>,
    }

    #[async_trait]
    impl TtsClient for MockTtsClient {
        fn name(&self) -> &str {
            "mock"
        }

        async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError> {
            if self.fail_on.as_deref() == Some(request.text.as_str()) {
                return Err(SynthesisError::Provider {
                    status: 400,
                    body: "Mock TTS error".into(),
                });
            }
            Ok(test_wav(240, 24_000, 1))
        }
    }

    async fn setup(fail_on: Option<&str>) -> Result<(tempfile::TempDir, WorkflowManager, Arc<Mutex<usize>>)> {
        let temp_dir = tempfile::tempdir()?;
        let root = temp_dir.path();
        let input_dir = root.join("input");
        fs::create_dir_all(&input_dir)?;
        fs::write(input_dir.join("ch02.txt"), "Rain fell.\n")?;
        fs::write(input_dir.join("ch01.txt"), "\"Hello there.\" Jake waved.\n")?;
        fs::write(input_dir.join("notes.md"), "not a chapter")?;

        let mut config = Config::from_yaml("llm:\n  provider: ollama\nunattended: true\n")?;
        config.input_folder = input_dir.to_string_lossy().to_string();
        config.output_folder = root.join("output").to_string_lossy().to_string();
        config.build_folder = root.join("build").to_string_lossy().to_string();
        config.pipeline.cache_folder = root.join("cache").to_string_lossy().to_string();
        config.audio.voices.insert("Narrator".into(), "fable".into());

        let call_count = Arc::new(Mutex::new(0));
        let llm = Arc::new(MockLlmClient {
            call_count: call_count.clone(),
        });
        let tts = Arc::new(MockTtsClient {
            fail_on: fail_on.map(str::to_string),
        });
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
        let pipeline = Arc::new(ChapterPipeline::from_config(&config, llm, tts, storage.clone())?);
        let workflow = WorkflowManager::new(config, pipeline, storage).await?;
        Ok((temp_dir, workflow, call_count))
    }

    #[tokio::test]
    async fn test_run_processes_chapters_in_order() -> Result<()> {
        let (temp_dir, mut workflow, call_count) = setup(None).await?;
        let ids = workflow.chapter_ids().await?;
        assert_eq!(ids, vec!["ch01", "ch02"]);

        let summary = workflow.run().await?;
        assert_eq!(summary.completed, vec!["ch01", "ch02"]);
        assert!(summary.failed.is_empty());
        assert_eq!(*call_count.lock().unwrap(), 2);
        assert!(temp_dir.path().join("output").join("ch01.wav").exists());
        assert!(temp_dir.path().join("output").join("ch02.wav").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_new_speakers_are_saved_with_default_voice() -> Result<()> {
        let (temp_dir, mut workflow, _) = setup(None).await?;
        workflow.run().await?;

        assert_eq!(workflow.voice_map().voice_for("Jake"), "alloy");
        let saved = fs::read_to_string(temp_dir.path().join("build").join(VOICE_MAP_FILE))?;
        assert!(saved.contains("\"Jake\""));
        assert!(!saved.contains("\"narrator\""));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_chapter_does_not_stop_the_run() -> Result<()> {
        let (_temp_dir, mut workflow, _) = setup(Some("Jake waved.")).await?;
        let summary = workflow.run().await?;
        assert_eq!(summary.failed, vec!["ch01"]);
        assert_eq!(summary.completed, vec!["ch02"]);

        let state = workflow.pipeline().status("ch01").await?.unwrap();
        assert_eq!(state.failure.unwrap().segment_indices, vec![1]);
        Ok(())
    }
}
