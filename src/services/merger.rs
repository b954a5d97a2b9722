use crate::core::config::TransitionConfig;
use crate::core::error::{IncompleteChapterError, PipelineError};
use crate::core::io::Storage;
use crate::core::model::CacheKey;
use crate::services::cache::SegmentCache;
use crate::utils::audio::{encode_wav, frames_to_duration, silence, WavInfo};
use anyhow::{anyhow, bail, Context};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClipSource {
    Silence { duration_ms: u64 },
    File { path: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TransitionClip {
    pub name: String,
    pub source: ClipSource,
}

/// Fixed clips around the chapter body.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TransitionSet {
    pub leading: Vec<TransitionClip>,
    pub trailing: Vec<TransitionClip>,
}

impl TransitionSet {
    pub fn from_config(config: &TransitionConfig) -> Self {
        let pause = |name: &str, ms: u64| TransitionClip {
            name: name.to_string(),
            source: ClipSource::Silence { duration_ms: ms },
        };

        let mut leading = Vec::new();
        if config.intro_pause_ms > 0 {
            leading.push(pause("intro_pause", config.intro_pause_ms));
        }

        let mut trailing = Vec::new();
        if let Some(path) = &config.announcement {
            trailing.push(TransitionClip {
                name: "announcement".to_string(),
                source: ClipSource::File { path: path.clone() },
            });
        }
        if config.outro_pause_ms > 0 {
            trailing.push(pause("outro_pause", config.outro_pause_ms));
        }

        Self { leading, trailing }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    Transition,
    Segment,
}

/// One constituent of a merged chapter, in playback order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MergePart {
    pub kind: PartKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<CacheKey>,
    pub offset_ms: u64,
    pub duration_ms: u64,
}

/// Merge result, persisted as the chapter manifest.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MergedChapterAudio {
    pub chapter_id: String,
    pub path: String,
    pub duration_ms: u64,
    pub parts: Vec<MergePart>,
}

pub struct AudioMerger {
    storage: Arc<dyn Storage>,
    tolerance: Duration,
}

impl AudioMerger {
    pub fn new(storage: Arc<dyn Storage>, tolerance: Duration) -> Self {
        Self { storage, tolerance }
    }

    /// Concatenates the audio for `keys` (in segment order) between the
    /// transition clips and publishes the result at `output_path`. Every key
    /// must be cached; nothing is written otherwise.
    pub async fn merge(
        &self,
        chapter_id: &str,
        keys: &[CacheKey],
        cache: &SegmentCache,
        transitions: &TransitionSet,
        output_path: &str,
    ) -> Result<MergedChapterAudio, PipelineError> {
        let mut entries = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            match cache.lookup(key).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => missing.push(i),
                Err(e) => {
                    warn!("Cache anomaly during merge of chapter {}: {}", chapter_id, e);
                    missing.push(i);
                }
            }
        }
        if !missing.is_empty() {
            return Err(IncompleteChapterError {
                chapter_id: chapter_id.to_string(),
                missing,
            }
            .into());
        }
        if entries.is_empty() {
            return Err(anyhow!("Chapter {} has no segments to merge", chapter_id).into());
        }

        let mut audio = Vec::with_capacity(entries.len());
        for entry in &entries {
            audio.push(cache.read_audio(entry).await?);
        }
        let infos = audio
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                WavInfo::parse(bytes).with_context(|| format!("segment {} audio", i))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let format = infos[0].clone();
        for (i, info) in infos.iter().enumerate() {
            if info.fmt != format.fmt {
                return Err(anyhow!(
                    "Segment {} of chapter {} has a different WAV format ({} Hz, {} ch) than segment 0 ({} Hz, {} ch)",
                    i,
                    chapter_id,
                    info.sample_rate(),
                    info.channels(),
                    format.sample_rate(),
                    format.channels()
                )
                .into());
            }
        }

        let leading = self.render_clips(&transitions.leading, &format).await?;
        let trailing = self.render_clips(&transitions.trailing, &format).await?;

        let mut parts = Vec::new();
        let mut pcm: Vec<&[u8]> = Vec::new();
        let mut frames: u64 = 0;
        let block_align = format.block_align() as u64;
        let mut push = |kind: PartKind,
                        name: String,
                        segment_index: Option<usize>,
                        key: Option<CacheKey>,
                        data: &[u8],
                        parts: &mut Vec<MergePart>| {
            let part_frames = data.len() as u64 / block_align;
            parts.push(MergePart {
                kind,
                name,
                segment_index,
                key,
                offset_ms: frames_to_duration(frames, format.sample_rate()).as_millis() as u64,
                duration_ms: frames_to_duration(part_frames, format.sample_rate()).as_millis() as u64,
            });
            frames += part_frames;
        };

        for (name, data) in &leading {
            push(PartKind::Transition, name.clone(), None, None, data.as_slice(), &mut parts);
            pcm.push(data.as_slice());
        }
        for (i, (bytes, info)) in audio.iter().zip(&infos).enumerate() {
            let data = info.pcm(bytes);
            push(
                PartKind::Segment,
                format!("segment_{:05}", i),
                Some(i),
                Some(keys[i].clone()),
                data,
                &mut parts,
            );
            pcm.push(data);
        }
        for (name, data) in &trailing {
            push(PartKind::Transition, name.clone(), None, None, data.as_slice(), &mut parts);
            pcm.push(data.as_slice());
        }

        let merged = encode_wav(&format.fmt, &pcm)?;
        let duration = WavInfo::parse(&merged)?.duration();
        let expected: Duration = infos.iter().map(WavInfo::duration).sum::<Duration>()
            + leading
                .iter()
                .chain(trailing.iter())
                .map(|(_, d)| frames_to_duration(d.len() as u64 / block_align, format.sample_rate()))
                .sum::<Duration>();
        let drift = if duration > expected {
            duration - expected
        } else {
            expected - duration
        };
        if drift > self.tolerance {
            return Err(anyhow!(
                "Merged chapter {} is {:?} long, expected {:?} (tolerance {:?})",
                chapter_id,
                duration,
                expected,
                self.tolerance
            )
            .into());
        }

        self.storage.write_atomic(output_path, &merged).await?;
        info!(
            "Merged {} segments of chapter {} into {} ({:.1}s)",
            entries.len(),
            chapter_id,
            output_path,
            duration.as_secs_f64()
        );

        Ok(MergedChapterAudio {
            chapter_id: chapter_id.to_string(),
            path: output_path.to_string(),
            duration_ms: duration.as_millis() as u64,
            parts,
        })
    }

    /// Renders clips as PCM in `format`.
    async fn render_clips(
        &self,
        clips: &[TransitionClip],
        format: &WavInfo,
    ) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut rendered = Vec::with_capacity(clips.len());
        for clip in clips {
            let data = match &clip.source {
                ClipSource::Silence { duration_ms } => {
                    silence(format, Duration::from_millis(*duration_ms))
                }
                ClipSource::File { path } => {
                    let bytes = self
                        .storage
                        .read(path)
                        .await
                        .with_context(|| format!("Transition clip '{}'", clip.name))?;
                    let info = WavInfo::parse(&bytes)
                        .with_context(|| format!("Transition clip '{}' ({})", clip.name, path))?;
                    if info.fmt != format.fmt {
                        bail!(
                            "Transition clip '{}' is {} Hz / {} ch, segments are {} Hz / {} ch",
                            clip.name,
                            info.sample_rate(),
                            info.channels(),
                            format.sample_rate(),
                            format.channels()
                        );
                    }
                    info.pcm(&bytes).to_vec()
                }
            };
            rendered.push((clip.name.clone(), data));
        }
        Ok(rendered)
    }
}
