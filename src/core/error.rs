//! Error taxonomy for the chapter pipeline.
//!
//! Component errors are small, cloneable values so they can be shared between
//! the callers of one single-flight generation. `PipelineError` is what the
//! coordinator surfaces to its callers.

use crate::core::state::Stage;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkingError {
    #[error("chunk budget must be greater than zero")]
    ZeroBudget,

    #[error("chapter has no text to voice")]
    EmptyChapter,

    #[error("chunks do not tile the chapter text (gap or overlap at byte {offset})")]
    Tiling { offset: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("attribution failed for chunk {chunk_index} after {attempts} attempt(s): {reason}")]
pub struct AttributionError {
    pub chunk_index: usize,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("provider rate limited the request: {0}")]
    RateLimited(String),

    #[error("provider call timed out after {0}s")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("provider rejected the request: {0}")]
    Rejected(String),

    #[error("provider returned malformed audio: {0}")]
    MalformedAudio(String),

    #[error("cache storage error: {0}")]
    Storage(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<SynthesisError>,
    },
}

impl SynthesisError {
    /// Whether another attempt against the provider could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SynthesisError::RateLimited(_)
            | SynthesisError::Timeout(_)
            | SynthesisError::Transport(_) => true,
            SynthesisError::Provider { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("chapter {chapter_id} is missing audio for segment(s) {missing:?}")]
pub struct IncompleteChapterError {
    pub chapter_id: String,
    pub missing: Vec<usize>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cache entry {key} is corrupt: {reason}")]
pub struct CacheCorruptionError {
    pub key: String,
    pub reason: String,
}

/// One segment that could not be synthesized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFailure {
    pub segment_index: usize,
    pub error: SynthesisError,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Chunking(#[from] ChunkingError),

    #[error(transparent)]
    Attribution(#[from] AttributionError),

    #[error("synthesis failed for chapter {chapter_id}, segment(s) {}: {}", failed_indices(.failures), first_reason(.failures))]
    Synthesis {
        chapter_id: String,
        failures: Vec<SegmentFailure>,
    },

    #[error(transparent)]
    Incomplete(#[from] IncompleteChapterError),

    #[error("chapter {chapter_id} was cancelled before stage {stage}")]
    Cancelled { chapter_id: String, stage: Stage },

    #[error("chapter {chapter_id} has no segment {segment_index}")]
    UnknownSegment {
        chapter_id: String,
        segment_index: usize,
    },

    #[error("chapter {chapter_id} has not been attributed yet")]
    NotAttributed { chapter_id: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    /// Segment indices a targeted retry should address, if any.
    pub fn failed_segments(&self) -> Vec<usize> {
        match self {
            PipelineError::Synthesis { failures, .. } => {
                failures.iter().map(|f| f.segment_index).collect()
            }
            PipelineError::Incomplete(e) => e.missing.clone(),
            _ => Vec::new(),
        }
    }
}

fn failed_indices(failures: &[SegmentFailure]) -> String {
    failures
        .iter()
        .map(|f| f.segment_index.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn first_reason(failures: &[SegmentFailure]) -> String {
    failures
        .first()
        .map(|f| f.error.to_string())
        .unwrap_or_default()
}
