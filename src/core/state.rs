use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages in the order a chapter passes through them.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    New,
    Chunked,
    Attributed,
    SegmentsReady,
    Merged,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::New => "new",
            Stage::Chunked => "chunked",
            Stage::Attributed => "attributed",
            Stage::SegmentsReady => "segments_ready",
            Stage::Merged => "merged",
        };
        f.write_str(name)
    }
}

/// Why a chapter stopped short of its next stage.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FailureRecord {
    /// The stage the pipeline was trying to reach.
    pub target: Stage,
    #[serde(default)]
    pub chunk_index: Option<usize>,
    #[serde(default)]
    pub segment_indices: Vec<usize>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Persisted per-chapter progress marker (`build/<chapter>/state.json`).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PipelineState {
    pub chapter_id: String,
    pub text_hash: String,
    #[serde(default)]
    pub voices_hash: String,
    pub stage: Stage,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
}

impl PipelineState {
    pub fn new(chapter_id: &str, text_hash: &str, voices_hash: &str) -> Self {
        Self {
            chapter_id: chapter_id.to_string(),
            text_hash: text_hash.to_string(),
            voices_hash: voices_hash.to_string(),
            stage: Stage::New,
            updated_at: Utc::now(),
            failure: None,
        }
    }

    /// Moves forward to `stage`. Never moves backwards.
    pub fn advance(&mut self, stage: Stage) {
        if stage > self.stage {
            self.stage = stage;
        }
        self.failure = None;
        self.updated_at = Utc::now();
    }

    /// Drops back to `stage` because an input the later stages depend on changed.
    pub fn rewind(&mut self, stage: Stage) {
        if stage < self.stage {
            self.stage = stage;
            self.updated_at = Utc::now();
        }
    }

    pub fn record_failure(&mut self, failure: FailureRecord) {
        self.failure = Some(failure);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let mut state = PipelineState::new("ch1", "abc", "def");
        state.advance(Stage::Attributed);
        state.advance(Stage::Chunked);
        assert_eq!(state.stage, Stage::Attributed);
    }

    #[test]
    fn test_advance_clears_failure() {
        let mut state = PipelineState::new("ch1", "abc", "def");
        state.advance(Stage::Attributed);
        state.record_failure(FailureRecord {
            target: Stage::SegmentsReady,
            chunk_index: None,
            segment_indices: vec![3],
            message: "boom".into(),
            at: Utc::now(),
        });
        state.advance(Stage::SegmentsReady);
        assert!(state.failure.is_none());
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::SegmentsReady).unwrap();
        assert_eq!(json, "\"segments_ready\"");
        assert_eq!(Stage::SegmentsReady.to_string(), "segments_ready");
    }
}
