//! Live, per-chapter progress record.
//!
//! The coordinator owns a [`ProgressTracker`] for each chapter it runs and
//! hands out [`ProgressHandle`]s, which can only read snapshots. Reads take a
//! short read lock and never wait on pipeline work.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Chunking,
    Attributing,
    Synthesizing,
    Merging,
    Done,
    Failed,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub current_chunk: usize,
    pub total_chunks: usize,
    pub speaker_counts: BTreeMap<String, usize>,
    pub segments_done: usize,
    pub segments_total: usize,
    pub error: Option<String>,
}

#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<ProgressSnapshot>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> ProgressHandle {
        ProgressHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn set_phase(&self, phase: Phase) {
        self.inner.write().phase = phase;
    }

    /// Starts a fresh count; callers report every chunk again, journaled or not.
    pub fn begin_attribution(&self, total_chunks: usize, already_done: usize) {
        let mut p = self.inner.write();
        p.phase = Phase::Attributing;
        p.total_chunks = total_chunks;
        p.current_chunk = already_done;
        p.speaker_counts.clear();
        p.error = None;
    }

    /// Records one finished chunk and the speakers it produced.
    pub fn chunk_completed<'a>(&self, speakers: impl IntoIterator<Item = &'a str>) {
        let mut p = self.inner.write();
        p.current_chunk += 1;
        for speaker in speakers {
            *p.speaker_counts.entry(speaker.to_string()).or_default() += 1;
        }
    }

    pub fn begin_synthesis(&self, total_segments: usize) {
        let mut p = self.inner.write();
        p.phase = Phase::Synthesizing;
        p.segments_total = total_segments;
        p.segments_done = 0;
    }

    pub fn segment_completed(&self) {
        self.inner.write().segments_done += 1;
    }

    pub fn fail(&self, message: impl Into<String>) {
        let mut p = self.inner.write();
        p.phase = Phase::Failed;
        p.error = Some(message.into());
    }
}

/// Read-only view of a chapter's progress.
#[derive(Clone)]
pub struct ProgressHandle {
    inner: Arc<RwLock<ProgressSnapshot>>,
}

impl ProgressHandle {
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.read().clone()
    }
}
