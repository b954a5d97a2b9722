//! Speaker attribution for one chunk at a time.
//!
//! The chunk is split into quote and narration spans by a regex pre-pass, the
//! language model labels them, and its answer is aligned back onto the source
//! text character by character (whitespace ignored). Segment text always
//! comes from the source, never from the model. An entry that swallows
//! several spans is split back on span boundaries, so a collapsed
//! `"quote" narration "quote"` answer still yields three segments.

pub mod script;
pub mod spans;

use crate::core::error::AttributionError;
use crate::core::model::{SegmentKind, SpeakerSegment, TextChunk};
use crate::core::retry::RetryPolicy;
use crate::services::alias::AliasResolver;
use crate::services::llm::{ChatRequest, LlmClient};
use anyhow::{anyhow, bail, Result};
use log::{debug, warn};
use script::RawSegment;
use serde::{Deserialize, Serialize};
use spans::{Span, SpanKind};
use std::sync::Arc;
use std::time::Duration;

/// A finished attribution for part of a chunk. Offsets are chapter offsets.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AttributedSpan {
    pub speaker_id: String,
    pub kind: SegmentKind,
    pub text: String,
    pub start: usize,
    pub end: usize,
    #[serde(default)]
    pub needs_review: bool,
}

pub struct AttributionClient {
    llm: Arc<dyn LlmClient>,
    aliases: Arc<AliasResolver>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl AttributionClient {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        aliases: Arc<AliasResolver>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            aliases,
            retry,
            timeout,
        }
    }

    pub async fn attribute_chunk(
        &self,
        chunk: &TextChunk,
        known_speakers: &[String],
    ) -> Result<Vec<AttributedSpan>, AttributionError> {
        let spans = spans::split_spans(&chunk.text);
        if spans.is_empty() {
            return Ok(Vec::new());
        }
        for span in spans.iter().filter(|s| s.kind == SpanKind::Ambiguous) {
            warn!(
                "Chapter {} chunk {}: unpaired quotes, sending paragraph whole and flagging for review: {:.60}",
                chunk.chapter_id,
                chunk.index,
                span.text(&chunk.text)
            );
        }

        let request = ChatRequest::new(
            script::SYSTEM_PROMPT,
            script::build_prompt(&chunk.text, &spans, known_speakers),
        )
        .with_schema(script::SCHEMA_NAME, script::response_schema());

        let label = format!("Attribution of chapter {} chunk {}", chunk.chapter_id, chunk.index);
        let result = self
            .retry
            .run(
                &label,
                |attempt| {
                    let request = &request;
                    let spans = &spans;
                    let label = &label;
                    async move {
                        debug!("{} (attempt {})", label, attempt);
                        let response = tokio::time::timeout(self.timeout, self.llm.chat(request))
                            .await
                            .map_err(|_| anyhow!("timed out after {:?}", self.timeout))??;
                        let raw = script::parse_response(&response)?;
                        self.align(chunk, spans, &raw)
                    }
                },
                |_| true,
            )
            .await;

        result.map_err(|e| AttributionError {
            chunk_index: chunk.index,
            attempts: e.attempts,
            reason: format!("{:#}", e.last),
        })
    }

    /// Maps each response entry onto the source text and splits it on span
    /// boundaries.
    fn align(
        &self,
        chunk: &TextChunk,
        spans: &[Span],
        raw: &[RawSegment],
    ) -> Result<Vec<AttributedSpan>> {
        let source = &chunk.text;
        let chars: Vec<(usize, char)> = source
            .char_indices()
            .filter(|(_, c)| !c.is_whitespace())
            .collect();

        let mut cursor = 0;
        let mut out = Vec::new();
        for (n, entry) in raw.iter().enumerate() {
            let wanted: Vec<char> = entry.text.chars().filter(|c| !c.is_whitespace()).collect();
            if wanted.is_empty() {
                bail!("response segment {} is empty", n);
            }
            let end = cursor + wanted.len();
            let matches = end <= chars.len()
                && chars[cursor..end].iter().map(|(_, c)| *c).eq(wanted.iter().copied());
            if !matches {
                bail!(
                    "response segment {} does not match the source text at character {}: {:?}",
                    n,
                    cursor,
                    entry.text
                );
            }

            let (first_byte, _) = chars[cursor];
            let (last_byte, last_char) = chars[end - 1];
            let range = first_byte..last_byte + last_char.len_utf8();
            cursor = end;

            let kind = script::parse_kind(&entry.kind)?;
            for span in spans {
                let start = span.start.max(range.start);
                let stop = span.end.min(range.end);
                if start >= stop {
                    continue;
                }
                let piece = source[start..stop].trim();
                if piece.is_empty() {
                    continue;
                }
                let lead = source[start..stop].len() - source[start..stop].trim_start().len();
                let start = start + lead;
                let (speaker_id, kind, needs_review) = self.assign(span.kind, &entry.speaker, kind);
                out.push(AttributedSpan {
                    speaker_id,
                    kind,
                    text: piece.to_string(),
                    start: chunk.start + start,
                    end: chunk.start + start + piece.len(),
                    needs_review,
                });
            }
        }

        if cursor != chars.len() {
            bail!(
                "response covers {} of {} source characters",
                cursor,
                chars.len()
            );
        }
        Ok(out)
    }

    fn assign(&self, span: SpanKind, speaker: &str, kind: SegmentKind) -> (String, SegmentKind, bool) {
        let narrator = self.aliases.narrator().to_string();
        let system = self.aliases.system().to_string();
        match (span, kind) {
            (_, SegmentKind::System) => (system, SegmentKind::System, span == SpanKind::Ambiguous),
            (SpanKind::Narration, _) => (narrator, SegmentKind::Narration, false),
            (SpanKind::Quote, _) | (SpanKind::Ambiguous, _) => {
                let speaker_id = self.aliases.resolve(speaker);
                let kind = if speaker_id == narrator {
                    SegmentKind::Narration
                } else {
                    SegmentKind::Dialogue
                };
                (speaker_id, kind, span == SpanKind::Ambiguous)
            }
        }
    }
}

/// Numbers per-chunk results into one chapter-wide segment list. `per_chunk`
/// must be ordered by chunk index.
pub fn assemble_segments(chapter_id: &str, per_chunk: &[Vec<AttributedSpan>]) -> Vec<SpeakerSegment> {
    let mut segments = Vec::new();
    for (chunk_index, spans) in per_chunk.iter().enumerate() {
        for span in spans {
            segments.push(SpeakerSegment {
                chapter_id: chapter_id.to_string(),
                index: segments.len(),
                chunk_index,
                speaker_id: span.speaker_id.clone(),
                kind: span.kind,
                text: span.text.clone(),
                start: span.start,
                end: span.end,
                needs_review: span.needs_review,
            });
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::SpeakerConfig;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct ScriptedLlm {
        replies: Mutex<VecDeque<String>>,
        calls: Arc<Mutex<usize>>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _request: &ChatRequest) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("no more replies"))
        }
    }

    fn client(llm: Arc<ScriptedLlm>, aliases: &[(&str, &str)]) -> AttributionClient {
        let config = SpeakerConfig {
            aliases: aliases
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            ..SpeakerConfig::default()
        };
        AttributionClient::new(
            llm,
            Arc::new(AliasResolver::new(&config).unwrap()),
            RetryPolicy::new(3, Duration::from_millis(1), 2.0),
            Duration::from_secs(5),
        )
    }

    fn chunk(text: &str) -> TextChunk {
        TextChunk {
            chapter_id: "ch1".into(),
            index: 0,
            start: 100,
            end: 100 + text.len(),
            text: text.into(),
            oversized: false,
        }
    }

    const COLLAPSE: &str = "\"It won't!\" he slammed the table. \"Eleven Primas are coming!\"";

    #[tokio::test]
    async fn test_collapsed_response_is_split_on_span_boundaries() {
        let reply = serde_json::json!({
            "segments": [{ "id": 0, "speaker": "mage", "text": COLLAPSE, "kind": "dialogue" }]
        })
        .to_string();
        let llm = Arc::new(ScriptedLlm::new(&[&reply]));
        let spans = client(llm, &[]).attribute_chunk(&chunk(COLLAPSE), &[]).await.unwrap();

        let got: Vec<(&str, SegmentKind, &str)> = spans
            .iter()
            .map(|s| (s.speaker_id.as_str(), s.kind, s.text.as_str()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("mage", SegmentKind::Dialogue, "\"It won't!\""),
                ("narrator", SegmentKind::Narration, "he slammed the table."),
                ("mage", SegmentKind::Dialogue, "\"Eleven Primas are coming!\""),
            ]
        );
        assert_eq!(spans[0].start, 100);
        assert_eq!(&COLLAPSE[spans[1].start - 100..spans[1].end - 100], "he slammed the table.");
    }

    #[tokio::test]
    async fn test_aliases_are_resolved() {
        let text = "\"Hello, Jake.\" The Viper smiled.";
        let reply = r#"[
            {"id": 0, "speaker": "Villy", "text": "\"Hello, Jake.\"", "kind": "dialogue"},
            {"id": 1, "speaker": "Narrator", "text": "The Viper smiled.", "kind": "narration"}
        ]"#;
        let llm = Arc::new(ScriptedLlm::new(&[reply]));
        let spans = client(llm, &[("Villy", "vilastromoz")])
            .attribute_chunk(&chunk(text), &[])
            .await
            .unwrap();
        assert_eq!(spans[0].speaker_id, "vilastromoz");
        assert_eq!(spans[1].speaker_id, "narrator");
    }

    #[tokio::test]
    async fn test_invalid_response_is_retried() {
        let text = "\"Go.\" She left.";
        let good = r#"[
            {"id": 0, "speaker": "Miranda", "text": "\"Go.\"", "kind": "dialogue"},
            {"id": 1, "speaker": "Narrator", "text": "She left.", "kind": "narration"}
        ]"#;
        let rewritten = r#"[{"id": 0, "speaker": "Miranda", "text": "Go away.", "kind": "dialogue"}]"#;
        let llm = Arc::new(ScriptedLlm::new(&["not json", rewritten, good]));
        let calls = llm.calls.clone();
        let spans = client(llm, &[]).attribute_chunk(&chunk(text), &[]).await.unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_name_the_chunk() {
        let text = "\"Go.\" She left.";
        let partial = r#"[{"id": 0, "speaker": "Miranda", "text": "\"Go.\"", "kind": "dialogue"}]"#;
        let llm = Arc::new(ScriptedLlm::new(&[partial, partial, partial]));
        let err = client(llm, &[]).attribute_chunk(&chunk(text), &[]).await.unwrap_err();
        assert_eq!(err.chunk_index, 0);
        assert_eq!(err.attempts, 3);
        assert!(err.reason.contains("covers"), "{}", err.reason);
    }

    #[tokio::test]
    async fn test_ambiguous_paragraph_is_flagged() {
        let text = "\"Wait, he said, this is wrong.";
        let reply = r#"[
            {"id": 0, "speaker": "Jake", "text": "\"Wait,", "kind": "dialogue"},
            {"id": 1, "speaker": "Narrator", "text": "he said,", "kind": "narration"},
            {"id": 2, "speaker": "Jake", "text": "this is wrong.", "kind": "dialogue"}
        ]"#;
        let llm = Arc::new(ScriptedLlm::new(&[reply]));
        let spans = client(llm, &[]).attribute_chunk(&chunk(text), &[]).await.unwrap();
        assert_eq!(spans.len(), 3);
        assert!(spans.iter().all(|s| s.needs_review));
        assert_eq!(spans[1].speaker_id, "narrator");
        assert_eq!(spans[1].kind, SegmentKind::Narration);
    }

    #[tokio::test]
    async fn test_whitespace_only_chunk_skips_the_model() {
        let llm = Arc::new(ScriptedLlm::new(&[]));
        let calls = llm.calls.clone();
        let spans = client(llm, &[]).attribute_chunk(&chunk("  \n\n "), &[]).await.unwrap();
        assert!(spans.is_empty());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_assemble_numbers_segments_across_chunks() {
        let span = |text: &str| AttributedSpan {
            speaker_id: "narrator".into(),
            kind: SegmentKind::Narration,
            text: text.into(),
            start: 0,
            end: text.len(),
            needs_review: false,
        };
        let segments = assemble_segments("ch1", &[vec![span("a"), span("b")], vec![], vec![span("c")]]);
        let indices: Vec<(usize, usize)> = segments.iter().map(|s| (s.index, s.chunk_index)).collect();
        assert_eq!(indices, vec![(0, 0), (1, 0), (2, 2)]);
    }
}
