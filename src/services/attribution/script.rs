use super::spans::{Span, SpanKind};
use crate::core::model::SegmentKind;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

pub const SCHEMA_NAME: &str = "speaker_segments";

pub const SYSTEM_PROMPT: &str = "You attribute lines of fiction to their speakers. \
Return only JSON matching the provided schema. Never rewrite, translate or summarize the text.";

/// One entry of the model's answer, before validation.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RawSegment {
    #[serde(default)]
    pub id: Option<usize>,
    #[serde(default)]
    pub speaker: String,
    pub text: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ResponseShape {
    Wrapped { segments: Vec<RawSegment> },
    Bare(Vec<RawSegment>),
}

pub fn response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "segments": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "integer" },
                        "speaker": { "type": "string" },
                        "text": { "type": "string" },
                        "kind": { "type": "string", "enum": ["dialogue", "narration", "system"] }
                    },
                    "required": ["id", "speaker", "text", "kind"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["segments"],
        "additionalProperties": false
    })
}

pub fn build_prompt(source: &str, spans: &[Span], known_speakers: &[String]) -> String {
    let mut listing = String::new();
    for (i, span) in spans.iter().enumerate() {
        let hint = match span.kind {
            SpanKind::Quote => "quote",
            SpanKind::Narration => "narration",
            SpanKind::Ambiguous => "unclear",
        };
        listing.push_str(&format!("[{}] ({}) {}\n", i, hint, span.text(source)));
    }

    let speakers = if known_speakers.is_empty() {
        "(none yet)".to_string()
    } else {
        known_speakers.join(", ")
    };

    format!(
        "Attribute every numbered span below to the character who says it.\n\
        Rules:\n\
        1. Return one entry per span, in order, with the span number as `id`.\n\
        2. Copy `text` exactly from the span. Do not merge or drop spans.\n\
        3. `kind` is `dialogue` for spoken lines, `narration` for prose, and `system` for \
        game-system notifications (usually in square brackets).\n\
        4. Use `Narrator` as the speaker for narration.\n\
        5. Prefer these known speaker names when they fit: {}\n\
        6. Spans marked `unclear` may mix speech and prose; split them into several entries \
        if needed, still copying the text exactly.\n\
        \n\
        Spans:\n{}",
        speakers, listing
    )
}

/// Parses the model's answer. Code fences are stripped and both a bare array
/// and a `{"segments": [...]}` object are accepted.
pub fn parse_response(response: &str) -> Result<Vec<RawSegment>> {
    let clean_json = strip_code_blocks(response);
    let shape: ResponseShape = serde_json::from_str(&clean_json)
        .with_context(|| format!("Failed to parse attribution JSON: {}", clean_json))?;
    let segments = match shape {
        ResponseShape::Wrapped { segments } => segments,
        ResponseShape::Bare(segments) => segments,
    };
    if segments.is_empty() {
        bail!("Attribution response contains no segments");
    }
    Ok(segments)
}

pub fn parse_kind(kind: &str) -> Result<SegmentKind> {
    match kind.trim().to_lowercase().as_str() {
        "dialogue" | "dialog" | "speech" | "quote" => Ok(SegmentKind::Dialogue),
        "narration" | "narrator" | "description" | "" => Ok(SegmentKind::Narration),
        "system" | "notification" => Ok(SegmentKind::System),
        other => bail!("Unknown segment kind '{}'", other),
    }
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::attribution::spans::split_spans;

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("```json\n[1]\n```"), "[1]");
        assert_eq!(strip_code_blocks("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_blocks("  [1]  "), "[1]");
    }

    #[test]
    fn test_parse_wrapped_and_bare_responses() {
        let wrapped = r#"```json
{"segments": [{"id": 0, "speaker": "mage", "text": "\"Hi\"", "kind": "dialogue"}]}
```"#;
        let bare = r#"[{"id": 0, "speaker": "mage", "text": "\"Hi\"", "kind": "dialogue"}]"#;
        assert_eq!(parse_response(wrapped).unwrap(), parse_response(bare).unwrap());
        assert_eq!(parse_response(bare).unwrap()[0].speaker, "mage");
    }

    #[test]
    fn test_parse_rejects_malformed_and_empty() {
        assert!(parse_response("the mage said hi").is_err());
        assert!(parse_response("[]").is_err());
        assert!(parse_response(r#"{"segments": [{"speaker": "x"}]}"#).is_err());
    }

    #[test]
    fn test_parse_kind_aliases() {
        assert_eq!(parse_kind("Dialogue").unwrap(), SegmentKind::Dialogue);
        assert_eq!(parse_kind("speech").unwrap(), SegmentKind::Dialogue);
        assert_eq!(parse_kind("narrator").unwrap(), SegmentKind::Narration);
        assert_eq!(parse_kind("notification").unwrap(), SegmentKind::System);
        assert!(parse_kind("song").is_err());
    }

    #[test]
    fn test_prompt_numbers_spans_and_lists_speakers() {
        let text = "\"Run!\" Jake shouted.";
        let spans = split_spans(text);
        let prompt = build_prompt(text, &spans, &["Jake".to_string()]);
        assert!(prompt.contains("[0] (quote) \"Run!\""));
        assert!(prompt.contains("[1] (narration) Jake shouted."));
        assert!(prompt.contains("known speaker names when they fit: Jake"));
    }
}
