//! Deterministic pre-pass that splits a chunk into quoted utterances and
//! narration before the language model sees it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static QUOTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[^"\n]*"|“[^“”\n]*”|「[^「」\n]*」|『[^『』\n]*』"#).unwrap());

const QUOTE_MARKS: [char; 7] = ['"', '“', '”', '「', '」', '『', '』'];

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Quote,
    Narration,
    /// A line whose quote marks could not be paired. Sent whole.
    Ambiguous,
}

/// Byte range of `text` that starts and ends on non-whitespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub kind: SpanKind,
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

fn trimmed(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead + trail >= slice.len() {
        None
    } else {
        Some((start + lead, end - trail))
    }
}

/// Splits `text` into ordered, disjoint spans covering all of its
/// non-whitespace content.
pub fn split_spans(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut line_start = 0;
    for line in text.split_inclusive('\n') {
        let line_end = line_start + line.len();
        split_line(text, line_start, line_end, &mut spans);
        line_start = line_end;
    }
    spans
}

fn split_line(text: &str, line_start: usize, line_end: usize, out: &mut Vec<Span>) {
    let line = &text[line_start..line_end];
    let mut line_spans: Vec<Span> = Vec::new();
    // Punctuation-only text before the first quote, e.g. a leading dash.
    let mut pending: Option<usize> = None;
    let mut cursor = 0;

    let gap = |from: usize,
               to: usize,
               line_spans: &mut Vec<Span>,
               pending: &mut Option<usize>|
     -> bool {
        let Some((s, e)) = trimmed(text, line_start + from, line_start + to) else {
            return true;
        };
        let gap_text = &text[s..e];
        if gap_text.contains(&QUOTE_MARKS[..]) {
            return false;
        }
        if gap_text.chars().any(char::is_alphanumeric) {
            line_spans.push(Span {
                kind: SpanKind::Narration,
                start: pending.take().unwrap_or(s),
                end: e,
            });
        } else if let Some(prev) = line_spans.last_mut() {
            prev.end = e;
        } else if pending.is_none() {
            *pending = Some(s);
        }
        true
    };

    let mut paired = true;
    for m in QUOTE_RE.find_iter(line) {
        if !gap(cursor, m.start(), &mut line_spans, &mut pending) {
            paired = false;
            break;
        }
        line_spans.push(Span {
            kind: SpanKind::Quote,
            start: pending.take().unwrap_or(line_start + m.start()),
            end: line_start + m.end(),
        });
        cursor = m.end();
    }
    if paired && !gap(cursor, line.len(), &mut line_spans, &mut pending) {
        paired = false;
    }

    if !paired {
        if let Some((s, e)) = trimmed(text, line_start, line_end) {
            out.push(Span {
                kind: SpanKind::Ambiguous,
                start: s,
                end: e,
            });
        }
        return;
    }

    if let Some(s) = pending {
        // Punctuation with nothing after it on the line.
        let (_, e) = trimmed(text, s, line_end).unwrap_or((s, line_end));
        line_spans.push(Span {
            kind: SpanKind::Narration,
            start: s,
            end: e,
        });
    }
    out.extend(line_spans);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts<'a>(source: &'a str, spans: &[Span]) -> Vec<(SpanKind, &'a str)> {
        spans.iter().map(|s| (s.kind, s.text(source))).collect()
    }

    #[test]
    fn test_quote_narration_quote() {
        let text = "\"It won't!\" he slammed the table. \"Eleven Primas are coming!\"";
        let spans = split_spans(text);
        assert_eq!(
            texts(text, &spans),
            vec![
                (SpanKind::Quote, "\"It won't!\""),
                (SpanKind::Narration, "he slammed the table."),
                (SpanKind::Quote, "\"Eleven Primas are coming!\""),
            ]
        );
    }

    #[test]
    fn test_cjk_and_curly_quotes() {
        let text = "他說：「你好。」\n“Fine,” she said.";
        let spans = split_spans(text);
        assert_eq!(
            texts(text, &spans),
            vec![
                (SpanKind::Narration, "他說："),
                (SpanKind::Quote, "「你好。」"),
                (SpanKind::Quote, "“Fine,”"),
                (SpanKind::Narration, "she said."),
            ]
        );
    }

    #[test]
    fn test_punctuation_gap_attaches_to_previous_span() {
        let text = "\"Run\"! \"Now\".";
        let spans = split_spans(text);
        assert_eq!(
            texts(text, &spans),
            vec![(SpanKind::Quote, "\"Run\"!"), (SpanKind::Quote, "\"Now\".")]
        );
    }

    #[test]
    fn test_unterminated_quote_is_ambiguous() {
        let text = "Jake nodded.\n\"This never ends, he muttered.\nThe end.";
        let spans = split_spans(text);
        assert_eq!(
            texts(text, &spans),
            vec![
                (SpanKind::Narration, "Jake nodded."),
                (SpanKind::Ambiguous, "\"This never ends, he muttered."),
                (SpanKind::Narration, "The end."),
            ]
        );
    }

    #[test]
    fn test_nested_same_kind_quote_is_ambiguous() {
        let text = "“He said “no” to me,” she whispered.";
        let spans = split_spans(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].kind, SpanKind::Ambiguous);
        assert_eq!(spans[0].text(text), text);
    }

    #[test]
    fn test_spans_cover_all_non_whitespace() {
        let text = "  — \"Hi.\"  Then silence.\n\n\"Bye.\"\n";
        let spans = split_spans(text);
        let joined: String = spans.iter().map(|s| s.text(text)).collect();
        let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
        assert_eq!(strip(&joined), strip(text));
        assert!(spans.windows(2).all(|w| w[0].end <= w[1].start));
    }
}
