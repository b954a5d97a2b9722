//! Splits chapter text into bounded chunks for attribution.
//!
//! Chunks are built from atomic units: sentences that end outside of any
//! quoted span. Units are packed greedily up to the byte budget, backing off
//! to the last paragraph break when that still fills at least half the
//! budget. A unit larger than the budget becomes its own oversized chunk.

use crate::core::error::ChunkingError;
use crate::core::model::TextChunk;
use log::warn;

#[derive(Debug, Clone, Copy)]
struct Unit {
    start: usize,
    end: usize,
    paragraph_end: bool,
}

#[derive(Default)]
struct QuoteState {
    straight_open: bool,
    depth: usize,
}

impl QuoteState {
    fn feed(&mut self, c: char) {
        match c {
            '"' => self.straight_open = !self.straight_open,
            '“' | '「' | '『' => self.depth += 1,
            '”' | '」' | '』' => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
    }

    fn inside(&self) -> bool {
        self.straight_open || self.depth > 0
    }
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…' | '。' | '！' | '？')
}

fn is_closer(c: char) -> bool {
    matches!(c, '"' | '”' | '」' | '』' | '\'' | '’' | ')' | ']')
}

fn is_cjk_terminator(c: char) -> bool {
    matches!(c, '。' | '！' | '？' | '」' | '』')
}

pub struct Chunker {
    budget: usize,
}

impl Chunker {
    pub fn new(budget: usize) -> Result<Self, ChunkingError> {
        if budget == 0 {
            return Err(ChunkingError::ZeroBudget);
        }
        Ok(Self { budget })
    }

    pub fn split(&self, chapter_id: &str, text: &str) -> Result<Vec<TextChunk>, ChunkingError> {
        if text.trim().is_empty() {
            return Err(ChunkingError::EmptyChapter);
        }
        let units = atomic_units(text);
        let mut chunks = Vec::new();
        let mut first = 0;

        while first < units.len() {
            let chunk_start = units[first].start;
            let mut last = first;
            while last < units.len() && units[last].end - chunk_start <= self.budget {
                last += 1;
            }

            if last == first {
                let unit = units[first];
                warn!(
                    "Chapter {}: {} byte span at offset {} exceeds the {} byte chunk budget; keeping it whole",
                    chapter_id,
                    unit.end - unit.start,
                    unit.start,
                    self.budget
                );
                chunks.push(make_chunk(chapter_id, chunks.len(), text, unit.start, unit.end, true));
                first += 1;
                continue;
            }

            if last < units.len() {
                if let Some(p) = (first..last).rev().find(|&i| units[i].paragraph_end) {
                    if units[p].end - chunk_start >= self.budget / 2 {
                        last = p + 1;
                    }
                }
            }

            let end = units[last - 1].end;
            chunks.push(make_chunk(chapter_id, chunks.len(), text, chunk_start, end, false));
            first = last;
        }

        verify_tiling(text, &chunks)?;
        Ok(chunks)
    }
}

fn make_chunk(
    chapter_id: &str,
    index: usize,
    text: &str,
    start: usize,
    end: usize,
    oversized: bool,
) -> TextChunk {
    TextChunk {
        chapter_id: chapter_id.to_string(),
        index,
        start,
        end,
        text: text[start..end].to_string(),
        oversized,
    }
}

fn verify_tiling(text: &str, chunks: &[TextChunk]) -> Result<(), ChunkingError> {
    let mut offset = 0;
    for chunk in chunks {
        if chunk.start != offset || chunk.end < chunk.start {
            return Err(ChunkingError::Tiling { offset });
        }
        offset = chunk.end;
    }
    if offset != text.len() {
        return Err(ChunkingError::Tiling { offset });
    }
    Ok(())
}

/// Sentence-level units tiling `text`. Trailing whitespace belongs to the
/// unit it follows.
fn atomic_units(text: &str) -> Vec<Unit> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut units = Vec::new();
    let mut quotes = QuoteState::default();
    let mut unit_start = 0;
    let mut i = 0;

    while i < chars.len() {
        let (_, c) = chars[i];
        let prev = if i > 0 { Some(chars[i - 1].1) } else { None };
        quotes.feed(c);

        let sentence_end = !quotes.inside()
            && (is_terminator(c) || (is_closer(c) && prev.is_some_and(is_terminator)));

        if c == '\n' || sentence_end {
            let mut j = i + 1;
            let mut newline = c == '\n';
            while j < chars.len() && chars[j].1.is_whitespace() {
                newline |= chars[j].1 == '\n';
                j += 1;
            }

            let next = chars.get(j).map(|(_, c)| *c);
            let boundary = c == '\n'
                || next.is_none()
                || newline
                || (j > i + 1 && !next.is_some_and(char::is_lowercase))
                || is_cjk_terminator(c);

            if boundary {
                let end = chars.get(j).map(|(pos, _)| *pos).unwrap_or(text.len());
                units.push(Unit {
                    start: unit_start,
                    end,
                    paragraph_end: newline,
                });
                if newline {
                    // Unclosed quotes do not run past a line break.
                    quotes = QuoteState::default();
                }
                unit_start = end;
                i = j;
                continue;
            }
        }
        i += 1;
    }

    if unit_start < text.len() {
        units.push(Unit {
            start: unit_start,
            end: text.len(),
            paragraph_end: true,
        });
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Jake drew his bow. The forest was silent.\n\n\
        \"It won't!\" he slammed the table. \"Eleven Primas are coming!\"\n\n\
        Villy laughed. \"Oh, this will be fun.\" The Viper leaned back.\n";

    fn concat(chunks: &[TextChunk]) -> String {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn test_chunks_reconstruct_text() {
        for budget in [1, 16, 40, 64, 100, 4096] {
            let chunks = Chunker::new(budget).unwrap().split("ch1", SAMPLE).unwrap();
            assert_eq!(concat(&chunks), SAMPLE, "budget {}", budget);
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.index, i);
                assert_eq!(&SAMPLE[c.start..c.end], c.text);
            }
        }
    }

    #[test]
    fn test_chunks_respect_budget_unless_oversized() {
        let chunks = Chunker::new(64).unwrap().split("ch1", SAMPLE).unwrap();
        for c in &chunks {
            assert!(c.oversized || c.text.len() <= 64, "chunk too big: {:?}", c.text);
        }
    }

    #[test]
    fn test_never_splits_inside_quotes() {
        let text = "\"Stop. Wait. Listen to me.\" She turned away.";
        let chunks = Chunker::new(12).unwrap().split("ch1", text).unwrap();
        assert!(chunks[0].text.starts_with("\"Stop. Wait. Listen to me.\""));
        assert!(chunks[0].oversized);
        assert_eq!(concat(&chunks), text);
    }

    #[test]
    fn test_oversized_unit_is_kept_whole() {
        let text = "a".repeat(100);
        let chunks = Chunker::new(10).unwrap().split("ch1", &text).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].oversized);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_prefers_paragraph_breaks() {
        let text = "One two three. Four five six.\n\nSeven eight. Nine ten.";
        let chunks = Chunker::new(40).unwrap().split("ch1", text).unwrap();
        assert_eq!(chunks[0].text, "One two three. Four five six.\n\n");
        assert_eq!(concat(&chunks), text);
    }

    #[test]
    fn test_cjk_sentences() {
        let text = "他說：「你好。」她笑了。今天天氣很好。";
        let chunks = Chunker::new(30).unwrap().split("ch1", text).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(concat(&chunks), text);
        assert!(chunks.iter().all(|c| !c.text.contains('」') || c.text.contains('「')));
    }

    #[test]
    fn test_empty_text_and_zero_budget() {
        let chunker = Chunker::new(100).unwrap();
        assert_eq!(chunker.split("ch1", "").err(), Some(ChunkingError::EmptyChapter));
        assert_eq!(chunker.split("ch1", " \n\n\t").err(), Some(ChunkingError::EmptyChapter));
        assert_eq!(Chunker::new(0).err(), Some(ChunkingError::ZeroBudget));
    }
}
