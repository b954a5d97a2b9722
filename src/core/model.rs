use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// A chapter as handed over by the extraction side. Never mutated; a
/// re-extracted chapter is a new value with a new text hash.
#[derive(Debug, Clone)]
pub struct Chapter {
    pub id: String,
    pub text: String,
    pub voices: VoiceMap,
}

impl Chapter {
    pub fn new(id: impl Into<String>, text: impl Into<String>, voices: VoiceMap) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            voices,
        }
    }

    pub fn text_hash(&self) -> String {
        hash_hex(self.text.as_bytes())
    }
}

/// Speaker ID → voice ID, with a fallback voice for unmapped speakers.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VoiceMap {
    #[serde(default)]
    pub voices: BTreeMap<String, String>,
    pub default_voice: String,
}

impl VoiceMap {
    pub fn new(default_voice: impl Into<String>) -> Self {
        Self {
            voices: BTreeMap::new(),
            default_voice: default_voice.into(),
        }
    }

    pub fn with_voice(mut self, speaker: impl Into<String>, voice: impl Into<String>) -> Self {
        self.voices.insert(speaker.into(), voice.into());
        self
    }

    pub fn voice_for(&self, speaker_id: &str) -> &str {
        self.voices
            .get(speaker_id)
            .map(String::as_str)
            .unwrap_or(&self.default_voice)
    }

    /// Rewrites the keys through `resolve`, so lookups by canonical ID work
    /// whatever surface name the map was written with.
    pub fn canonicalize(&self, resolve: impl Fn(&str) -> String) -> VoiceMap {
        VoiceMap {
            voices: self
                .voices
                .iter()
                .map(|(speaker, voice)| (resolve(speaker), voice.clone()))
                .collect(),
            default_voice: self.default_voice.clone(),
        }
    }

    /// Entries that map to the default voice do not count: they resolve the
    /// same as no entry at all.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (speaker, voice) in self.voices.iter().filter(|(_, v)| **v != self.default_voice) {
            hash_field(&mut hasher, speaker);
            hash_field(&mut hasher, voice);
        }
        hash_field(&mut hasher, &self.default_voice);
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TextChunk {
    pub chapter_id: String,
    pub index: usize,
    /// Byte offsets into the chapter text.
    pub start: usize,
    pub end: usize,
    pub text: String,
    #[serde(default)]
    pub oversized: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Dialogue,
    Narration,
    System,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SegmentKind::Dialogue => "dialogue",
            SegmentKind::Narration => "narration",
            SegmentKind::System => "system",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SpeakerSegment {
    pub chapter_id: String,
    /// Contiguous, zero-based position in the chapter. Fixed once attribution
    /// completes.
    pub index: usize,
    pub chunk_index: usize,
    pub speaker_id: String,
    pub kind: SegmentKind,
    pub text: String,
    /// Byte offsets of `text` in the chapter.
    pub start: usize,
    pub end: usize,
    #[serde(default)]
    pub needs_review: bool,
}

/// Synthesis model settings. Part of every cache key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SynthesisParams {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_model() -> String {
    "tts-1-hd".to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_speed() -> f32 {
    1.0
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            model: default_model(),
            language: default_language(),
            speed: default_speed(),
            extra: BTreeMap::new(),
        }
    }
}

impl SynthesisParams {
    /// Stable textual form used when hashing.
    pub fn fingerprint(&self) -> String {
        let mut s = format!("model={};language={};speed={}", self.model, self.language, self.speed);
        for (k, v) in &self.extra {
            s.push_str(&format!(";{}={}", k, v));
        }
        s
    }
}

/// Content address of one synthesized segment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(text: &str, speaker_id: &str, voice_id: &str, params: &SynthesisParams) -> Self {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, &normalize_text(text));
        hash_field(&mut hasher, speaker_id);
        hash_field(&mut hasher, voice_id);
        hash_field(&mut hasher, &params.fingerprint());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Two-character directory prefix used to spread entries on disk.
    pub fn shard(&self) -> &str {
        &self.0[..2.min(self.0.len())]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collapses every whitespace run to one space and trims the ends.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn hash_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

// Length-prefixed so ("ab", "c") and ("a", "bc") hash differently.
fn hash_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}
