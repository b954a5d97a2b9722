use anyhow::{anyhow, bail, Result};
use std::ops::Range;
use std::time::Duration;

/// Layout of a parsed RIFF/WAVE buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct WavInfo {
    pub fmt: Vec<u8>,
    pub data: Range<usize>,
}

const WAVE_FORMAT_PCM: u16 = 1;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

impl WavInfo {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 || &bytes[0..4] != b"RIFF" {
            bail!("Not a RIFF file");
        }
        if &bytes[8..12] != b"WAVE" {
            bail!("Not a WAVE file");
        }

        let mut fmt: Option<Vec<u8>> = None;
        let mut pos = 12;
        while pos + 8 <= bytes.len() {
            let chunk_id = &bytes[pos..pos + 4];
            let chunk_size = u32::from_le_bytes([
                bytes[pos + 4],
                bytes[pos + 5],
                bytes[pos + 6],
                bytes[pos + 7],
            ]) as usize;
            let body = pos + 8;

            if chunk_id == b"fmt " {
                let end = body
                    .checked_add(chunk_size)
                    .filter(|end| *end <= bytes.len())
                    .ok_or_else(|| anyhow!("Truncated fmt chunk"))?;
                fmt = Some(bytes[body..end].to_vec());
            } else if chunk_id == b"data" {
                let fmt = fmt.ok_or_else(|| anyhow!("data chunk before fmt chunk"))?;
                // Streaming encoders sometimes leave the size at 0 or u32::MAX.
                let end = if chunk_size == 0 || body + chunk_size > bytes.len() {
                    bytes.len()
                } else {
                    body + chunk_size
                };
                let info = WavInfo {
                    fmt,
                    data: body..end,
                };
                info.validate()?;
                return Ok(info);
            }
            // Chunks are word aligned.
            pos = body + chunk_size + (chunk_size & 1);
        }

        Err(anyhow!("Missing data chunk"))
    }

    fn validate(&self) -> Result<()> {
        if self.fmt.len() < 16 {
            bail!("fmt chunk too short ({} bytes)", self.fmt.len());
        }
        let tag = self.format_tag();
        if tag != WAVE_FORMAT_PCM && tag != WAVE_FORMAT_EXTENSIBLE {
            bail!("Unsupported WAV encoding {:#06x}; only PCM can be merged", tag);
        }
        if self.sample_rate() == 0 || self.block_align() == 0 {
            bail!("Invalid WAV header (zero sample rate or block align)");
        }
        Ok(())
    }

    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.fmt[offset], self.fmt[offset + 1]])
    }

    fn u32_at(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.fmt[offset],
            self.fmt[offset + 1],
            self.fmt[offset + 2],
            self.fmt[offset + 3],
        ])
    }

    pub fn format_tag(&self) -> u16 {
        self.u16_at(0)
    }
    pub fn channels(&self) -> u16 {
        self.u16_at(2)
    }
    pub fn sample_rate(&self) -> u32 {
        self.u32_at(4)
    }
    pub fn block_align(&self) -> u16 {
        self.u16_at(12)
    }
    pub fn bits_per_sample(&self) -> u16 {
        self.u16_at(14)
    }

    /// Whole sample frames in the data chunk. A trailing partial frame is
    /// ignored.
    pub fn frames(&self) -> u64 {
        (self.data.len() / self.block_align() as usize) as u64
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames(), self.sample_rate())
    }

    /// The data bytes, trimmed to whole frames.
    pub fn pcm<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        let len = self.frames() as usize * self.block_align() as usize;
        &bytes[self.data.start..self.data.start + len]
    }
}

pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    Duration::from_micros(frames * 1_000_000 / sample_rate.max(1) as u64)
}

/// PCM silence of `duration` in the given format.
pub fn silence(fmt: &WavInfo, duration: Duration) -> Vec<u8> {
    let frames = duration.as_micros() as u64 * fmt.sample_rate() as u64 / 1_000_000;
    let len = frames as usize * fmt.block_align() as usize;
    // 8-bit PCM is unsigned, so its zero level is 0x80.
    let level = if fmt.bits_per_sample() == 8 { 0x80 } else { 0 };
    vec![level; len]
}

/// Builds a WAV file from a fmt chunk body and PCM data parts.
pub fn encode_wav(fmt: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let data_len: usize = parts.iter().map(|p| p.len()).sum();
    let data_size = u32::try_from(data_len)
        .map_err(|_| anyhow!("Merged audio exceeds the 4 GiB WAV limit"))?;
    let fmt_size = fmt.len() as u32;

    let mut out = Vec::with_capacity(data_len + fmt.len() + 28);
    out.extend_from_slice(b"RIFF");
    // RIFF size = 4 (WAVE) + 8 (fmt hdr) + fmt_len + pad + 8 (data hdr) + data_len
    let pad = fmt_size & 1;
    out.extend_from_slice(&(4 + 8 + fmt_size + pad + 8 + data_size).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&fmt_size.to_le_bytes());
    out.extend_from_slice(fmt);
    if pad == 1 {
        out.push(0);
    }
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_size.to_le_bytes());
    for part in parts {
        out.extend_from_slice(part);
    }
    Ok(out)
}

/// A 16-byte PCM fmt chunk body.
pub fn pcm_format(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let block_align = channels * (bits_per_sample / 8);
    let byte_rate = sample_rate * block_align as u32;
    let mut fmt = Vec::with_capacity(16);
    fmt.extend_from_slice(&WAVE_FORMAT_PCM.to_le_bytes());
    fmt.extend_from_slice(&channels.to_le_bytes());
    fmt.extend_from_slice(&sample_rate.to_le_bytes());
    fmt.extend_from_slice(&byte_rate.to_le_bytes());
    fmt.extend_from_slice(&block_align.to_le_bytes());
    fmt.extend_from_slice(&bits_per_sample.to_le_bytes());
    fmt
}

#[cfg(test)]
pub(crate) fn test_wav(frames: usize, sample_rate: u32, fill: u8) -> Vec<u8> {
    let fmt = pcm_format(sample_rate, 1, 16);
    let data = vec![fill; frames * 2];
    encode_wav(&fmt, &[&data]).unwrap()
}
