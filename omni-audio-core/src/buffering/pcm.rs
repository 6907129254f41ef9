//! 16-bit little-endian PCM helpers and stream format metadata.

use serde::{Deserialize, Serialize};

/// Bytes per 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Sample rate, channel count and bit depth of one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl AudioFormat {
    pub fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth: 16,
        }
    }

    /// Bytes in one interleaved frame.
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }
}

/// Decode interleaved little-endian bytes into samples.
///
/// A trailing odd byte is ignored.
pub fn samples_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    let mut out = Vec::with_capacity(bytes.len() / BYTES_PER_SAMPLE);
    samples_from_le_bytes_into(bytes, &mut out);
    out
}

/// Decode into `out`, replacing its contents.
pub fn samples_from_le_bytes_into(bytes: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]])),
    );
}

/// Encode samples as little-endian bytes.
pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    samples_to_le_bytes_into(samples, &mut out);
    out
}

/// Encode into `out`, replacing its contents.
pub fn samples_to_le_bytes_into(samples: &[i16], out: &mut Vec<u8>) {
    out.clear();
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_variants_replace_previous_contents() {
        let mut samples = vec![9i16; 8];
        samples_from_le_bytes_into(&[0x02, 0x00, 0xFE, 0xFF], &mut samples);
        assert_eq!(samples, vec![2, -2]);

        let mut bytes = vec![0xAAu8; 16];
        samples_to_le_bytes_into(&[0x0102], &mut bytes);
        assert_eq!(bytes, vec![0x02, 0x01]);
    }

    #[test]
    fn decodes_little_endian_and_ignores_odd_tail() {
        let bytes = [0x01, 0x00, 0xFF, 0x7F, 0x00, 0x80, 0x42];
        assert_eq!(samples_from_le_bytes(&bytes), vec![1, i16::MAX, i16::MIN]);
    }

    #[test]
    fn frame_bytes_scales_with_channels() {
        assert_eq!(AudioFormat::pcm16(48_000, 2).frame_bytes(), 4);
        assert_eq!(AudioFormat::pcm16(16_000, 1).frame_bytes(), 2);
    }
}
