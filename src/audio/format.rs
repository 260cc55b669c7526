//! # Audio Format Descriptors
//!
//! Defines the immutable audio format descriptors used across the bridge.
//! Two canonical formats matter in practice:
//!
//! - **Telephony**: 8kHz mono G.711 μ-law, 8-bit (what the provider sends)
//! - **Pipeline**: 16kHz mono PCM, 16-bit little-endian (what the AI expects)
//!
//! Formats compare by value; the codec dispatches conversions on exact
//! format pairs rather than guessing from raw bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Audio sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// G.711 μ-law companding (one byte per sample)
    Mulaw,
    /// G.711 A-law companding (declared for completeness, not converted)
    Alaw,
    /// Linear PCM, little-endian signed integers
    Pcm,
}

/// Immutable audio format descriptor.
///
/// ## Fields:
/// - `sample_rate`: samples per second (8000 for telephony, 16000 for AI)
/// - `channels`: 1 for mono, 2 for stereo
/// - `encoding`: how each sample is represented on the wire
/// - `bit_depth`: bits per sample (8 for μ-law, 16 for PCM)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub encoding: AudioEncoding,
    pub bit_depth: u8,
}

/// 8kHz mono μ-law, the narrowband telephony format.
pub const TELEPHONY: AudioFormat = AudioFormat {
    sample_rate: 8000,
    channels: 1,
    encoding: AudioEncoding::Mulaw,
    bit_depth: 8,
};

/// 16kHz mono PCM16, the AI pipeline format.
pub const PIPELINE: AudioFormat = AudioFormat {
    sample_rate: 16000,
    channels: 1,
    encoding: AudioEncoding::Pcm,
    bit_depth: 16,
};

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u8, encoding: AudioEncoding, bit_depth: u8) -> Self {
        Self {
            sample_rate,
            channels,
            encoding,
            bit_depth,
        }
    }

    /// Bytes occupied by a single sample on one channel.
    pub fn bytes_per_sample(&self) -> usize {
        (self.bit_depth as usize).div_ceil(8)
    }

    /// Basic sanity check used by configuration validation.
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0
            && (self.channels == 1 || self.channels == 2)
            && (self.bit_depth == 8 || self.bit_depth == 16)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoding = match self.encoding {
            AudioEncoding::Mulaw => "mulaw",
            AudioEncoding::Alaw => "alaw",
            AudioEncoding::Pcm => "pcm",
        };
        write!(
            f,
            "{}Hz/{}ch/{}bit/{}",
            self.sample_rate, self.channels, self.bit_depth, encoding
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_formats() {
        assert_eq!(TELEPHONY.sample_rate, 8000);
        assert_eq!(TELEPHONY.encoding, AudioEncoding::Mulaw);
        assert_eq!(TELEPHONY.bytes_per_sample(), 1);

        assert_eq!(PIPELINE.sample_rate, 16000);
        assert_eq!(PIPELINE.encoding, AudioEncoding::Pcm);
        assert_eq!(PIPELINE.bytes_per_sample(), 2);

        assert!(TELEPHONY.is_valid());
        assert!(PIPELINE.is_valid());
        assert_ne!(TELEPHONY, PIPELINE);
    }

    #[test]
    fn test_equality_by_value() {
        let a = AudioFormat::new(8000, 1, AudioEncoding::Mulaw, 8);
        assert_eq!(a, TELEPHONY);
    }

    #[test]
    fn test_invalid_formats_rejected() {
        let zero_rate = AudioFormat::new(0, 1, AudioEncoding::Pcm, 16);
        assert!(!zero_rate.is_valid());

        let bad_channels = AudioFormat::new(16000, 3, AudioEncoding::Pcm, 16);
        assert!(!bad_channels.is_valid());
    }

    #[test]
    fn test_format_display() {
        assert_eq!(TELEPHONY.to_string(), "8000Hz/1ch/8bit/mulaw");
        assert_eq!(PIPELINE.to_string(), "16000Hz/1ch/16bit/pcm");
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&TELEPHONY).unwrap();
        assert!(json.contains("\"mulaw\""));
        let back: AudioFormat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TELEPHONY);
    }
}
