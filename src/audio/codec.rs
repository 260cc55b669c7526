//! # Audio Codec and Resampler
//!
//! Stateless conversion between the telephony wire format (G.711 μ-law,
//! 8kHz mono) and the AI pipeline format (PCM16 little-endian, 16kHz mono).
//!
//! ## Operations:
//! - **μ-law decode/encode**: logarithmic companding per G.711
//! - **Resampling**: linear interpolation between sample rates
//! - **Convert**: format-pair dispatch (Telephony ↔ Pipeline only)
//! - **Helpers**: gain, mixing, frame splitting for streaming
//!
//! All operations take and return raw byte frames. PCM16 frames must have
//! an even byte length; μ-law frames carry one sample per byte. Linear
//! interpolation is within telephony tolerance at 8↔16kHz; no higher-order
//! filtering is attempted.

use byteorder::{ByteOrder, LittleEndian};

use crate::audio::format::{AudioFormat, PIPELINE, TELEPHONY};
use crate::error::CodecError;

/// Maximum linear magnitude representable in μ-law.
const MULAW_MAX: i32 = 32635;

/// μ-law bias term (0x84 = 132).
const MULAW_BIAS: i32 = 0x84;

/// Default split size: 20ms of 8kHz PCM16 audio.
const DEFAULT_CHUNK_SIZE: usize = 320;

/// Decode G.711 μ-law bytes to little-endian PCM16 at the same sample rate.
///
/// Each μ-law byte is bit-inverted, then split into sign, 3-bit exponent and
/// 4-bit mantissa; the linear sample is `sign * (((mantissa << 3) + 0x84) <<
/// exponent)`. One input byte produces one 16-bit output sample.
pub fn decode_mulaw(mulaw_data: &[u8]) -> Vec<u8> {
    let mut pcm_data = vec![0u8; mulaw_data.len() * 2];

    for (i, &mulaw_byte) in mulaw_data.iter().enumerate() {
        LittleEndian::write_i16(&mut pcm_data[i * 2..i * 2 + 2], mulaw_to_linear(mulaw_byte));
    }

    pcm_data
}

/// Encode little-endian PCM16 to G.711 μ-law.
///
/// ## Errors:
/// Rejects frames with an odd byte length; every sample must be complete.
pub fn encode_mulaw(pcm_data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if pcm_data.len() % 2 != 0 {
        return Err(CodecError::OddLength {
            len: pcm_data.len(),
        });
    }

    let num_samples = pcm_data.len() / 2;
    let mut mulaw_data = vec![0u8; num_samples];

    for (i, out) in mulaw_data.iter_mut().enumerate() {
        let sample = LittleEndian::read_i16(&pcm_data[i * 2..i * 2 + 2]);
        *out = linear_to_mulaw(sample);
    }

    Ok(mulaw_data)
}

/// Convert a single μ-law byte to a linear 16-bit sample.
fn mulaw_to_linear(mulaw_byte: u8) -> i16 {
    let b = mulaw_byte ^ 0xFF;

    let exponent = (b >> 4) & 0x07;
    let mantissa = (b & 0x0F) as i32;
    let magnitude = ((mantissa << 3) + MULAW_BIAS) << exponent;

    if b & 0x80 != 0 {
        (-magnitude) as i16
    } else {
        magnitude as i16
    }
}

/// Convert a linear 16-bit sample to a single μ-law byte.
///
/// The magnitude is clamped to 32635, then assigned to the smallest segment
/// (exponent) that can hold it; ties break toward the smaller exponent. The
/// mantissa is recovered relative to the segment base so that encoding a
/// decoded byte reproduces it exactly.
fn linear_to_mulaw(sample: i16) -> u8 {
    let negative = sample < 0;
    let mut magnitude = (sample as i32).abs();
    if magnitude > MULAW_MAX {
        magnitude = MULAW_MAX;
    }

    let mut exponent = 7u32;
    for exp in 0..7u32 {
        if magnitude < (0x100 << exp) {
            exponent = exp;
            break;
        }
    }

    let mantissa = (((magnitude >> exponent) - MULAW_BIAS).max(0) >> 3) as u8;

    let mut mulaw_byte = ((exponent as u8) << 4) | mantissa;
    if negative {
        mulaw_byte |= 0x80;
    }

    // Invert for transmission
    mulaw_byte ^ 0xFF
}

/// Resample little-endian PCM16 audio between sample rates using linear
/// interpolation.
///
/// The output holds `floor(in_samples * to_rate / from_rate)` samples. For
/// each output index the fractional source position is interpolated between
/// the two nearest input samples, with the index clamped so the last sample
/// pair stays in bounds. Results saturate to the 16-bit range.
pub fn resample_pcm16(pcm_data: &[u8], from_rate: u32, to_rate: u32) -> Result<Vec<u8>, CodecError> {
    if pcm_data.len() % 2 != 0 {
        return Err(CodecError::OddLength {
            len: pcm_data.len(),
        });
    }

    if from_rate == to_rate || pcm_data.is_empty() {
        return Ok(pcm_data.to_vec());
    }

    let num_input_samples = pcm_data.len() / 2;
    let num_output_samples =
        (num_input_samples as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut output = vec![0u8; num_output_samples * 2];

    if num_input_samples < 2 {
        // One sample gives no interpolation span; repeat it.
        let sample = LittleEndian::read_i16(pcm_data);
        for i in 0..num_output_samples {
            LittleEndian::write_i16(&mut output[i * 2..i * 2 + 2], sample);
        }
        return Ok(output);
    }

    let ratio = from_rate as f64 / to_rate as f64;

    for i in 0..num_output_samples {
        let src_pos = i as f64 * ratio;

        let mut src_index = src_pos as usize;
        if src_index >= num_input_samples - 1 {
            src_index = num_input_samples - 2;
        }
        let fraction = src_pos - src_index as f64;

        let sample1 = LittleEndian::read_i16(&pcm_data[src_index * 2..src_index * 2 + 2]) as f64;
        let sample2 =
            LittleEndian::read_i16(&pcm_data[(src_index + 1) * 2..(src_index + 1) * 2 + 2]) as f64;

        let interpolated = (sample1 * (1.0 - fraction) + sample2 * fraction).round();
        let clamped = interpolated.clamp(i16::MIN as f64, i16::MAX as f64) as i16;

        LittleEndian::write_i16(&mut output[i * 2..i * 2 + 2], clamped);
    }

    Ok(output)
}

/// Convert an audio frame between formats.
///
/// Identity when the formats are equal. Otherwise only the two telephony
/// conversions are supported:
/// - Telephony (μ-law 8kHz) → Pipeline (PCM16 16kHz): decode then upsample
/// - Pipeline → Telephony: downsample then encode
///
/// Any other pairing returns [`CodecError::UnsupportedConversion`]; callers
/// must not assume transitivity.
pub fn convert(frame: &[u8], from: &AudioFormat, to: &AudioFormat) -> Result<Vec<u8>, CodecError> {
    if from == to {
        return Ok(frame.to_vec());
    }

    if *from == TELEPHONY && *to == PIPELINE {
        let pcm = decode_mulaw(frame);
        resample_pcm16(&pcm, from.sample_rate, to.sample_rate)
    } else if *from == PIPELINE && *to == TELEPHONY {
        let pcm = resample_pcm16(frame, from.sample_rate, to.sample_rate)?;
        encode_mulaw(&pcm)
    } else {
        Err(CodecError::UnsupportedConversion {
            from: *from,
            to: *to,
        })
    }
}

/// Multiply every PCM16 sample by `gain`, saturating to the 16-bit range.
pub fn apply_gain(pcm_data: &[u8], gain: f64) -> Result<Vec<u8>, CodecError> {
    if pcm_data.len() % 2 != 0 {
        return Err(CodecError::OddLength {
            len: pcm_data.len(),
        });
    }

    let mut result = vec![0u8; pcm_data.len()];
    let num_samples = pcm_data.len() / 2;

    for i in 0..num_samples {
        let sample = LittleEndian::read_i16(&pcm_data[i * 2..i * 2 + 2]) as f64;
        let amplified = (sample * gain).clamp(i16::MIN as f64, i16::MAX as f64);
        LittleEndian::write_i16(&mut result[i * 2..i * 2 + 2], amplified as i16);
    }

    Ok(result)
}

/// Mix multiple PCM16 streams by averaging each sample position.
///
/// Averaging rather than summing guards against clipping and DC build-up
/// when several sources are combined. All streams must share the same
/// length (and implicitly rate and format).
pub fn mix(streams: &[&[u8]]) -> Result<Vec<u8>, CodecError> {
    let first = streams.first().ok_or(CodecError::EmptyStreamList)?;
    let length = first.len();

    if length % 2 != 0 {
        return Err(CodecError::OddLength { len: length });
    }
    for stream in streams {
        if stream.len() != length {
            return Err(CodecError::LengthMismatch {
                expected: length,
                actual: stream.len(),
            });
        }
    }

    let mut result = vec![0u8; length];
    let num_samples = length / 2;

    for i in 0..num_samples {
        let mut sum: i32 = 0;
        for stream in streams {
            sum += LittleEndian::read_i16(&stream[i * 2..i * 2 + 2]) as i32;
        }

        let average = (sum / streams.len() as i32).clamp(i16::MIN as i32, i16::MAX as i32);
        LittleEndian::write_i16(&mut result[i * 2..i * 2 + 2], average as i16);
    }

    Ok(result)
}

/// Split a buffer into chunks of at most `chunk_size` bytes.
///
/// A `chunk_size` of zero falls back to 320 bytes (20ms at 8kHz PCM16).
/// The final chunk may be shorter.
pub fn split_frames(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };

    data.chunks(chunk_size).map(|c| c.to_vec()).collect()
}

/// Concatenate audio buffers back into one contiguous frame.
pub fn concat_frames(frames: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = frames.iter().map(|f| f.len()).sum();
    let mut buffer = Vec::with_capacity(total);
    for frame in frames {
        buffer.extend_from_slice(frame);
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        let mut out = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(samples, &mut out);
        out
    }

    fn pcm_samples(bytes: &[u8]) -> Vec<i16> {
        let mut out = vec![0i16; bytes.len() / 2];
        LittleEndian::read_i16_into(bytes, &mut out);
        out
    }

    #[test]
    fn test_mulaw_exact_round_trip() {
        // μ-law is the narrow side: every byte must survive decode → encode.
        for byte in 0u8..=255 {
            let linear = mulaw_to_linear(byte);
            assert_eq!(
                linear_to_mulaw(linear),
                byte,
                "byte 0x{:02X} decoded to {} did not re-encode",
                byte,
                linear
            );
        }
    }

    #[test]
    fn test_mulaw_round_trip_boundary_bytes() {
        let input = [0x00u8, 0x7F, 0x80, 0xFF];
        let decoded = decode_mulaw(&input);
        let encoded = encode_mulaw(&decoded).unwrap();
        assert_eq!(encoded, input.to_vec());
    }

    #[test]
    fn test_mulaw_quantisation_error_bounded() {
        // Encoding then decoding may only lose the quantisation step of the
        // segment the magnitude falls in; larger magnitudes tolerate more.
        for sample in (-16384i32..=16384).step_by(7) {
            let sample = sample as i16;
            let encoded = linear_to_mulaw(sample);
            let decoded = mulaw_to_linear(encoded) as i32;
            let allowed = (sample.unsigned_abs() as i32 / 8).max(140);
            let error = (decoded - sample as i32).abs();
            assert!(
                error <= allowed,
                "sample {} decoded to {} (error {} > {})",
                sample,
                decoded,
                error,
                allowed
            );
        }
    }

    #[test]
    fn test_mulaw_decode_signs() {
        let decoded = pcm_samples(&decode_mulaw(&[0x7F, 0xFF]));
        // 0x7F is the smallest negative value, 0xFF the smallest positive.
        assert!(decoded[0] < 0);
        assert!(decoded[1] > 0);
        assert_eq!(decoded[0], -decoded[1]);
    }

    #[test]
    fn test_encode_mulaw_rejects_odd_length() {
        assert_eq!(
            encode_mulaw(&[0u8; 3]),
            Err(CodecError::OddLength { len: 3 })
        );
    }

    #[test]
    fn test_resample_doubling() {
        let input = pcm_bytes(&[0, 10000, 0, -10000]);
        let output = resample_pcm16(&input, 8000, 16000).unwrap();
        let samples = pcm_samples(&output);

        assert_eq!(samples.len(), 8);
        // Even indices reproduce the input exactly.
        assert_eq!(samples[0], 0);
        assert_eq!(samples[2], 10000);
        assert_eq!(samples[4], 0);
        assert_eq!(samples[6], -10000);
        // Interior odd indices are the mean of their neighbours.
        assert_eq!(samples[1], 5000);
        assert_eq!(samples[3], 5000);
        assert_eq!(samples[5], -5000);
        // The final sample extrapolates past the last input pair.
        assert_eq!(samples[7], -15000);
    }

    #[test]
    fn test_resample_halving_length() {
        let input = pcm_bytes(&[100; 320]);
        let output = resample_pcm16(&input, 16000, 8000).unwrap();
        assert_eq!(output.len(), 320); // 160 samples * 2 bytes
        assert!(pcm_samples(&output).iter().all(|&s| s == 100));
    }

    #[test]
    fn test_resample_output_length_formula() {
        for &(in_samples, from, to) in &[(160usize, 8000u32, 16000u32), (441, 44100, 8000), (3, 8000, 16000)] {
            let input = pcm_bytes(&vec![1i16; in_samples]);
            let output = resample_pcm16(&input, from, to).unwrap();
            let expected = in_samples as u64 * to as u64 / from as u64;
            assert_eq!(output.len() as u64, expected * 2);
        }
    }

    #[test]
    fn test_resample_stays_within_i16() {
        let input = pcm_bytes(&[i16::MAX, i16::MIN, i16::MAX, i16::MIN]);
        let output = resample_pcm16(&input, 8000, 16000).unwrap();
        // Reading back as i16 cannot overflow by construction; the assert
        // verifies the interpolation saturated instead of wrapping.
        let samples = pcm_samples(&output);
        assert_eq!(samples[0], i16::MAX);
        assert_eq!(samples[2], i16::MIN);
    }

    #[test]
    fn test_resample_identity_and_odd_length() {
        let input = pcm_bytes(&[1, 2, 3]);
        assert_eq!(resample_pcm16(&input, 8000, 8000).unwrap(), input);
        assert!(matches!(
            resample_pcm16(&[0u8; 5], 8000, 16000),
            Err(CodecError::OddLength { len: 5 })
        ));
    }

    #[test]
    fn test_convert_identity() {
        let frame = vec![0x55u8; 160];
        let out = convert(&frame, &TELEPHONY, &TELEPHONY).unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn test_convert_telephony_to_pipeline() {
        // 160 μ-law bytes (20ms at 8kHz) become 320 PCM16 samples at 16kHz.
        let frame = vec![0xFFu8; 160];
        let out = convert(&frame, &TELEPHONY, &PIPELINE).unwrap();
        assert_eq!(out.len(), 320 * 2);
    }

    #[test]
    fn test_convert_pipeline_to_telephony() {
        let frame = pcm_bytes(&vec![1000i16; 320]);
        let out = convert(&frame, &PIPELINE, &TELEPHONY).unwrap();
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn test_convert_unsupported_pair() {
        use crate::audio::format::{AudioEncoding, AudioFormat};
        let alaw = AudioFormat::new(8000, 1, AudioEncoding::Alaw, 8);
        let err = convert(&[0u8; 4], &alaw, &PIPELINE).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedConversion { .. }));
    }

    #[test]
    fn test_apply_gain_saturates() {
        let input = pcm_bytes(&[1000, -1000, 30000]);
        let out = pcm_samples(&apply_gain(&input, 2.0).unwrap());
        assert_eq!(out, vec![2000, -2000, i16::MAX]);

        assert!(apply_gain(&[0u8; 1], 1.0).is_err());
    }

    #[test]
    fn test_mix_averages() {
        let a = pcm_bytes(&[1000, -2000]);
        let b = pcm_bytes(&[3000, 0]);
        let mixed = pcm_samples(&mix(&[&a, &b]).unwrap());
        assert_eq!(mixed, vec![2000, -1000]);
    }

    #[test]
    fn test_mix_rejects_bad_input() {
        assert_eq!(mix(&[]), Err(CodecError::EmptyStreamList));

        let a = pcm_bytes(&[1, 2]);
        let b = pcm_bytes(&[1]);
        assert_eq!(
            mix(&[&a, &b]),
            Err(CodecError::LengthMismatch {
                expected: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn test_split_and_concat() {
        let data = vec![7u8; 700];
        let chunks = split_frames(&data, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 320);
        assert_eq!(chunks[2].len(), 60);

        assert_eq!(concat_frames(&chunks), data);
    }
}
