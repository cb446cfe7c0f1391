//! Sample-format decoding and encoding.
//!
//! The pipeline normalizes all non-passthrough audio to interleaved f32 and
//! encodes back to the requested format at the end. i16 conversions ride the
//! SIMD kernels; i24 (packed 3-byte little-endian) and i32 are scalar.

use crate::convert::simd;
use crate::error::TapError;
use crate::format::SampleFormat;

const I24_SCALE: f32 = 1.0 / 8_388_608.0;
const I32_SCALE: f64 = 1.0 / 2_147_483_648.0;

/// Decodes raw little-endian PCM into normalized f32 samples.
///
/// `bytes.len()` must be a multiple of the sample size.
pub fn decode_to_f32(bytes: &[u8], format: SampleFormat) -> Result<Vec<f32>, TapError> {
    let stride = format.bytes_per_sample();
    if bytes.len() % stride != 0 {
        return Err(TapError::format_unsupported(format!(
            "{} bytes is not a whole number of {format} samples",
            bytes.len()
        )));
    }

    Ok(match format {
        SampleFormat::I16 => {
            let samples: Vec<i16> = bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect();
            let mut out = vec![0.0f32; samples.len()];
            simd::i16_to_f32(&samples, &mut out);
            out
        }
        SampleFormat::I24 => bytes
            .chunks_exact(3)
            .map(|c| {
                // Sign-extend 24 bits through the top of an i32.
                let v = i32::from_le_bytes([0, c[0], c[1], c[2]]) >> 8;
                v as f32 * I24_SCALE
            })
            .collect(),
        SampleFormat::I32 => bytes
            .chunks_exact(4)
            .map(|c| {
                let v = i32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                (f64::from(v) * I32_SCALE) as f32
            })
            .collect(),
        SampleFormat::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    })
}

/// Encodes normalized f32 samples into raw little-endian PCM.
pub fn encode_from_f32(samples: &[f32], format: SampleFormat) -> Vec<u8> {
    match format {
        SampleFormat::I16 => {
            let mut ints = vec![0i16; samples.len()];
            simd::f32_to_i16(samples, &mut ints);
            ints.iter().flat_map(|s| s.to_le_bytes()).collect()
        }
        SampleFormat::I24 => samples
            .iter()
            .flat_map(|&s| {
                let v = (s.clamp(-1.0, 1.0) * 8_388_608.0).round() as i32;
                let v = v.clamp(-8_388_608, 8_388_607);
                let b = v.to_le_bytes();
                [b[0], b[1], b[2]]
            })
            .collect(),
        SampleFormat::I32 => samples
            .iter()
            .flat_map(|&s| {
                let v = (f64::from(s.clamp(-1.0, 1.0)) * 2_147_483_648.0).round() as i64;
                let v = v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
                v.to_le_bytes()
            })
            .collect(),
        SampleFormat::F32 => samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i16_decode_encode_round_trip() {
        let original: Vec<u8> = [-32768i16, -12345, 0, 1, 12345, 32767]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let floats = decode_to_f32(&original, SampleFormat::I16).unwrap();
        let back = encode_from_f32(&floats, SampleFormat::I16);
        assert_eq!(original, back);
    }

    #[test]
    fn test_i24_sign_extension() {
        // 0x800000 is the most negative 24-bit value.
        let bytes = [0x00, 0x00, 0x80];
        let floats = decode_to_f32(&bytes, SampleFormat::I24).unwrap();
        assert_eq!(floats, vec![-1.0]);

        // 0x7FFFFF is the most positive.
        let bytes = [0xFF, 0xFF, 0x7F];
        let floats = decode_to_f32(&bytes, SampleFormat::I24).unwrap();
        assert!((floats[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_i24_round_trip() {
        let values: Vec<i32> = vec![-8_388_608, -100_000, 0, 42, 100_000, 8_388_607];
        let bytes: Vec<u8> = values
            .iter()
            .flat_map(|v| {
                let b = v.to_le_bytes();
                [b[0], b[1], b[2]]
            })
            .collect();
        let floats = decode_to_f32(&bytes, SampleFormat::I24).unwrap();
        let back = encode_from_f32(&floats, SampleFormat::I24);
        assert_eq!(bytes, back);
    }

    #[test]
    fn test_i32_round_trip() {
        let original: Vec<u8> = [i32::MIN, -7_000_000, 0, 7_000_000, i32::MAX]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let floats = decode_to_f32(&original, SampleFormat::I32).unwrap();
        let back = encode_from_f32(&floats, SampleFormat::I32);
        // f32 cannot represent every i32; verify within 1 part in 2^23.
        for (orig, round) in original.chunks_exact(4).zip(back.chunks_exact(4)) {
            let a = i32::from_le_bytes([orig[0], orig[1], orig[2], orig[3]]);
            let b = i32::from_le_bytes([round[0], round[1], round[2], round[3]]);
            assert!((i64::from(a) - i64::from(b)).abs() <= 256, "{a} vs {b}");
        }
    }

    #[test]
    fn test_f32_passthrough_is_exact() {
        let samples = [0.1f32, -0.9, f32::MIN_POSITIVE];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let decoded = decode_to_f32(&bytes, SampleFormat::F32).unwrap();
        assert_eq!(decoded, samples);
        assert_eq!(encode_from_f32(&decoded, SampleFormat::F32), bytes);
    }

    #[test]
    fn test_misaligned_input_rejected() {
        let err = decode_to_f32(&[0u8; 5], SampleFormat::I16).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::FormatUnsupported);
    }

    #[test]
    fn test_f32_to_i16_error_bound() {
        // float32 -> int16 -> float32 must stay within one LSB of amplitude.
        let samples: Vec<f32> = (0..1000).map(|i| (i as f32 / 500.0) - 1.0).collect();
        let encoded = encode_from_f32(&samples, SampleFormat::I16);
        let decoded = decode_to_f32(&encoded, SampleFormat::I16).unwrap();
        for (a, b) in samples.iter().zip(&decoded) {
            assert!((a - b).abs() <= 1.0 / 32768.0, "{a} vs {b}");
        }
    }
}
