//! Format-normalization pipeline.
//!
//! Three pure stages: sample-format conversion, channel remapping, and
//! resampling. Any stage whose input and output agree is bypassed, and a
//! fully-identity pipeline hands back the input bytes untouched.

pub mod channel;
pub mod resample;
pub mod sample;
pub mod simd;

use std::borrow::Cow;

use crate::config::ResampleQuality;
use crate::error::TapError;
use crate::format::{Format, SampleFormat};

pub use resample::expected_frames;
pub use simd::{cpu_features, CpuFeatures};

/// Converts PCM buffers from a fixed source format to a fixed target format.
///
/// A converter is cheap to construct and carries no state between calls, so
/// one instance can serve both the dispatcher thread and `read` callers.
#[derive(Debug, Clone)]
pub struct Converter {
    source: Format,
    target: Format,
    quality: ResampleQuality,
}

impl Converter {
    /// Creates a converter between two formats.
    #[must_use]
    pub fn new(source: Format, target: Format, quality: ResampleQuality) -> Self {
        Self {
            source,
            target,
            quality,
        }
    }

    /// The source (native) format.
    #[must_use]
    pub fn source(&self) -> Format {
        self.source
    }

    /// The target (requested) format.
    #[must_use]
    pub fn target(&self) -> Format {
        self.target
    }

    /// Returns `true` when conversion is a byte-for-byte no-op.
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self.source == self.target
    }

    /// Converts frame-aligned source bytes to the target format.
    ///
    /// The identity pipeline borrows the input without copying.
    pub fn convert<'a>(&self, bytes: &'a [u8]) -> Result<Cow<'a, [u8]>, TapError> {
        if self.is_passthrough() {
            return Ok(Cow::Borrowed(bytes));
        }
        if bytes.is_empty() {
            return Ok(Cow::Owned(Vec::new()));
        }
        if bytes.len() % self.source.frame_size() != 0 {
            return Err(TapError::internal(format!(
                "conversion input not frame-aligned: {} bytes, frame size {}",
                bytes.len(),
                self.source.frame_size()
            )));
        }

        // Stage 1: decode to normalized f32 (bypassed for f32 sources, where
        // decoding is a reinterpretation).
        let mut samples = sample::decode_to_f32(bytes, self.source.sample_format)?;

        // Stage 2: channel remap, downmix before resampling so the filter
        // touches fewer samples.
        samples = channel::remap(samples, self.source.channels, self.target.channels)?;

        // Stage 3: resample.
        if self.source.sample_rate != self.target.sample_rate {
            samples = resample::resample(
                &samples,
                self.source.sample_rate,
                self.target.sample_rate,
                self.target.channels,
                self.quality,
            )?;
        }

        Ok(Cow::Owned(sample::encode_from_f32(
            &samples,
            self.target.sample_format,
        )))
    }
}

/// Convenience check used by backends when deciding whether to log a
/// format mismatch.
#[must_use]
pub fn is_conversion_needed(native: Format, requested: Format) -> bool {
    native != requested
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(rate: u32, ch: u16, sf: SampleFormat) -> Format {
        Format::new(rate, ch, sf)
    }

    #[test]
    fn test_passthrough_borrows() {
        let format = fmt(48000, 2, SampleFormat::F32);
        let converter = Converter::new(format, format, ResampleQuality::Best);
        assert!(converter.is_passthrough());

        let bytes = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let out = converter.convert(&bytes).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, &bytes[..]);
    }

    #[test]
    fn test_sample_format_only() {
        // 48k stereo f32 -> 48k stereo i16: stage 1+encode only.
        let converter = Converter::new(
            fmt(48000, 2, SampleFormat::F32),
            fmt(48000, 2, SampleFormat::I16),
            ResampleQuality::Fast,
        );
        let input: Vec<u8> = [0.5f32, -0.5, 1.0, -1.0]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = converter.convert(&input).unwrap();
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples, vec![16384, -16384, 32767, -32768]);
    }

    #[test]
    fn test_downmix_only() {
        let converter = Converter::new(
            fmt(48000, 2, SampleFormat::F32),
            fmt(48000, 1, SampleFormat::F32),
            ResampleQuality::Fast,
        );
        let input: Vec<u8> = [0.25f32, 0.75, -0.5, 0.5]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = converter.convert(&input).unwrap();
        let samples: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(samples, vec![0.5, 0.0]);
    }

    #[test]
    fn test_full_pipeline_48k_stereo_f32_to_44k_mono_i16() {
        let converter = Converter::new(
            fmt(48000, 2, SampleFormat::F32),
            fmt(44100, 1, SampleFormat::I16),
            ResampleQuality::Best,
        );

        // 1 second of a 1kHz sine at -6 dBFS.
        let mut input = Vec::with_capacity(48000 * 2 * 4);
        for i in 0..48000 {
            let t = i as f64 / 48000.0;
            let v = (2.0 * std::f64::consts::PI * 1000.0 * t).sin() as f32 * 0.5;
            input.extend_from_slice(&v.to_le_bytes());
            input.extend_from_slice(&v.to_le_bytes());
        }

        let out = converter.convert(&input).unwrap();
        let frames = out.len() / 2;
        assert!(frames.abs_diff(44100) <= 1, "got {frames} frames");

        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        let peak = samples[2000..frames - 2000]
            .iter()
            .map(|s| i32::from(*s).unsigned_abs())
            .max()
            .unwrap();
        assert!(
            (15500..=17000).contains(&peak),
            "peak {peak} outside -6 dBFS window"
        );
    }

    #[test]
    fn test_misaligned_input_is_internal_error() {
        let converter = Converter::new(
            fmt(48000, 2, SampleFormat::F32),
            fmt(48000, 1, SampleFormat::F32),
            ResampleQuality::Fast,
        );
        let err = converter.convert(&[0u8; 9]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Internal);
    }

    #[test]
    fn test_unsupported_channel_map_surfaces() {
        let converter = Converter::new(
            fmt(48000, 2, SampleFormat::F32),
            Format::new(48000, 2, SampleFormat::F32),
            ResampleQuality::Fast,
        );
        // Force a bogus source channel count through the public type.
        let converter = Converter {
            source: Format::new(48000, 4, SampleFormat::F32),
            ..converter
        };
        let err = converter.convert(&[0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::FormatUnsupported);
    }
}
