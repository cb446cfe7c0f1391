//! Configuration types for capture sessions.

use std::time::Duration;

use crate::format::{Format, SampleFormat};

/// Resampling quality hint.
///
/// Controls the trade-off between latency and audio quality. The
/// high-quality SINC backend maps these to its three converter modes; the
/// built-in fallbacks select between polyphase filtering and linear
/// interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleQuality {
    /// Windowed-sinc with a long filter. Best quality, highest cost.
    Best,
    /// Windowed-sinc with a shorter filter.
    #[default]
    Medium,
    /// Linear interpolation. Lowest latency, audible artifacts on large
    /// ratio changes.
    Fast,
}

impl ResampleQuality {
    /// Parses the CLI spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "best" => Some(Self::Best),
            "medium" => Some(Self::Medium),
            "fast" => Some(Self::Fast),
            _ => None,
        }
    }
}

/// Requested output configuration for a capture session.
///
/// When no configuration is given, the session adopts the backend's native
/// format and the conversion pipeline is bypassed entirely.
///
/// # Example
///
/// ```
/// use proctap::{CaptureConfig, SampleFormat};
///
/// let config = CaptureConfig {
///     sample_rate: 44100,
///     channels: 1,
///     sample_format: SampleFormat::I16,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Output sample rate in Hz.
    ///
    /// Default: 48000 (standard for voice processing).
    pub sample_rate: u32,

    /// Output channel count (1 or 2).
    ///
    /// Default: 2 (preserves spatial audio).
    pub channels: u16,

    /// Output sample encoding.
    ///
    /// Default: [`SampleFormat::F32`] normalized to [-1.0, 1.0].
    pub sample_format: SampleFormat,

    /// Resampling quality when the native rate differs.
    pub resample_quality: ResampleQuality,

    /// Target duration of chunks delivered to a data callback.
    ///
    /// Smaller values reduce latency but increase overhead.
    /// Default: 10ms.
    pub chunk_duration: Duration,

    /// Ring buffer capacity in bytes.
    ///
    /// The ring absorbs pressure from slow consumers; once full, the oldest
    /// frames are dropped and the session's drop counter increments.
    /// Default: 4 MiB (roughly 20 seconds of 48kHz stereo float32).
    pub ring_capacity: usize,
}

/// Default ring capacity: ~20s of 48kHz stereo float32.
pub(crate) const DEFAULT_RING_CAPACITY: usize = 4 * 1024 * 1024;

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::F32,
            resample_quality: ResampleQuality::default(),
            chunk_duration: Duration::from_millis(10),
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

impl CaptureConfig {
    /// The output [`Format`] this configuration describes.
    #[must_use]
    pub fn format(&self) -> Format {
        Format::new(self.sample_rate, self.channels, self.sample_format)
    }

    /// Validates field ranges.
    pub(crate) fn validate(&self) -> Result<(), crate::TapError> {
        if self.sample_rate == 0 {
            return Err(crate::TapError::format_unsupported("sample rate 0"));
        }
        if !matches!(self.channels, 1 | 2) {
            return Err(crate::TapError::format_unsupported(format!(
                "{} channels (only mono and stereo are supported)",
                self.channels
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.channels, 2);
        assert_eq!(config.sample_format, SampleFormat::F32);
        assert_eq!(config.chunk_duration, Duration::from_millis(10));
        assert_eq!(config.ring_capacity, 4 * 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let config = CaptureConfig {
            sample_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_surround() {
        let config = CaptureConfig {
            channels: 6,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quality_parse() {
        assert_eq!(ResampleQuality::parse("best"), Some(ResampleQuality::Best));
        assert_eq!(ResampleQuality::parse("fast"), Some(ResampleQuality::Fast));
        assert_eq!(ResampleQuality::parse("ultra"), None);
    }
}
