//! Audio data chunk with format metadata.

use std::time::Duration;

use crate::format::Format;

/// A discrete buffer of PCM audio delivered by a capture session.
///
/// `AudioChunk` is the unit handed to `read`, `stream`, and data callbacks.
/// The payload is raw interleaved little-endian PCM; `format` describes how
/// to interpret it.
///
/// # Example
///
/// ```
/// use proctap::{AudioChunk, Format, SampleFormat};
///
/// let format = Format::new(48000, 2, SampleFormat::F32);
/// let chunk = AudioChunk::new(vec![0u8; 480 * 8], format);
///
/// assert_eq!(chunk.frame_count, 480);
/// assert_eq!(chunk.duration(), std::time::Duration::from_millis(10));
/// ```
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Raw interleaved PCM bytes.
    pub bytes: Vec<u8>,
    /// Number of frames in `bytes`. Always `bytes.len() / format.frame_size()`.
    pub frame_count: usize,
    /// Format of the payload.
    pub format: Format,
}

impl AudioChunk {
    /// Creates a chunk from frame-aligned bytes.
    ///
    /// # Panics
    ///
    /// Panics if `bytes.len()` is not a multiple of the frame size. Producers
    /// inside the crate only ever emit whole frames; this guards the public
    /// constructor.
    #[must_use]
    pub fn new(bytes: Vec<u8>, format: Format) -> Self {
        assert!(
            bytes.len() % format.frame_size() == 0,
            "chunk bytes must be frame-aligned ({} bytes, frame size {})",
            bytes.len(),
            format.frame_size()
        );
        let frame_count = bytes.len() / format.frame_size();
        Self {
            bytes,
            frame_count,
            format,
        }
    }

    /// Duration of this chunk at its sample rate.
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.format.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count as f64 / f64::from(self.format.sample_rate))
    }

    /// Returns `true` if this chunk contains no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Interprets the payload as interleaved f32 samples.
    ///
    /// Returns `None` unless the chunk's sample format is
    /// [`SampleFormat::F32`](crate::SampleFormat::F32).
    #[must_use]
    pub fn as_f32(&self) -> Option<Vec<f32>> {
        if self.format.sample_format != crate::SampleFormat::F32 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// Interprets the payload as interleaved i16 samples.
    ///
    /// Returns `None` unless the chunk's sample format is
    /// [`SampleFormat::I16`](crate::SampleFormat::I16).
    #[must_use]
    pub fn as_i16(&self) -> Option<Vec<i16>> {
        if self.format.sample_format != crate::SampleFormat::I16 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
        )
    }
}
