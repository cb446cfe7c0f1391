//! Deterministic in-process backend for testing without OS audio.
//!
//! The mock plays a pre-generated PCM buffer through the real bridge-thread
//! machinery, so session lifecycle, ring accounting, conversion, and
//! delivery surfaces can all be exercised in CI.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::backend::CaptureBackend;
use crate::error::TapError;
use crate::format::{Format, SampleFormat};
use crate::session::Shared;

/// A scripted audio source standing in for a real capture backend.
///
/// # Example
///
/// ```
/// use proctap::MockBackend;
///
/// let mut mock = MockBackend::new();
/// mock.generate_sine(1000.0, 0.5, 250);
/// mock.generate_silence(50);
/// ```
pub struct MockBackend {
    format: Format,
    pcm: Vec<u8>,
    realtime: bool,
    die_after_playback: bool,
    activation_error: Option<TapError>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Creates a mock producing 48kHz stereo float32, the common native
    /// format of the real backends.
    #[must_use]
    pub fn new() -> Self {
        Self::with_format(Format::new(48000, 2, SampleFormat::F32))
    }

    /// Creates a mock with an explicit native format.
    #[must_use]
    pub fn with_format(format: Format) -> Self {
        Self {
            format,
            pcm: Vec::new(),
            realtime: false,
            die_after_playback: false,
            activation_error: None,
        }
    }

    /// The native format this mock reports.
    #[must_use]
    pub fn format(&self) -> Format {
        self.format
    }

    /// Appends `duration_ms` of a sine wave at `frequency` Hz and
    /// `amplitude` (1.0 = full scale), identical on all channels.
    pub fn generate_sine(&mut self, frequency: f64, amplitude: f64, duration_ms: u64) {
        let frames = (u64::from(self.format.sample_rate) * duration_ms / 1000) as usize;
        let rate = f64::from(self.format.sample_rate);
        for i in 0..frames {
            let t = i as f64 / rate;
            let v = (2.0 * std::f64::consts::PI * frequency * t).sin() * amplitude;
            self.push_frame(v as f32);
        }
    }

    /// Appends `duration_ms` of silence.
    pub fn generate_silence(&mut self, duration_ms: u64) {
        let frames = (u64::from(self.format.sample_rate) * duration_ms / 1000) as usize;
        for _ in 0..frames {
            self.push_frame(0.0);
        }
    }

    /// Appends raw pre-encoded bytes (must be whole frames).
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        assert_eq!(bytes.len() % self.format.frame_size(), 0);
        self.pcm.extend_from_slice(bytes);
    }

    /// When `true`, audio is paced at real time (10ms slices); otherwise the
    /// whole buffer is written as fast as the ring accepts it.
    pub fn set_realtime(&mut self, realtime: bool) {
        self.realtime = realtime;
    }

    /// Simulates a mid-stream backend death: once the scripted audio has
    /// been written, the session fails with `BackendLost`.
    pub fn set_die_after_playback(&mut self, die: bool) {
        self.die_after_playback = die;
    }

    /// Makes `activate` fail with the given error instead of starting.
    pub fn set_activation_error(&mut self, error: TapError) {
        self.activation_error = Some(error);
    }

    /// Total frames scripted so far.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.pcm.len() / self.format.frame_size()
    }

    fn push_frame(&mut self, value: f32) {
        for _ in 0..self.format.channels {
            match self.format.sample_format {
                SampleFormat::F32 => self.pcm.extend_from_slice(&value.to_le_bytes()),
                SampleFormat::I16 => {
                    let v = (f64::from(value) * 32768.0).round() as i64;
                    let v = v.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16;
                    self.pcm.extend_from_slice(&v.to_le_bytes());
                }
                SampleFormat::I24 => {
                    let v = (f64::from(value) * 8_388_608.0).round() as i64;
                    let v = v.clamp(-8_388_608, 8_388_607) as i32;
                    self.pcm.extend_from_slice(&v.to_le_bytes()[..3]);
                }
                SampleFormat::I32 => {
                    let v = (f64::from(value) * 2_147_483_648.0).round() as i64;
                    let v = v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
                    self.pcm.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
    }
}

/// Bridge adapter that plays a [`MockBackend`] into a session's ring.
pub(crate) struct MockRunner {
    mock: Option<MockBackend>,
    shared: Arc<Shared>,
    local_stop: Arc<AtomicBool>,
    bridge: Option<thread::JoinHandle<()>>,
}

impl MockRunner {
    pub(crate) fn new(mock: MockBackend, shared: Arc<Shared>) -> Self {
        Self {
            mock: Some(mock),
            shared,
            local_stop: Arc::new(AtomicBool::new(false)),
            bridge: None,
        }
    }
}

impl CaptureBackend for MockRunner {
    fn activate(&mut self) -> Result<Format, TapError> {
        let mut mock = self
            .mock
            .take()
            .ok_or_else(|| TapError::internal("mock backend activated twice"))?;

        if let Some(error) = mock.activation_error.take() {
            return Err(error);
        }

        let format = mock.format;
        // Fix the ring's frame granularity before the bridge's first write.
        self.shared.set_native_format(format);
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.local_stop);
        let slice_bytes = format.bytes_for_ms(10);

        let bridge = thread::Builder::new()
            .name("proctap-mock-bridge".into())
            .spawn(move || {
                let mut offset = 0;
                while offset < mock.pcm.len() {
                    if stop.load(Ordering::Acquire) || shared.stop_requested() {
                        return;
                    }
                    let end = (offset + slice_bytes).min(mock.pcm.len());
                    shared.ring().write(&mock.pcm[offset..end]);
                    offset = end;
                    if mock.realtime {
                        thread::sleep(Duration::from_millis(10));
                    }
                }

                if mock.die_after_playback {
                    shared.fail(TapError::backend_lost("mock target exited"));
                    return;
                }

                // Keep "capturing" silence-free until told to stop, like a
                // real backend whose target has gone quiet.
                while !stop.load(Ordering::Acquire) && !shared.stop_requested() {
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .map_err(|e| TapError::internal(format!("failed to spawn mock bridge: {e}")))?;

        self.bridge = Some(bridge);
        Ok(format)
    }

    fn deactivate(&mut self) {
        self.local_stop.store(true, Ordering::Release);
        if let Some(bridge) = self.bridge.take() {
            let _ = bridge.join();
        }
    }

    fn strategy(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_generation_length() {
        let mut mock = MockBackend::new();
        mock.generate_sine(440.0, 0.5, 100);
        // 100ms at 48kHz = 4800 frames.
        assert_eq!(mock.frame_count(), 4800);
    }

    #[test]
    fn test_i16_mock_frames() {
        let mut mock = MockBackend::with_format(Format::new(16000, 1, SampleFormat::I16));
        mock.generate_silence(100);
        assert_eq!(mock.frame_count(), 1600);
        assert!(mock.pcm.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic]
    fn test_push_bytes_rejects_partial_frames() {
        let mut mock = MockBackend::new();
        mock.push_bytes(&[0u8; 7]);
    }
}
