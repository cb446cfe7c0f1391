//! Linux backend: per-process capture over PipeWire or PulseAudio.
//!
//! Strategies are probed in order at activation; the first to succeed owns
//! the capture until deactivation:
//!
//! 1. native PipeWire stream (`pipewire-native` feature)
//! 2. `pw-record` subprocess targeting the discovered node
//! 3. PulseAudio private null-sink + `parec`
//!
//! Per-strategy failures are folded into one `BackendUnavailable` error that
//! is only surfaced when every strategy has failed.

#[cfg(feature = "pipewire-native")]
mod pw_native;
mod pw_record;
mod pulse;

use std::path::Path;
use std::sync::Arc;

use crate::backend::{CaptureBackend, CaptureTarget};
use crate::error::TapError;
use crate::format::Format;
use crate::session::Shared;

/// A strategy that has acquired its OS resources and is filling the ring.
pub(crate) trait ActiveCapture: Send {
    /// Stops the capture and releases everything. Idempotent.
    fn shutdown(&mut self);
    /// Diagnostic strategy name.
    fn name(&self) -> &'static str;
}

pub(crate) struct LinuxBackend {
    pid: u32,
    shared: Arc<Shared>,
    active: Option<Box<dyn ActiveCapture>>,
}

impl LinuxBackend {
    pub(crate) fn new(target: &CaptureTarget, shared: Arc<Shared>) -> Result<Self, TapError> {
        let pid = match target {
            CaptureTarget::Pid(pid) => *pid,
            CaptureTarget::BundleId(_) => {
                return Err(TapError::invalid_target(
                    "bundle identifiers are only valid on macOS",
                ))
            }
        };
        Ok(Self {
            pid,
            shared,
            active: None,
        })
    }
}

impl CaptureBackend for LinuxBackend {
    fn activate(&mut self) -> Result<Format, TapError> {
        if !Path::new(&format!("/proc/{}", self.pid)).exists() {
            return Err(TapError::target_not_found(format!("pid {}", self.pid)));
        }

        let mut reasons = Vec::new();

        #[cfg(feature = "pipewire-native")]
        match pw_native::activate(self.pid, Arc::clone(&self.shared)) {
            Ok((format, active)) => {
                self.active = Some(active);
                return Ok(format);
            }
            Err(reason) => {
                tracing::debug!(%reason, "native PipeWire strategy failed");
                reasons.push(format!("pipewire: {reason}"));
            }
        }

        match pw_record::activate(self.pid, Arc::clone(&self.shared)) {
            Ok((format, active)) => {
                self.active = Some(active);
                return Ok(format);
            }
            Err(reason) => {
                tracing::debug!(%reason, "pw-record strategy failed");
                reasons.push(format!("pw-record: {reason}"));
            }
        }

        match pulse::activate(self.pid, Arc::clone(&self.shared)) {
            Ok((format, active)) => {
                self.active = Some(active);
                return Ok(format);
            }
            Err(reason) => {
                tracing::debug!(%reason, "PulseAudio strategy failed");
                reasons.push(format!("pulseaudio: {reason}"));
            }
        }

        Err(TapError::BackendUnavailable { reasons })
    }

    fn deactivate(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.shutdown();
        }
    }

    fn strategy(&self) -> &'static str {
        self.active.as_ref().map_or("unselected", |a| a.name())
    }
}

/// The format both subprocess strategies request from their producers:
/// 48kHz stereo interleaved little-endian float32.
pub(crate) fn subprocess_format() -> Format {
    Format::new(48000, 2, crate::format::SampleFormat::F32)
}
