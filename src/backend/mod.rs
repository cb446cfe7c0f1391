//! Capture backends: one per host OS, plus a deterministic mock.
//!
//! A backend owns every OS handle involved in per-process capture (audio
//! clients, streams, subprocesses) and pushes whole native frames into the
//! session's ring buffer from its bridge thread. Construction never touches
//! OS audio APIs; `activate` acquires everything and reports the format that
//! will flow.

pub mod mock;

#[cfg(target_os = "linux")]
pub(crate) mod linux;
#[cfg(target_os = "macos")]
pub(crate) mod macos;
#[cfg(windows)]
pub(crate) mod windows;

use std::io::Read;
use std::sync::Arc;

use crate::error::TapError;
use crate::format::Format;
use crate::session::Shared;

/// What to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    /// A process id. Captures the process and its descendants.
    Pid(u32),
    /// A macOS application bundle identifier (`com.vendor.app`).
    BundleId(String),
}

impl std::fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pid(pid) => write!(f, "pid {pid}"),
            Self::BundleId(id) => write!(f, "bundle {id}"),
        }
    }
}

/// Contract between the session façade and a platform backend.
pub(crate) trait CaptureBackend: Send {
    /// Acquires OS resources and starts the bridge that fills the ring.
    /// Returns the native format that will flow.
    fn activate(&mut self) -> Result<Format, TapError>;

    /// Releases OS resources and stops the bridge. Idempotent; never panics.
    fn deactivate(&mut self);

    /// Diagnostic name of the active capture strategy.
    fn strategy(&self) -> &'static str;
}

/// Constructs the platform backend for `target`.
///
/// Cheap: resolves identifiers and validates platform support, but performs
/// no audio activity.
pub(crate) fn create(
    target: &CaptureTarget,
    shared: Arc<Shared>,
) -> Result<Box<dyn CaptureBackend>, TapError> {
    #[cfg(windows)]
    {
        return Ok(Box::new(windows::WindowsBackend::new(target, shared)?));
    }
    #[cfg(target_os = "linux")]
    {
        return Ok(Box::new(linux::LinuxBackend::new(target, shared)?));
    }
    #[cfg(target_os = "macos")]
    {
        return Ok(Box::new(macos::MacosBackend::new(target, shared)?));
    }
    #[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
    {
        let _ = (target, shared);
        Err(TapError::UnsupportedOs {
            reason: format!("no capture backend for {}", std::env::consts::OS),
        })
    }
}

/// Static capability check: does this build carry a backend for the host?
#[must_use]
pub fn is_supported() -> bool {
    cfg!(any(windows, target_os = "linux", target_os = "macos"))
}

/// Reads frame-aligned blocks from a pipe into the ring until EOF or stop.
///
/// Shared by every subprocess-based strategy (pw-record, parec, the macOS
/// helper). Runs on the caller's bridge thread. Returns `Ok(())` on clean
/// EOF after a stop request, `Err(reason)` when the producer died
/// unexpectedly.
#[allow(dead_code)] // each platform compiles only its own backends
pub(crate) fn pump_pipe_into_ring(
    mut pipe: impl Read,
    shared: &Shared,
    frame_size: usize,
) -> Result<(), String> {
    // ~10ms of 48kHz stereo f32 per read keeps latency low without
    // hammering the pipe.
    let block = (4096 / frame_size).max(1) * frame_size;
    let mut buf = vec![0u8; block];
    // Carry for partial frames split across reads.
    let mut staged = 0usize;

    loop {
        if shared.stop_requested() {
            return Ok(());
        }
        match pipe.read(&mut buf[staged..]) {
            Ok(0) => {
                return if shared.stop_requested() {
                    Ok(())
                } else {
                    Err("unexpected end of stream".into())
                };
            }
            Ok(n) => {
                let have = staged + n;
                let whole = have - have % frame_size;
                if whole > 0 {
                    shared.ring().write(&buf[..whole]);
                    buf.copy_within(whole..have, 0);
                }
                staged = have - whole;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                return if shared.stop_requested() {
                    Ok(())
                } else {
                    Err(format!("pipe read failed: {e}"))
                };
            }
        }
    }
}
