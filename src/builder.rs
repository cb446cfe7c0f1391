//! Builder for capture sessions.

use std::sync::Arc;

use crate::backend::mock::{MockBackend, MockRunner};
use crate::backend::{self, CaptureTarget};
use crate::config::{CaptureConfig, ResampleQuality};
use crate::error::TapError;
use crate::session::{DataCallback, Session, Shared};

/// Entry point for proctap.
///
/// # Example
///
/// ```ignore
/// use proctap::{ProcTap, CaptureConfig, SampleFormat};
/// use std::time::Duration;
///
/// let session = ProcTap::builder()
///     .pid(4242)
///     .config(CaptureConfig {
///         sample_rate: 44100,
///         channels: 1,
///         sample_format: SampleFormat::I16,
///         ..Default::default()
///     })
///     .open()?;
///
/// session.start()?;
/// while let Some(chunk) = session.read(Duration::from_millis(500))? {
///     // feed chunk.bytes to an encoder, a socket, ...
/// }
/// session.close()?;
/// ```
pub struct ProcTap;

impl ProcTap {
    /// Creates a builder for configuring a capture session.
    #[must_use]
    pub fn builder() -> ProcTapBuilder {
        ProcTapBuilder::new()
    }
}

/// Configures and opens a [`Session`].
#[must_use]
pub struct ProcTapBuilder {
    target: Option<CaptureTarget>,
    config: Option<CaptureConfig>,
    callback: Option<DataCallback>,
    capacity: Option<usize>,
    mock: Option<MockBackend>,
}

impl Default for ProcTapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcTapBuilder {
    /// Creates a builder with no target and native-format output.
    pub fn new() -> Self {
        Self {
            target: None,
            config: None,
            callback: None,
            capacity: None,
            mock: None,
        }
    }

    /// Captures the process with the given id (and its descendants).
    pub fn pid(mut self, pid: u32) -> Self {
        self.target = Some(CaptureTarget::Pid(pid));
        self
    }

    /// Captures the application with the given bundle identifier.
    ///
    /// Only meaningful on macOS; other platforms reject it at `open`.
    pub fn bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.target = Some(CaptureTarget::BundleId(bundle_id.into()));
        self
    }

    /// Requests an output format and conversion behavior.
    ///
    /// Without this, chunks arrive in the backend's native format and the
    /// conversion pipeline is bypassed entirely.
    pub fn config(mut self, config: CaptureConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the resampling quality without otherwise requesting a format.
    pub fn quality(mut self, quality: ResampleQuality) -> Self {
        let mut config = self.config.take().unwrap_or_default();
        config.resample_quality = quality;
        self.config = Some(config);
        self
    }

    /// Overrides the ring buffer capacity in bytes.
    pub fn capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Registers a push callback invoked with `(pcm_bytes, frame_count)`.
    ///
    /// While a callback is registered, delivery is exclusive: `read` and
    /// `stream` observe an empty session.
    pub fn on_data<F>(mut self, callback: F) -> Self
    where
        F: Fn(&[u8], usize) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Substitutes a scripted [`MockBackend`] for the platform backend.
    ///
    /// Intended for tests and CI machines without a capturable process; no
    /// target is required.
    pub fn mock_backend(mut self, mock: MockBackend) -> Self {
        self.mock = Some(mock);
        self
    }

    /// Validates the target and constructs a `Created` session.
    ///
    /// No audio activity happens here; OS resources are acquired by
    /// [`Session::start`].
    pub fn open(self) -> Result<Session, TapError> {
        if let Some(config) = &self.config {
            config.validate()?;
        }

        // The ambient knobs (chunk duration, ring size, quality) always have
        // defaults; a *requested format* only exists when the caller set one.
        let requested = self.config.as_ref().map(CaptureConfig::format);
        let mut effective = self.config.clone().unwrap_or_default();
        if let Some(capacity) = self.capacity {
            effective.ring_capacity = capacity;
        }

        let shared = Arc::new(Shared::new(&effective, requested));
        if let Some(callback) = self.callback {
            shared.install_callback(callback);
        }

        let backend: Box<dyn backend::CaptureBackend> = match self.mock {
            Some(mock) => Box::new(MockRunner::new(mock, Arc::clone(&shared))),
            None => {
                let target = self
                    .target
                    .ok_or_else(|| TapError::invalid_target("no capture target given"))?;
                match &target {
                    CaptureTarget::Pid(0) => {
                        return Err(TapError::invalid_target("pid 0"));
                    }
                    CaptureTarget::BundleId(_) if !cfg!(target_os = "macos") => {
                        return Err(TapError::invalid_target(
                            "bundle identifiers are only valid on macOS",
                        ));
                    }
                    _ => {}
                }
                backend::create(&target, Arc::clone(&shared))?
            }
        };

        Ok(Session::new(shared, backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_open_requires_target() {
        let err = ProcTap::builder().open().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTarget);
    }

    #[test]
    fn test_open_rejects_pid_zero() {
        let err = ProcTap::builder().pid(0).open().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTarget);
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_open_rejects_bundle_id_off_macos() {
        let err = ProcTap::builder()
            .bundle_id("com.example.app")
            .open()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTarget);
    }

    #[test]
    fn test_open_with_mock_needs_no_target() {
        let session = ProcTap::builder()
            .mock_backend(MockBackend::new())
            .open()
            .expect("mock session opens");
        assert!(!session.is_running());
    }

    #[test]
    fn test_open_rejects_bad_config() {
        let config = CaptureConfig {
            channels: 7,
            ..Default::default()
        };
        let err = ProcTap::builder()
            .mock_backend(MockBackend::new())
            .config(config)
            .open()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FormatUnsupported);
    }
}
