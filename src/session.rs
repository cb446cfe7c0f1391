//! Capture session lifecycle and consumer surfaces.
//!
//! A [`Session`] owns its backend, ring buffer, and dispatcher thread. The
//! state machine runs `Created -> Starting -> Running -> Stopping ->
//! Stopped`, with `Failed` and `Closed` as terminal states. Transitions are
//! serialized under a session mutex that is never held across OS audio calls
//! or user callbacks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::backend::CaptureBackend;
use crate::chunk::AudioChunk;
use crate::config::{CaptureConfig, ResampleQuality};
use crate::convert::Converter;
use crate::error::{ErrorKind, TapError};
use crate::format::Format;
use crate::pipeline::dispatcher;
use crate::pipeline::ring::ByteRing;
use crate::pipeline::stream::ChunkStream;

/// How long `stop` waits for the dispatcher to drain and exit.
const STOP_DEADLINE: Duration = Duration::from_millis(500);

/// Upper bound on bytes returned by a single `read`.
const MAX_READ_BYTES: usize = 256 * 1024;

/// Push-delivery callback: `(pcm_bytes, frame_count)`.
///
/// Invoked synchronously on the session's dispatcher thread. Panics are
/// caught, logged, and do not stop capture.
pub type DataCallback = Arc<dyn Fn(&[u8], usize) + Send + Sync>;

/// Creates a [`DataCallback`] from a closure.
pub fn data_callback<F>(f: F) -> DataCallback
where
    F: Fn(&[u8], usize) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed(ErrorKind),
    Closed,
}

/// Statistics for a capture session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    /// Bytes the backend has written into the ring (including later drops).
    pub bytes_captured: u64,
    /// Native frames handed to consumers (callback or `read`/`stream`).
    pub frames_delivered: u64,
    /// Frames discarded because the ring overflowed.
    pub dropped_frames: u64,
    /// Chunks pushed through the data callback.
    pub chunks_dispatched: u64,
}

/// State shared between the session façade, its dispatcher thread, and the
/// backend bridge.
pub(crate) struct Shared {
    state: Mutex<State>,
    ring: ByteRing,
    requested: Option<Format>,
    quality: ResampleQuality,
    chunk_duration: Duration,
    native_format: OnceLock<Format>,
    converter: OnceLock<Option<Converter>>,
    callback: Mutex<Option<DataCallback>>,
    stop_requested: AtomicBool,
    last_error: Mutex<Option<TapError>>,
    frames_delivered: AtomicU64,
    chunks_dispatched: AtomicU64,
}

impl Shared {
    pub(crate) fn new(config: &CaptureConfig, requested: Option<Format>) -> Self {
        Self {
            state: Mutex::new(State::Created),
            ring: ByteRing::new(config.ring_capacity),
            requested,
            quality: config.resample_quality,
            chunk_duration: config.chunk_duration,
            native_format: OnceLock::new(),
            converter: OnceLock::new(),
            callback: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            last_error: Mutex::new(None),
            frames_delivered: AtomicU64::new(0),
            chunks_dispatched: AtomicU64::new(0),
        }
    }

    pub(crate) fn ring(&self) -> &ByteRing {
        &self.ring
    }

    pub(crate) fn state(&self) -> State {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: State) {
        *self.state.lock() = state;
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(self.state(), State::Starting | State::Running)
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    /// Records the format the backend negotiated and fixes the ring's frame
    /// granularity. Backends call this before their first ring write; later
    /// calls are no-ops so the façade can re-report it safely.
    pub(crate) fn set_native_format(&self, format: Format) {
        if self.native_format.get().is_some() {
            return;
        }
        self.ring.set_frame_size(format.frame_size());
        let _ = self.native_format.set(format);
        let _ = self.converter.set(self.requested.and_then(|target| {
            if target == format {
                None
            } else {
                Some(Converter::new(format, target, self.quality))
            }
        }));
    }

    pub(crate) fn native_format(&self) -> Option<Format> {
        self.native_format.get().copied()
    }

    /// Format chunks are delivered in: the requested format, else native.
    #[allow(dead_code)] // consulted by backends that negotiate a format up front
    pub(crate) fn output_format(&self) -> Option<Format> {
        self.requested.or_else(|| self.native_format())
    }

    pub(crate) fn converter(&self) -> Option<&Converter> {
        self.converter.get().and_then(Option::as_ref)
    }

    pub(crate) fn chunk_duration(&self) -> Duration {
        self.chunk_duration
    }

    pub(crate) fn callback(&self) -> Option<DataCallback> {
        self.callback.lock().clone()
    }

    pub(crate) fn install_callback(&self, callback: DataCallback) {
        *self.callback.lock() = Some(callback);
    }

    pub(crate) fn record_dispatch(&self, native_frames: u64) {
        self.frames_delivered
            .fetch_add(native_frames, Ordering::Relaxed);
        self.chunks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Moves the session to `Failed`, preserving the first cause, and wakes
    /// every blocked consumer. Safe to call from any backend thread.
    pub(crate) fn fail(&self, error: TapError) {
        let kind = error.kind();
        {
            let mut last = self.last_error.lock();
            if last.is_none() {
                *last = Some(error);
            }
        }
        {
            let mut state = self.state.lock();
            if !matches!(*state, State::Closed | State::Failed(_)) {
                *state = State::Failed(kind);
            }
        }
        self.request_stop();
        self.ring.close();
        tracing::error!(?kind, "capture session failed");
    }

    /// Non-blocking read of whatever whole frames are available, converted
    /// to the output format. `Ok(None)` when the ring holds less than one
    /// frame.
    pub(crate) fn try_read_chunk(&self) -> Result<Option<AudioChunk>, TapError> {
        let Some(native) = self.native_format() else {
            return Ok(None);
        };
        let frame_size = native.frame_size();
        let available = self.ring.available();
        if available < frame_size {
            return Ok(None);
        }

        let take = available.min(MAX_READ_BYTES / frame_size * frame_size);
        let mut buf = vec![0u8; take];
        let n = self.ring.read_available(&mut buf);
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);

        let native_frames = (n / frame_size) as u64;
        let chunk = match self.converter() {
            None => AudioChunk::new(buf, native),
            Some(converter) => {
                let converted = converter.convert(&buf)?.into_owned();
                AudioChunk::new(converted, converter.target())
            }
        };
        self.frames_delivered
            .fetch_add(native_frames, Ordering::Relaxed);
        Ok(Some(chunk))
    }

    pub(crate) fn take_last_error(&self) -> Option<TapError> {
        self.last_error.lock().as_ref().map(TapError::duplicate)
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_captured: self.ring.total_written(),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            dropped_frames: self.ring.dropped_frames(),
            chunks_dispatched: self.chunks_dispatched.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a per-process capture session.
///
/// Created by [`ProcTap::builder()`](crate::ProcTap::builder). A session is
/// inert until [`start`](Session::start) and unusable after
/// [`close`](Session::close).
///
/// # Example
///
/// ```ignore
/// let session = ProcTap::builder().pid(4242).open()?;
/// session.start()?;
///
/// while let Some(chunk) = session.read(Duration::from_millis(500))? {
///     stdout.write_all(&chunk.bytes)?;
/// }
///
/// session.close()?;
/// ```
pub struct Session {
    shared: Arc<Shared>,
    backend: Mutex<Option<Box<dyn CaptureBackend>>>,
    dispatcher: Mutex<Option<std::thread::JoinHandle<()>>>,
    /// Serializes concurrent `read` callers so the consumer role stays
    /// single.
    read_serial: Mutex<()>,
}

impl Session {
    pub(crate) fn new(shared: Arc<Shared>, backend: Box<dyn CaptureBackend>) -> Self {
        Self {
            shared,
            backend: Mutex::new(Some(backend)),
            dispatcher: Mutex::new(None),
            read_serial: Mutex::new(()),
        }
    }

    /// Activates the backend and begins capturing.
    ///
    /// On any failure the partially acquired resources are released and the
    /// session lands in a terminal failed state; the error is returned
    /// synchronously.
    pub fn start(&self) -> Result<(), TapError> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                State::Created => *state = State::Starting,
                State::Closed => return Err(TapError::SessionClosed),
                State::Starting | State::Running => return Ok(()),
                State::Failed(_) | State::Stopping | State::Stopped => {
                    return Err(TapError::SessionStopped)
                }
            }
        }

        let mut backend_slot = self.backend.lock();
        let Some(backend) = backend_slot.as_mut() else {
            self.shared.set_state(State::Failed(ErrorKind::Internal));
            return Err(TapError::internal("session has no backend"));
        };

        match backend.activate() {
            Ok(native) => {
                tracing::info!(%native, strategy = backend.strategy(), "capture started");
                self.shared.set_native_format(native);

                match dispatcher::spawn(Arc::clone(&self.shared)) {
                    Ok(handle) => {
                        drop(backend_slot);
                        *self.dispatcher.lock() = Some(handle);
                        self.shared.set_state(State::Running);
                        Ok(())
                    }
                    Err(e) => {
                        // The backend is live by now; release it before
                        // failing the session.
                        self.shared.request_stop();
                        backend.deactivate();
                        drop(backend_slot);
                        self.shared.fail(e.duplicate());
                        Err(e)
                    }
                }
            }
            Err(e) => {
                backend.deactivate();
                drop(backend_slot);
                self.shared.fail(e.duplicate());
                Err(e)
            }
        }
    }

    /// Blocks up to `timeout` for at least one frame of audio.
    ///
    /// Returns `Ok(None)` on timeout — and immediately when a data callback
    /// is registered, since callback delivery is exclusive. Returns
    /// `Err(SessionStopped)` once the session has left the running states.
    /// Chunks are always whole frames, converted to the requested format
    /// when one was given.
    pub fn read(&self, timeout: Duration) -> Result<Option<AudioChunk>, TapError> {
        let _serial = self.read_serial.lock();
        let deadline = Instant::now() + timeout;

        loop {
            match self.shared.state() {
                State::Starting | State::Running => {}
                State::Closed => return Err(TapError::SessionClosed),
                _ => return Err(TapError::SessionStopped),
            }

            if self.shared.callback().is_some() {
                return Ok(None);
            }

            if let Some(chunk) = self.shared.try_read_chunk()? {
                return Ok(Some(chunk));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Short slices so callback registration and state changes are
            // observed promptly.
            let slice = (deadline - now).min(Duration::from_millis(50));
            self.shared.ring().wait_readable(slice);
        }
    }

    /// Returns a lazy, finite stream of chunks.
    ///
    /// The stream suspends only while the ring is empty and terminates
    /// cleanly once the session stops and residual audio is drained.
    /// Dropping the stream does not stop the capture.
    #[must_use]
    pub fn stream(&self) -> ChunkStream {
        ChunkStream::new(Arc::clone(&self.shared))
    }

    /// Registers the push callback, replacing any previous one.
    ///
    /// Takes effect at the next chunk boundary. While registered, chunks go
    /// exclusively to the callback and `read` returns `Ok(None)`.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&[u8], usize) + Send + Sync + 'static,
    {
        *self.shared.callback.lock() = Some(Arc::new(callback));
    }

    /// Removes the push callback; chunks queue for `read`/`stream` again.
    pub fn clear_callback(&self) {
        *self.shared.callback.lock() = None;
    }

    /// The format the backend actually delivers. Valid only while running.
    pub fn native_format(&self) -> Result<Format, TapError> {
        match self.shared.state() {
            State::Running => self
                .shared
                .native_format()
                .ok_or_else(|| TapError::internal("running session without native format")),
            State::Closed => Err(TapError::SessionClosed),
            _ => Err(TapError::SessionStopped),
        }
    }

    /// `true` while the session is starting or running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_active()
    }

    /// Current session statistics.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }

    /// The first error that moved the session into the failed state.
    #[must_use]
    pub fn last_error(&self) -> Option<TapError> {
        self.shared.take_last_error()
    }

    /// Diagnostic name of the backend strategy in use (e.g. which Linux
    /// capture path won the probe).
    #[must_use]
    pub fn strategy(&self) -> Option<&'static str> {
        self.backend.lock().as_ref().map(|b| b.strategy())
    }

    /// Stops capture and tears down OS resources. Idempotent; completes
    /// within a bounded time regardless of backend state. Readers blocked in
    /// `read` wake with `SessionStopped`.
    pub fn stop(&self) -> Result<(), TapError> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                State::Closed => return Err(TapError::SessionClosed),
                State::Stopped | State::Stopping | State::Failed(_) => return Ok(()),
                State::Created => {
                    *state = State::Stopped;
                    return Ok(());
                }
                State::Starting | State::Running => *state = State::Stopping,
            }
        }

        self.shared.request_stop();

        if let Some(mut backend) = self.backend.lock().take() {
            backend.deactivate();
        }
        self.shared.ring().close();
        self.join_dispatcher();

        // A backend failure observed during teardown keeps the Failed state.
        {
            let mut state = self.shared.state.lock();
            if *state == State::Stopping {
                *state = State::Stopped;
            }
        }
        tracing::debug!("capture session stopped");
        Ok(())
    }

    /// Stops if needed and releases every remaining resource. After `close`
    /// all operations return `SessionClosed`; closing twice is a no-op.
    pub fn close(&self) -> Result<(), TapError> {
        match self.shared.state() {
            State::Closed => return Ok(()),
            State::Starting | State::Running => {
                let _ = self.stop();
            }
            _ => {
                // Make sure straggling resources are gone even from
                // Stopped/Failed.
                self.shared.request_stop();
                if let Some(mut backend) = self.backend.lock().take() {
                    backend.deactivate();
                }
                self.shared.ring().close();
                self.join_dispatcher();
            }
        }
        self.shared.set_state(State::Closed);
        Ok(())
    }

    /// Joins the dispatcher, detaching it if it overruns the stop deadline.
    fn join_dispatcher(&self) {
        let Some(handle) = self.dispatcher.lock().take() else {
            return;
        };
        let deadline = Instant::now() + STOP_DEADLINE;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("dispatcher did not exit within the stop deadline; detaching");
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let _ = handle.join();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.shared.is_active() {
            // Dropped without an explicit stop; tear down synchronously but
            // bounded.
            let _ = self.stop();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.shared.state())
            .field("native_format", &self.shared.native_format())
            .finish_non_exhaustive()
    }
}
