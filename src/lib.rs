//! # proctap
//!
//! Per-process audio capture: given a process id, deliver a live PCM stream
//! of that process's audio output — and only that process's audio — without
//! system sounds or other applications mixed in.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use proctap::{ProcTap, CaptureConfig, SampleFormat};
//! use std::time::Duration;
//!
//! let session = ProcTap::builder()
//!     .pid(4242)
//!     .config(CaptureConfig {
//!         sample_rate: 48000,
//!         channels: 2,
//!         sample_format: SampleFormat::F32,
//!         ..Default::default()
//!     })
//!     .open()?;
//!
//! session.start()?;
//!
//! // Pull chunks...
//! while let Some(chunk) = session.read(Duration::from_millis(500))? {
//!     feed_encoder(&chunk.bytes);
//! }
//!
//! // ...or iterate asynchronously:
//! let mut stream = session.stream();
//! while let Some(chunk) = stream.next().await {
//!     feed_encoder(&chunk.bytes);
//! }
//!
//! session.stop()?;
//! session.close()?;
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary:
//!
//! - **OS audio / bridge thread**: owned by the backend, fills the ring
//!   buffer and never blocks on consumers
//! - **Ring buffer**: bounded frame-aligned byte queue that absorbs pressure
//!   from slow consumers by dropping the oldest audio
//! - **Dispatcher thread**: runs the conversion pipeline and fans out to the
//!   data callback, or leaves raw audio queued for `read`/`stream`
//!
//! ## Platform backends
//!
//! | Platform | Mechanism | Requires |
//! |----------|-----------|----------|
//! | Windows  | WASAPI process loopback | Windows 10 build 19041+ |
//! | Linux    | PipeWire stream, `pw-record`, or PulseAudio null-sink | PipeWire or PulseAudio |
//! | macOS    | ScreenCaptureKit helper subprocess | macOS 13+, Screen Recording permission |

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod backend;
mod builder;
mod chunk;
mod config;
pub mod convert;
mod error;
mod format;
mod pipeline;
mod session;

pub use backend::mock::MockBackend;
pub use backend::{is_supported, CaptureTarget};
pub use builder::{ProcTap, ProcTapBuilder};
pub use chunk::AudioChunk;
pub use config::{CaptureConfig, ResampleQuality};
pub use error::{ErrorKind, TapError};
pub use format::{detect_format, DetectedFormat, Format, SampleFormat};
pub use pipeline::stream::ChunkStream;
pub use session::{data_callback, DataCallback, Session, SessionStats};
