//! Per-session dispatcher thread.
//!
//! When a data callback is registered, the dispatcher pulls chunks of about
//! one `chunk_duration` from the ring, runs the conversion pipeline, and
//! invokes the callback synchronously. Without a callback it stays out of
//! the way: raw native bytes remain in the ring for `read`/`stream`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::TapError;
use crate::session::{DataCallback, Shared};

/// Idle poll while no callback is registered.
const IDLE_POLL: Duration = Duration::from_millis(5);
/// Wait slice while a callback is registered but the ring is empty.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Spawns the dispatcher for a session that just became active.
pub(crate) fn spawn(shared: Arc<Shared>) -> Result<thread::JoinHandle<()>, TapError> {
    thread::Builder::new()
        .name("proctap-dispatcher".into())
        .spawn(move || run(&shared))
        .map_err(|e| TapError::internal(format!("failed to spawn dispatcher thread: {e}")))
}

fn run(shared: &Shared) {
    let Some(native) = shared.native_format() else {
        tracing::error!("dispatcher started before format negotiation");
        return;
    };
    let chunk_bytes = native.bytes_for_ms(shared.chunk_duration().as_millis() as u64);
    let mut buf = vec![0u8; chunk_bytes];

    while !shared.stop_requested() {
        let Some(callback) = shared.callback() else {
            // Pull consumers own the ring; check back for a callback soon.
            thread::sleep(IDLE_POLL);
            continue;
        };

        if !shared.ring().wait_readable(WAIT_SLICE) {
            continue;
        }
        let n = shared.ring().read_available(&mut buf);
        if n > 0 {
            deliver(shared, &callback, &buf[..n], native.frame_size());
        }
    }

    // Final drain: whatever the bridge wrote before stopping is deliverable
    // once, then discarded with the ring.
    if let Some(callback) = shared.callback() {
        loop {
            let n = shared.ring().read_available(&mut buf);
            if n == 0 {
                break;
            }
            deliver(shared, &callback, &buf[..n], native.frame_size());
        }
    }
    tracing::trace!("dispatcher exited");
}

fn deliver(shared: &Shared, callback: &DataCallback, bytes: &[u8], native_frame_size: usize) {
    let native_frames = (bytes.len() / native_frame_size) as u64;

    let payload;
    let (out_bytes, out_frames): (&[u8], usize) = match shared.converter() {
        None => (bytes, native_frames as usize),
        Some(converter) => match converter.convert(bytes) {
            Ok(converted) => {
                payload = converted.into_owned();
                let frames = converter.target().frames_in(payload.len());
                (&payload, frames)
            }
            Err(e) => {
                // Conversion trouble on one chunk must not kill the capture.
                tracing::warn!(error = %e, "dropping chunk after conversion failure");
                return;
            }
        },
    };

    let result = catch_unwind(AssertUnwindSafe(|| callback(out_bytes, out_frames)));
    if result.is_err() {
        tracing::error!("data callback panicked; capture continues");
    }
    shared.record_dispatch(native_frames);
}
