//! Asynchronous chunk iteration over a capture session.

use std::sync::Arc;
use std::time::Duration;

use crate::chunk::AudioChunk;
use crate::session::Shared;

/// Poll interval while the ring is empty. Half the default chunk duration,
/// so a waiting consumer observes new audio within one chunk period.
const POLL: Duration = Duration::from_millis(5);

/// A lazy, finite sequence of [`AudioChunk`]s from a running session.
///
/// Obtained from [`Session::stream`](crate::Session::stream). The stream
/// suspends only while the ring buffer is empty and ends when the session
/// stops and residual audio has been drained. It is not restartable;
/// dropping it cancels iteration without affecting the capture.
///
/// # Example
///
/// ```ignore
/// let mut stream = session.stream();
/// while let Some(chunk) = stream.next().await {
///     process(&chunk);
/// }
/// ```
pub struct ChunkStream {
    shared: Arc<Shared>,
    finished: bool,
}

impl ChunkStream {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            finished: false,
        }
    }

    /// Waits for the next chunk; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<AudioChunk> {
        loop {
            if self.finished {
                return None;
            }

            // Callback delivery is exclusive; an iterating consumer sees an
            // empty stream rather than duplicated chunks.
            if self.shared.callback().is_some() {
                self.finished = true;
                return None;
            }

            match self.shared.try_read_chunk() {
                Ok(Some(chunk)) => return Some(chunk),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "chunk stream ended on conversion failure");
                    self.finished = true;
                    return None;
                }
            }

            if !self.shared.is_active() {
                // Session stopped and the drain above found nothing left.
                self.finished = true;
                return None;
            }

            tokio::time::sleep(POLL).await;
        }
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("finished", &self.finished)
            .finish()
    }
}
