//! Bounded frame-aligned byte ring bridging the capture path to consumers.
//!
//! Exactly one producer (the backend's bridge thread or audio callback) and
//! one consumer role (the dispatcher, or a direct reader serialized by the
//! session). The writer never blocks: when the ring is full the oldest whole
//! frames are discarded and the drop counter advances. Critical sections are
//! a handful of index updates plus a bounded `memcpy`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct RingInner {
    buf: Box<[u8]>,
    /// Usable capacity: `buf.len()` rounded down to a frame multiple.
    cap: usize,
    /// Read position; always a frame boundary.
    head: usize,
    /// Occupied bytes; always a frame multiple.
    len: usize,
    frame_size: usize,
}

/// Fixed-capacity byte ring with whole-frame granularity.
pub(crate) struct ByteRing {
    inner: Mutex<RingInner>,
    readable: Condvar,
    dropped_frames: AtomicU64,
    total_written: AtomicU64,
    closed: AtomicBool,
}

impl ByteRing {
    /// Creates a ring with `capacity` bytes of storage. The frame size
    /// defaults to 1 until the backend reports its native format.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(64);
        Self {
            inner: Mutex::new(RingInner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                cap: capacity,
                head: 0,
                len: 0,
                frame_size: 1,
            }),
            readable: Condvar::new(),
            dropped_frames: AtomicU64::new(0),
            total_written: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Fixes the frame granularity. Called once by the backend after format
    /// negotiation, before the first `write`. Discards any staged bytes.
    pub fn set_frame_size(&self, frame_size: usize) {
        let mut inner = self.inner.lock();
        let frame_size = frame_size.max(1);
        inner.frame_size = frame_size;
        inner.cap = inner.buf.len() - inner.buf.len() % frame_size;
        inner.head = 0;
        inner.len = 0;
    }

    /// Current frame size in bytes.
    pub fn frame_size(&self) -> usize {
        self.inner.lock().frame_size
    }

    /// Copies `bytes` (a whole number of frames) into the ring, discarding
    /// the oldest frames if there is not enough free space. Never blocks
    /// beyond the short index-update critical section, never allocates.
    pub fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() || self.closed.load(Ordering::Acquire) {
            return;
        }

        let mut inner = self.inner.lock();
        let fs = inner.frame_size;
        debug_assert_eq!(bytes.len() % fs, 0, "ring writes must be whole frames");
        if inner.cap == 0 {
            return;
        }

        let mut src = bytes;
        // Oversized writes keep only the newest frames that fit.
        if src.len() > inner.cap {
            let skip = src.len() - inner.cap;
            self.dropped_frames
                .fetch_add((skip / fs) as u64, Ordering::Relaxed);
            src = &src[skip..];
        }

        // Make room by discarding the oldest whole frames.
        let free = inner.cap - inner.len;
        if free < src.len() {
            let shortfall = src.len() - free;
            let drop_bytes = shortfall.div_ceil(fs) * fs;
            let drop_bytes = drop_bytes.min(inner.len);
            inner.head = (inner.head + drop_bytes) % inner.cap;
            inner.len -= drop_bytes;
            self.dropped_frames
                .fetch_add((drop_bytes / fs) as u64, Ordering::Relaxed);
        }

        // Copy at the tail, wrapping at most once.
        let cap = inner.cap;
        let tail = (inner.head + inner.len) % cap;
        let first = src.len().min(cap - tail);
        inner.buf[tail..tail + first].copy_from_slice(&src[..first]);
        if first < src.len() {
            let rest = src.len() - first;
            inner.buf[..rest].copy_from_slice(&src[first..]);
        }
        inner.len += src.len();

        self.total_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        drop(inner);
        self.readable.notify_all();
    }

    /// Copies up to `dest.len()` bytes out of the ring, never splitting a
    /// frame. Returns 0 immediately when the ring is empty.
    pub fn read_available(&self, dest: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        let fs = inner.frame_size;
        let mut n = inner.len.min(dest.len());
        n -= n % fs;
        if n == 0 {
            return 0;
        }

        let cap = inner.cap;
        let head = inner.head;
        let first = n.min(cap - head);
        dest[..first].copy_from_slice(&inner.buf[head..head + first]);
        if first < n {
            let rest = n - first;
            dest[first..n].copy_from_slice(&inner.buf[..rest]);
        }
        inner.head = (head + n) % cap;
        inner.len -= n;
        n
    }

    /// Bytes currently readable.
    pub fn available(&self) -> usize {
        self.inner.lock().len
    }

    /// Blocks until at least one frame is readable, the ring is closed, or
    /// `timeout` elapses. Returns `true` when data is available.
    pub fn wait_readable(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.len >= inner.frame_size {
                return true;
            }
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self
                .readable
                .wait_for(&mut inner, deadline - now)
                .timed_out()
            {
                return inner.len >= inner.frame_size;
            }
        }
    }

    /// Marks the ring closed and wakes every waiter. Staged data remains
    /// readable; only blocking waits are affected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.inner.lock();
        self.readable.notify_all();
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Total frames discarded due to overflow.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Total bytes accepted from the producer, including frames later
    /// dropped.
    pub fn total_written(&self) -> u64 {
        self.total_written.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ring_with_frames(capacity: usize, frame_size: usize) -> ByteRing {
        let ring = ByteRing::new(capacity);
        ring.set_frame_size(frame_size);
        ring
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let ring = ring_with_frames(64, 4);
        ring.write(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ring.available(), 8);

        let mut out = [0u8; 16];
        let n = ring.read_available(&mut out);
        assert_eq!(n, 8);
        assert_eq!(&out[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_read_never_splits_frames() {
        let ring = ring_with_frames(64, 4);
        ring.write(&[1, 2, 3, 4, 5, 6, 7, 8]);

        // A 6-byte destination only gets one whole 4-byte frame.
        let mut out = [0u8; 6];
        assert_eq!(ring.read_available(&mut out), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);

        let mut rest = [0u8; 4];
        assert_eq!(ring.read_available(&mut rest), 4);
        assert_eq!(rest, [5, 6, 7, 8]);
    }

    #[test]
    fn test_overflow_drops_oldest_whole_frames() {
        let ring = ring_with_frames(16, 4);

        // Fill: frames A B C D.
        ring.write(&[1; 4]);
        ring.write(&[2; 4]);
        ring.write(&[3; 4]);
        ring.write(&[4; 4]);
        assert_eq!(ring.dropped_frames(), 0);

        // Frame E evicts A.
        ring.write(&[5; 4]);
        assert_eq!(ring.dropped_frames(), 1);
        assert_eq!(ring.available(), 16);

        let mut out = [0u8; 16];
        ring.read_available(&mut out);
        assert_eq!(&out, &[2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5]);
    }

    #[test]
    fn test_oversized_write_keeps_newest_frames() {
        let ring = ring_with_frames(8, 4);
        let data: Vec<u8> = (0..16).collect();
        ring.write(&data);
        // Two frames fit; the first two were dropped.
        assert_eq!(ring.dropped_frames(), 2);

        let mut out = [0u8; 8];
        assert_eq!(ring.read_available(&mut out), 8);
        assert_eq!(out, [8, 9, 10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let ring = ring_with_frames(12, 4);
        ring.write(&[1; 4]);
        ring.write(&[2; 4]);

        let mut out = [0u8; 4];
        ring.read_available(&mut out);

        // Tail now wraps around the end of the buffer.
        ring.write(&[3; 4]);
        ring.write(&[4; 4]);

        let mut all = [0u8; 12];
        let n = ring.read_available(&mut all);
        assert_eq!(n, 12);
        assert_eq!(&all, &[2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4]);
    }

    #[test]
    fn test_capacity_rounds_down_to_frame_multiple() {
        let ring = ByteRing::new(70);
        ring.set_frame_size(8);
        // 70 -> 64 usable; 9 frames must evict one.
        for i in 0..9u8 {
            ring.write(&[i; 8]);
        }
        assert_eq!(ring.dropped_frames(), 1);
        assert_eq!(ring.available(), 64);
    }

    #[test]
    fn test_wait_readable_times_out_when_empty() {
        let ring = ring_with_frames(64, 4);
        let start = Instant::now();
        assert!(!ring.wait_readable(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_readable_zero_timeout_returns_immediately() {
        let ring = ring_with_frames(64, 4);
        assert!(!ring.wait_readable(Duration::ZERO));
        ring.write(&[0; 4]);
        assert!(ring.wait_readable(Duration::ZERO));
    }

    #[test]
    fn test_close_wakes_waiter() {
        let ring = Arc::new(ring_with_frames(64, 4));
        let waiter = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || ring.wait_readable(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(50));
        ring.close();
        assert!(!waiter.join().expect("waiter panicked"));
    }

    #[test]
    fn test_writer_wakes_waiter() {
        let ring = Arc::new(ring_with_frames(64, 4));
        let waiter = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || ring.wait_readable(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(50));
        ring.write(&[7; 4]);
        assert!(waiter.join().expect("waiter panicked"));
    }

    #[test]
    fn test_conservation_under_concurrent_overflow() {
        // delivered + dropped * frame_size + residual == written
        let ring = Arc::new(ring_with_frames(256, 8));
        let writer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for i in 0..2000u32 {
                    let frame = [(i % 251) as u8; 8];
                    ring.write(&frame);
                }
            })
        };

        let mut delivered = 0u64;
        let mut buf = [0u8; 64];
        while !writer.is_finished() {
            delivered += ring.read_available(&mut buf) as u64;
        }
        writer.join().expect("writer panicked");
        loop {
            let n = ring.read_available(&mut buf) as u64;
            if n == 0 {
                break;
            }
            delivered += n;
        }

        let written = ring.total_written();
        let dropped_bytes = ring.dropped_frames() * 8;
        assert_eq!(written, 2000 * 8);
        assert_eq!(delivered + dropped_bytes, written);
    }
}
