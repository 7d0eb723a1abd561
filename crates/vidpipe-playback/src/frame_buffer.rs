//! Bounded, index-keyed cache of decoded frames.
//!
//! Filled by the session's ingest thread, read by the scheduler. Capacity is
//! enforced by evicting the oldest-inserted frames first. Evicted and cleared
//! frames are dropped before the call returns, after the lock is released,
//! so their pixel buffers are freed synchronously.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;
use vidpipe_core::{DecodedFrame, SharedFrame};

struct Inner {
    frames: HashMap<usize, SharedFrame>,
    /// Frame numbers in arrival order, oldest first. Holds each key once.
    arrival: VecDeque<usize>,
    generation: u64,
    playhead: usize,
    total_frames: usize,
    closed: bool,
}

impl Inner {
    fn remove_from_arrival(&mut self, frame_number: usize) {
        if let Some(pos) = self.arrival.iter().position(|&n| n == frame_number) {
            self.arrival.remove(pos);
        }
    }

    /// Whether `frame_number` lies in `[playhead, playhead + window)`,
    /// wrapping over the stream length.
    fn in_lookahead(&self, frame_number: usize, max_size: usize) -> bool {
        if self.total_frames == 0 {
            return false;
        }
        let window = max_size.min(self.total_frames);
        let ahead = (frame_number + self.total_frames - self.playhead % self.total_frames)
            % self.total_frames;
        frame_number < self.total_frames && ahead < window
    }

    /// Whether inserting `incoming` would evict a frame that is still ahead
    /// of the playhead.
    fn would_evict_lookahead(&self, incoming: &[usize], max_size: usize) -> bool {
        let new_keys = incoming
            .iter()
            .filter(|&n| !self.frames.contains_key(n))
            .count();
        let overflow = (self.frames.len() + new_keys).saturating_sub(max_size);
        self.arrival
            .iter()
            .filter(|&n| !incoming.contains(n))
            .take(overflow)
            .any(|&n| self.in_lookahead(n, max_size))
    }
}

/// Thread-safe frame cache shared by the decode and presentation sides.
pub struct FrameBuffer {
    inner: Mutex<Inner>,
    changed: Condvar,
    max_size: usize,
}

impl FrameBuffer {
    /// Create an empty buffer holding at most `max_size` frames (at least one).
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            inner: Mutex::new(Inner {
                frames: HashMap::with_capacity(max_size + 1),
                arrival: VecDeque::with_capacity(max_size + 1),
                generation: 0,
                playhead: 0,
                total_frames: 0,
                closed: false,
            }),
            changed: Condvar::new(),
            max_size,
        }
    }

    pub fn shared(max_size: usize) -> Arc<Self> {
        Arc::new(Self::new(max_size))
    }

    /// Insert a batch decoded under `generation`.
    ///
    /// A batch from an older generation is dropped whole. A frame number
    /// already present is replaced and counts as newly arrived. Returns the
    /// number of frames inserted.
    pub fn add_frames(&self, generation: u64, batch: Vec<DecodedFrame>) -> usize {
        let mut evicted = Vec::new();
        let inserted = {
            let mut inner = self.inner.lock();
            if generation != inner.generation {
                trace!(
                    generation,
                    current = inner.generation,
                    count = batch.len(),
                    "Dropping stale batch"
                );
                0
            } else {
                let count = batch.len();
                for frame in batch {
                    let frame_number = frame.frame_number;
                    if let Some(old) = inner.frames.insert(frame_number, Arc::new(frame)) {
                        inner.remove_from_arrival(frame_number);
                        evicted.push(old);
                    }
                    inner.arrival.push_back(frame_number);
                }

                while inner.frames.len() > self.max_size {
                    let Some(oldest) = inner.arrival.pop_front() else {
                        break;
                    };
                    if let Some(frame) = inner.frames.remove(&oldest) {
                        evicted.push(frame);
                    }
                }
                count
            }
        };

        if inserted > 0 {
            self.changed.notify_all();
        }
        // Released here, outside the lock.
        drop(evicted);
        inserted
    }

    /// Look up a frame without touching content or order.
    pub fn get_frame(&self, index: usize) -> Option<SharedFrame> {
        self.inner.lock().frames.get(&index).cloned()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.inner.lock().frames.contains_key(&index)
    }

    /// Block until at least `min_fill` frames (capped at capacity) are
    /// buffered. Returns whether that happened before `timeout`.
    pub fn wait_for_initial_buffer(&self, min_fill: usize, timeout: Duration) -> bool {
        let target = min_fill.min(self.max_size);
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.frames.len() < target && !inner.closed {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.frames.len() >= target
    }

    /// Release every frame and start a new generation, which is returned.
    pub fn clear(&self) -> u64 {
        let (released, generation) = {
            let mut inner = self.inner.lock();
            inner.arrival.clear();
            inner.generation += 1;
            let released: Vec<SharedFrame> = inner.frames.drain().map(|(_, f)| f).collect();
            (released, inner.generation)
        };
        self.changed.notify_all();
        trace!(generation, released = released.len(), "Frame buffer cleared");
        drop(released);
        generation
    }

    /// Record the presentation position used for backpressure.
    pub fn set_playhead(&self, index: usize, total_frames: usize) {
        {
            let mut inner = self.inner.lock();
            inner.playhead = index;
            inner.total_frames = total_frames;
        }
        self.changed.notify_all();
    }

    /// Block while inserting `batch` would evict a frame inside the
    /// look-ahead window `[playhead, playhead + max_size)`.
    ///
    /// Returns `true` once the batch fits (or would be dropped as stale), or
    /// when the buffer is closed; `false` on timeout.
    pub fn wait_for_space(
        &self,
        generation: u64,
        batch: &[DecodedFrame],
        timeout: Duration,
    ) -> bool {
        let incoming: Vec<usize> = batch.iter().map(|f| f.frame_number).collect();
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.closed
                || inner.generation != generation
                || !inner.would_evict_lookahead(&incoming, self.max_size)
            {
                return true;
            }
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return inner.closed
                    || inner.generation != generation
                    || !inner.would_evict_lookahead(&incoming, self.max_size);
            }
        }
    }

    /// Wake every waiter; later waits return immediately.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Occupancy as a fraction of capacity.
    pub fn health(&self) -> f64 {
        self.len() as f64 / self.max_size as f64
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Buffered frame numbers, ascending.
    pub fn frame_numbers(&self) -> Vec<usize> {
        let mut numbers: Vec<usize> = self.inner.lock().frames.keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FrameBuffer")
            .field("len", &inner.frames.len())
            .field("max_size", &self.max_size)
            .field("generation", &inner.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;
    use vidpipe_core::{BufferLedger, PixelBuffer, PixelFormat};

    fn frame(ledger: &BufferLedger, n: usize) -> DecodedFrame {
        let pixels = PixelBuffer::zeroed(PixelFormat::Rgba8.frame_size(2, 2), ledger);
        DecodedFrame::new(n, 2, 2, PixelFormat::Rgba8, 0, pixels).unwrap()
    }

    fn batch(ledger: &BufferLedger, range: std::ops::Range<usize>) -> Vec<DecodedFrame> {
        range.map(|n| frame(ledger, n)).collect()
    }

    #[test]
    fn test_fifo_eviction_releases_oldest() {
        let ledger = BufferLedger::new();
        let buffer = FrameBuffer::new(15);
        assert_eq!(buffer.add_frames(0, batch(&ledger, 0..15)), 15);
        assert_eq!(buffer.len(), 15);

        buffer.add_frames(0, batch(&ledger, 15..16));
        assert_eq!(buffer.len(), 15);
        assert!(buffer.get_frame(0).is_none());
        assert!(buffer.get_frame(15).is_some());
        let snap = ledger.snapshot();
        assert_eq!(snap.released, 1);
        assert_eq!(snap.live(), 15);
    }

    #[test]
    fn test_reinsert_refreshes_arrival() {
        let ledger = BufferLedger::new();
        let buffer = FrameBuffer::new(3);
        buffer.add_frames(0, batch(&ledger, 0..3));
        // Frame 0 arrives again and becomes the newest.
        buffer.add_frames(0, batch(&ledger, 0..1));
        assert_eq!(ledger.live(), 3);

        buffer.add_frames(0, batch(&ledger, 3..4));
        assert_eq!(buffer.frame_numbers(), vec![0, 2, 3]);
    }

    #[test]
    fn test_get_frame_has_no_side_effects() {
        let ledger = BufferLedger::new();
        let buffer = FrameBuffer::new(4);
        buffer.add_frames(0, batch(&ledger, 0..4));
        for _ in 0..3 {
            assert_eq!(buffer.get_frame(2).unwrap().frame_number, 2);
        }
        assert!(buffer.get_frame(9).is_none());
        assert_eq!(buffer.frame_numbers(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_clear_releases_and_bumps_generation() {
        let ledger = BufferLedger::new();
        let buffer = FrameBuffer::new(8);
        buffer.add_frames(0, batch(&ledger, 0..5));
        assert_eq!(buffer.clear(), 1);
        assert!(buffer.is_empty());
        assert_eq!(ledger.live(), 0);

        // Batches from before the clear are refused.
        assert_eq!(buffer.add_frames(0, batch(&ledger, 5..8)), 0);
        assert!(buffer.is_empty());
        assert_eq!(ledger.live(), 0);
        assert_eq!(buffer.add_frames(1, batch(&ledger, 5..8)), 3);
    }

    #[test]
    fn test_held_frame_outlives_eviction() {
        let ledger = BufferLedger::new();
        let buffer = FrameBuffer::new(1);
        buffer.add_frames(0, batch(&ledger, 0..1));
        let held = buffer.get_frame(0).unwrap();
        buffer.add_frames(0, batch(&ledger, 1..2));
        assert_eq!(ledger.live(), 2);
        drop(held);
        assert_eq!(ledger.live(), 1);
    }

    #[test]
    fn test_wait_for_initial_buffer() {
        let ledger = BufferLedger::new();
        let buffer = Arc::new(FrameBuffer::new(10));
        assert!(!buffer.wait_for_initial_buffer(3, Duration::from_millis(10)));

        let producer = {
            let buffer = Arc::clone(&buffer);
            let ledger = ledger.clone();
            thread::spawn(move || {
                for n in 0..3 {
                    thread::sleep(Duration::from_millis(5));
                    buffer.add_frames(0, vec![frame(&ledger, n)]);
                }
            })
        };
        assert!(buffer.wait_for_initial_buffer(3, Duration::from_secs(5)));
        producer.join().unwrap();

        assert!(!buffer.wait_for_initial_buffer(500, Duration::from_millis(1)));
    }

    #[test]
    fn test_initial_fill_capped_at_capacity() {
        let ledger = BufferLedger::new();
        let buffer = FrameBuffer::new(4);
        buffer.add_frames(0, batch(&ledger, 0..4));
        assert!(buffer.wait_for_initial_buffer(500, Duration::ZERO));
    }

    #[test]
    fn test_backpressure_blocks_until_playhead_moves() {
        let ledger = BufferLedger::new();
        let buffer = Arc::new(FrameBuffer::new(4));
        buffer.set_playhead(0, 100);
        buffer.add_frames(0, batch(&ledger, 0..4));
        let next = batch(&ledger, 4..5);
        assert!(!buffer.wait_for_space(0, &next, Duration::from_millis(10)));

        let mover = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                buffer.set_playhead(1, 100);
            })
        };
        assert!(buffer.wait_for_space(0, &next, Duration::from_secs(5)));
        mover.join().unwrap();
    }

    #[test]
    fn test_backpressure_protects_lookahead_from_whole_batch() {
        let ledger = BufferLedger::new();
        let buffer = FrameBuffer::new(15);
        buffer.set_playhead(0, 100);
        buffer.add_frames(0, batch(&ledger, 0..15));
        buffer.set_playhead(1, 100);

        // One slot is free of the window, but the batch needs three.
        let next = batch(&ledger, 15..18);
        assert!(!buffer.wait_for_space(0, &next, Duration::from_millis(10)));

        buffer.set_playhead(3, 100);
        assert!(buffer.wait_for_space(0, &next, Duration::ZERO));
        buffer.add_frames(0, next);
        assert!((3..18).all(|n| buffer.get_frame(n).is_some()));
    }

    #[test]
    fn test_backpressure_ignores_replacements_and_stale_batches() {
        let ledger = BufferLedger::new();
        let buffer = FrameBuffer::new(4);
        buffer.set_playhead(0, 100);
        buffer.add_frames(0, batch(&ledger, 0..4));

        // Replacing buffered frames needs no room.
        let again = batch(&ledger, 2..4);
        assert!(buffer.wait_for_space(0, &again, Duration::ZERO));

        buffer.clear();
        buffer.add_frames(1, batch(&ledger, 0..4));
        let stale = batch(&ledger, 4..6);
        assert!(buffer.wait_for_space(0, &stale, Duration::ZERO));
        assert!(!buffer.wait_for_space(1, &stale, Duration::ZERO));
    }

    #[test]
    fn test_backpressure_window_wraps() {
        let ledger = BufferLedger::new();
        let buffer = FrameBuffer::new(4);
        buffer.set_playhead(8, 10);
        buffer.add_frames(0, batch(&ledger, 8..10));
        assert!(buffer.wait_for_space(0, &batch(&ledger, 0..2), Duration::ZERO));
        buffer.add_frames(0, batch(&ledger, 0..2));
        assert!(!buffer.wait_for_space(0, &batch(&ledger, 2..3), Duration::ZERO));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let ledger = BufferLedger::new();
        let buffer = Arc::new(FrameBuffer::new(2));
        buffer.set_playhead(0, 10);
        buffer.add_frames(0, batch(&ledger, 0..2));

        let waiter = {
            let buffer = Arc::clone(&buffer);
            let next = batch(&ledger, 2..3);
            thread::spawn(move || buffer.wait_for_space(0, &next, Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        buffer.close();
        assert!(waiter.join().unwrap());

        buffer.clear();
        assert!(!buffer.wait_for_initial_buffer(2, Duration::from_secs(30)));
    }

    proptest! {
        #[test]
        fn prop_len_never_exceeds_capacity(
            max_size in 1usize..20,
            batches in prop::collection::vec(prop::collection::vec(0usize..64, 0..8), 0..40),
            clear_at in prop::option::of(0usize..40),
        ) {
            let ledger = BufferLedger::new();
            let buffer = FrameBuffer::new(max_size);
            for (i, numbers) in batches.into_iter().enumerate() {
                if clear_at == Some(i) {
                    buffer.clear();
                }
                let frames = numbers.into_iter().map(|n| frame(&ledger, n)).collect();
                buffer.add_frames(buffer.generation(), frames);
                prop_assert!(buffer.len() <= max_size);
                prop_assert_eq!(ledger.live(), buffer.len() as u64);
            }
            buffer.clear();
            prop_assert_eq!(ledger.live(), 0);
        }
    }
}
