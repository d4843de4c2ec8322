//! Lock-free double buffer between the capture thread and analysis readers.
//!
//! One writer (the capture worker) appends sample chunks into the write slot;
//! once a full capacity of new samples has accumulated the roles swap and the
//! freshly written slot becomes the stable read target. The new write slot
//! inherits a copy of the published window, so partial writes always slide
//! over a coherent window rather than a half-stale one.
//!
//! Publication state lives in a single packed word:
//!
//! ```text
//! | swap sequence | end offset (13 bits) | slot (1 bit) |
//! ```
//!
//! The swap stores the word with `Release` and readers load it with `Acquire`,
//! so every sample written before a swap is visible to any reader that
//! observes the post-swap word. Readers re-check the word after copying
//! (seqlock style) and retry if a swap landed mid-copy; swaps are at least a
//! full capacity of samples apart, so a retry is rare and the loop is short.

use std::sync::atomic::{AtomicI16, AtomicUsize, Ordering};

/// Smallest logical capacity, matching the nominal backend chunk size.
pub const MIN_CAPACITY: usize = 512;
/// Largest logical capacity; both slots are allocated at this size once.
pub const MAX_CAPACITY: usize = 4096;

const SLOT_MASK: usize = 0b1;
const END_SHIFT: u32 = 1;
const END_MASK: usize = 0x1FFF; // 13 bits, fits MAX_CAPACITY
const SEQ_SHIFT: u32 = 14;

fn pack(seq: usize, end: usize, slot: usize) -> usize {
    (seq << SEQ_SHIFT) | (end << END_SHIFT) | slot
}

/// Double-buffered sample store. One writer, any number of readers, no locks.
pub struct CaptureBuffer {
    slots: [Box<[AtomicI16]>; 2],
    /// Packed publication word, see module docs.
    tag: AtomicUsize,
    /// Logical capacity, always a power of two.
    capacity: AtomicUsize,
    // Writer-only running state. Atomics only because the buffer is shared;
    // the single writer accesses them with relaxed ordering.
    write_pos: AtomicUsize,
    since_swap: AtomicUsize,
}

impl CaptureBuffer {
    /// Allocates both slots at [`MAX_CAPACITY`] and configures the logical
    /// capacity (rounded up to a power of two, clamped to the supported
    /// range).
    pub fn new(capacity: usize) -> Self {
        let alloc = || {
            (0..MAX_CAPACITY)
                .map(|_| AtomicI16::new(0))
                .collect::<Box<[AtomicI16]>>()
        };
        let buffer = Self {
            slots: [alloc(), alloc()],
            tag: AtomicUsize::new(0),
            capacity: AtomicUsize::new(MIN_CAPACITY),
            write_pos: AtomicUsize::new(0),
            since_swap: AtomicUsize::new(0),
        };
        buffer.configure(capacity);
        buffer
    }

    /// Sets the logical capacity, zero-fills both slots and resets the write
    /// offset. Returns the effective capacity. Callers must serialize this
    /// with writer start/stop; concurrent readers observe silence.
    pub fn configure(&self, capacity: usize) -> usize {
        let capacity = capacity
            .next_power_of_two()
            .clamp(MIN_CAPACITY, MAX_CAPACITY);
        for slot in &self.slots {
            for cell in slot.iter() {
                cell.store(0, Ordering::Relaxed);
            }
        }
        self.write_pos.store(0, Ordering::Relaxed);
        self.since_swap.store(0, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Release);
        let seq = (self.tag.load(Ordering::Relaxed) >> SEQ_SHIFT).wrapping_add(1);
        self.tag.store(pack(seq, 0, 0), Ordering::Release);
        capacity
    }

    /// Logical capacity in samples.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Zeroes the write slot without disturbing ongoing reads.
    pub fn clear(&self) {
        let write_slot = 1 - (self.tag.load(Ordering::Acquire) & SLOT_MASK);
        for cell in self.slots[write_slot].iter() {
            cell.store(0, Ordering::Relaxed);
        }
    }

    /// Appends `chunk` into the write slot, wrapping circularly. Swaps the
    /// slot roles after each full capacity of new samples. Writer-only; never
    /// blocks.
    pub fn publish(&self, chunk: &[i16]) {
        let capacity = self.capacity.load(Ordering::Relaxed);
        let mut write_pos = self.write_pos.load(Ordering::Relaxed);
        let mut since_swap = self.since_swap.load(Ordering::Relaxed);
        let mut remaining = chunk;

        while !remaining.is_empty() {
            let mut write_slot = 1 - (self.tag.load(Ordering::Relaxed) & SLOT_MASK);
            let take = remaining.len().min(capacity - since_swap);
            let cells = &self.slots[write_slot];
            for &sample in &remaining[..take] {
                cells[write_pos].store(sample, Ordering::Relaxed);
                write_pos = (write_pos + 1) & (capacity - 1);
            }
            since_swap += take;
            remaining = &remaining[take..];

            if since_swap == capacity {
                // Publish the filled slot, then seed the other slot with the
                // same window so the next partial writes overlap coherently.
                let seq = (self.tag.load(Ordering::Relaxed) >> SEQ_SHIFT).wrapping_add(1);
                self.tag
                    .store(pack(seq, write_pos, write_slot), Ordering::Release);
                let published = &self.slots[write_slot];
                write_slot = 1 - write_slot;
                let inherit = &self.slots[write_slot];
                for i in 0..capacity {
                    inherit[i].store(published[i].load(Ordering::Relaxed), Ordering::Relaxed);
                }
                since_swap = 0;
            }
        }

        self.write_pos.store(write_pos, Ordering::Relaxed);
        self.since_swap.store(since_swap, Ordering::Relaxed);
    }

    /// Reads the most recent `count` samples as `f32` in [-1.0, 1.0] into
    /// `out` (cleared first). `count == 0` reads the full capacity; larger
    /// counts are clamped. Returns the number of samples read.
    pub fn read_latest_f32(&self, out: &mut Vec<f32>, count: usize) -> usize {
        self.read_latest_into(out, count, |s| f32::from(s) / 32768.0)
    }

    /// `f64` variant of [`read_latest_f32`](Self::read_latest_f32).
    pub fn read_latest_f64(&self, out: &mut Vec<f64>, count: usize) -> usize {
        self.read_latest_into(out, count, |s| f64::from(s) / 32768.0)
    }

    fn read_latest_into<T>(
        &self,
        out: &mut Vec<T>,
        count: usize,
        convert: impl Fn(i16) -> T,
    ) -> usize {
        loop {
            let tag = self.tag.load(Ordering::Acquire);
            let capacity = self.capacity.load(Ordering::Acquire);
            let slot = tag & SLOT_MASK;
            let end = (tag >> END_SHIFT) & END_MASK;
            let n = if count == 0 { capacity } else { count.min(capacity) };

            out.clear();
            let cells = &self.slots[slot];
            for i in 0..n {
                let idx = (end + capacity - n + i) & (capacity - 1);
                out.push(convert(cells[idx].load(Ordering::Relaxed)));
            }

            // A swap mid-copy may have reseeded this slot; retry on change.
            if self.tag.load(Ordering::Acquire) == tag {
                return n;
            }
        }
    }
}

impl std::fmt::Debug for CaptureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureBuffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}
