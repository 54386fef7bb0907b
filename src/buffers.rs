//! Sample and frame storage
//!
//! The ingest side owns two small staging buffers:
//!
//! - a circular buffer that trails the NULL power-dip search, so the capture
//!   handed to the correlators always *precedes and includes* the NULL;
//! - a linear buffer that accumulates the NULL + PRS pair consumed by the
//!   coarse-frequency and fine-time correlators.
//!
//! Whole frames live in a pair of [`FrameBuffer`]s behind
//! [`SharedFrameBuffers`]: the ingest thread fills the inactive one while the
//! pipeline workers read the active one, and the two swap roles by an index
//! flip at the coordinator barrier — no samples are copied.
//!
//! All storage is allocated once at construction; nothing on the sample path
//! allocates.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::params::OfdmParams;
use crate::types::{IQSample, SoftBit};

const ZERO: IQSample = IQSample { re: 0.0, im: 0.0 };

/// Fixed-capacity circular sample buffer with overwriting append.
#[derive(Debug, Clone)]
pub struct CircularSampleBuffer {
    data: Vec<IQSample>,
    /// Next write position.
    index: usize,
    /// Samples stored, saturating at capacity.
    length: usize,
}

impl CircularSampleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![ZERO; capacity],
            index: 0,
            length: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Append all samples, overwriting the oldest once full.
    pub fn push_overwrite(&mut self, src: &[IQSample]) {
        let cap = self.data.len();
        // Only the trailing window can survive; skip anything older.
        let src = if src.len() > cap {
            &src[src.len() - cap..]
        } else {
            src
        };
        for &v in src {
            self.data[self.index] = v;
            self.index = (self.index + 1) % cap;
        }
        self.length = (self.length + src.len()).min(cap);
    }

    /// Copy the stored samples oldest-first into `dst`.
    ///
    /// `dst` must hold exactly `len()` samples.
    pub fn copy_ordered(&self, dst: &mut [IQSample]) {
        debug_assert_eq!(dst.len(), self.length);
        let cap = self.data.len();
        let oldest = if self.length == cap { self.index } else { 0 };
        for (i, out) in dst.iter_mut().enumerate() {
            *out = self.data[(oldest + i) % cap];
        }
    }

    pub fn clear(&mut self) {
        self.index = 0;
        self.length = 0;
    }
}

/// Fixed-capacity linear buffer with resumable fill.
///
/// `consume` takes as many samples as fit and reports how many it took, so a
/// caller iterating over an input batch can carry the remainder into its next
/// state.
#[derive(Debug, Clone)]
pub struct LinearSampleBuffer {
    data: Vec<IQSample>,
    length: usize,
}

impl LinearSampleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![ZERO; capacity],
            length: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_full(&self) -> bool {
        self.length == self.data.len()
    }

    /// Append up to the remaining capacity; returns the samples consumed.
    pub fn consume(&mut self, src: &[IQSample]) -> usize {
        let take = src.len().min(self.data.len() - self.length);
        self.data[self.length..self.length + take].copy_from_slice(&src[..take]);
        self.length += take;
        take
    }

    /// Replace the contents with `src` (must fit).
    pub fn fill_from(&mut self, src: &[IQSample]) {
        debug_assert!(src.len() <= self.data.len());
        self.data[..src.len()].copy_from_slice(src);
        self.length = src.len();
    }

    /// Replace the contents with a circular buffer's samples, oldest first.
    pub fn fill_ordered_from(&mut self, src: &CircularSampleBuffer) {
        let n = src.len();
        debug_assert!(n <= self.data.len());
        src.copy_ordered(&mut self.data[..n]);
        self.length = n;
    }

    pub fn clear(&mut self) {
        self.length = 0;
    }

    /// The filled portion.
    pub fn as_slice(&self) -> &[IQSample] {
        &self.data[..self.length]
    }
}

/// One frame of symbol-addressable sample storage.
///
/// Layout: `nb_frame_symbols` symbol periods (the PRS at index 0) followed by
/// the trailing NULL period. The NULL slot is addressable as one more symbol
/// because every mode's NULL period exceeds its symbol period.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    data: Vec<IQSample>,
    length: usize,
    nb_symbol_period: usize,
    nb_frame_symbols: usize,
    nb_null_period: usize,
}

impl FrameBuffer {
    pub fn new(params: &OfdmParams) -> Self {
        let total = params.nb_frame_symbols * params.nb_symbol_period + params.nb_null_period;
        Self {
            data: vec![ZERO; total],
            length: 0,
            nb_symbol_period: params.nb_symbol_period,
            nb_frame_symbols: params.nb_frame_symbols,
            nb_null_period: params.nb_null_period,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_full(&self) -> bool {
        self.length == self.data.len()
    }

    /// Append up to the remaining capacity; returns the samples consumed.
    pub fn consume(&mut self, src: &[IQSample]) -> usize {
        let take = src.len().min(self.data.len() - self.length);
        self.data[self.length..self.length + take].copy_from_slice(&src[..take]);
        self.length += take;
        take
    }

    pub fn reset(&mut self) {
        self.length = 0;
    }

    /// Symbol-period slice for symbol `i`.
    ///
    /// Valid for `i <= nb_frame_symbols`; index `nb_frame_symbols` addresses
    /// the head of the trailing NULL.
    pub fn symbol(&self, i: usize) -> &[IQSample] {
        let start = i * self.nb_symbol_period;
        &self.data[start..start + self.nb_symbol_period]
    }

    pub fn symbol_mut(&mut self, i: usize) -> &mut [IQSample] {
        let start = i * self.nb_symbol_period;
        &mut self.data[start..start + self.nb_symbol_period]
    }

    /// The trailing NULL period.
    pub fn null_symbol(&self) -> &[IQSample] {
        let start = self.nb_frame_symbols * self.nb_symbol_period;
        &self.data[start..start + self.nb_null_period]
    }

    /// Raw pointer to the sample storage, for the shared pipeline views.
    ///
    /// The storage is allocated once and never reallocated, so the pointer
    /// stays valid for the buffer's lifetime.
    fn data_mut_ptr(&mut self) -> *mut IQSample {
        self.data.as_mut_ptr()
    }
}

/// Frame-pipeline storage shared between the ingest thread, the coordinator
/// and the pipeline workers.
///
/// Interior mutability is deliberate: the barrier protocol — not a lock —
/// serializes access. The contract mirrors the one a lock-free ring buffer
/// makes between its producer and consumer sides:
///
/// - The *inactive* frame and the buffer swap are touched only by the ingest
///   thread, and only while every worker is parked between the coordinator's
///   end and start barriers.
/// - During a frame, each worker mutates only the active-frame symbols, FFT
///   rows and soft-bit rows of its own half-open symbol range; ranges are
///   disjoint by construction. A worker reads its dependent's first FFT row
///   only after that worker's FFT event, which orders the write before the
///   read.
/// - The coordinator reads the whole soft-bit buffer only after every
///   worker's end event.
///
/// Every unsafe accessor states which leg of this contract it relies on.
/// Worker-side views are carved from raw base pointers captured at
/// construction, so concurrent disjoint slices never materialize aliasing
/// references to the owning containers.
pub struct SharedFrameBuffers {
    frames: [UnsafeCell<FrameBuffer>; 2],
    frame_data: [*mut IQSample; 2],
    fft: Box<[UnsafeCell<IQSample>]>,
    bits: Box<[UnsafeCell<SoftBit>]>,
    active: AtomicUsize,
    nb_fft: usize,
    nb_symbol_period: usize,
    nb_bits_per_symbol: usize,
}

// Safety: see the protocol contract above; all aliasing-sensitive access
// goes through the unsafe accessors, and the barrier events provide the
// happens-before edges between roles.
unsafe impl Send for SharedFrameBuffers {}
unsafe impl Sync for SharedFrameBuffers {}

impl SharedFrameBuffers {
    pub fn new(params: &OfdmParams) -> Self {
        let nb_fft_rows = params.nb_frame_symbols + 1;
        let mut frames = [
            UnsafeCell::new(FrameBuffer::new(params)),
            UnsafeCell::new(FrameBuffer::new(params)),
        ];
        let frame_data = [
            frames[0].get_mut().data_mut_ptr(),
            frames[1].get_mut().data_mut_ptr(),
        ];
        let fft = (0..nb_fft_rows * params.nb_fft)
            .map(|_| UnsafeCell::new(ZERO))
            .collect();
        let bits = (0..params.nb_frame_bits())
            .map(|_| UnsafeCell::new(0))
            .collect();
        Self {
            frames,
            frame_data,
            fft,
            bits,
            active: AtomicUsize::new(0),
            nb_fft: params.nb_fft,
            nb_symbol_period: params.nb_symbol_period,
            nb_bits_per_symbol: params.nb_data_carriers * 2,
        }
    }

    /// Swap the active and inactive frames by flipping the index.
    ///
    /// Called by the ingest thread between the coordinator's end and start
    /// barriers, while no worker is running.
    pub fn swap(&self) {
        self.active.fetch_xor(1, Ordering::AcqRel);
    }

    fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Symbol-period slice of the active frame, read-only.
    ///
    /// # Safety
    /// Caller must be a worker within a frame, and no other role may hold a
    /// mutable view of symbol `i`: workers only mutate their own disjoint
    /// ranges, so reading an owned symbol is always fine.
    pub unsafe fn active_symbol(&self, i: usize) -> &[IQSample] {
        let base = self.frame_data[self.active_index()];
        std::slice::from_raw_parts(base.add(i * self.nb_symbol_period), self.nb_symbol_period)
    }

    /// Mutable symbol-period slice of the active frame.
    ///
    /// # Safety
    /// Caller must be the worker owning symbol `i` per the range carve.
    /// Symbol ranges are disjoint, so concurrent workers never alias.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn active_symbol_mut(&self, i: usize) -> &mut [IQSample] {
        let base = self.frame_data[self.active_index()];
        std::slice::from_raw_parts_mut(base.add(i * self.nb_symbol_period), self.nb_symbol_period)
    }

    /// Mutable inactive frame.
    ///
    /// # Safety
    /// Caller must be the ingest thread. Workers never touch the inactive
    /// frame cell or its storage, so the exclusive borrow cannot alias.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn inactive_mut(&self) -> &mut FrameBuffer {
        &mut *self.frames[self.active_index() ^ 1].get()
    }

    /// FFT output row for symbol `i`, read-only.
    ///
    /// # Safety
    /// Caller must either own symbol `i` or have observed the owning worker's
    /// FFT event for this frame.
    pub unsafe fn fft_symbol(&self, i: usize) -> &[IQSample] {
        let start = i * self.nb_fft;
        std::slice::from_raw_parts(self.fft[start].get() as *const IQSample, self.nb_fft)
    }

    /// Mutable FFT output row for symbol `i`.
    ///
    /// # Safety
    /// Caller must be the worker owning symbol `i`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn fft_symbol_mut(&self, i: usize) -> &mut [IQSample] {
        let start = i * self.nb_fft;
        std::slice::from_raw_parts_mut(self.fft[start].get(), self.nb_fft)
    }

    /// Mutable soft-bit row for DQPSK symbol pair `i`.
    ///
    /// # Safety
    /// Caller must be the worker owning symbol `i`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bits_symbol_mut(&self, i: usize) -> &mut [SoftBit] {
        let start = i * self.nb_bits_per_symbol;
        std::slice::from_raw_parts_mut(self.bits[start].get(), self.nb_bits_per_symbol)
    }

    /// The whole soft-bit buffer, read-only.
    ///
    /// # Safety
    /// Caller must be the coordinator after every worker's end event and
    /// before the next frame's start.
    pub unsafe fn out_bits(&self) -> &[SoftBit] {
        std::slice::from_raw_parts(self.bits[0].get() as *const SoftBit, self.bits.len())
    }
}
