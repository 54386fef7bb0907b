//! Pipeline roles and shared frequency state
//!
//! One coordinator thread and `W` worker threads process each frame:
//!
//! ```text
//! ingest ──start──> coordinator ──start──> workers
//!                   coordinator <─phase──  workers   (fine-freq feedback)
//!        worker i <────fft──── worker i+1            (tail-DQPSK handoff)
//!                   coordinator <──end───  workers
//! ingest <──end──── coordinator ──bits──> observers
//! ```
//!
//! Workers are chained because differential demodulation of a worker's last
//! symbol needs the *next* worker's first FFT; publishing FFT completion as
//! its own event lets the owner continue into its independent DQPSK work
//! while the neighbour proceeds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::event::SignalEvent;

/// Shared frequency-offset state.
///
/// The coarse offset has a single writer (the ingest thread); the fine offset
/// is written by two roles — the ingest thread counter-adjusts it during
/// coarse correction and the coordinator applies the per-frame feedback — so
/// its read-modify-write cycle is serialized by a mutex. Workers read both
/// through plain atomic loads: a stale value costs at worst one mildly
/// suboptimal symbol, since per-frame corrections stay below one FFT bin.
#[derive(Debug)]
pub struct FreqOffsets {
    coarse_bits: AtomicU64,
    fine_bits: AtomicU64,
    fine_lock: Mutex<()>,
}

impl FreqOffsets {
    pub fn new() -> Self {
        Self {
            coarse_bits: AtomicU64::new(0.0_f64.to_bits()),
            fine_bits: AtomicU64::new(0.0_f64.to_bits()),
            fine_lock: Mutex::new(()),
        }
    }

    /// Coarse offset in normalized cycles/sample.
    pub fn coarse(&self) -> f64 {
        f64::from_bits(self.coarse_bits.load(Ordering::Acquire))
    }

    /// Fine offset in normalized cycles/sample.
    pub fn fine(&self) -> f64 {
        f64::from_bits(self.fine_bits.load(Ordering::Acquire))
    }

    /// Combined offset snapshot for the PLL.
    pub fn snapshot(&self) -> f64 {
        self.coarse() + self.fine()
    }

    /// Set the coarse offset. Ingest thread only.
    pub fn set_coarse(&self, value: f64) {
        self.coarse_bits.store(value.to_bits(), Ordering::Release);
    }

    /// Add `delta` to the fine offset, wrapping into `(-wrap, +wrap)`.
    ///
    /// The wrap bound is half an FFT bin with a small margin; anything larger
    /// belongs to the coarse estimator.
    pub fn update_fine(&self, delta: f64, wrap: f64) {
        let _guard = self.fine_lock.lock().unwrap();
        let next = (self.fine() + delta) % wrap;
        self.fine_bits.store(next.to_bits(), Ordering::Release);
    }

    /// Zero both offsets. Used on desync reset.
    pub fn clear(&self) {
        let _guard = self.fine_lock.lock().unwrap();
        self.coarse_bits.store(0.0_f64.to_bits(), Ordering::Release);
        self.fine_bits.store(0.0_f64.to_bits(), Ordering::Release);
    }
}

impl Default for FreqOffsets {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker descriptor: its symbol range, its barrier events, and the slot
/// where it publishes its summed cyclic phase error each frame.
#[derive(Debug)]
pub struct PipelineWorker {
    symbol_start: usize,
    symbol_end: usize,
    phase_error_bits: AtomicU64,
    pub start: SignalEvent,
    pub phase_error_ready: SignalEvent,
    pub fft_ready: SignalEvent,
    pub end: SignalEvent,
}

impl PipelineWorker {
    pub fn new(symbol_start: usize, symbol_end: usize) -> Self {
        Self {
            symbol_start,
            symbol_end,
            phase_error_bits: AtomicU64::new(0.0_f64.to_bits()),
            start: SignalEvent::new(),
            phase_error_ready: SignalEvent::new(),
            fft_ready: SignalEvent::new(),
            end: SignalEvent::new(),
        }
    }

    pub fn symbol_start(&self) -> usize {
        self.symbol_start
    }

    pub fn symbol_end(&self) -> usize {
        self.symbol_end
    }

    pub fn set_phase_error(&self, value: f64) {
        self.phase_error_bits.store(value.to_bits(), Ordering::Release);
    }

    pub fn phase_error(&self) -> f64 {
        f64::from_bits(self.phase_error_bits.load(Ordering::Acquire))
    }

    /// Release every barrier permanently so the worker thread can exit.
    pub fn stop(&self) {
        self.start.stop();
        self.phase_error_ready.stop();
        self.fft_ready.stop();
        self.end.stop();
    }
}

/// Coordinator barriers.
///
/// The end event starts signaled: the ingest side waits on it before the very
/// first buffer swap, when no frame is in flight yet.
#[derive(Debug)]
pub struct Coordinator {
    pub start: SignalEvent,
    pub end: SignalEvent,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            start: SignalEvent::new(),
            end: SignalEvent::with_signaled(true),
        }
    }

    pub fn stop(&self) {
        self.start.stop();
        self.end.stop();
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Carve `nb_symbols` into `nb_workers` contiguous half-open ranges by
/// ceil-division, so earlier workers take the larger shares.
pub fn carve_symbol_ranges(nb_symbols: usize, nb_workers: usize) -> Vec<(usize, usize)> {
    debug_assert!(nb_workers >= 1 && nb_workers <= nb_symbols);
    let mut ranges = Vec::with_capacity(nb_workers);
    let mut start = 0;
    for i in 0..nb_workers {
        let remain_symbols = nb_symbols - start;
        let remain_workers = nb_workers - i;
        let count = remain_symbols.div_ceil(remain_workers);
        let end = if i == nb_workers - 1 {
            nb_symbols
        } else {
            start + count
        };
        ranges.push((start, end));
        start = end;
    }
    ranges
}

/// Resolve the worker count from a user override or the machine parallelism.
///
/// Auto mode leaves one hardware thread to the ingest role when the machine
/// has more than one.
pub fn resolve_worker_count(nb_symbols: usize, desired: Option<usize>) -> usize {
    match desired {
        Some(n) if n > 0 => n.min(nb_symbols),
        _ => {
            let hw = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            let mut n = hw.min(nb_symbols);
            if n > 1 {
                n -= 1;
            }
            n.max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carve_covers_all_symbols() {
        for (syms, workers) in [(77, 4), (77, 1), (154, 8), (10, 10), (77, 3)] {
            let ranges = carve_symbol_ranges(syms, workers);
            assert_eq!(ranges.len(), workers);
            assert_eq!(ranges[0].0, 0);
            assert_eq!(ranges.last().unwrap().1, syms);
            for w in ranges.windows(2) {
                assert_eq!(w[0].1, w[1].0);
                assert!(w[0].0 < w[0].1);
            }
        }
    }

    #[test]
    fn test_carve_front_loads_remainder() {
        let ranges = carve_symbol_ranges(10, 3);
        assert_eq!(ranges, vec![(0, 4), (4, 7), (7, 10)]);
    }

    #[test]
    fn test_resolve_worker_count_override() {
        assert_eq!(resolve_worker_count(77, Some(4)), 4);
        assert_eq!(resolve_worker_count(77, Some(500)), 77);
        assert!(resolve_worker_count(77, None) >= 1);
        assert!(resolve_worker_count(2, None) <= 2);
    }

    #[test]
    fn test_freq_offsets_wrap() {
        let off = FreqOffsets::new();
        let wrap = 0.5 * (1.0 / 2048.0) * 1.01;
        off.update_fine(3.0 * wrap + 1e-6, wrap);
        assert!(off.fine().abs() < wrap);
        off.clear();
        assert_eq!(off.snapshot(), 0.0);
    }

    #[test]
    fn test_freq_offsets_snapshot() {
        let off = FreqOffsets::new();
        off.set_coarse(3.0 / 2048.0);
        off.update_fine(1e-4, 1.0);
        assert!((off.snapshot() - (3.0 / 2048.0 + 1e-4)).abs() < 1e-15);
    }

    #[test]
    fn test_phase_error_slot() {
        let w = PipelineWorker::new(0, 5);
        w.set_phase_error(-1.25);
        assert_eq!(w.phase_error(), -1.25);
        assert_eq!(w.symbol_start(), 0);
        assert_eq!(w.symbol_end(), 5);
    }
}
