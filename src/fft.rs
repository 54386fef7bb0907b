//! FFT plan wrapper
//!
//! The synchronization chain leans on one FFT size (`nb_fft`) executed many
//! times per frame: forward transforms for every data symbol, plus the
//! forward/inverse pairs used by the PRS correlators. Plans are built once
//! and executed on externally supplied buffers so the demodulator can carve
//! its own storage.
//!
//! `FftProcessor` is cheap to clone: the underlying `rustfft` plans are
//! shared behind `Arc` while each clone carries its own scratch space, so
//! every pipeline thread can transform concurrently.

use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

use crate::types::IQSample;

/// Fixed-size forward/inverse FFT executor.
pub struct FftProcessor {
    size: usize,
    fft_forward: Arc<dyn Fft<f64>>,
    fft_inverse: Arc<dyn Fft<f64>>,
    scratch: Vec<IQSample>,
}

impl fmt::Debug for FftProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftProcessor").field("size", &self.size).finish()
    }
}

impl Clone for FftProcessor {
    fn clone(&self) -> Self {
        Self {
            size: self.size,
            fft_forward: Arc::clone(&self.fft_forward),
            fft_inverse: Arc::clone(&self.fft_inverse),
            scratch: vec![IQSample::new(0.0, 0.0); self.scratch.len()],
        }
    }
}

impl FftProcessor {
    /// Plan forward and inverse transforms of the given size.
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft_forward = planner.plan_fft_forward(size);
        let fft_inverse = planner.plan_fft_inverse(size);
        let scratch_len = fft_forward
            .get_inplace_scratch_len()
            .max(fft_inverse.get_inplace_scratch_len());
        Self {
            size,
            fft_forward,
            fft_inverse,
            scratch: vec![IQSample::new(0.0, 0.0); scratch_len],
        }
    }

    /// FFT size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Forward transform in place.
    pub fn fft_inplace(&mut self, buf: &mut [IQSample]) {
        debug_assert_eq!(buf.len(), self.size);
        self.fft_forward.process_with_scratch(buf, &mut self.scratch);
    }

    /// Inverse transform in place, normalized by `1/N`.
    pub fn ifft_inplace(&mut self, buf: &mut [IQSample]) {
        debug_assert_eq!(buf.len(), self.size);
        self.fft_inverse.process_with_scratch(buf, &mut self.scratch);
        let scale = 1.0 / self.size as f64;
        for v in buf.iter_mut() {
            *v *= scale;
        }
    }

    /// Forward transform from `input` into `output`.
    pub fn fft(&mut self, input: &[IQSample], output: &mut [IQSample]) {
        output.copy_from_slice(input);
        self.fft_inplace(output);
    }

    /// Inverse transform from `input` into `output`, normalized by `1/N`.
    pub fn ifft(&mut self, input: &[IQSample], output: &mut [IQSample]) {
        output.copy_from_slice(input);
        self.ifft_inplace(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_fft_single_tone() {
        let n = 256;
        let bin = 17;
        let signal: Vec<IQSample> = (0..n)
            .map(|i| {
                let phase = 2.0 * PI * bin as f64 * i as f64 / n as f64;
                IQSample::new(phase.cos(), phase.sin())
            })
            .collect();

        let mut fft = FftProcessor::new(n);
        let mut spectrum = vec![IQSample::new(0.0, 0.0); n];
        fft.fft(&signal, &mut spectrum);

        let peak = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.norm_sqr().total_cmp(&b.1.norm_sqr()))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, bin);
    }

    #[test]
    fn test_fft_ifft_identity() {
        let n = 128;
        let signal: Vec<IQSample> = (0..n)
            .map(|i| IQSample::new(i as f64 * 0.25, -(i as f64) * 0.5))
            .collect();

        let mut fft = FftProcessor::new(n);
        let mut buf = signal.clone();
        fft.fft_inplace(&mut buf);
        fft.ifft_inplace(&mut buf);

        for (a, b) in signal.iter().zip(buf.iter()) {
            assert!((a - b).norm() < 1e-9);
        }
    }

    #[test]
    fn test_clone_shares_plans() {
        let mut a = FftProcessor::new(64);
        let mut b = a.clone();
        let signal: Vec<IQSample> = (0..64).map(|i| IQSample::new(i as f64, 0.0)).collect();
        let mut out_a = vec![IQSample::new(0.0, 0.0); 64];
        let mut out_b = vec![IQSample::new(0.0, 0.0); 64];
        a.fft(&signal, &mut out_a);
        b.fft(&signal, &mut out_b);
        assert_eq!(out_a, out_b);
    }
}
