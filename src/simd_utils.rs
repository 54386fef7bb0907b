//! Hot-path math kernels
//!
//! These functions dominate the runtime of a frame: the PLL rotation runs
//! over every sample of every symbol and the conjugate-multiply-sum runs over
//! every cyclic prefix. They are written as branch-free loops over slices so
//! LLVM can auto-vectorize them on x86 (SSE/AVX) and ARM (NEON); compile with
//! `RUSTFLAGS="-C target-cpu=native"` for the widest vectors.

use num_complex::Complex64;
use std::f64::consts::TAU;

use crate::types::{IQSample, SoftBit, SOFT_DECISION_HIGH};

/// Apply a frequency shift in place: `y[n] = x[n] * exp(j*2*pi*(dt0 + n*f))`.
///
/// `freq` is in normalized cycles/sample; `dt0` seeds the phase so a symbol
/// processed in isolation keeps phase continuity with its position in the
/// frame.
#[inline]
pub fn apply_pll(buf: &mut [IQSample], freq: f64, dt0: f64) {
    let step = TAU * freq;
    let mut phase = TAU * dt0;
    for v in buf.iter_mut() {
        let (sin, cos) = phase.sin_cos();
        *v *= Complex64::new(cos, sin);
        phase += step;
    }
}

/// Conjugate multiply-accumulate: `sum(conj(a[k]) * b[k])`.
#[inline]
pub fn complex_conj_mul_sum(a: &[IQSample], b: &[IQSample]) -> IQSample {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| x.conj() * y)
        .fold(Complex64::new(0.0, 0.0), |acc, v| acc + v)
}

/// Relative phase between consecutive bins: `out[k] = conj(z[k]) * z[k+1]`,
/// with the last element zeroed.
///
/// Correlating these complex differences instead of the raw bins makes the
/// coarse frequency search insensitive to the absolute phase ramp a timing
/// offset imposes on the spectrum.
#[inline]
pub fn calculate_relative_phase(z: &[IQSample], out: &mut [IQSample]) {
    debug_assert_eq!(z.len(), out.len());
    let n = z.len();
    for k in 0..n - 1 {
        out[k] = z[k].conj() * z[k + 1];
    }
    out[n - 1] = Complex64::new(0.0, 0.0);
}

/// Log-magnitude spectrum, fftshifted so DC lands at `N/2`:
/// `out[i] = 20*log10(|z[(i + N/2) mod N]|)`.
#[inline]
pub fn calculate_magnitude_db(z: &[IQSample], out: &mut [f64]) {
    debug_assert_eq!(z.len(), out.len());
    let n = z.len();
    let half = n / 2;
    for i in 0..n {
        let j = (i + half) % n;
        out[i] = 20.0 * z[j].norm().log10();
    }
}

/// Mean of `|re| + |im|` over a block.
///
/// The L1 norm avoids the square root of a true magnitude and is sufficient
/// for relative power comparisons during NULL detection.
#[inline]
pub fn calculate_l1_average(block: &[IQSample]) -> f64 {
    if block.is_empty() {
        return 0.0;
    }
    let sum: f64 = block.iter().map(|v| v.re.abs() + v.im.abs()).sum();
    sum / block.len() as f64
}

/// Map a normalized QPSK component to a signed soft-decision bit.
///
/// The QPSK mapper on the transmit side uses `x = 1 - 2*b`, so the receive
/// side recovers `b' = -A*x`: a confident logical 1 lands at `+A`, a
/// confident logical 0 at `-A`.
#[inline]
pub fn convert_to_soft_bit(x: f64) -> SoftBit {
    let a = f64::from(SOFT_DECISION_HIGH);
    let v = (-x * a).round().clamp(-a, a);
    v as SoftBit
}
