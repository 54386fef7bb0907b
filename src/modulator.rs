//! OFDM frame synthesis
//!
//! Builds complete DAB transmission frames from payload bits: a NULL period,
//! the phase reference symbol, and differentially-encoded QPSK data symbols,
//! each with its cyclic prefix. The synthesizer uses the same parameters,
//! PRS spectrum and carrier mapper as the demodulator, so a modulated frame
//! fed straight back into [`crate::demodulator::OfdmDemodulator`] recovers
//! the source bits — the loopback used throughout the integration tests and
//! available to receiver applications for self-test signal generation.

use num_complex::Complex64;
use std::f64::consts::FRAC_1_SQRT_2;

use crate::fft::FftProcessor;
use crate::params::OfdmParams;
use crate::reference::validate_carrier_mapper;
use crate::simd_utils::apply_pll;
use crate::types::{DspError, DspResult, IQSample};

/// DAB OFDM frame synthesizer.
#[derive(Debug)]
pub struct OfdmModulator {
    params: OfdmParams,
    /// Frequency-domain PRS (not conjugated).
    prs_freq: Vec<IQSample>,
    carrier_mapper: Vec<usize>,
    fft: FftProcessor,
    /// Frequency-domain state of the previously emitted symbol.
    last_freq: Vec<IQSample>,
    time_scratch: Vec<IQSample>,
}

impl OfdmModulator {
    pub fn new(
        params: OfdmParams,
        prs_fft_ref: &[IQSample],
        carrier_mapper: &[usize],
    ) -> DspResult<Self> {
        params.validate()?;
        if prs_fft_ref.len() != params.nb_fft {
            return Err(DspError::ReferenceLengthMismatch {
                expected: params.nb_fft,
                actual: prs_fft_ref.len(),
            });
        }
        validate_carrier_mapper(carrier_mapper, params.nb_data_carriers)?;
        Ok(Self {
            params,
            prs_freq: prs_fft_ref.to_vec(),
            carrier_mapper: carrier_mapper.to_vec(),
            fft: FftProcessor::new(params.nb_fft),
            last_freq: vec![Complex64::new(0.0, 0.0); params.nb_fft],
            time_scratch: vec![Complex64::new(0.0, 0.0); params.nb_fft],
        })
    }

    pub fn params(&self) -> &OfdmParams {
        &self.params
    }

    /// Synthesize one whole transmission frame from payload bits.
    ///
    /// `bits` must hold `params.nb_frame_bits()` values in the same layout
    /// the demodulator emits: for each data symbol, `nb_data_carriers` first
    /// bits then `nb_data_carriers` second bits, in deinterleaved order.
    pub fn modulate_frame(&mut self, bits: &[bool]) -> DspResult<Vec<IQSample>> {
        let p = self.params;
        if bits.len() != p.nb_frame_bits() {
            return Err(DspError::InvalidParams(format!(
                "expected {} payload bits, got {}",
                p.nb_frame_bits(),
                bits.len()
            )));
        }

        let mut out = Vec::with_capacity(p.nb_frame_period());
        out.resize(p.nb_null_period, Complex64::new(0.0, 0.0));

        // Symbol 0: the PRS itself.
        self.last_freq.copy_from_slice(&self.prs_freq);
        self.emit_symbol(&mut out);

        let nb_carriers = p.nb_data_carriers;
        let half = (nb_carriers / 2) as i64;
        let mut delta = vec![Complex64::new(0.0, 0.0); nb_carriers];

        for sym in 1..p.nb_frame_symbols {
            let base = (sym - 1) * nb_carriers * 2;
            let (b0, b1) = (&bits[base..base + nb_carriers], &bits[base + nb_carriers..base + 2 * nb_carriers]);

            // Interleave: output position i modulates carrier mapper[i].
            // The quadrature is negated relative to the textbook mapper so
            // the receiver's soft-bit demapper recovers the source signs.
            for i in 0..nb_carriers {
                let re = if b0[i] { -1.0 } else { 1.0 };
                let im = if b1[i] { 1.0 } else { -1.0 };
                delta[self.carrier_mapper[i]] = Complex64::new(re, im) * FRAC_1_SQRT_2;
            }

            // Differential encoding on each active carrier.
            let n = p.nb_fft as i64;
            let mut carrier_index = 0usize;
            for c in -half..=half {
                if c == 0 {
                    continue;
                }
                let bin = ((n + c) % n) as usize;
                self.last_freq[bin] *= delta[carrier_index];
                carrier_index += 1;
            }
            self.emit_symbol(&mut out);
        }

        debug_assert_eq!(out.len(), p.nb_frame_period());
        Ok(out)
    }

    /// IFFT the current spectrum and append cyclic prefix + body to `out`.
    fn emit_symbol(&mut self, out: &mut Vec<IQSample>) {
        let n = self.params.nb_fft;
        let cp = self.params.nb_cyclic_prefix;
        self.fft.ifft(&self.last_freq, &mut self.time_scratch);
        out.extend_from_slice(&self.time_scratch[n - cp..]);
        out.extend_from_slice(&self.time_scratch);
    }
}

/// Simulate a receiver tuning error of `freq` normalized cycles/sample.
///
/// A receiver whose local oscillator sits *above* the transmitter sees the
/// baseband rotated by `exp(-j*2*pi*freq*n)`; the demodulator's recovered
/// coarse + fine offset then converges to `+freq`.
pub fn apply_tuning_offset(buf: &mut [IQSample], freq: f64) {
    apply_pll(buf, -freq, 0.0);
}
