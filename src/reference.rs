//! PRS and carrier-mapper reference data
//!
//! The demodulator takes its phase reference symbol and frequency
//! deinterleaver as opaque construction inputs, so a broadcast-compliant
//! receiver can plug in the tabulated values from its standard. The
//! generators here provide matched reference data for simulation, testing
//! and loopback use:
//!
//! - [`generate_prs_reference`] builds a deterministic QPSK-phase reference
//!   spectrum on the active carriers, seeded so transmitter and receiver
//!   agree;
//! - [`generate_carrier_mapper`] builds the DAB rotation frequency
//!   interleaver, which is a valid permutation for every transmission mode.

use std::f64::consts::PI;

use crate::params::OfdmParams;
use crate::types::{DspResult, DspError, IQSample};

/// Deterministic frequency-domain phase reference symbol.
///
/// Every active carrier gets a unit-magnitude point at one of the four QPSK
/// phases `pi/4 + q*pi/2`; DC and the guard bins stay zero. The phases come
/// from a 64-bit LCG so the sequence is reproducible from the seed alone.
pub fn generate_prs_reference(params: &OfdmParams, seed: u64) -> Vec<IQSample> {
    let n = params.nb_fft;
    let half_carriers = (params.nb_data_carriers / 2) as i64;
    let mut state = seed;
    let mut next_phase = move || -> f64 {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let q = (state >> 33) & 3;
        PI / 4.0 + q as f64 * PI / 2.0
    };

    let mut prs = vec![IQSample::new(0.0, 0.0); n];
    for c in -half_carriers..=half_carriers {
        if c == 0 {
            continue;
        }
        let bin = (n as i64 + c) as usize % n;
        let phase = next_phase();
        prs[bin] = IQSample::new(phase.cos(), phase.sin());
    }
    prs
}

/// DAB frequency interleaver: a rotation permutation over the active
/// carriers.
///
/// The generator `a(n) = (13*a(n-1) + nb_fft/4 - 1) mod nb_fft` visits every
/// residue exactly once per cycle; keeping only the visits that land on
/// active carriers (and skipping DC) yields a permutation of
/// `[0, nb_data_carriers)` mapping output bit positions to DQPSK carrier
/// indices.
pub fn generate_carrier_mapper(params: &OfdmParams) -> Vec<usize> {
    let n = params.nb_fft;
    let half = params.nb_data_carriers / 2;
    let mid = n / 2;
    let lo = mid - half;
    let hi = mid + half;
    let offset = n / 4 - 1;

    let mut mapper = Vec::with_capacity(params.nb_data_carriers);
    let mut a = 0usize;
    for _ in 0..n {
        a = (13 * a + offset) % n;
        if a >= lo && a <= hi && a != mid {
            let index = if a < mid { a - lo } else { a - lo - 1 };
            mapper.push(index);
        }
    }
    mapper
}

/// Check that `mapper` is a permutation of `[0, nb_carriers)`.
pub fn validate_carrier_mapper(mapper: &[usize], nb_carriers: usize) -> DspResult<()> {
    if mapper.len() != nb_carriers {
        return Err(DspError::InvalidCarrierMapper(nb_carriers));
    }
    let mut seen = vec![false; nb_carriers];
    for &m in mapper {
        if m >= nb_carriers || seen[m] {
            return Err(DspError::InvalidCarrierMapper(nb_carriers));
        }
        seen[m] = true;
    }
    Ok(())
}
