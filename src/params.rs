//! DAB OFDM transmission parameters
//!
//! DAB (ETSI EN 300 401) defines four transmission modes trading carrier
//! spacing against guard length for different propagation environments.
//! All figures below are sample counts at the 2.048 MS/s baseline rate,
//! although the demodulator itself is rate-agnostic: frequencies are handled
//! in normalized cycles/sample and the sample rate only enters the optional
//! duration helpers.
//!
//! | Mode | FFT  | Cyclic prefix | Symbol | NULL | Symbols/frame | Carriers |
//! |------|------|---------------|--------|------|---------------|----------|
//! | I    | 2048 | 504           | 2552   | 2656 | 76            | 1536     |
//! | II   | 512  | 126           | 638    | 664  | 76            | 384      |
//! | III  | 256  | 63            | 319    | 345  | 153           | 192      |
//! | IV   | 1024 | 252           | 1276   | 1328 | 76            | 768      |
//!
//! Each transmission frame is a NULL period followed by `nb_frame_symbols`
//! OFDM symbols; the first symbol is the phase reference symbol (PRS) and
//! carries no payload.

use serde::{Deserialize, Serialize};

use crate::types::{DspError, DspResult};

/// DAB transmission mode (ETSI EN 300 401, clause 14).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransmissionMode {
    /// Terrestrial SFN networks (VHF band III).
    ModeI,
    /// Terrestrial local / satellite hybrid (L-band).
    ModeII,
    /// Cable and satellite below 3 GHz.
    ModeIII,
    /// L-band terrestrial with larger cells.
    ModeIV,
}

impl TransmissionMode {
    /// OFDM parameters for this mode.
    pub fn params(self) -> OfdmParams {
        let (nb_fft, nb_cyclic_prefix, nb_null_period, nb_frame_symbols, nb_data_carriers) =
            match self {
                TransmissionMode::ModeI => (2048, 504, 2656, 76, 1536),
                TransmissionMode::ModeII => (512, 126, 664, 76, 384),
                TransmissionMode::ModeIII => (256, 63, 345, 153, 192),
                TransmissionMode::ModeIV => (1024, 252, 1328, 76, 768),
            };
        OfdmParams {
            nb_fft,
            nb_cyclic_prefix,
            nb_symbol_period: nb_fft + nb_cyclic_prefix,
            nb_null_period,
            nb_frame_symbols,
            nb_data_carriers,
        }
    }
}

/// OFDM frame structure parameters, immutable after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfdmParams {
    /// Useful symbol length in samples (FFT size).
    pub nb_fft: usize,
    /// Cyclic prefix (guard interval) length in samples.
    pub nb_cyclic_prefix: usize,
    /// Whole symbol period: `nb_fft + nb_cyclic_prefix`.
    pub nb_symbol_period: usize,
    /// NULL period length in samples.
    pub nb_null_period: usize,
    /// OFDM symbols per frame, the PRS counting as symbol 0.
    pub nb_frame_symbols: usize,
    /// Information-bearing subcarriers, symmetric about DC.
    pub nb_data_carriers: usize,
}

impl OfdmParams {
    /// Validate structural constraints.
    ///
    /// Called at demodulator construction; a failing parameter set refuses to
    /// start rather than misbehaving on the sample path.
    pub fn validate(&self) -> DspResult<()> {
        if self.nb_fft == 0
            || self.nb_cyclic_prefix == 0
            || self.nb_null_period == 0
            || self.nb_frame_symbols < 2
            || self.nb_data_carriers == 0
        {
            return Err(DspError::InvalidParams(
                "all dimensions must be non-zero and at least two symbols per frame".into(),
            ));
        }
        if self.nb_symbol_period != self.nb_fft + self.nb_cyclic_prefix {
            return Err(DspError::InvalidParams(format!(
                "symbol period {} != fft {} + cyclic prefix {}",
                self.nb_symbol_period, self.nb_fft, self.nb_cyclic_prefix
            )));
        }
        // The trailing NULL is addressed as one more symbol slot by the
        // pipeline, so it must cover at least a symbol period.
        if self.nb_null_period < self.nb_symbol_period {
            return Err(DspError::InvalidParams(format!(
                "null period {} shorter than symbol period {}",
                self.nb_null_period, self.nb_symbol_period
            )));
        }
        if self.nb_data_carriers % 2 != 0 || self.nb_data_carriers >= self.nb_fft {
            return Err(DspError::InvalidParams(format!(
                "data carriers {} must be even and fit inside the FFT size {}",
                self.nb_data_carriers, self.nb_fft
            )));
        }
        Ok(())
    }

    /// Samples in one whole transmission frame (NULL + all symbols).
    pub fn nb_frame_period(&self) -> usize {
        self.nb_null_period + self.nb_frame_symbols * self.nb_symbol_period
    }

    /// Soft bits produced per frame.
    ///
    /// Differential demodulation yields one fewer symbol than raw, each
    /// carrying two bits per data carrier.
    pub fn nb_frame_bits(&self) -> usize {
        (self.nb_frame_symbols - 1) * self.nb_data_carriers * 2
    }

    /// Frame duration in seconds at the given sample rate.
    pub fn frame_duration(&self, sample_rate: f64) -> f64 {
        self.nb_frame_period() as f64 / sample_rate
    }

    /// Subcarrier spacing in Hz at the given sample rate.
    pub fn carrier_spacing(&self, sample_rate: f64) -> f64 {
        sample_rate / self.nb_fft as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_i_params() {
        let p = TransmissionMode::ModeI.params();
        assert_eq!(p.nb_fft, 2048);
        assert_eq!(p.nb_cyclic_prefix, 504);
        assert_eq!(p.nb_symbol_period, 2552);
        assert_eq!(p.nb_null_period, 2656);
        assert_eq!(p.nb_frame_symbols, 76);
        assert_eq!(p.nb_data_carriers, 1536);
        // 96 ms frame at 2.048 MS/s
        assert_eq!(p.nb_frame_period(), 196_608);
        assert!((p.frame_duration(2.048e6) - 0.096).abs() < 1e-12);
    }

    #[test]
    fn test_all_modes_validate() {
        for mode in [
            TransmissionMode::ModeI,
            TransmissionMode::ModeII,
            TransmissionMode::ModeIII,
            TransmissionMode::ModeIV,
        ] {
            let p = mode.params();
            p.validate().unwrap();
            // Frame periods are 96/24/24/48 ms at the baseline rate.
            assert_eq!(p.nb_frame_period() % 24_576, 0);
        }
    }

    #[test]
    fn test_frame_bits_mode_i() {
        let p = TransmissionMode::ModeI.params();
        assert_eq!(p.nb_frame_bits(), 75 * 1536 * 2);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut p = TransmissionMode::ModeI.params();
        p.nb_symbol_period += 1;
        assert!(p.validate().is_err());

        let mut p = TransmissionMode::ModeI.params();
        p.nb_null_period = 100;
        assert!(p.validate().is_err());

        let mut p = TransmissionMode::ModeI.params();
        p.nb_data_carriers = p.nb_fft;
        assert!(p.validate().is_err());

        let mut p = TransmissionMode::ModeI.params();
        p.nb_data_carriers = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_mode_iii_has_most_symbols() {
        let p = TransmissionMode::ModeIII.params();
        assert_eq!(p.nb_frame_symbols, 153);
        assert!(p.nb_frame_symbols > TransmissionMode::ModeI.params().nb_frame_symbols);
    }
}
