//! Runtime-tunable demodulator configuration
//!
//! All knobs have working defaults; a receiver application typically
//! deserializes overrides from its configuration file and applies them with
//! [`crate::demodulator::OfdmDemodulator::set_config`]. Frequencies are
//! normalized cycles/sample, thresholds are fractions of the running L1
//! signal average, and EMA coefficients are in `0..1`.

use serde::{Deserialize, Serialize};

/// Block-wise L1 signal power estimator settings.
///
/// The L1 average (`mean(|re| + |im|)`) is cheaper than magnitude and is
/// sufficient for NULL-period detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalL1Config {
    /// Samples per estimator block.
    pub nb_samples: usize,
    /// Stride multiplier between updates (blocks skipped between estimates).
    pub nb_decimate: usize,
    /// EMA coefficient: weight of the previous average.
    pub update_beta: f64,
}

impl Default for SignalL1Config {
    fn default() -> Self {
        Self {
            nb_samples: 100,
            nb_decimate: 5,
            update_beta: 0.95,
        }
    }
}

/// NULL-period power-dip search thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NullSearchConfig {
    /// Fraction of the L1 average below which a NULL period begins.
    pub thresh_null_start: f64,
    /// Fraction of the L1 average above which the NULL period has ended.
    pub thresh_null_end: f64,
}

impl Default for NullSearchConfig {
    fn default() -> Self {
        Self {
            thresh_null_start: 0.35,
            thresh_null_end: 0.75,
        }
    }
}

/// Frequency and time synchronization settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// When false, coarse frequency correction is skipped and assumed zero.
    pub is_coarse_freq_correction: bool,
    /// Half-width of the coarse correlation search window, as a fraction of
    /// the sample rate. Multiplied by the FFT size this gives the window in
    /// FFT bins.
    pub max_coarse_freq_correction_norm: f64,
    /// EMA coefficient for small coarse corrections. Slow updates keep the
    /// estimate from oscillating when the true offset sits between two bins.
    pub coarse_freq_slow_beta: f64,
    /// Minimum peak-above-mean level, in dB, for the PRS impulse response to
    /// count as a time lock.
    pub impulse_peak_threshold_db: f64,
    /// Probability weight retained by an impulse peak one symbol period away
    /// from the expected position. Peaks far from the cyclic-prefix boundary
    /// are discounted to avoid spurious locks while still frequency-offset.
    pub impulse_peak_distance_probability: f64,
    /// EMA coefficient for the per-frame fine frequency feedback.
    pub fine_freq_update_beta: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            is_coarse_freq_correction: true,
            max_coarse_freq_correction_norm: 0.01,
            coarse_freq_slow_beta: 0.1,
            impulse_peak_threshold_db: 20.0,
            impulse_peak_distance_probability: 0.15,
            fine_freq_update_beta: 0.9,
        }
    }
}

/// Complete demodulator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DemodConfig {
    pub signal_l1: SignalL1Config,
    pub null_search: NullSearchConfig,
    pub sync: SyncConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sane() {
        let cfg = DemodConfig::default();
        assert!(cfg.signal_l1.nb_samples > 0);
        assert!(cfg.signal_l1.update_beta > 0.0 && cfg.signal_l1.update_beta < 1.0);
        assert!(cfg.null_search.thresh_null_start < cfg.null_search.thresh_null_end);
        assert!(cfg.sync.is_coarse_freq_correction);
        assert!(cfg.sync.coarse_freq_slow_beta > 0.0 && cfg.sync.coarse_freq_slow_beta < 1.0);
        assert!(cfg.sync.fine_freq_update_beta > 0.0 && cfg.sync.fine_freq_update_beta <= 1.0);
        assert!(cfg.sync.impulse_peak_threshold_db > 0.0);
    }

    #[test]
    fn test_coarse_window_mode_i() {
        // The default window spans roughly +-20 FFT bins in mode I.
        let cfg = DemodConfig::default();
        let bins = (cfg.sync.max_coarse_freq_correction_norm * 2048.0).round() as i64;
        assert_eq!(bins, 20);
    }
}
