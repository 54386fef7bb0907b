//! # DAB OFDM receiver front-end
//!
//! This crate implements the OFDM demodulation core of a software-defined
//! DAB (Digital Audio Broadcasting) receiver: it consumes a stream of
//! complex baseband I/Q samples from an RF source and emits, once per
//! transmission frame, the ordered soft-decision bits that feed the
//! downstream Viterbi/FIC/MSC decoding stages.
//!
//! ## Signal flow
//!
//! ```text
//! IQ samples -> ingest FSM -> frame buffer -> N pipeline workers -> soft bits
//!               |                             |
//!               null detection                PLL + FFT + DQPSK
//!               coarse/fine freq sync         deinterleave + demap
//!               fine time sync (PRS)          cyclic phase error
//! ```
//!
//! Acquisition is sample-synchronous on the caller's thread; demodulation of
//! each captured frame runs on a coordinator thread plus a configurable pool
//! of worker threads, double-buffered so ingest never drops samples while a
//! frame is in flight.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dab_ofdm::prelude::*;
//!
//! // Mode I parameters with matched reference data.
//! let params = TransmissionMode::ModeI.params();
//! let prs = generate_prs_reference(&params, 42);
//! let mapper = generate_carrier_mapper(&params);
//!
//! let mut demod = OfdmDemodulator::new(params, &prs, &mapper, None).unwrap();
//! demod.on_frame(|bits| {
//!     // Hand the soft bits to the Viterbi decoder.
//!     println!("frame: {} soft bits", bits.len());
//! });
//!
//! // Feed batches from the SDR; any batch size works.
//! let samples: Vec<IQSample> = vec![];
//! demod.process(&samples);
//! ```

pub mod buffers;
pub mod config;
pub mod demodulator;
pub mod event;
pub mod fft;
pub mod modulator;
pub mod params;
pub mod pipeline;
pub mod reference;
pub mod simd_utils;
pub mod types;

pub use config::DemodConfig;
pub use demodulator::{DemodState, OfdmDemodulator};
pub use modulator::OfdmModulator;
pub use params::{OfdmParams, TransmissionMode};
pub use types::{DspError, DspResult, IQSample, SoftBit};

/// Commonly used items.
pub mod prelude {
    pub use crate::config::{DemodConfig, NullSearchConfig, SignalL1Config, SyncConfig};
    pub use crate::demodulator::{DemodState, OfdmDemodulator};
    pub use crate::modulator::{apply_tuning_offset, OfdmModulator};
    pub use crate::params::{OfdmParams, TransmissionMode};
    pub use crate::reference::{generate_carrier_mapper, generate_prs_reference};
    pub use crate::types::{DspError, DspResult, IQSample, SoftBit, SOFT_DECISION_HIGH};
}
