//! OFDM demodulator: ingest state machine and frame pipeline
//!
//! [`OfdmDemodulator`] consumes a continuous stream of complex baseband
//! samples and emits, once per DAB transmission frame, the frame's
//! soft-decision bits to registered observers.
//!
//! ```text
//! IQ samples -> ingest FSM -> inactive frame buffer
//!                                   | swap at barrier
//!                             active frame buffer -> W workers -> soft bits
//! ```
//!
//! The ingest side runs on the caller's thread and never blocks on IO; it
//! blocks once per frame on the coordinator's end barrier, bounded by one
//! frame's compute. Acquisition walks five states:
//!
//! 1. **FindingNullPowerDip** — hunt the NULL period by L1 power drop;
//! 2. **ReadingNullAndPrs** — capture one NULL + PRS into the correlation
//!    buffer;
//! 3. **RunningCoarseFreqSync** — integral-bin frequency estimate from the
//!    relative-phase PRS correlation;
//! 4. **RunningFineTimeSync** — PRS impulse response locates the symbol
//!    boundary, or resets the whole chain when the peak is too weak;
//! 5. **ReadingSymbols** — fill the inactive frame, swap at the barrier,
//!    hand the frame to the pipeline.
//!
//! Frequency handling is split: the coarse offset is quantized to FFT bins
//! and owned by the ingest thread, while the fine offset stays within half a
//! bin and is driven by the per-frame cyclic-prefix phase error. When a
//! coarse jump lands, the fine offset is counter-adjusted so the combined
//! correction stays continuous.

use num_complex::Complex64;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use tracing::{debug, warn};

use crate::buffers::{CircularSampleBuffer, LinearSampleBuffer, SharedFrameBuffers};
use crate::config::DemodConfig;
use crate::event::Stopped;
use crate::fft::FftProcessor;
use crate::params::OfdmParams;
use crate::pipeline::{
    carve_symbol_ranges, resolve_worker_count, Coordinator, FreqOffsets, PipelineWorker,
};
use crate::reference::validate_carrier_mapper;
use crate::simd_utils::{
    apply_pll, calculate_l1_average, calculate_magnitude_db, calculate_relative_phase,
    complex_conj_mul_sum, convert_to_soft_bit,
};
use crate::types::{DspError, DspResult, IQSample, SoftBit};

/// Acquisition state of the ingest machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemodState {
    FindingNullPowerDip,
    ReadingNullAndPrs,
    RunningCoarseFreqSync,
    RunningFineTimeSync,
    ReadingSymbols,
}

type FrameObserver = Box<dyn FnMut(&[SoftBit]) + Send>;

/// State shared between the ingest thread, the coordinator and the workers.
struct DemodShared {
    params: OfdmParams,
    config: RwLock<DemodConfig>,
    offsets: FreqOffsets,
    buffers: SharedFrameBuffers,
    carrier_mapper: Vec<usize>,
    coordinator: Coordinator,
    workers: Vec<PipelineWorker>,
    fft_plans: FftProcessor,
    total_frames_read: AtomicU64,
    total_frames_desync: AtomicU64,
    observers: Mutex<Vec<FrameObserver>>,
}

impl DemodShared {
    fn fine_wrap(&self) -> f64 {
        // Half an FFT bin with a 1% margin against edge oscillation.
        0.5 * (1.0 / self.params.nb_fft as f64) * 1.01
    }
}

/// Sample-driven OFDM demodulator with a multi-threaded frame pipeline.
pub struct OfdmDemodulator {
    shared: Arc<DemodShared>,

    // Ingest-side state; touched only from the `process` caller's thread.
    state: DemodState,
    is_null_start_found: bool,
    is_null_end_found: bool,
    is_found_coarse_freq_offset: bool,
    signal_l1_average: f64,
    fine_time_offset: isize,
    null_power_dip_buffer: CircularSampleBuffer,
    correlation_time_buffer: LinearSampleBuffer,
    /// Conjugated frequency-domain PRS, for the fine-time correlator.
    prs_fft_reference: Vec<IQSample>,
    /// Conjugated time-domain relative-phase PRS, for the coarse correlator.
    prs_time_reference: Vec<IQSample>,
    correlation_fft_buffer: Vec<IQSample>,
    correlation_ifft_buffer: Vec<IQSample>,
    correlation_impulse_response: Vec<f64>,
    correlation_frequency_response: Vec<f64>,
    interleaved_staging: Vec<IQSample>,
    fft: FftProcessor,

    coordinator_handle: Option<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl OfdmDemodulator {
    /// Build the demodulator and spawn its pipeline threads.
    ///
    /// `prs_fft_ref` is the (unconjugated) frequency-domain PRS of length
    /// `nb_fft`; `carrier_mapper` the frequency deinterleaver permutation;
    /// `nb_desired_threads` caps the worker count, `None` meaning automatic.
    pub fn new(
        params: OfdmParams,
        prs_fft_ref: &[IQSample],
        carrier_mapper: &[usize],
        nb_desired_threads: Option<usize>,
    ) -> DspResult<Self> {
        params.validate()?;
        if prs_fft_ref.len() != params.nb_fft {
            return Err(DspError::ReferenceLengthMismatch {
                expected: params.nb_fft,
                actual: prs_fft_ref.len(),
            });
        }
        validate_carrier_mapper(carrier_mapper, params.nb_data_carriers)?;

        let mut fft = FftProcessor::new(params.nb_fft);

        // Fine time sync correlates in the frequency domain, so the PRS
        // reference is stored conjugated.
        let prs_fft_reference: Vec<IQSample> = prs_fft_ref.iter().map(|v| v.conj()).collect();

        // Coarse frequency sync correlates relative-phase spectra via a
        // product in the time domain, so that reference is the conjugated
        // time-domain image of the relative-phase PRS.
        let mut prs_time_reference = vec![Complex64::new(0.0, 0.0); params.nb_fft];
        calculate_relative_phase(prs_fft_ref, &mut prs_time_reference);
        fft.ifft_inplace(&mut prs_time_reference);
        for v in prs_time_reference.iter_mut() {
            *v = v.conj();
        }

        let nb_symbols = params.nb_frame_symbols + 1;
        let nb_workers = resolve_worker_count(nb_symbols, nb_desired_threads);
        let workers: Vec<PipelineWorker> = carve_symbol_ranges(nb_symbols, nb_workers)
            .into_iter()
            .map(|(a, b)| PipelineWorker::new(a, b))
            .collect();
        debug!(nb_workers, nb_symbols, "ofdm pipeline carved");

        let shared = Arc::new(DemodShared {
            params,
            config: RwLock::new(DemodConfig::default()),
            offsets: FreqOffsets::new(),
            buffers: SharedFrameBuffers::new(&params),
            carrier_mapper: carrier_mapper.to_vec(),
            coordinator: Coordinator::new(),
            workers,
            fft_plans: fft.clone(),
            total_frames_read: AtomicU64::new(0),
            total_frames_desync: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
        });

        let (coordinator_handle, worker_handles) = spawn_pipeline(&shared)?;

        Ok(Self {
            shared,
            state: DemodState::FindingNullPowerDip,
            is_null_start_found: false,
            is_null_end_found: false,
            is_found_coarse_freq_offset: false,
            signal_l1_average: 0.0,
            fine_time_offset: 0,
            null_power_dip_buffer: CircularSampleBuffer::new(params.nb_null_period),
            correlation_time_buffer: LinearSampleBuffer::new(
                params.nb_null_period + params.nb_symbol_period,
            ),
            prs_fft_reference,
            prs_time_reference,
            correlation_fft_buffer: vec![Complex64::new(0.0, 0.0); params.nb_fft],
            correlation_ifft_buffer: vec![Complex64::new(0.0, 0.0); params.nb_fft],
            correlation_impulse_response: vec![0.0; params.nb_fft],
            correlation_frequency_response: vec![0.0; params.nb_fft],
            interleaved_staging: Vec::new(),
            fft,
            coordinator_handle: Some(coordinator_handle),
            worker_handles,
        })
    }

    // -- Public surface -----------------------------------------------------

    pub fn params(&self) -> &OfdmParams {
        &self.shared.params
    }

    pub fn state(&self) -> DemodState {
        self.state
    }

    pub fn config(&self) -> DemodConfig {
        *self.shared.config.read().unwrap()
    }

    pub fn set_config(&self, config: DemodConfig) {
        *self.shared.config.write().unwrap() = config;
    }

    /// Register an observer invoked once per decoded frame with the frame's
    /// soft bits, from the coordinator thread.
    pub fn on_frame<F>(&self, callback: F)
    where
        F: FnMut(&[SoftBit]) + Send + 'static,
    {
        self.shared.observers.lock().unwrap().push(Box::new(callback));
    }

    pub fn total_frames_read(&self) -> u64 {
        self.shared.total_frames_read.load(Ordering::Relaxed)
    }

    pub fn total_frames_desync(&self) -> u64 {
        self.shared.total_frames_desync.load(Ordering::Relaxed)
    }

    /// Coarse frequency offset in normalized cycles/sample.
    pub fn coarse_freq_offset(&self) -> f64 {
        self.shared.offsets.coarse()
    }

    /// Fine frequency offset in normalized cycles/sample.
    pub fn fine_freq_offset(&self) -> f64 {
        self.shared.offsets.fine()
    }

    /// Sample adjustment applied to the most recent PRS window.
    pub fn fine_time_offset(&self) -> isize {
        self.fine_time_offset
    }

    /// Exponentially-smoothed L1 signal average.
    pub fn signal_l1_average(&self) -> f64 {
        self.signal_l1_average
    }

    /// Feed a batch of complex baseband samples.
    ///
    /// Batches may be any size; the acquisition machine is resumable across
    /// batch boundaries and always consumes the entire batch.
    pub fn process(&mut self, samples: &[IQSample]) {
        self.update_signal_average(samples);

        let n = samples.len();
        let mut index = 0;
        while index < n {
            let remain = &samples[index..];
            index += match self.state {
                DemodState::FindingNullPowerDip => self.find_null_power_dip(remain),
                DemodState::ReadingNullAndPrs => self.read_null_prs(remain),
                DemodState::RunningCoarseFreqSync => self.run_coarse_freq_sync(),
                DemodState::RunningFineTimeSync => self.run_fine_time_sync(),
                DemodState::ReadingSymbols => self.read_symbols(remain),
            };
        }
    }

    /// Feed interleaved I/Q float samples (`i0, q0, i1, q1, ...`).
    ///
    /// A trailing unpaired value is ignored.
    pub fn process_interleaved(&mut self, samples: &[f32]) {
        let mut staging = std::mem::take(&mut self.interleaved_staging);
        staging.clear();
        staging.extend(
            samples
                .chunks_exact(2)
                .map(|iq| Complex64::new(f64::from(iq[0]), f64::from(iq[1]))),
        );
        self.process(&staging);
        self.interleaved_staging = staging;
    }

    // -- Acquisition machine ------------------------------------------------

    /// Severe desync: drop back to the power-dip hunt and flush frequency
    /// state. An invalid fine-frequency estimate corrupts the next fine-time
    /// impulse response, so all of it goes together.
    fn reset(&mut self) {
        warn!(
            desyncs = self.total_frames_desync() + 1,
            "ofdm demod lost sync, restarting acquisition"
        );
        self.state = DemodState::FindingNullPowerDip;
        self.correlation_time_buffer.clear();
        self.shared.total_frames_desync.fetch_add(1, Ordering::Relaxed);
        self.is_found_coarse_freq_offset = false;
        self.shared.offsets.clear();
        self.fine_time_offset = 0;
    }

    /// EMA of the block-wise L1 power, decimated; the threshold basis for
    /// NULL detection.
    fn update_signal_average(&mut self, buf: &[IQSample]) {
        let cfg = self.shared.config.read().unwrap().signal_l1;
        let k = cfg.nb_samples.max(1);
        let n = buf.len();
        if n < k {
            return;
        }
        let stride = k * cfg.nb_decimate.max(1);
        let beta = cfg.update_beta;
        let mut i = 0;
        while i < n - k {
            let l1 = calculate_l1_average(&buf[i..i + k]);
            self.signal_l1_average = beta * self.signal_l1_average + (1.0 - beta) * l1;
            i += stride;
        }
    }

    /// Hunt the NULL period: a block-power drop below the start threshold
    /// followed by a rise above the end threshold. Everything scanned lands
    /// in the trailing circular buffer so the captured region precedes and
    /// includes the NULL, guaranteeing the full PRS is still ahead of us.
    fn find_null_power_dip(&mut self, buf: &[IQSample]) -> usize {
        let cfg = self.shared.config.read().unwrap();
        let k = cfg.signal_l1.nb_samples.max(1);
        let null_start_thresh = self.signal_l1_average * cfg.null_search.thresh_null_start;
        let null_end_thresh = self.signal_l1_average * cfg.null_search.thresh_null_end;
        drop(cfg);

        let n = buf.len();
        let mut nb_read = n;
        let mut i = 0;
        while i + k < n {
            let l1 = calculate_l1_average(&buf[i..i + k]);
            if self.is_null_start_found {
                if l1 > null_end_thresh {
                    self.is_null_end_found = true;
                    nb_read = i + k;
                    break;
                }
            } else if l1 < null_start_thresh {
                self.is_null_start_found = true;
            }
            i += k;
        }

        self.null_power_dip_buffer.push_overwrite(&buf[..nb_read]);
        if !self.is_null_end_found {
            return nb_read;
        }

        self.correlation_time_buffer
            .fill_ordered_from(&self.null_power_dip_buffer);
        self.is_null_start_found = false;
        self.is_null_end_found = false;
        self.null_power_dip_buffer.clear();
        debug!("null power dip found, capturing NULL+PRS");
        self.state = DemodState::ReadingNullAndPrs;
        nb_read
    }

    fn read_null_prs(&mut self, buf: &[IQSample]) -> usize {
        let nb_read = self.correlation_time_buffer.consume(buf);
        if self.correlation_time_buffer.is_full() {
            self.state = DemodState::RunningCoarseFreqSync;
        }
        nb_read
    }

    /// Integral frequency offset from the PRS: correlate the bin-to-bin
    /// relative phase of the received spectrum against the reference, then
    /// pick the strongest shift inside the search window. Consumes no input.
    fn run_coarse_freq_sync(&mut self) -> usize {
        let cfg = self.shared.config.read().unwrap().sync;
        if !cfg.is_coarse_freq_correction {
            self.shared.offsets.set_coarse(0.0);
            self.state = DemodState::RunningFineTimeSync;
            return 0;
        }

        let params = self.shared.params;
        let nb_fft = params.nb_fft;
        let prs = &self.correlation_time_buffer.as_slice()
            [params.nb_null_period..params.nb_null_period + params.nb_symbol_period];

        // Received relative-phase spectrum, moved to the time domain where
        // correlation is a pointwise product with the conjugated reference.
        self.fft.fft(&prs[..nb_fft], &mut self.correlation_fft_buffer);
        calculate_relative_phase(&self.correlation_fft_buffer, &mut self.correlation_ifft_buffer);
        self.fft.ifft_inplace(&mut self.correlation_ifft_buffer);
        for (v, r) in self
            .correlation_ifft_buffer
            .iter_mut()
            .zip(self.prs_time_reference.iter())
        {
            *v *= r;
        }
        self.fft.fft_inplace(&mut self.correlation_ifft_buffer);
        calculate_magnitude_db(
            &self.correlation_ifft_buffer,
            &mut self.correlation_frequency_response,
        );

        // Peak search over the allowed window; zero error sits at nb_fft/2
        // in the shifted spectrum.
        let mid = (nb_fft / 2) as i64;
        let max_carrier_offset = ((cfg.max_coarse_freq_correction_norm * nb_fft as f64).round()
            as i64)
            .clamp(0, mid);
        let mut best_index = -max_carrier_offset;
        let mut best_value = f64::NEG_INFINITY;
        for i in -max_carrier_offset..=max_carrier_offset {
            let shifted = i + mid;
            if shifted == nb_fft as i64 {
                continue;
            }
            let value = self.correlation_frequency_response[shifted as usize];
            if value > best_value {
                best_value = value;
                best_index = i;
            }
        }

        let predicted = -(best_index as f64) / nb_fft as f64;
        let error = predicted - self.shared.offsets.coarse();

        // A whole-bin jump must land immediately or everything downstream
        // works on a badly shifted spectrum; a sub-bin wobble is averaged so
        // the estimate cannot oscillate between two adjacent bins.
        let large_offset_threshold = 1.5 / nb_fft as f64;
        let is_fast_update =
            error.abs() > large_offset_threshold || !self.is_found_coarse_freq_offset;
        let beta = if is_fast_update {
            1.0
        } else {
            cfg.coarse_freq_slow_beta
        };
        let delta = beta * error;

        self.shared
            .offsets
            .set_coarse(self.shared.offsets.coarse() + delta);
        self.is_found_coarse_freq_offset = true;
        // Counter-adjust so the combined offset stays continuous across the
        // quantized coarse jump.
        self.shared.offsets.update_fine(-delta, self.shared.fine_wrap());

        if is_fast_update && delta != 0.0 {
            debug!(
                bins = predicted * nb_fft as f64,
                "coarse frequency correction applied"
            );
        }

        self.state = DemodState::RunningFineTimeSync;
        0
    }

    /// Locate the PRS boundary from its impulse response, weighted towards
    /// the expected position just past the cyclic prefix. Consumes no input.
    fn run_fine_time_sync(&mut self) -> usize {
        let cfg = self.shared.config.read().unwrap().sync;
        let params = self.shared.params;
        let nb_fft = params.nb_fft;
        let nb_cp = params.nb_cyclic_prefix;

        let prs = &self.correlation_time_buffer.as_slice()
            [params.nb_null_period..params.nb_null_period + params.nb_symbol_period];

        // Correct the capture with the current frequency estimate first; the
        // impulse response of a rotating PRS spreads badly.
        let freq_offset = self.shared.offsets.snapshot();
        self.correlation_ifft_buffer.copy_from_slice(&prs[..nb_fft]);
        apply_pll(&mut self.correlation_ifft_buffer, freq_offset, 0.0);

        // Time correlation against the PRS = conjugate product in frequency.
        self.fft.fft_inplace(&mut self.correlation_ifft_buffer);
        for (v, r) in self
            .correlation_ifft_buffer
            .iter_mut()
            .zip(self.prs_fft_reference.iter())
        {
            *v *= r;
        }
        self.fft.ifft_inplace(&mut self.correlation_ifft_buffer);
        for (out, v) in self
            .correlation_impulse_response
            .iter_mut()
            .zip(self.correlation_ifft_buffer.iter())
        {
            *out = 20.0 * v.norm().log10();
        }

        // Weighted peak: discount peaks far from the expected boundary so a
        // stray correlation lobe during lock-in cannot cause a spurious jump.
        let decay_weight = 1.0 - cfg.impulse_peak_distance_probability;
        let expected_peak = nb_cp as isize;
        let mut impulse_avg = 0.0;
        let mut peak_value = self.correlation_impulse_response[0];
        let mut peak_index = 0usize;
        for (i, &value) in self.correlation_impulse_response.iter().enumerate() {
            let distance = (expected_peak - i as isize).unsigned_abs();
            let norm_distance = distance as f64 / params.nb_symbol_period as f64;
            let probability = 1.0 - decay_weight * norm_distance;
            let weighted = probability * value;
            impulse_avg += value;
            if weighted > peak_value {
                peak_value = weighted;
                peak_index = i;
            }
        }
        impulse_avg /= nb_fft as f64;

        // Too weak a main lobe means the capture was not a PRS at all.
        if peak_value - impulse_avg < cfg.impulse_peak_threshold_db {
            self.reset();
            return 0;
        }

        // The lobe lands just after the cyclic prefix; adjust back to the
        // prefix start and seed the inactive buffer with the partial PRS.
        let offset = peak_index as isize - nb_cp as isize;
        let prs_start = (params.nb_null_period as isize + offset) as usize;
        let prs_end = params.nb_null_period + params.nb_symbol_period;
        let prs_buf = &self.correlation_time_buffer.as_slice()[prs_start..prs_end];

        // Safety: the inactive frame is only ever touched by this thread.
        let inactive = unsafe { self.shared.buffers.inactive_mut() };
        inactive.reset();
        inactive.consume(prs_buf);

        self.correlation_time_buffer.clear();
        self.fine_time_offset = offset;
        debug!(offset, "fine time sync locked");
        self.state = DemodState::ReadingSymbols;
        0
    }

    /// Fill the inactive frame; on completion pre-seed the next capture with
    /// the trailing NULL, then swap buffers at the coordinator barrier and
    /// launch the pipeline.
    fn read_symbols(&mut self, buf: &[IQSample]) -> usize {
        // Safety: the inactive frame is only ever touched by this thread.
        let inactive = unsafe { self.shared.buffers.inactive_mut() };
        let nb_read = inactive.consume(buf);
        if !inactive.is_full() {
            return nb_read;
        }

        // The trailing NULL doubles as the head of the next capture.
        self.correlation_time_buffer.fill_from(inactive.null_symbol());

        if self.shared.coordinator.end.wait() == Err(Stopped) {
            return nb_read;
        }
        self.shared.buffers.swap();
        // Safety: workers are parked between the end and start barriers.
        unsafe { self.shared.buffers.inactive_mut() }.reset();
        self.shared.coordinator.start.signal();

        self.state = DemodState::ReadingNullAndPrs;
        nb_read
    }
}

impl Drop for OfdmDemodulator {
    fn drop(&mut self) {
        // Stop the coordinator first so a pending frame drains through the
        // worker barriers, then release the workers.
        self.shared.coordinator.stop();
        if let Some(handle) = self.coordinator_handle.take() {
            let _ = handle.join();
        }
        for worker in &self.shared.workers {
            worker.stop();
        }
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

// -- Pipeline threads -------------------------------------------------------

fn spawn_pipeline(
    shared: &Arc<DemodShared>,
) -> DspResult<(JoinHandle<()>, Vec<JoinHandle<()>>)> {
    let cleanup = |coordinator: Option<JoinHandle<()>>, workers: Vec<JoinHandle<()>>| {
        shared.coordinator.stop();
        for w in &shared.workers {
            w.stop();
        }
        if let Some(h) = coordinator {
            let _ = h.join();
        }
        for h in workers {
            let _ = h.join();
        }
    };

    let coordinator_handle = {
        let shared = Arc::clone(shared);
        std::thread::Builder::new()
            .name("ofdm-coordinator".into())
            .spawn(move || coordinator_loop(&shared))
            .map_err(|source| DspError::ThreadSpawn {
                role: "coordinator",
                source,
            })?
    };

    let mut worker_handles = Vec::with_capacity(shared.workers.len());
    for index in 0..shared.workers.len() {
        let spawned = {
            let shared = Arc::clone(shared);
            std::thread::Builder::new()
                .name(format!("ofdm-worker-{index}"))
                .spawn(move || worker_loop(&shared, index))
        };
        match spawned {
            Ok(handle) => worker_handles.push(handle),
            Err(source) => {
                cleanup(Some(coordinator_handle), worker_handles);
                return Err(DspError::ThreadSpawn {
                    role: "worker",
                    source,
                });
            }
        }
    }
    Ok((coordinator_handle, worker_handles))
}

/// Coordinator: per frame, launch the workers, fold their cyclic phase
/// errors into the fine-frequency feedback while their FFT work is still in
/// flight, then publish the frame downstream.
fn coordinator_loop(shared: &DemodShared) {
    let nb_fft = shared.params.nb_fft as f64;
    let mut frame_bits = vec![0 as SoftBit; shared.params.nb_frame_bits()];

    'frames: loop {
        if shared.coordinator.start.wait() == Err(Stopped) {
            break;
        }

        for worker in &shared.workers {
            worker.start.signal();
        }
        for worker in &shared.workers {
            if worker.phase_error_ready.wait() == Err(Stopped) {
                break 'frames;
            }
        }

        // Fractional frequency error from the cyclic-prefix phase rotation:
        // a residual of f cycles/sample rotates the prefix against the tail
        // by 2*pi*f*nb_fft, so the per-symbol error maps back through
        // (1/nb_fft) / (2*pi).
        let mut average_cyclic_error = 0.0;
        for worker in &shared.workers {
            average_cyclic_error += worker.phase_error();
        }
        average_cyclic_error /= shared.params.nb_frame_symbols as f64;
        let fine_freq_error = (1.0 / nb_fft) * average_cyclic_error / TAU;
        let beta = shared.config.read().unwrap().sync.fine_freq_update_beta;
        shared
            .offsets
            .update_fine(-beta * fine_freq_error, shared.fine_wrap());

        for worker in &shared.workers {
            if worker.end.wait() == Err(Stopped) {
                break 'frames;
            }
        }

        // Snapshot the bits before releasing the ingest side: the next swap
        // may happen at any point afterwards.
        // Safety: every worker signaled its end event for this frame.
        frame_bits.copy_from_slice(unsafe { shared.buffers.out_bits() });

        shared.coordinator.end.signal();
        shared.total_frames_read.fetch_add(1, Ordering::Relaxed);

        let mut observers = shared.observers.lock().unwrap();
        for observer in observers.iter_mut() {
            observer(&frame_bits);
        }
    }
}

/// Worker: PLL-correct, measure, transform and demap its own symbol range,
/// publishing the first FFT early so the left neighbour can finish its tail
/// DQPSK without waiting for this worker's whole range.
fn worker_loop(shared: &DemodShared, index: usize) {
    let me = &shared.workers[index];
    let dependent = shared.workers.get(index + 1);
    let params = shared.params;
    let mut fft = shared.fft_plans.clone();
    let mut dqpsk_vec = vec![Complex64::new(0.0, 0.0); params.nb_data_carriers];

    let symbol_start = me.symbol_start();
    let symbol_end = me.symbol_end();
    let symbol_end_no_null = symbol_end.min(params.nb_frame_symbols);
    let symbol_end_dqpsk = symbol_end.min(params.nb_frame_symbols - 1);

    loop {
        if me.start.wait() == Err(Stopped) {
            break;
        }

        // One snapshot for the whole frame; the ingest side may move the
        // offsets concurrently but per-frame corrections are sub-bin.
        let frequency_offset = shared.offsets.snapshot();
        for s in symbol_start..symbol_end {
            // Safety: symbol `s` is inside this worker's carve.
            let symbol = unsafe { shared.buffers.active_symbol_mut(s) };
            let dt0 = (s * params.nb_symbol_period) as f64 * frequency_offset;
            apply_pll(symbol, frequency_offset, dt0);
        }

        // Cyclic-prefix phase error over the data symbols (NULL excluded).
        let mut total_phase_error = 0.0;
        for s in symbol_start..symbol_end_no_null {
            // Safety: symbol `s` is inside this worker's carve.
            let symbol = unsafe { shared.buffers.active_symbol(s) };
            total_phase_error += calculate_cyclic_phase_error(symbol, &params);
        }
        me.set_phase_error(total_phase_error);
        me.phase_error_ready.signal();

        // First FFT published eagerly: the left neighbour's last DQPSK pair
        // needs it.
        run_symbol_fft(shared, &mut fft, &params, symbol_start);
        me.fft_ready.signal();
        for s in symbol_start + 1..symbol_end {
            run_symbol_fft(shared, &mut fft, &params, s);
        }

        // Differential demodulation; the final pair crosses into the
        // dependent's range and waits for its published FFT.
        match dependent {
            Some(dep) if symbol_end_dqpsk > symbol_start => {
                for s in symbol_start..symbol_end_dqpsk - 1 {
                    run_symbol_dqpsk(shared, &mut dqpsk_vec, &params, s);
                }
                let _ = dep.fft_ready.wait();
                run_symbol_dqpsk(shared, &mut dqpsk_vec, &params, symbol_end_dqpsk - 1);
            }
            _ => {
                for s in symbol_start..symbol_end_dqpsk {
                    run_symbol_dqpsk(shared, &mut dqpsk_vec, &params, s);
                }
            }
        }

        me.end.signal();
    }
}

/// Cyclic prefix vs. symbol tail: `arg(sum(conj(prefix) * tail))`.
///
/// The prefix is a copy of the tail one useful-symbol-period earlier, so any
/// residual rotation of `f` cycles/sample shows up as a phase of
/// `2*pi*f*nb_fft` between them.
fn calculate_cyclic_phase_error(symbol: &[IQSample], params: &OfdmParams) -> f64 {
    let prefix = &symbol[..params.nb_cyclic_prefix];
    let tail = &symbol[params.nb_fft..params.nb_fft + params.nb_cyclic_prefix];
    let error_vec = complex_conj_mul_sum(prefix, tail);
    error_vec.im.atan2(error_vec.re)
}

fn run_symbol_fft(shared: &DemodShared, fft: &mut FftProcessor, params: &OfdmParams, s: usize) {
    // Safety: symbol `s` and FFT row `s` belong to the calling worker.
    let symbol = unsafe { shared.buffers.active_symbol(s) };
    let out = unsafe { shared.buffers.fft_symbol_mut(s) };
    // Cyclic prefix removal happens here: only the useful part is
    // transformed.
    fft.fft(&symbol[params.nb_cyclic_prefix..params.nb_cyclic_prefix + params.nb_fft], out);
}

fn run_symbol_dqpsk(
    shared: &DemodShared,
    dqpsk_vec: &mut [IQSample],
    params: &OfdmParams,
    s: usize,
) {
    // Safety: FFT row `s` belongs to the calling worker; row `s + 1` is
    // either owned too or covered by the dependent's FFT event.
    let fft_prev = unsafe { shared.buffers.fft_symbol(s) };
    let fft_next = unsafe { shared.buffers.fft_symbol(s + 1) };
    let out_bits = unsafe { shared.buffers.bits_symbol_mut(s) };

    // Zero-padding removal: walk the information-bearing carriers around DC,
    // skipping the DC bin itself.
    let n = params.nb_fft as i64;
    let half = (params.nb_data_carriers / 2) as i64;
    let mut carrier_index = 0usize;
    for c in -half..=half {
        if c == 0 {
            continue;
        }
        let bin = ((n + c) % n) as usize;
        // arg(z1 * conj(z0)) = arg(z1) - arg(z0)
        dqpsk_vec[carrier_index] = fft_next[bin] * fft_prev[bin].conj();
        carrier_index += 1;
    }

    // Frequency deinterleave and QPSK demap. L-infinity normalization keeps
    // both rails at full scale when re and im are equal, where an L2 norm
    // would lose sqrt(2).
    let nb_carriers = params.nb_data_carriers;
    for i in 0..nb_carriers {
        let vec = dqpsk_vec[shared.carrier_mapper[i]];
        let amplitude = vec.re.abs().max(vec.im.abs());
        let norm = if amplitude > 0.0 {
            vec / amplitude
        } else {
            Complex64::new(0.0, 0.0)
        };
        out_bits[i] = convert_to_soft_bit(norm.re);
        out_bits[i + nb_carriers] = convert_to_soft_bit(-norm.im);
    }
}
