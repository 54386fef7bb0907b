//! End-to-end receiver scenarios: synthesized DAB frames fed through the
//! demodulator, exercising acquisition, frequency sync, desync recovery and
//! multi-worker equivalence.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use dab_ofdm::prelude::*;

type FrameLog = Arc<Mutex<Vec<Vec<SoftBit>>>>;

fn reference_data(params: &OfdmParams) -> (Vec<IQSample>, Vec<usize>) {
    (
        generate_prs_reference(params, 42),
        generate_carrier_mapper(params),
    )
}

fn build_demod(mode: TransmissionMode, threads: Option<usize>) -> (OfdmDemodulator, FrameLog) {
    let params = mode.params();
    let (prs, mapper) = reference_data(&params);
    let demod = OfdmDemodulator::new(params, &prs, &mapper, threads).unwrap();
    let log: FrameLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    demod.on_frame(move |bits| sink.lock().unwrap().push(bits.to_vec()));
    (demod, log)
}

fn build_modulator(mode: TransmissionMode) -> OfdmModulator {
    let params = mode.params();
    let (prs, mapper) = reference_data(&params);
    OfdmModulator::new(params, &prs, &mapper).unwrap()
}

fn random_bits(rng: &mut StdRng, n: usize) -> Vec<bool> {
    (0..n).map(|_| rng.gen_bool(0.5)).collect()
}

fn zeros(n: usize) -> Vec<IQSample> {
    vec![IQSample::new(0.0, 0.0); n]
}

fn feed(demod: &mut OfdmDemodulator, stream: &[IQSample], batch: usize) {
    for chunk in stream.chunks(batch) {
        demod.process(chunk);
    }
}

/// The pipeline finishes frames asynchronously on the coordinator thread;
/// the observer fires last, so waiting on the log also covers the counters.
fn wait_for_frames(log: &FrameLog, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while log.lock().unwrap().len() < n {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {n} frames (got {})",
            log.lock().unwrap().len()
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Fraction of soft bits whose sign matches the source bits.
fn sign_match(soft: &[SoftBit], bits: &[bool]) -> f64 {
    assert_eq!(soft.len(), bits.len());
    let hits = soft
        .iter()
        .zip(bits.iter())
        .filter(|(&s, &b)| (s > 0) == b)
        .count();
    hits as f64 / bits.len() as f64
}

// -- S1: cold start on an ideal signal --------------------------------------

#[test]
fn s1_cold_start_ideal() {
    let mode = TransmissionMode::ModeI;
    let params = mode.params();
    let mut rng = StdRng::seed_from_u64(1);
    let bits = random_bits(&mut rng, params.nb_frame_bits());

    let mut modulator = build_modulator(mode);
    let mut stream = zeros(2 * params.nb_null_period);
    stream.extend(modulator.modulate_frame(&bits).unwrap());
    stream.extend(zeros(params.nb_null_period));

    let (mut demod, log) = build_demod(mode, Some(4));
    feed(&mut demod, &stream, 8191);
    wait_for_frames(&log, 1);

    assert_eq!(demod.total_frames_read(), 1);
    assert_eq!(demod.total_frames_desync(), 0);
    assert_eq!(demod.coarse_freq_offset(), 0.0);

    let frames = log.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].len(), params.nb_frame_bits());
    assert!(
        sign_match(&frames[0], &bits) >= 0.99,
        "noiseless round trip must sign-match"
    );
}

// -- S2: integral coarse frequency offset -----------------------------------

#[test]
fn s2_coarse_offset_single_frame_is_bin_exact() {
    let mode = TransmissionMode::ModeI;
    let params = mode.params();
    let mut rng = StdRng::seed_from_u64(2);
    let bits = random_bits(&mut rng, params.nb_frame_bits());

    let mut modulator = build_modulator(mode);
    let mut stream = zeros(2 * params.nb_null_period);
    stream.extend(modulator.modulate_frame(&bits).unwrap());
    stream.extend(zeros(params.nb_null_period));
    apply_tuning_offset(&mut stream, 3.0 / params.nb_fft as f64);

    let (mut demod, log) = build_demod(mode, Some(4));
    feed(&mut demod, &stream, 8191);
    wait_for_frames(&log, 1);

    // The first (fast-track) correction lands on the exact bin.
    let coarse_bins = demod.coarse_freq_offset() * params.nb_fft as f64;
    assert!(
        (coarse_bins - 3.0).abs() < 1e-9,
        "fast coarse update must be bin-exact, got {coarse_bins}"
    );
    assert!(
        (coarse_bins - coarse_bins.round()).abs() < 1e-9,
        "coarse offset must be a bin multiple after a fast update"
    );
}

#[test]
fn s2_coarse_offset_two_frames() {
    let mode = TransmissionMode::ModeI;
    let params = mode.params();
    let nb_fft = params.nb_fft as f64;
    let mut rng = StdRng::seed_from_u64(3);

    let mut modulator = build_modulator(mode);
    let mut stream = zeros(2 * params.nb_null_period);
    for _ in 0..2 {
        let bits = random_bits(&mut rng, params.nb_frame_bits());
        stream.extend(modulator.modulate_frame(&bits).unwrap());
    }
    stream.extend(zeros(params.nb_null_period));
    apply_tuning_offset(&mut stream, 3.0 / nb_fft);

    let (mut demod, log) = build_demod(mode, Some(4));
    feed(&mut demod, &stream, 8191);
    wait_for_frames(&log, 2);

    assert_eq!(demod.total_frames_desync(), 0);
    let coarse_bins = demod.coarse_freq_offset() * nb_fft;
    assert!(
        (coarse_bins - 3.0).abs() < 0.3,
        "coarse must settle near +3 bins, got {coarse_bins}"
    );
    let fine_bins = demod.fine_freq_offset() * nb_fft;
    assert!(fine_bins.abs() < 0.5, "fine stays sub-bin, got {fine_bins}");
}

// -- S3: fractional frequency offset ----------------------------------------

#[test]
fn s3_fractional_offset_converges() {
    let mode = TransmissionMode::ModeI;
    let params = mode.params();
    let nb_fft = params.nb_fft as f64;
    let mut rng = StdRng::seed_from_u64(4);

    let mut modulator = build_modulator(mode);
    let mut frames_bits = Vec::new();
    let mut stream = zeros(2 * params.nb_null_period);
    for _ in 0..6 {
        let bits = random_bits(&mut rng, params.nb_frame_bits());
        stream.extend(modulator.modulate_frame(&bits).unwrap());
        frames_bits.push(bits);
    }
    stream.extend(zeros(params.nb_null_period));
    apply_tuning_offset(&mut stream, 0.2 / nb_fft);

    let (mut demod, log) = build_demod(mode, Some(4));
    feed(&mut demod, &stream, 8191);
    wait_for_frames(&log, 6);

    assert_eq!(demod.total_frames_desync(), 0);
    assert_eq!(demod.coarse_freq_offset(), 0.0);

    let fine_bins = demod.fine_freq_offset() * nb_fft;
    assert!(
        (fine_bins - 0.2).abs() < 0.02,
        "fine frequency must converge to +0.2 bins, got {fine_bins}"
    );
    // Invariant: the fine offset never leaves half a bin (plus margin).
    assert!(fine_bins.abs() <= 0.5 * 1.01);

    let frames = log.lock().unwrap();
    assert!(
        sign_match(frames.last().unwrap(), frames_bits.last().unwrap()) >= 0.99,
        "post-convergence frames must sign-match"
    );
}

// -- S4: desync mid-stream ---------------------------------------------------

#[test]
fn s4_symbol_slip_recovers() {
    let mode = TransmissionMode::ModeII;
    let params = mode.params();
    let mut rng = StdRng::seed_from_u64(5);

    let mut modulator = build_modulator(mode);
    let mut frames_bits = Vec::new();
    let mut make_frame = |rng: &mut StdRng, frames_bits: &mut Vec<Vec<bool>>| {
        let bits = random_bits(rng, params.nb_frame_bits());
        let frame = modulator.modulate_frame(&bits).unwrap();
        frames_bits.push(bits);
        frame
    };

    let mut stream = zeros(2 * params.nb_null_period);
    stream.extend(make_frame(&mut rng, &mut frames_bits));
    stream.extend(make_frame(&mut rng, &mut frames_bits));
    // One whole symbol period of dead air knocks the frame grid sideways.
    stream.extend(zeros(params.nb_symbol_period));
    stream.extend(make_frame(&mut rng, &mut frames_bits));
    stream.extend(make_frame(&mut rng, &mut frames_bits));
    stream.extend(make_frame(&mut rng, &mut frames_bits));
    stream.extend(zeros(params.nb_null_period));

    let (mut demod, log) = build_demod(mode, Some(2));
    feed(&mut demod, &stream, 4099);
    wait_for_frames(&log, 4);

    // The slip costs at most one full reset; fine time sync can absorb it
    // without one when the displaced PRS still falls inside the search
    // window.
    assert!(demod.total_frames_desync() <= 1);

    let frames = log.lock().unwrap();
    assert!(frames.len() >= 4, "receiver must relock after the slip");
    assert!(
        sign_match(frames.last().unwrap(), frames_bits.last().unwrap()) >= 0.99,
        "frames after relock must be clean"
    );
}

#[test]
fn s4_garbage_capture_resets_acquisition() {
    let mode = TransmissionMode::ModeII;
    let params = mode.params();
    let mut rng = StdRng::seed_from_u64(6);

    let mut modulator = build_modulator(mode);
    let bits1 = random_bits(&mut rng, params.nb_frame_bits());
    let bits2 = random_bits(&mut rng, params.nb_frame_bits());
    let frame1 = modulator.modulate_frame(&bits1).unwrap();

    // Noise with the same RMS as the modulated signal, so the power
    // thresholds see it as signal while the PRS correlator sees garbage.
    let body = &frame1[params.nb_null_period..];
    let rms = (body.iter().map(|v| v.norm_sqr()).sum::<f64>() / body.len() as f64).sqrt();
    let normal = Normal::new(0.0, rms / 2f64.sqrt()).unwrap();
    let noise: Vec<IQSample> = (0..4 * params.nb_symbol_period)
        .map(|_| IQSample::new(normal.sample(&mut rng), normal.sample(&mut rng)))
        .collect();

    let (mut demod, log) = build_demod(mode, Some(2));

    let mut head = zeros(2 * params.nb_null_period);
    head.extend(frame1);
    head.extend(zeros(params.nb_null_period));
    feed(&mut demod, &head, 4099);
    wait_for_frames(&log, 1);
    assert_eq!(demod.total_frames_desync(), 0);

    // Where the next PRS should be, there is only noise: the impulse peak
    // check fails and acquisition restarts with all frequency state flushed.
    feed(&mut demod, &noise, 4099);
    assert_eq!(demod.total_frames_desync(), 1);
    assert_eq!(demod.state(), DemodState::FindingNullPowerDip);
    assert_eq!(demod.coarse_freq_offset(), 0.0);
    assert_eq!(demod.fine_freq_offset(), 0.0);
    assert_eq!(demod.fine_time_offset(), 0);

    // A clean frame after the noise relocks.
    let mut tail = modulator.modulate_frame(&bits2).unwrap();
    tail.extend(zeros(params.nb_null_period));
    feed(&mut demod, &tail, 4099);
    wait_for_frames(&log, 2);

    assert_eq!(demod.total_frames_desync(), 1);
    let frames = log.lock().unwrap();
    assert!(sign_match(frames.last().unwrap(), &bits2) >= 0.99);
}

// -- S5: worker-count equivalence --------------------------------------------

#[test]
fn s5_output_identical_across_worker_counts() {
    let mode = TransmissionMode::ModeI;
    let params = mode.params();
    let mut rng = StdRng::seed_from_u64(7);

    let mut modulator = build_modulator(mode);
    let mut stream = zeros(2 * params.nb_null_period);
    for _ in 0..2 {
        let bits = random_bits(&mut rng, params.nb_frame_bits());
        stream.extend(modulator.modulate_frame(&bits).unwrap());
    }
    stream.extend(zeros(params.nb_null_period));

    let mut outputs = Vec::new();
    for workers in [1usize, 4, 8] {
        let (mut demod, log) = build_demod(mode, Some(workers));
        feed(&mut demod, &stream, 8191);
        wait_for_frames(&log, 2);
        assert_eq!(demod.total_frames_desync(), 0);
        outputs.push(log.lock().unwrap().clone());
    }

    assert_eq!(outputs[0], outputs[1], "1 vs 4 workers");
    assert_eq!(outputs[0], outputs[2], "1 vs 8 workers");
}

// -- S6: back-to-back frames --------------------------------------------------

#[test]
fn s6_back_to_back_frames_in_order() {
    let mode = TransmissionMode::ModeII;
    let params = mode.params();
    let mut rng = StdRng::seed_from_u64(8);

    let mut modulator = build_modulator(mode);
    let mut frames_bits = Vec::new();
    let mut stream = zeros(2 * params.nb_null_period);
    for _ in 0..10 {
        let bits = random_bits(&mut rng, params.nb_frame_bits());
        stream.extend(modulator.modulate_frame(&bits).unwrap());
        frames_bits.push(bits);
    }
    stream.extend(zeros(params.nb_null_period));

    let (mut demod, log) = build_demod(mode, Some(3));
    feed(&mut demod, &stream, 4099);
    wait_for_frames(&log, 10);

    assert_eq!(demod.total_frames_read(), 10);
    assert_eq!(demod.total_frames_desync(), 0);
    // Steady-state captures are exactly aligned on the pre-seeded NULL.
    assert_eq!(demod.fine_time_offset(), 0);

    let frames = log.lock().unwrap();
    assert_eq!(frames.len(), 10, "observer fires once per frame");
    for (frame, bits) in frames.iter().zip(frames_bits.iter()) {
        assert_eq!(frame.len(), params.nb_frame_bits());
        assert!(sign_match(frame, bits) >= 0.99, "frames arrive in order");
    }
}
