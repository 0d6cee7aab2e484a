//! Audio Reactor
//!
//! [`AudioReactor`] turns fixed-size mono blocks into an [`AudioSnapshot`]: DC removal,
//! automatic gain control, Hann-windowed FFT, three summed bands, smoothing and onset flags.
//! [`AudioCapture`] owns the input stream on its own thread and only forwards blocks, so the
//! analysis runs on the consumer side and never inside the device callback.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::{Receiver, Sender, bounded};
use realfft::num_complex::Complex32;
use realfft::{RealFftPlanner, RealToComplex};
use tracing::{debug, error, info, trace, warn};

use crate::config::AudioConfig;
use crate::error::{Error, Result};

/// Rolling peak release per block.
pub const AGC_DECAY: f32 = 0.995;
/// Lowest rolling peak, keeps silence from being amplified into noise.
pub const AGC_FLOOR: f32 = 0.001;
const AGC_INITIAL: f32 = 0.01;
/// Fixed make-up gain applied on top of the user gain.
const MAKEUP_GAIN: f32 = 2.0;
const BAND_SMOOTHING: f32 = 0.6;
const ONSET_RATIO: f32 = 1.3;
const KICK_FLOOR: f32 = 8.0;
const SNARE_FLOOR: f32 = 5.0;
/// Band energy that maps to ~76% on the display curve.
const DISPLAY_SCALE: f32 = 30.0;

/// Band edges in bins at 44.1 kHz with 1024-sample blocks.
const REFERENCE_RATE: f32 = 44_100.0;
const REFERENCE_BLOCK: f32 = 1024.0;
const REFERENCE_EDGES: [(usize, usize); 3] = [(1, 5), (5, 45), (45, 250)];

/// Result of analysing one block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AudioSnapshot {
    /// Low band onset
    pub kick: bool,
    /// High band onset
    pub snare: bool,
    /// Mean level of the normalized signal (0-255)
    pub volume: u8,
    /// Smoothed bass, mid and high energy on a soft-saturating 0-255 scale
    pub bands: [u8; 3],
}

impl AudioSnapshot {
    pub fn bass(&self) -> u8 {
        self.bands[0]
    }

    pub fn mid(&self) -> u8 {
        self.bands[1]
    }

    pub fn high(&self) -> u8 {
        self.bands[2]
    }
}

fn display_level(energy: f32) -> u8 {
    ((energy / DISPLAY_SCALE).tanh() * 255.0).clamp(0.0, 255.0) as u8
}

/// Symmetric Hann window.
fn hann(len: usize) -> Vec<f32> {
    if len < 2 {
        return vec![1.0; len];
    }
    let denom = (len - 1) as f32;
    (0..len)
        .map(|n| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * n as f32 / denom).cos())
        .collect()
}

/// Bin ranges of the three bands for `sample_rate` and `size`, clamped to the spectrum.
fn band_bins(sample_rate: u32, size: usize) -> [Range<usize>; 3] {
    let bins = size / 2 + 1;
    let scale = (REFERENCE_RATE / REFERENCE_BLOCK) * size as f32 / sample_rate.max(1) as f32;
    REFERENCE_EDGES.map(|(lo, hi)| {
        let lo = ((lo as f32 * scale).round() as usize).clamp(1, bins);
        let hi = ((hi as f32 * scale).round() as usize).clamp(lo, bins);
        lo..hi
    })
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
    window: Vec<f32>,
    bands: [Range<usize>; 3],
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .field("bands", &self.bands)
            .finish()
    }
}

pub struct AudioReactor {
    sample_rate: u32,
    gain: f32,
    rolling_peak: f32,
    smoothed: [f32; 3],
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl fmt::Debug for AudioReactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioReactor")
            .field("sample_rate", &self.sample_rate)
            .field("gain", &self.gain)
            .field("rolling_peak", &self.rolling_peak)
            .field("smoothed", &self.smoothed)
            .field("fft", &self.fft)
            .finish()
    }
}

impl AudioReactor {
    pub fn new(sample_rate: u32, gain: f32) -> Self {
        Self {
            sample_rate,
            gain,
            rolling_peak: AGC_INITIAL,
            smoothed: [0.0; 3],
            fft_planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.max(0.0);
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn rolling_peak(&self) -> f32 {
        self.rolling_peak
    }

    /// Smoothed raw band energies before the display curve.
    pub fn band_energy(&self) -> [f32; 3] {
        self.smoothed
    }

    /// Analyses one mono block.
    pub fn process(&mut self, block: &[f32]) -> Result<AudioSnapshot> {
        if block.is_empty() {
            return Ok(AudioSnapshot::default());
        }
        let mean = block.iter().sum::<f32>() / block.len() as f32;
        let peak = block
            .iter()
            .map(|s| (s - mean).abs())
            .fold(0.0f32, f32::max);
        if peak > self.rolling_peak {
            self.rolling_peak = peak;
        } else {
            self.rolling_peak *= AGC_DECAY;
        }
        self.rolling_peak = self.rolling_peak.max(AGC_FLOOR);

        let scale = self.gain * MAKEUP_GAIN / self.rolling_peak;
        let fft = self.prepare_fft(block.len());

        let mut abs_sum = 0.0f32;
        for ((dst, src), w) in fft.input.iter_mut().zip(block).zip(&fft.window) {
            let normalized = (src - mean) * scale;
            abs_sum += normalized.abs();
            *dst = normalized * w;
        }
        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|e| Error::Audio(e.to_string()))?;

        let spectrum = &fft.spectrum;
        let raw = fft
            .bands
            .clone()
            .map(|bins| spectrum[bins].iter().map(|c| c.norm()).sum::<f32>());

        for (s, r) in self.smoothed.iter_mut().zip(raw) {
            *s = *s * BAND_SMOOTHING + r * (1.0 - BAND_SMOOTHING);
        }
        let [bass, _, high] = self.smoothed;
        let kick = bass > KICK_FLOOR && raw[0] > bass * ONSET_RATIO;
        let snare = high > SNARE_FLOOR && raw[2] > high * ONSET_RATIO;
        let volume = (abs_sum / block.len() as f32 * 255.0 * 2.0).min(255.0) as u8;

        let snapshot = AudioSnapshot {
            kick,
            snare,
            volume,
            bands: self.smoothed.map(display_level),
        };
        trace!(?snapshot, "audio block");
        Ok(snapshot)
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        if self.fft.as_ref().is_some_and(|fft| fft.size != size) {
            self.fft = None;
        }
        let planner = &mut self.fft_planner;
        let sample_rate = self.sample_rate;
        self.fft.get_or_insert_with(|| {
            let plan = planner.plan_fft_forward(size);
            debug!(size, sample_rate, "fft plan built");
            FftResources {
                size,
                scratch: plan.make_scratch_vec(),
                spectrum: plan.make_output_vec(),
                input: plan.make_input_vec(),
                plan,
                window: hann(size),
                bands: band_bins(sample_rate, size),
            }
        })
    }
}

/// Live input stream owner. The stream lives on its own thread because it cannot move
/// between threads; dropping this stops it.
pub struct AudioCapture {
    thread_stopper: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
    sample_rate: u32,
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        let _ = self.thread_stopper.send(());
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("audio capture thread panicked");
            }
        }
        info!("audio capture stopped");
    }
}

impl AudioCapture {
    /// Opens the configured input and forwards mono blocks of `block_size` samples to
    /// `blocks`. Blocks are dropped when the consumer falls behind.
    pub fn start(config: &AudioConfig, blocks: Sender<Vec<f32>>) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<u32>>(1);
        let config = config.clone();
        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || capture_thread(config, blocks, stop_rx, ready_tx))?;
        match ready_rx.recv() {
            Ok(Ok(sample_rate)) => Ok(Self {
                thread_stopper: stop_tx,
                thread_handle: Some(handle),
                sample_rate,
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(Error::Audio("capture thread exited during startup".into())),
        }
    }

    /// Rate the device actually runs at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

fn capture_thread(
    config: AudioConfig,
    blocks: Sender<Vec<f32>>,
    stop: Receiver<()>,
    ready: Sender<Result<u32>>,
) {
    let stream = match open_stream(&config, blocks) {
        Ok((stream, rate)) => {
            let _ = ready.send(Ok(rate));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = stop.recv();
    drop(stream);
}

fn open_stream(config: &AudioConfig, blocks: Sender<Vec<f32>>) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = match config.device_index {
        Some(index) => host
            .input_devices()
            .map_err(|e| Error::Audio(e.to_string()))?
            .nth(index)
            .ok_or_else(|| Error::UnknownItem {
                kind: "audio input",
                name: index.to_string(),
            })?,
        None => host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".into()))?,
    };
    let supported = device
        .default_input_config()
        .map_err(|e| Error::Audio(e.to_string()))?;
    let sample_rate = supported.sample_rate();
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    if sample_rate != config.sample_rate {
        info!(device_rate = sample_rate, configured = config.sample_rate, "analysing at device rate");
    }
    let stream_config: cpal::StreamConfig = supported.into();
    let block_size = config.block_size.max(64);

    let stream = match sample_format {
        cpal::SampleFormat::F32 => {
            build_input::<f32>(&device, &stream_config, channels, block_size, blocks)?
        }
        cpal::SampleFormat::I16 => {
            build_input::<i16>(&device, &stream_config, channels, block_size, blocks)?
        }
        cpal::SampleFormat::U16 => {
            build_input::<u16>(&device, &stream_config, channels, block_size, blocks)?
        }
        other => {
            return Err(Error::Audio(format!("unsupported sample format {other}")));
        }
    };
    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    info!(sample_rate, channels, block_size, "audio capture started");
    Ok((stream, sample_rate))
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    block_size: usize,
    blocks: Sender<Vec<f32>>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = channels.max(1);
    let mut pending: Vec<f32> = Vec::with_capacity(block_size);
    let err_fn = |err: cpal::StreamError| warn!(%err, "audio input stream error");
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels) {
                    let mixed = frame
                        .iter()
                        .fold(0.0f32, |acc, s| acc + s.to_sample::<f32>())
                        / frame.len() as f32;
                    pending.push(mixed);
                    if pending.len() == block_size {
                        let full = std::mem::replace(&mut pending, Vec::with_capacity(block_size));
                        if blocks.try_send(full).is_err() {
                            trace!("audio queue full, block dropped");
                        }
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|n| amplitude * (2.0 * std::f32::consts::PI * freq * n as f32 / 44_100.0).sin())
            .collect()
    }

    #[test]
    fn loud_block_raises_rolling_peak_immediately() {
        let mut reactor = AudioReactor::new(44_100, 1.0);
        let block = sine(440.0, 0.5, 1024);
        let mean = block.iter().sum::<f32>() / 1024.0;
        let expected = block
            .iter()
            .map(|s| (s - mean).abs())
            .fold(0.0f32, f32::max);
        reactor.process(&block).unwrap();
        assert_eq!(reactor.rolling_peak(), expected);
    }

    #[test]
    fn quiet_blocks_decay_geometrically_but_never_reach_zero() {
        let mut reactor = AudioReactor::new(44_100, 1.0);
        reactor.process(&sine(440.0, 0.8, 1024)).unwrap();
        let mut previous = reactor.rolling_peak();
        let silence = vec![0.0f32; 1024];
        for _ in 0..50 {
            reactor.process(&silence).unwrap();
            let now = reactor.rolling_peak();
            assert!((now - previous * AGC_DECAY).abs() < 1e-6);
            previous = now;
        }
        for _ in 0..5_000 {
            reactor.process(&silence).unwrap();
        }
        assert!(reactor.rolling_peak() > 0.0);
        assert_eq!(reactor.rolling_peak(), AGC_FLOOR);
    }

    #[test]
    fn silence_is_dark_and_quiet() {
        let mut reactor = AudioReactor::new(44_100, 1.0);
        let snapshot = reactor.process(&vec![0.25f32; 1024]).unwrap();
        assert_eq!(snapshot, AudioSnapshot::default());
    }

    #[test]
    fn bass_burst_after_silence_is_a_kick() {
        let mut reactor = AudioReactor::new(44_100, 1.0);
        let silence = vec![0.0f32; 1024];
        for _ in 0..4 {
            reactor.process(&silence).unwrap();
        }
        let snapshot = reactor.process(&sine(86.0, 0.3, 1024)).unwrap();
        assert!(snapshot.kick);
        assert!(!snapshot.snare);
        assert!(snapshot.bass() > 200);
        assert!(snapshot.volume > 0);
    }

    #[test]
    fn hi_hat_burst_is_a_snare() {
        let mut reactor = AudioReactor::new(44_100, 1.0);
        reactor.process(&vec![0.0f32; 1024]).unwrap();
        let snapshot = reactor.process(&sine(5_000.0, 0.3, 1024)).unwrap();
        assert!(snapshot.snare);
        assert!(!snapshot.kick);
        assert!(snapshot.high() > 200);
    }

    #[test]
    fn sustained_tone_stops_triggering() {
        let mut reactor = AudioReactor::new(44_100, 1.0);
        let tone = sine(86.0, 0.3, 1024);
        let kicks = (0..20)
            .filter(|_| reactor.process(&tone).unwrap().kick)
            .count();
        assert!(kicks < 3, "{kicks} kicks on a steady tone");
    }

    #[test]
    fn band_edges_follow_rate_and_block_size() {
        assert_eq!(band_bins(44_100, 1024), [1..5, 5..45, 45..250]);
        let [bass, _, high] = band_bins(48_000, 512);
        assert_eq!(bass.start, 1);
        assert!(high.end <= 257);
        assert_eq!(hann(4)[0], 0.0);
    }
}
