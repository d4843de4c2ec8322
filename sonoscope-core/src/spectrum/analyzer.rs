//! FFT bar-spectrum extraction.
//!
//! One [`SpectrumAnalyzer`] turns a window of mono samples into `bars`
//! normalized magnitudes: Hann window → forward FFT → log-spaced band
//! reduction (50 Hz – 10 kHz, bass left) → running-peak normalization →
//! monstercat neighbor filter → per-bar attack/release envelope. Output is
//! always in `[0.0, 1.0]`.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use crate::buffering::{MAX_CAPACITY, MIN_CAPACITY};
use crate::error::{Result, SonoscopeError};
use crate::SAMPLE_RATE;

pub const DEFAULT_BARS: usize = 64;
pub const MAX_BARS: usize = 512;
/// Capture window = next power of two ≥ bars × this, clamped to the buffer's
/// supported range. Tunable, not a contract.
pub const BAR_WINDOW_MULTIPLIER: usize = 8;

const FREQ_LOW: f32 = 50.0;
const FREQ_HIGH: f32 = 10_000.0;
/// Per-frame decay of the running peak used for auto-gain.
const PEAK_DECAY: f32 = 0.997;
const PEAK_FLOOR: f32 = 1e-4;
/// Monstercat filter base: neighbors inherit `value / base^distance`.
const MONSTERCAT: f32 = 1.5;
/// Envelope blend factors toward rising / falling targets.
const ATTACK: f32 = 0.6;
const RELEASE: f32 = 0.15;

/// Sample window an analyzer with `bars` output bands wants to read.
pub fn window_for_bars(bars: usize) -> usize {
    (bars * BAR_WINDOW_MULTIPLIER)
        .next_power_of_two()
        .clamp(MIN_CAPACITY, MAX_CAPACITY)
}

pub struct SpectrumAnalyzer {
    bars: usize,
    window: usize,
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
    /// Band `k` covers FFT bins `edges[k]..edges[k + 1]`.
    edges: Vec<usize>,
    fft_buf: Vec<Complex<f32>>,
    raw: Vec<f32>,
    smoothed: Vec<f32>,
    peak: f32,
}

impl SpectrumAnalyzer {
    pub fn new(bars: usize) -> Result<Self> {
        if bars == 0 || bars > MAX_BARS {
            return Err(SonoscopeError::InvalidBarCount(bars));
        }

        let window = window_for_bars(bars);
        let fft = FftPlanner::new().plan_fft_forward(window);
        let hann = (0..window)
            .map(|i| {
                let phase = std::f32::consts::TAU * i as f32 / window as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();

        Ok(Self {
            bars,
            window,
            fft,
            hann,
            edges: band_edges(bars, window),
            fft_buf: vec![Complex::default(); window],
            raw: vec![0.0; bars],
            smoothed: vec![0.0; bars],
            peak: PEAK_FLOOR,
        })
    }

    pub fn bars(&self) -> usize {
        self.bars
    }

    /// Samples per analysis window.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Produces one frame of bar magnitudes from the newest samples.
    ///
    /// Short inputs are treated as the tail of a zero-padded window; extra
    /// leading samples are ignored.
    pub fn analyze(&mut self, samples: &[f32]) -> &[f32] {
        let take = samples.len().min(self.window);
        let pad = self.window - take;
        for (i, cell) in self.fft_buf.iter_mut().enumerate() {
            let sample = if i < pad {
                0.0
            } else {
                samples[samples.len() - take + (i - pad)]
            };
            *cell = Complex::new(sample * self.hann[i], 0.0);
        }
        self.fft.process(&mut self.fft_buf);

        let scale = 1.0 / self.window as f32;
        for k in 0..self.bars {
            let band = &self.fft_buf[self.edges[k]..self.edges[k + 1]];
            self.raw[k] = band
                .iter()
                .map(|c| c.norm() * scale)
                .fold(0.0f32, f32::max);
        }

        // Slow-decay running peak keeps quiet material visible without
        // letting loud frames pin every bar at 1.0.
        let frame_peak = self.raw.iter().fold(0.0f32, |a, &b| a.max(b));
        self.peak = (self.peak * PEAK_DECAY).max(frame_peak).max(PEAK_FLOOR);
        for value in &mut self.raw {
            *value /= self.peak;
        }

        monstercat(&mut self.raw);

        for k in 0..self.bars {
            let target = self.raw[k].clamp(0.0, 1.0);
            let rate = if target > self.smoothed[k] {
                ATTACK
            } else {
                RELEASE
            };
            self.smoothed[k] += (target - self.smoothed[k]) * rate;
            self.smoothed[k] = self.smoothed[k].clamp(0.0, 1.0);
        }

        &self.smoothed
    }
}

/// Log-spaced bin cutoffs so bars are perceptually even: cutoff k sits at
/// `low * (high/low)^(k/bars)`. Forced strictly monotonic so no band is
/// empty.
fn band_edges(bars: usize, window: usize) -> Vec<usize> {
    let bins = window / 2;
    let hz_per_bin = SAMPLE_RATE as f32 / window as f32;
    let mut edges: Vec<usize> = (0..=bars)
        .map(|k| {
            let freq = FREQ_LOW * (FREQ_HIGH / FREQ_LOW).powf(k as f32 / bars as f32);
            ((freq / hz_per_bin) as usize).min(bins)
        })
        .collect();
    for k in 1..edges.len() {
        if edges[k] <= edges[k - 1] {
            edges[k] = (edges[k - 1] + 1).min(bins);
        }
    }
    edges
}

/// Spreads each bar into its neighbors with exponential falloff, the
/// classic monstercat smoothing pass.
fn monstercat(bars: &mut [f32]) {
    for i in 0..bars.len() {
        let value = bars[i];
        for (distance, j) in (0..i).rev().enumerate() {
            let spread = value / MONSTERCAT.powi(distance as i32 + 1);
            if spread > bars[j] {
                bars[j] = spread;
            }
        }
        for (distance, j) in (i + 1..bars.len()).enumerate() {
            let spread = value / MONSTERCAT.powi(distance as i32 + 1);
            if spread > bars[j] {
                bars[j] = spread;
            }
        }
    }
}
