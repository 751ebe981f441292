//! Windowed-sinc FIR low-pass filters
//!
//! Filters are designed once at pipeline init (Blackman window, odd tap
//! count, 1-norm) and applied as circular convolutions over a delay line.
//! The taps are stored twice back to back so the modular convolution never
//! branches on the wrap point.

use num_complex::Complex32;
use std::f64::consts::PI;

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// A symmetric FIR low-pass filter with duplicated taps.
#[derive(Debug, Clone)]
pub struct FirFilter {
    taps: usize,
    /// Length 2*taps: ws[taps + n] == ws[n].
    ws: Vec<f32>,
}

impl FirFilter {
    /// Blackman-windowed sinc design for normalized cutoff `cutoff`
    /// (fraction of the sample rate). An even `taps` is bumped to the next
    /// odd count; the result is normalized to unit 1-norm.
    pub fn lowpass(cutoff: f64, taps: usize) -> Self {
        let mut taps = taps.max(1);
        if taps % 2 == 0 {
            taps += 1;
        }

        let mut ws = vec![0.0f32; 2 * taps];
        let mut norm = 0.0f64;
        for n in 0..taps {
            let w = 7938.0 / 18608.0
                - 9240.0 / 18608.0 * (2.0 * PI * n as f64 / (taps - 1) as f64).cos()
                + 1430.0 / 18608.0 * (4.0 * PI * n as f64 / (taps - 1) as f64).cos();
            let h = 2.0 * cutoff * sinc(2.0 * cutoff * (n as f64 - (taps - 1) as f64 / 2.0));
            ws[n] = (w * h) as f32;
            norm += ws[n] as f64;
        }
        for n in 0..taps {
            ws[n] = (ws[n] as f64 / norm) as f32;
        }
        for n in 0..taps {
            ws[taps + n] = ws[n];
        }

        Self { taps, ws }
    }

    pub fn taps(&self) -> usize {
        self.taps
    }

    /// First copy of the tap weights.
    pub fn weights(&self) -> &[f32] {
        &self.ws[..self.taps]
    }

    pub fn norm1(&self) -> f32 {
        self.ws[..self.taps].iter().sum()
    }

    /// Circular convolution over a complex delay line. `sample` is the
    /// total number of samples written so far; the caller stores sample n
    /// at `buf[n % taps]` before invoking with `sample = n + 1`.
    pub fn convolve_complex(&self, buf: &[Complex32], sample: u64) -> Complex32 {
        debug_assert_eq!(buf.len(), self.taps);
        let s = self.taps - (sample as usize % self.taps);
        let mut acc = Complex32::new(0.0, 0.0);
        for (n, &b) in buf.iter().enumerate() {
            acc += b * self.ws[s + n];
        }
        acc
    }

    /// Circular convolution over a real delay line; same indexing contract
    /// as [`convolve_complex`](Self::convolve_complex).
    pub fn convolve_real(&self, buf: &[f32], sample: u64) -> f32 {
        debug_assert_eq!(buf.len(), self.taps);
        let s = self.taps - (sample as usize % self.taps);
        let mut acc = 0.0f32;
        for (n, &b) in buf.iter().enumerate() {
            acc += b * self.ws[s + n];
        }
        acc
    }
}

/// Tap count for a transition band `t_bw` (normalized): taps = 4 / t_bw,
/// forced odd.
pub fn taps_for_transition(t_bw: f64) -> usize {
    let mut taps = (4.0 / t_bw) as usize;
    if taps % 2 == 0 {
        taps += 1;
    }
    taps.max(1)
}
