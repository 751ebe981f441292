//! Matched-filter templates for the sync detector
//!
//! Each family's sync preamble is rendered as the idealized FM-audio
//! waveform of its GFSK modulation: the NRZ bit sequence convolved with a
//! Gaussian pulse, three adjacent symbols contributing to every sample.
//! The kernel is L2-normalized, time-reversed, zero-padded to the DFT size
//! and transformed once at startup.

use crate::catalog::FamilySpec;
use num_complex::Complex32;
use rustfft::Fft;
use std::sync::Arc;

/// Gaussian tail probability `Q(x) = 0.5 - 0.5 erf(x / sqrt(2))`.
fn q(x: f64) -> f64 {
    0.5 - 0.5 * libm::erf(x / std::f64::consts::SQRT_2)
}

/// GFSK frequency pulse of one symbol: `Q((t-0.5)/sigma) - Q((t+0.5)/sigma)`
/// with t in symbol periods.
pub fn gauss_pulse(t: f64, sigma: f64) -> f64 {
    q((t - 0.5) / sigma) - q((t + 0.5) / sigma)
}

/// Sigma of the Gaussian pulse for a BT product.
pub fn pulse_sigma(bt: f64) -> f64 {
    (2.0f64.ln()).sqrt() / (2.0 * std::f64::consts::PI * bt)
}

/// The idealized FM waveform of a sync preamble at `samples_per_symbol`,
/// L2-normalized. Each sample collects the pulse of its own symbol and the
/// two neighbours.
pub fn matched_kernel(header: &str, samples_per_symbol: f32, bt: f32) -> Vec<f32> {
    let bits = header.as_bytes();
    let h_len = bits.len();
    let spb = samples_per_symbol as f64;
    let len = (h_len as f64 * spb + 0.5) as usize;
    let sigma = pulse_sigma(bt as f64);

    let mut kernel = vec![0.0f32; len];
    for (i, k) in kernel.iter_mut().enumerate() {
        let pos = (i as f64 / spb) as usize;
        let t = (i as f64 - pos as f64 * spb) / spb - 0.5;

        let b1 = ((bits[pos] & 1) as f64 - 0.5) * 2.0;
        let mut b = b1 * gauss_pulse(t, sigma);
        if pos > 0 {
            let b0 = ((bits[pos - 1] & 1) as f64 - 0.5) * 2.0;
            b += b0 * gauss_pulse(t + 1.0, sigma);
        }
        if pos < h_len - 1 {
            let b2 = ((bits[pos + 1] & 1) as f64 - 0.5) * 2.0;
            b += b2 * gauss_pulse(t - 1.0, sigma);
        }
        *k = b as f32;
    }

    let norm = kernel.iter().map(|&x| (x as f64).powi(2)).sum::<f64>().sqrt();
    if norm > 0.0 {
        for k in kernel.iter_mut() {
            *k = (*k as f64 / norm) as f32;
        }
    }
    kernel
}

/// Precomputed matched filter for one catalog entry.
pub struct SyncTemplate {
    /// Catalog index of the family.
    pub idx: usize,
    /// Samples per symbol at the detector rate.
    pub samples_per_symbol: f32,
    /// Kernel length L in samples.
    pub len: usize,
    /// DFT of the time-reversed kernel, length N_DFT.
    pub spectrum: Vec<Complex32>,
    pub threshold: f32,
    pub max_header_errors: usize,
}

impl SyncTemplate {
    /// Build the template at the detector sample rate. `baud_override`
    /// replaces the nominal symbol rate when within ~2%.
    pub fn build(
        spec: &FamilySpec,
        idx: usize,
        sample_rate: u32,
        n_dft: usize,
        fft: &Arc<dyn Fft<f32>>,
        threshold_override: Option<f32>,
        baud_override: Option<f32>,
    ) -> Self {
        let baud = match baud_override {
            Some(b) if (b - spec.symbol_rate as f32).abs() <= spec.symbol_rate as f32 * 0.02 => b,
            _ => spec.symbol_rate as f32,
        };
        let spb = sample_rate as f32 / baud;
        let kernel = matched_kernel(spec.header, spb, spec.bt);
        let len = kernel.len();
        debug_assert!(len + 1 < n_dft);

        // Time-reverse so the correlation peak lands at the end of the
        // template span, then transform.
        let mut buf = vec![Complex32::new(0.0, 0.0); n_dft];
        for (i, &k) in kernel.iter().enumerate() {
            buf[len - 1 - i] = Complex32::new(k, 0.0);
        }
        fft.process(&mut buf);

        Self {
            idx,
            samples_per_symbol: spb,
            len,
            spectrum: buf,
            threshold: threshold_override.unwrap_or(spec.threshold),
            max_header_errors: spec.max_header_errors,
        }
    }
}

/// DFT of a FIR filter's taps, zero-padded to the detector size; the
/// correlator applies it as a pointwise multiply in the frequency domain.
pub fn filter_spectrum(taps: &[f32], n_dft: usize, fft: &Arc<dyn Fft<f32>>) -> Vec<Complex32> {
    let mut buf = vec![Complex32::new(0.0, 0.0); n_dft];
    for (i, &t) in taps.iter().enumerate() {
        buf[i] = Complex32::new(t, 0.0);
    }
    fft.process(&mut buf);
    buf
}
