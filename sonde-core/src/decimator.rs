//! Baseband frequency translation and decimation
//!
//! Baseband IQ is rotated by the negated center frequency through an
//! exp-LUT, low-passed with a Blackman-sinc FIR and decimated M:1 down to
//! the IF rate. The LUT length is `sr_base / d` with `d` the largest
//! divisor of the base rate not exceeding a 16 Hz window; the requested
//! frequency is nudged within that window so the rotation is exactly
//! periodic over the table.

use crate::config::IF_SAMPLE_RATE_MIN;
use crate::errors::{DspError, Result};
use crate::fir::FirFilter;
use num_complex::Complex32;
use std::f64::consts::TAU;

/// Running IQ DC estimate, subtracted from each incoming sample. The
/// averaging window starts at `sr/32` samples and doubles after each
/// completed window until it reaches one second.
#[derive(Debug, Clone)]
pub struct IqDcTracker {
    sum_x: f64,
    sum_y: f64,
    avg: Complex32,
    cnt: u32,
    maxcnt: u32,
    maxlim: u32,
}

impl IqDcTracker {
    pub fn new(sr_base: u32) -> Self {
        let maxlim = sr_base.max(32);
        Self {
            sum_x: 0.0,
            sum_y: 0.0,
            avg: Complex32::new(0.0, 0.0),
            cnt: 0,
            maxcnt: (maxlim / 32).max(1),
            maxlim,
        }
    }

    /// Subtract the current estimate and fold the raw sample into the next
    /// window.
    pub fn apply(&mut self, raw: Complex32) -> Complex32 {
        let out = raw - self.avg;
        self.sum_x += raw.re as f64;
        self.sum_y += raw.im as f64;
        self.cnt += 1;
        if self.cnt == self.maxcnt {
            self.avg = Complex32::new(
                (self.sum_x / self.maxcnt as f64) as f32,
                (self.sum_y / self.maxcnt as f64) as f32,
            );
            self.sum_x = 0.0;
            self.sum_y = 0.0;
            self.cnt = 0;
            if self.maxcnt < self.maxlim {
                self.maxcnt *= 2;
            }
        }
        out
    }

    pub fn average(&self) -> Complex32 {
        self.avg
    }
}

/// Complex rotator realized as an exp lookup table.
#[derive(Debug, Clone)]
pub struct Rotator {
    lut: Vec<Complex32>,
    idx: usize,
}

impl Rotator {
    /// Rotate by `xlt_fq` (normalized; pass the negated center frequency).
    /// The discrete frequency snaps to the nearest value representable with
    /// a table of length `sr_base / d`.
    pub fn new(sr_base: u32, xlt_fq: f64) -> Self {
        const W: i64 = 2 * 8; // 16 Hz search window

        let mut d: i64 = 1;
        for cand in (1..=W).rev() {
            if sr_base as i64 % cand == 0 {
                d = cand;
                break;
            }
        }

        let freq = (xlt_fq * sr_base as f64).round() as i64;
        let mut freq0 = freq;
        for k in 0..W / 2 {
            if (freq + k) % d == 0 {
                freq0 = freq + k;
                break;
            }
            if (freq - k) % d == 0 {
                freq0 = freq - k;
                break;
            }
        }

        let lut_len = (sr_base as i64 / d) as usize;
        let f0 = freq0 as f64 / sr_base as f64;
        let lut = (0..lut_len)
            .map(|n| {
                let t = f0 * n as f64 * TAU;
                Complex32::new(t.cos() as f32, t.sin() as f32)
            })
            .collect();

        Self { lut, idx: 0 }
    }

    pub fn lut_len(&self) -> usize {
        self.lut.len()
    }

    #[inline]
    pub fn next(&mut self, z: Complex32) -> Complex32 {
        let out = z * self.lut[self.idx];
        self.idx += 1;
        if self.idx >= self.lut.len() {
            self.idx = 0;
        }
        out
    }
}

/// Rotate, low-pass and decimate baseband IQ M:1 to the IF rate.
pub struct Decimator {
    rotator: Rotator,
    fir: FirFilter,
    delay: Vec<Complex32>,
    write: usize,
    sample: u64,
    dec_m: u32,
    if_rate: u32,
}

impl Decimator {
    /// Plan the decimation from the base rate down to `target_if`
    /// (48 kHz, 32 kHz under `--min`, or higher when a wide IF low-pass is
    /// requested). The effective IF rate is raised until it divides the
    /// base rate exactly.
    pub fn new(sr_base: u32, target_if: u32, center_fq: f64) -> Result<Self> {
        let mut if_sr = target_if.min(sr_base);
        if if_sr < sr_base {
            while sr_base % if_sr != 0 {
                if_sr += 1;
            }
        }
        let dec_m = sr_base / if_sr;

        let wide_if = if_sr > 60_000;
        let (mut f_lp, mut t_bw);
        if wide_if {
            f_lp = (if_sr as f64 + 60e3) / (4.0 * sr_base as f64);
            t_bw = if_sr as f64 - 60e3;
        } else {
            f_lp = (if_sr as f64 + 20e3) / (4.0 * sr_base as f64);
            t_bw = if_sr as f64 - 20e3;
            if if_sr <= IF_SAMPLE_RATE_MIN {
                t_bw = if_sr as f64 - 12e3;
            }
        }
        if t_bw <= 0.0 {
            t_bw = 10e3;
        }
        t_bw /= sr_base as f64;

        let mut taps = (4.0 / t_bw) as usize;
        if taps % 2 == 0 {
            taps += 1;
        }
        if f_lp >= 0.5 {
            f_lp = 0.25;
        }
        if taps > 2000 {
            return Err(DspError::FilterDesignFailed {
                reason: format!("decimation filter needs {} taps", taps),
            }
            .into());
        }

        let fir = FirFilter::lowpass(f_lp, taps);
        let taps = fir.taps();

        Ok(Self {
            rotator: Rotator::new(sr_base, -center_fq),
            fir,
            delay: vec![Complex32::new(0.0, 0.0); taps],
            write: 0,
            sample: 0,
            dec_m,
            if_rate: if_sr,
        })
    }

    pub fn dec_m(&self) -> u32 {
        self.dec_m
    }

    pub fn if_rate(&self) -> u32 {
        self.if_rate
    }

    /// Feed one baseband sample; every M-th input emits one IF sample.
    pub fn push(&mut self, z: Complex32) -> Option<Complex32> {
        let rotated = self.rotator.next(z);
        self.delay[self.write] = rotated;
        self.write += 1;
        if self.write >= self.delay.len() {
            self.write = 0;
        }
        self.sample += 1;

        if self.sample % self.dec_m as u64 == 0 {
            Some(if self.dec_m > 1 {
                self.fir.convolve_complex(&self.delay, self.write as u64)
            } else {
                rotated
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn dc_tracker_converges_on_offset() {
        let mut dc = IqDcTracker::new(4800);
        let offset = Complex32::new(0.25, -0.1);
        for _ in 0..4800 {
            dc.apply(offset);
        }
        assert_relative_eq!(dc.average().re, 0.25, epsilon = 1e-5);
        assert_relative_eq!(dc.average().im, -0.1, epsilon = 1e-5);
        // Steady state: output is the residual after subtraction.
        let out = dc.apply(offset);
        assert!(out.norm() < 1e-5);
    }

    #[test]
    fn dc_window_doubles_until_limit() {
        let mut dc = IqDcTracker::new(3200);
        assert_eq!(dc.maxcnt, 100);
        for _ in 0..100 {
            dc.apply(Complex32::new(0.0, 0.0));
        }
        assert_eq!(dc.maxcnt, 200);
    }

    #[test]
    fn rotator_lut_divides_base_rate() {
        let rot = Rotator::new(2_400_000, -0.25);
        assert_eq!(2_400_000 % rot.lut_len() as u32, 0);
        assert_eq!(rot.lut_len(), 2_400_000 / 16);
    }

    #[test]
    fn rotator_shifts_a_tone_to_dc() {
        // A tone at +fq rotated by -fq becomes DC.
        let sr = 96_000u32;
        let fq = 0.125f64;
        let mut rot = Rotator::new(sr, -fq);
        let mut acc = Complex32::new(0.0, 0.0);
        let n = 4096;
        for i in 0..n {
            let t = TAU * fq * i as f64;
            let z = Complex32::new(t.cos() as f32, t.sin() as f32);
            acc += rot.next(z);
        }
        acc /= n as f32;
        assert!(acc.norm() > 0.99, "rotated tone not at DC: {}", acc.norm());
    }

    #[test]
    fn decimation_factor_divides_exactly() {
        let dec = Decimator::new(2_400_000, 48_000, 0.0).unwrap();
        assert_eq!(dec.dec_m(), 50);
        assert_eq!(dec.if_rate(), 48_000);

        // Non-divisible target gets raised.
        let dec = Decimator::new(100_000, 48_000, 0.0).unwrap();
        assert_eq!(100_000 % dec.if_rate(), 0);
        assert!(dec.if_rate() >= 48_000);
    }

    #[test]
    fn emits_one_output_per_m_inputs() {
        let mut dec = Decimator::new(192_000, 48_000, 0.0).unwrap();
        assert_eq!(dec.dec_m(), 4);
        let mut outputs = 0;
        for _ in 0..400 {
            if dec.push(Complex32::new(1.0, 0.0)).is_some() {
                outputs += 1;
            }
        }
        assert_eq!(outputs, 100);
    }

    #[test]
    fn dc_survives_decimation_filter() {
        let mut dec = Decimator::new(192_000, 48_000, 0.0).unwrap();
        let mut last = Complex32::new(0.0, 0.0);
        for _ in 0..40_000 {
            if let Some(z) = dec.push(Complex32::new(1.0, 0.0)) {
                last = z;
            }
        }
        assert_relative_eq!(last.re, 1.0, epsilon = 1e-3);
        assert_relative_eq!(last.im, 0.0, epsilon = 1e-3);
    }
}
