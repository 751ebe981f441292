//! Non-coherent FM demodulation
//!
//! The discriminator output is `s[n] = g * arg(z[n] * conj(z[n-1])) / pi`
//! with g = 0.8. An optional FM-audio low-pass follows, and the audio
//! stream may be decimated 4:1 after demodulation (`--decFM`); the filter
//! is only evaluated on retained samples.

use crate::config::FM_GAIN;
use crate::fir::FirFilter;
use num_complex::Complex32;
use std::f32::consts::PI;

/// Discriminator state: the previous complex sample.
#[derive(Debug, Clone)]
pub struct FmDemod {
    z_prev: Complex32,
    gain: f32,
}

impl FmDemod {
    pub fn new() -> Self {
        Self {
            z_prev: Complex32::new(0.0, 0.0),
            gain: FM_GAIN,
        }
    }

    #[inline]
    pub fn demod(&mut self, z: Complex32) -> f32 {
        let w = z * self.z_prev.conj();
        self.z_prev = z;
        self.gain * w.arg() / PI
    }
}

impl Default for FmDemod {
    fn default() -> Self {
        Self::new()
    }
}

/// Post-discriminator audio stage: optional low-pass, optional 4:1
/// decimation.
pub struct FmAudioStage {
    lowpass: Option<(FirFilter, Vec<f32>)>,
    sample: u64,
    dec_fm: u32,
}

impl FmAudioStage {
    /// `bw_hz` of `None` disables the FM low-pass; `dec_fm` is 1 or 4.
    pub fn new(sample_rate: u32, bw_hz: Option<f32>, dec_fm: u32) -> Self {
        let lowpass = bw_hz.map(|bw| {
            // 2 kHz transition band, same rule as the IF filters.
            let mut taps = (4 * sample_rate / 2000) as usize;
            if taps % 2 == 0 {
                taps += 1;
            }
            let fir = FirFilter::lowpass(bw as f64 / sample_rate as f64, taps);
            let taps = fir.taps();
            (fir, vec![0.0f32; taps])
        });
        Self {
            lowpass,
            sample: 0,
            dec_fm: dec_fm.max(1),
        }
    }

    /// Taps of the FM low-pass (0 when disabled); the detector shifts peak
    /// positions back by half of this to undo the group delay.
    pub fn group_delay_taps(&self) -> usize {
        self.lowpass.as_ref().map(|(f, _)| f.taps()).unwrap_or(0)
    }

    /// Feed one demodulated sample; returns the audio sample when it is
    /// retained by the decimation schedule.
    pub fn push(&mut self, s: f32) -> Option<f32> {
        let retained = (self.sample + 1) % self.dec_fm as u64 == 0;
        let out = match self.lowpass.as_mut() {
            Some((fir, buf)) => {
                let taps = fir.taps();
                buf[(self.sample % taps as u64) as usize] = s;
                if retained {
                    Some(fir.convolve_real(buf, self.sample + 1))
                } else {
                    None
                }
            }
            None => retained.then_some(s),
        };
        self.sample += 1;
        out
    }
}
