//! FFT cross-correlation sync detector
//!
//! A ring of recent FM-audio samples (one stream per IF low-pass) is
//! scanned every K samples: the last K+L samples are zero-padded to the
//! DFT size, optionally de-meaned and FM-low-passed in the frequency
//! domain, multiplied with each family's conjugate template spectrum and
//! inverse-transformed. The normalized peak is a score in [-1, 1] whose
//! sign carries polarity. Peaks on the window edges are ambiguous and
//! rejected.

use crate::catalog::{FamilySpec, FamilyTag, LP_FM_BW, FAMILIES, N_TEMPLATES};
use crate::config::{Config, FM_GAIN};
use crate::errors::{DspError, Result};
use crate::fir::FirFilter;
use crate::template::{filter_spectrum, SyncTemplate};
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Number of parallel FM streams (three IF low-pass widths plus the raw
/// stream).
pub const N_STREAMS: usize = 4;

/// Detector geometry derived from the template lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorDims {
    /// DFT length, a power of two.
    pub n_dft: usize,
    /// Samples between scans.
    pub scan_k: usize,
    /// Longest template span doubled; the correlation window is K + L.
    pub l2: usize,
    /// Read-behind of the ring buffer.
    pub delay: usize,
    /// Ring length M = N_DFT + delay + margin.
    pub ring_len: usize,
}

impl DetectorDims {
    /// Size the detector for the longest template at this sample rate.
    pub fn plan(l_max: usize) -> Self {
        let l2 = 2 * l_max;
        let mut p2 = 1usize;
        while p2 < 3 * l2 {
            p2 <<= 1;
        }
        while p2 < 0x2000 {
            p2 <<= 1;
        }
        let delay = l2 / 16;
        Self {
            n_dft: p2,
            scan_k: p2 - l2,
            l2,
            delay,
            ring_len: p2 + delay + 8,
        }
    }
}

/// Ring buffer of recent FM-audio samples, one lane per IF low-pass.
pub struct FmRing {
    bufs: Vec<Vec<f32>>,
    len: usize,
    sample_in: u64,
    delay: u64,
}

impl FmRing {
    pub fn new(dims: &DetectorDims) -> Self {
        Self {
            bufs: vec![vec![0.0; dims.ring_len]; N_STREAMS],
            len: dims.ring_len,
            sample_in: 0,
            delay: dims.delay as u64,
        }
    }

    /// Write one sample into every stream lane.
    pub fn push(&mut self, s: [f32; N_STREAMS]) {
        let idx = (self.sample_in % self.len as u64) as usize;
        for (lane, &v) in self.bufs.iter_mut().zip(s.iter()) {
            lane[idx] = v;
        }
        self.sample_in += 1;
    }

    pub fn sample_in(&self) -> u64 {
        self.sample_in
    }

    /// Read index trailing the write index by the detector delay.
    pub fn sample_out(&self) -> u64 {
        self.sample_in.saturating_sub(self.delay)
    }

    #[inline]
    pub fn get(&self, stream: usize, pos: i64) -> f32 {
        self.bufs[stream][pos.rem_euclid(self.len as i64) as usize]
    }
}

/// A template whose correlation exceeded its threshold at a fresh position.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    /// Catalog index.
    pub idx: usize,
    /// Signed correlation score in [-1, 1].
    pub score: f32,
    /// Absolute sample index of the sync end.
    pub pos: u64,
    /// DC estimate of the scan window.
    pub dc: f32,
    /// Residual carrier estimate, normalized to the base rate.
    pub freq_offset: Option<f32>,
}

/// Outcome surfaced to the dispatcher for an accepted sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub family: FamilyTag,
    /// Correlation peak, absolute value.
    pub correlation_peak: f32,
    /// Absolute sample index of the peak.
    pub peak_position: u64,
    pub inverted: bool,
    /// Residual carrier offset estimate in Hz, when DC tracking is on.
    pub frequency_offset_hz: Option<f32>,
    pub dc_offset: f32,
}

/// Sequential bit reader over the ring, integrate-and-dump at the
/// template's symbol spacing.
struct BufBitReader {
    rcount: u64,
    boundary: f64,
}

impl BufBitReader {
    fn new() -> Self {
        Self {
            rcount: 0,
            boundary: 0.0,
        }
    }

    /// Read one bit (symlen 1) or one Manchester half-pair (symlen 2,
    /// returning the first symbol's value) starting at `base + rcount`.
    fn read(
        &mut self,
        ring: &FmRing,
        stream: usize,
        spb: f32,
        base: i64,
        symlen: usize,
        dc: f32,
    ) -> u8 {
        let mut sum = 0.0f64;
        self.boundary += spb as f64;
        while (self.rcount as f64) < self.boundary {
            sum += (ring.get(stream, base + self.rcount as i64) - dc) as f64;
            self.rcount += 1;
        }
        if symlen == 2 {
            self.boundary += spb as f64;
            while (self.rcount as f64) < self.boundary {
                sum -= (ring.get(stream, base + self.rcount as i64) - dc) as f64;
                self.rcount += 1;
            }
        }
        (sum >= 0.0) as u8
    }
}

/// The detector: templates, scratch buffers and per-template scan state.
pub struct Correlator {
    dims: DetectorDims,
    fft_fwd: Arc<dyn Fft<f32>>,
    fft_inv: Arc<dyn Fft<f32>>,
    templates: Vec<SyncTemplate>,
    /// FM low-pass spectra for the frequency-domain multiply (IQ mode).
    lp_fm_spectra: Option<Vec<Vec<Complex32>>>,
    lp_fm_taps: usize,
    use_dc: bool,
    iq_mode: bool,
    /// Audio path with `--lpFM`: ring lanes carry the FM low-pass variants
    /// instead of the IF bank.
    audio_lp_fm: bool,
    dec_m: u32,
    sr_base: u32,
    /// Last peak position per template; a candidate must advance past it.
    prev_pos: Vec<u64>,
    /// Window DC and frequency estimate of the latest scan, per template.
    last_dc: Vec<f32>,
    xn: Vec<f32>,
    xf: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl Correlator {
    /// Build templates for every detectable family at the detector rate
    /// and size the scan geometry from the longest one.
    pub fn new(sample_rate: u32, sr_base: u32, dec_m: u32, cfg: &Config) -> Result<Self> {
        let mut planner = FftPlanner::new();

        // First pass with a probe DFT size to learn the template lengths.
        let l_max = FAMILIES
            .iter()
            .take(N_TEMPLATES)
            .map(|spec| {
                let spb = sample_rate as f32 / spec.symbol_rate as f32;
                (spec.header.len() as f32 * spb + 0.5) as usize
            })
            .max()
            .unwrap_or(0);
        let dims = DetectorDims::plan(l_max);
        if dims.l2 + dims.scan_k > dims.n_dft {
            return Err(DspError::WindowTooLarge {
                k: dims.scan_k,
                l: dims.l2,
                n_dft: dims.n_dft,
            }
            .into());
        }

        let fft_fwd = planner.plan_fft_forward(dims.n_dft);
        let fft_inv = planner.plan_fft_inverse(dims.n_dft);

        let templates = FAMILIES
            .iter()
            .take(N_TEMPLATES)
            .enumerate()
            .map(|(idx, spec)| {
                SyncTemplate::build(
                    spec,
                    idx,
                    sample_rate,
                    dims.n_dft,
                    &fft_fwd,
                    cfg.threshold,
                    cfg.baud_override,
                )
            })
            .collect::<Vec<_>>();

        let iq_mode = cfg.iq.is_iq();
        let (lp_fm_spectra, lp_fm_taps) = if iq_mode {
            let mut taps = (4 * sample_rate / 2000) as usize;
            if taps % 2 == 0 {
                taps += 1;
            }
            let mut spectra = Vec::with_capacity(LP_FM_BW.len());
            let mut actual_taps = taps;
            for &bw in LP_FM_BW.iter() {
                let fir = FirFilter::lowpass(bw as f64 / sample_rate as f64, taps);
                actual_taps = fir.taps();
                spectra.push(filter_spectrum(fir.weights(), dims.n_dft, &fft_fwd));
            }
            (Some(spectra), actual_taps)
        } else {
            (None, 0)
        };

        let n_templates = templates.len();
        Ok(Self {
            dims,
            fft_fwd,
            fft_inv,
            templates,
            lp_fm_spectra,
            lp_fm_taps,
            use_dc: cfg.dc,
            iq_mode,
            audio_lp_fm: !iq_mode && cfg.lp_fm,
            dec_m: dec_m.max(1),
            sr_base,
            prev_pos: vec![0; n_templates],
            last_dc: vec![0.0; n_templates],
            xn: vec![0.0; dims.n_dft],
            xf: vec![Complex32::new(0.0, 0.0); dims.n_dft],
            scratch: vec![Complex32::new(0.0, 0.0); dims.n_dft],
        })
    }

    pub fn dims(&self) -> DetectorDims {
        self.dims
    }

    pub fn templates(&self) -> &[SyncTemplate] {
        &self.templates
    }

    pub fn template(&self, idx: usize) -> &SyncTemplate {
        &self.templates[idx]
    }

    /// Window DC of the latest scan for a template.
    pub fn last_dc(&self, idx: usize) -> f32 {
        self.last_dc[idx]
    }

    /// Ring lane carrying a family's stream: the IF low-pass selection in
    /// IQ mode, the FM low-pass selection on the filtered audio path.
    pub fn stream_for(&self, spec: &FamilySpec) -> usize {
        if self.audio_lp_fm {
            spec.lp_fm
        } else {
            spec.lp_iq
        }
    }

    /// Frequency-offset estimate from a window DC value, normalized to the
    /// base rate.
    pub fn freq_offset(&self, dc: f32) -> f32 {
        dc / (2.0 * FM_GAIN * self.dec_m as f32)
    }

    pub fn freq_offset_hz(&self, dc: f32) -> f32 {
        self.freq_offset(dc) * self.sr_base as f32
    }

    /// Cross-correlate one template against the current window. Returns a
    /// candidate when the peak clears the threshold at a fresh position;
    /// edge peaks and stale positions yield `None`.
    fn correlate(&mut self, ring: &FmRing, tpl_idx: usize) -> Option<Candidate> {
        let k = self.dims.scan_k;
        let l = self.templates[tpl_idx].len;
        let n = self.dims.n_dft;
        debug_assert!(k + l <= n);

        let spec = &FAMILIES[self.templates[tpl_idx].idx];
        let stream = self.stream_for(spec);
        let pos = ring.sample_out();

        let window = k + l;
        for i in 0..window {
            self.xn[i] = ring.get(stream, pos as i64 - (window as i64 - 1) + i as i64);
        }
        for x in self.xn[window..].iter_mut() {
            *x = 0.0;
        }

        let mut dc = 0.0f32;
        if self.use_dc {
            // Mean of the last 2L samples only, to dodge slow carrier drift.
            for i in k - l..k + l {
                dc += self.xn[i];
            }
            dc /= 2.0 * l as f32;
        }
        self.last_dc[tpl_idx] = dc;

        for (xf, &v) in self.xf.iter_mut().zip(self.xn.iter()) {
            *xf = Complex32::new(v, 0.0);
        }
        self.fft_fwd.process(&mut self.xf);

        if self.use_dc {
            self.xf[0] -= Complex32::new(n as f32 * dc * 0.98, 0.0);
        }

        if let Some(spectra) = &self.lp_fm_spectra {
            let ws = &spectra[spec.lp_fm];
            for (xi, wi) in self.xf.iter_mut().zip(ws.iter()) {
                *xi *= *wi;
            }
        }

        if self.use_dc || self.iq_mode {
            // The norm below must see the de-meaned, filtered window.
            self.scratch.copy_from_slice(&self.xf);
            self.fft_inv.process(&mut self.scratch);
            for (xi, ci) in self.xn.iter_mut().zip(self.scratch.iter()) {
                *xi = ci.re / n as f32;
            }
        }

        for (zi, (xi, fi)) in self
            .scratch
            .iter_mut()
            .zip(self.xf.iter().zip(self.templates[tpl_idx].spectrum.iter()))
        {
            *zi = *xi * *fi;
        }
        self.fft_inv.process(&mut self.scratch);

        let mut mx = 0.0f32;
        let mut mx2 = 0.0f32;
        let mut mp = None;
        for i in l - 1..k + l {
            let re = self.scratch[i].re;
            if re * re > mx2 {
                mx = re;
                mx2 = re * re;
                mp = Some(i);
            }
        }
        let mp = mp?;
        if mp == l - 1 || mp == k + l - 1 {
            return None; // edge of the window, ambiguous
        }

        let mut mpos = pos as i64 - (window as i64 - 1) + mp as i64;

        let mut xnorm = 0.0f64;
        for i in 0..l {
            xnorm += (self.xn[mp - i] as f64).powi(2);
        }
        let xnorm = xnorm.sqrt() as f32;
        if xnorm == 0.0 {
            return None;
        }

        let score = mx / (xnorm * n as f32);

        if self.iq_mode {
            mpos -= (self.lp_fm_taps / 2) as i64;
        }
        if mpos < 0 {
            return None;
        }
        let mpos = mpos as u64;

        let threshold = self.templates[tpl_idx].threshold;
        if score.abs() <= threshold {
            return None;
        }
        if mpos <= self.prev_pos[tpl_idx] {
            return None;
        }
        self.prev_pos[tpl_idx] = mpos;

        Some(Candidate {
            idx: tpl_idx,
            score,
            pos: mpos,
            dc,
            freq_offset: self.use_dc.then(|| self.freq_offset(dc)),
        })
    }

    /// Run one scan over every template; returns all fresh above-threshold
    /// candidates.
    pub fn scan(&mut self, ring: &FmRing) -> Vec<Candidate> {
        (0..self.templates.len())
            .filter_map(|i| self.correlate(ring, i))
            .collect()
    }

    /// Compare the header bits ending at `peak` against the template's sync
    /// pattern; returns the Hamming distance.
    pub fn header_errors(&self, ring: &FmRing, tpl_idx: usize, peak: u64, inverted: bool) -> usize {
        let tpl = &self.templates[tpl_idx];
        let spec = &FAMILIES[tpl.idx];
        let dc = if self.use_dc { self.last_dc[tpl_idx] } else { 0.0 };

        let h_len = spec.header.len();
        let base = peak as i64 + 1 - (h_len as f32 * tpl.samples_per_symbol) as i64;
        let mut reader = BufBitReader::new();
        let mut errors = 0usize;
        for expect in spec.header.bytes() {
            let mut bit = reader.read(ring, self.stream_for(spec), tpl.samples_per_symbol, base, 1, dc);
            if inverted {
                bit ^= 1;
            }
            if bit != (expect & 1) {
                errors += 1;
            }
        }
        errors
    }

    /// Read the first 16 frame bits after an M10/M20 header with the
    /// differential Manchester rule and pack them big-endian. The leading
    /// `ofs` bits are taken from the tail of the sync pattern itself.
    pub fn m10_frame_head(&self, ring: &FmRing, tpl_idx: usize, peak: u64, inverted: bool) -> u16 {
        let tpl = &self.templates[tpl_idx];
        let spec = &FAMILIES[tpl.idx];
        let dc = if self.use_dc { self.last_dc[tpl_idx] } else { 0.0 };

        let header = spec.header.as_bytes();
        let mut ofs = (header.len().saturating_sub(28)) / 2;
        if ofs > 8 {
            ofs = 0;
        }

        let inv = inverted as u8;
        let mut bit0 = inv;
        let mut reader = BufBitReader::new();
        let mut word = 0u16;
        for pos2 in 0..16 {
            let mb = if pos2 < ofs {
                (header[28 + 2 * pos2] & 1) ^ inv
            } else {
                if pos2 == ofs {
                    reader = BufBitReader::new();
                }
                reader.read(ring, self.stream_for(spec), tpl.samples_per_symbol, peak as i64, 2, dc)
            };
            let frmbit = 1 ^ (bit0 ^ mb);
            word = (word << 1) | frmbit as u16;
            bit0 = mb;
        }
        word
    }
}

/// Decide M10 vs M20 from the first frame word: frame length byte plus
/// type byte. The reference keys on the Hamming weight of the type nibble.
pub fn m10_or_m20(word: u16) -> FamilyTag {
    let h = (word & 0x0F).count_ones();
    if h < 2 || (h == 2 && (word & 0xF0) == 0x20) {
        FamilyTag::M20
    } else {
        FamilyTag::M10
    }
}

/// Refinement verdict of the iMet AFSK tone classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImetKind {
    /// 2200 Hz dominant and above the 800 Hz floor: iMet-1RS / iMet-4.
    Rs,
    /// 2400 Hz dominant: likely iMet-1AB; the candidate is dropped.
    Rejected,
}

/// Accumulated DFT magnitude spectrum over one second of FM audio,
/// following an iMet AFSK preamble hit. The 800/2200/2400 Hz comparison is
/// an empirical heuristic.
pub struct ImetToneClassifier {
    fft: Arc<dyn Fft<f32>>,
    n_dft: usize,
    chunk: usize,
    xn: Vec<f32>,
    db: Vec<f32>,
    n: usize,
    target: usize,
}

impl ImetToneClassifier {
    pub fn new(n_dft: usize, sample_rate: u32) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            fft: planner.plan_fft_forward(n_dft),
            n_dft,
            chunk: n_dft / 2 - 3,
            xn: vec![0.0; n_dft],
            db: vec![0.0; n_dft],
            n: 0,
            target: sample_rate as usize,
        }
    }

    /// Feed one FM sample; returns true once a full second is accumulated.
    pub fn push(&mut self, s: f32) -> bool {
        self.xn[self.n % self.chunk] = s;
        self.n += 1;
        if self.n % self.chunk == 0 {
            let mut buf: Vec<Complex32> = self
                .xn
                .iter()
                .map(|&v| Complex32::new(v, 0.0))
                .collect();
            self.fft.process(&mut buf);
            for (d, b) in self.db.iter_mut().zip(buf.iter()) {
                *d += b.norm();
            }
        }
        self.n >= self.target
    }

    fn band_power(&self, sample_rate: u32, freq: f32, m: usize) -> f32 {
        let bin = (freq * self.n_dft as f32 / sample_rate as f32) as usize;
        let start = bin.saturating_sub(m / 4);
        self.db[start..(start + m).min(self.db.len())].iter().sum()
    }

    /// Compare tone power around 2200 Hz and 2400 Hz, then against the
    /// 800 Hz noise floor.
    pub fn classify(&self, sample_rate: u32) -> ImetKind {
        let df = sample_rate as f32 / self.n_dft as f32;
        let m = ((50.0 / df) as usize).max(1);
        if (2500.0 * self.n_dft as f32 / sample_rate as f32) as usize > self.n_dft / 2 {
            return ImetKind::Rejected;
        }

        let pow2200 = self.band_power(sample_rate, 2200.0, m);
        let pow2400 = self.band_power(sample_rate, 2400.0, m);
        if pow2200 > pow2400 {
            let pow800 = self.band_power(sample_rate, 800.0, m);
            if pow2200 > pow800 {
                return ImetKind::Rs;
            }
        }
        ImetKind::Rejected
    }
}
