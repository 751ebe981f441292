//! Pipeline configuration
//!
//! All runtime options collapse into one immutable [`Config`] populated by
//! the CLI parser and consumed by component constructors. Hot paths never
//! consult option flags at runtime; constructors bake the choices in.

use serde::{Deserialize, Serialize};

/// Target IF rate after decimation.
pub const IF_SAMPLE_RATE: u32 = 48_000;
/// Reduced IF rate under `--min`.
pub const IF_SAMPLE_RATE_MIN: u32 = 32_000;

/// FM discriminator gain.
pub const FM_GAIN: f32 = 0.8;

/// How complex baseband input is handled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IqMode {
    /// Real audio input; no complex path.
    Off,
    /// IQ at IF rate: demodulate directly, no rotation or decimation.
    Direct { center: f64 },
    /// Baseband IQ: rotate by -center, low-pass, decimate to the IF rate.
    Baseband { center: f64 },
}

impl IqMode {
    pub fn is_iq(&self) -> bool {
        !matches!(self, IqMode::Off)
    }

    pub fn is_baseband(&self) -> bool {
        matches!(self, IqMode::Baseband { .. })
    }

    /// Normalized center frequency, clamped to [-0.5, 0.5].
    pub fn center(&self) -> f64 {
        match *self {
            IqMode::Off => 0.0,
            IqMode::Direct { center } | IqMode::Baseband { center } => center.clamp(-0.5, 0.5),
        }
    }
}

/// Raw output selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawMode {
    Off,
    /// `-r`: frame bytes as hex.
    Bytes,
    /// `-R`: raw bit stream.
    Bits,
}

/// Immutable pipeline options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Verbosity 0..=3 (`-v`, `-vv`, `-vvv`).
    pub verbosity: u8,
    /// Raw byte/bit output instead of decoded frames.
    pub raw: RawMode,
    /// Force polarity inversion of the bit stream.
    pub invert: bool,
    /// Flip polarity automatically on a sustained inverted sync.
    pub auto_polarity: bool,
    /// Complex input handling.
    pub iq: IqMode,
    /// Enable the IF (IQ) low-pass bank.
    pub lp_iq: bool,
    /// Enable the FM-audio low-pass.
    pub lp_fm: bool,
    /// Override IF low-pass bandwidth in Hz; forces a single IF stream.
    pub lp_bw_hz: Option<f32>,
    /// Decimate the FM-audio stream by 4 after demodulation.
    pub dec_fm: bool,
    /// Track the DC offset (frequency lock hint).
    pub dc: bool,
    /// Reduce the target IF rate from 48 kHz to 32 kHz.
    pub min_if: bool,
    /// Verify frame CRCs.
    pub crc: bool,
    /// Run Reed-Solomon / Hamming correction.
    pub ecc: bool,
    /// Correlation threshold override for every family.
    pub threshold: Option<f32>,
    /// Baud-rate override (validated against nominal elsewhere).
    pub baud_override: Option<f32>,
    /// Emit line-delimited JSON frames.
    pub json: bool,
    /// Frequency tag attached to JSON frames, in Hz.
    pub json_freq_hz: Option<u32>,
    /// Bit offset shift for alignment, clamped to [-4, 4].
    pub bit_offset: i8,
    /// Selected audio channel (0 = left/mono, 1 = right via `--ch2`).
    pub channel: usize,
    /// Require two header confirmations before accepting a family (`-d2`).
    pub detect_twice: bool,
    /// Keep scanning after the first detection.
    pub continuous: bool,
    /// Upper bound on processed input, in seconds of samples (`-t`).
    pub time_limit_secs: Option<f32>,
    /// De-whiten WXR-301D payloads with the PN9 sequence.
    pub pn9: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbosity: 0,
            raw: RawMode::Off,
            invert: false,
            auto_polarity: false,
            iq: IqMode::Off,
            lp_iq: false,
            lp_fm: false,
            lp_bw_hz: None,
            dec_fm: false,
            dc: false,
            min_if: false,
            crc: false,
            ecc: false,
            threshold: None,
            baud_override: None,
            json: false,
            json_freq_hz: None,
            bit_offset: 0,
            channel: 0,
            detect_twice: false,
            continuous: false,
            time_limit_secs: None,
            pn9: false,
        }
    }
}

impl Config {
    /// Target IF rate honoring `--min`.
    pub fn if_rate(&self) -> u32 {
        if self.min_if {
            IF_SAMPLE_RATE_MIN
        } else {
            IF_SAMPLE_RATE
        }
    }

    /// Bit offset with the [-4, 4] clamp applied.
    pub fn bit_offset(&self) -> i8 {
        self.bit_offset.clamp(-4, 4)
    }

    /// Detect-twice disables continuous scanning, as in the reference scanner.
    pub fn normalized(mut self) -> Self {
        if self.detect_twice {
            self.continuous = false;
        }
        self.bit_offset = self.bit_offset.clamp(-4, 4);
        if let IqMode::Direct { center } = self.iq {
            self.iq = IqMode::Direct {
                center: center.clamp(-0.5, 0.5),
            };
        }
        if let IqMode::Baseband { center } = self.iq {
            self.iq = IqMode::Baseband {
                center: center.clamp(-0.5, 0.5),
            };
        }
        self
    }
}
