//! Error types with granular categories
//!
//! Three classes of failure flow through the pipeline: fatal setup errors
//! (bad container, unsupported sample format), recoverable per-frame errors
//! (the scanner drops the candidate and keeps running), and warnings that
//! only surface under verbose output.

use thiserror::Error;

/// Top-level error type for all pipeline operations
#[derive(Debug, Error)]
pub enum SondeError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("DSP processing error: {0}")]
    Dsp(#[from] DspError),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("ECC error: {0}")]
    Ecc(#[from] EccError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal errors from the sample source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Bad WAV header: {reason}")]
    BadWavHeader { reason: String },

    #[error("Unsupported bits per sample: {bits} (must be 8, 16 or 32)")]
    UnsupportedBitDepth { bits: u16 },

    #[error("IQ input needs 2 channels, stream has {channels}")]
    NotEnoughChannels { channels: u16 },

    #[error("Invalid raw PCM parameters: rate={rate}, bits={bits}")]
    InvalidRawParams { rate: i64, bits: i64 },

    #[error("Truncated stream while reading {context}")]
    Truncated { context: &'static str },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid sample rate: {rate} Hz (must be > 0)")]
    InvalidSampleRate { rate: u32 },

    #[error("Invalid baud rate override: {baud} (allowed within ~2% of nominal {nominal})")]
    InvalidBaudRate { baud: f32, nominal: f32 },

    #[error("Correlation threshold {threshold} outside (0, 1)")]
    InvalidThreshold { threshold: f32 },

    #[error("Low-pass bandwidth {bw_hz} Hz below minimum 1 kHz")]
    InvalidLowpassBandwidth { bw_hz: f32 },
}

/// DSP processing errors
#[derive(Debug, Error)]
pub enum DspError {
    #[error("DFT size {size} is not a power of 2")]
    InvalidDftSize { size: usize },

    #[error("Scan window K={k} plus template length L={l} exceeds DFT size {n_dft}")]
    WindowTooLarge { k: usize, l: usize, n_dft: usize },

    #[error("Filter design failed: {reason}")]
    FilterDesignFailed { reason: String },

    #[error("Decimation factor {dec_m} does not divide base rate {sr_base}")]
    NonIntegerDecimation { dec_m: u32, sr_base: u32 },
}

/// Recoverable per-frame errors; each resets the family state to Scanning
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Correlation peak at window edge")]
    PeakAtEdge,

    #[error("Header Hamming distance {errors} above limit {limit}")]
    HeaderMismatch { errors: usize, limit: usize },

    #[error("End of stream mid-frame after {bits_read} bits")]
    EofMidFrame { bits_read: usize },

    #[error("Frame checksum mismatch")]
    ChecksumMismatch,
}

/// ECC decode failures
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EccError {
    #[error("Reed-Solomon decode failed on codeword {codeword}")]
    RsUncorrectable { codeword: usize },

    #[error("Hamming block {block} uncorrectable")]
    HammingUncorrectable { block: usize },
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, SondeError>;
