//! Radiosonde decoder core
//!
//! The shared signal-processing and framing pipeline behind the per-family
//! telemetry decoders: sample sources (WAV / raw PCM / IQ baseband),
//! frequency translation and decimation, FM discrimination, symbol
//! recovery, FFT matched-filter sync detection across seventeen sonde
//! families, frame assembly with the per-family block codecs, and the
//! Reed-Solomon / CRC integrity layer. Family telemetry decoding itself is
//! an external concern reached through the dispatch seam.

pub mod assembler;
pub mod bits;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod correlator;
pub mod decimator;
pub mod demod;
pub mod dispatch;
pub mod errors;
pub mod fir;
pub mod hamming;
pub mod logging;
pub mod pipeline;
pub mod rs;
pub mod source;
pub mod template;

pub use catalog::{FamilyTag, FAMILIES};
pub use config::{Config, IqMode, RawMode};
pub use correlator::DetectionResult;
pub use dispatch::{Dispatcher, FamilyDecoder, FrameRecord};
pub use errors::{Result, SondeError};
pub use pipeline::{Pipeline, PipelineEvent, ScanState, SoftBitPipeline};
pub use source::{PcmSource, SoftBitSource};
