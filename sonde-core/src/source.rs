//! Sample sources
//!
//! Accepts PCM audio from a `RIFF`/`RF64` WAVE container or a raw stream
//! with explicit parameters, and produces normalized `f32` samples (or
//! interleaved IQ pairs) from one selected channel. A third mode reads
//! soft bits: one IEEE-754 float per bit, sign carrying the bit value.

use crate::errors::{Result, SourceError};
use std::io::{ErrorKind, Read};

/// Stream metadata, immutable after open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    pub selected_channel: u16,
}

/// Pull source of normalized samples.
#[derive(Debug)]
pub struct PcmSource<R: Read> {
    reader: R,
    fmt: PcmFormat,
    /// Set when the 900001 Hz recorder quirk was rewritten to 900000.
    rate_fixup: bool,
}

fn read_exact_or<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    context: &'static str,
) -> std::result::Result<(), SourceError> {
    reader
        .read_exact(buf)
        .map_err(|_| SourceError::Truncated { context })
}

/// Scan the byte stream for a four-character chunk tag, one byte at a time.
/// WAVE files may carry LIST/INFO chunks of arbitrary size in between.
fn scan_for_tag<R: Read>(reader: &mut R, tag: &[u8; 4]) -> std::result::Result<(), SourceError> {
    let mut window = [0u8; 4];
    let mut filled = 0usize;
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) => {
                return Err(SourceError::BadWavHeader {
                    reason: format!("chunk {:?} not found", String::from_utf8_lossy(tag)),
                })
            }
            Ok(_) => {}
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => {
                return Err(SourceError::Truncated {
                    context: "chunk scan",
                })
            }
        }
        window.rotate_left(1);
        window[3] = byte[0];
        if filled < 4 {
            filled += 1;
        }
        if filled >= 4 && window == *tag {
            return Ok(());
        }
    }
}

impl<R: Read> PcmSource<R> {
    /// Parse a `RIFF`/`RF64` WAVE header and position the reader at the
    /// first sample of the `data` chunk.
    pub fn open_wav(mut reader: R, wanted_channel: usize) -> Result<Self> {
        let mut four = [0u8; 4];
        read_exact_or(&mut reader, &mut four, "container tag")?;
        if &four != b"RIFF" && &four != b"RF64" {
            return Err(SourceError::BadWavHeader {
                reason: "not a RIFF/RF64 container".into(),
            }
            .into());
        }
        read_exact_or(&mut reader, &mut four, "riff size")?;
        read_exact_or(&mut reader, &mut four, "wave tag")?;
        if &four != b"WAVE" {
            return Err(SourceError::BadWavHeader {
                reason: "missing WAVE tag".into(),
            }
            .into());
        }

        scan_for_tag(&mut reader, b"fmt ")?;
        let mut two = [0u8; 2];
        read_exact_or(&mut reader, &mut four, "fmt size")?;
        read_exact_or(&mut reader, &mut two, "format tag")?;
        read_exact_or(&mut reader, &mut two, "channel count")?;
        let channels = u16::from_le_bytes(two);
        read_exact_or(&mut reader, &mut four, "sample rate")?;
        let mut sample_rate = u32::from_le_bytes(four);
        read_exact_or(&mut reader, &mut four, "byte rate")?;
        read_exact_or(&mut reader, &mut two, "block align")?;
        read_exact_or(&mut reader, &mut two, "bits per sample")?;
        let bits_per_sample = u16::from_le_bytes(two);

        scan_for_tag(&mut reader, b"data")?;
        read_exact_or(&mut reader, &mut four, "data size")?;

        if !matches!(bits_per_sample, 8 | 16 | 32) {
            return Err(SourceError::UnsupportedBitDepth {
                bits: bits_per_sample,
            }
            .into());
        }
        if channels == 0 {
            return Err(SourceError::BadWavHeader {
                reason: "zero channels".into(),
            }
            .into());
        }

        // Known recorder quirk.
        let rate_fixup = sample_rate == 900_001;
        if rate_fixup {
            sample_rate = 900_000;
        }

        let selected_channel = if (wanted_channel as u16) < channels {
            wanted_channel as u16
        } else {
            0
        };

        Ok(Self {
            reader,
            fmt: PcmFormat {
                sample_rate,
                bits_per_sample,
                channels,
                selected_channel,
            },
            rate_fixup,
        })
    }

    /// Raw PCM with explicit parameters (`- <sr> <bits>`); channel count is
    /// 2 when IQ mode is active, 1 otherwise.
    pub fn raw(
        reader: R,
        sample_rate: i64,
        bits_per_sample: i64,
        channels: u16,
        wanted_channel: usize,
    ) -> Result<Self> {
        if sample_rate < 1 || !matches!(bits_per_sample, 8 | 16 | 32) {
            return Err(SourceError::InvalidRawParams {
                rate: sample_rate,
                bits: bits_per_sample,
            }
            .into());
        }
        let selected_channel = if (wanted_channel as u16) < channels {
            wanted_channel as u16
        } else {
            0
        };
        Ok(Self {
            reader,
            fmt: PcmFormat {
                sample_rate: sample_rate as u32,
                bits_per_sample: bits_per_sample as u16,
                channels,
                selected_channel,
            },
            rate_fixup: false,
        })
    }

    pub fn format(&self) -> PcmFormat {
        self.fmt
    }

    pub fn rate_fixup_applied(&self) -> bool {
        self.rate_fixup
    }

    /// Ensure the stream carries the two channels IQ mode needs.
    pub fn require_iq_channels(&self) -> Result<()> {
        if self.fmt.channels < 2 {
            return Err(SourceError::NotEnoughChannels {
                channels: self.fmt.channels,
            }
            .into());
        }
        Ok(())
    }

    fn normalize(&self, raw: [u8; 4]) -> f32 {
        match self.fmt.bits_per_sample {
            8 => (raw[0] as i16 - 128) as f32 / 128.0,
            16 => i16::from_le_bytes([raw[0], raw[1]]) as f32 / 32768.0,
            _ => f32::from_le_bytes(raw),
        }
    }

    fn read_raw_unit(&mut self) -> Result<Option<[u8; 4]>> {
        let bytes = (self.fmt.bits_per_sample / 8) as usize;
        let mut buf = [0u8; 4];
        match self.reader.read_exact(&mut buf[..bytes]) {
            Ok(()) => Ok(Some(buf)),
            Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Next normalized sample from the selected channel, or `None` at EOF.
    pub fn read_sample(&mut self) -> Result<Option<f32>> {
        let mut selected = 0.0f32;
        for ch in 0..self.fmt.channels {
            let raw = match self.read_raw_unit()? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            if ch == self.fmt.selected_channel {
                selected = self.normalize(raw);
            }
        }
        Ok(Some(selected))
    }

    /// Next interleaved IQ pair (channels 0 and 1), or `None` at EOF.
    pub fn read_iq(&mut self) -> Result<Option<(f32, f32)>> {
        let i = match self.read_raw_unit()? {
            Some(raw) => self.normalize(raw),
            None => return Ok(None),
        };
        let q = match self.read_raw_unit()? {
            Some(raw) => self.normalize(raw),
            None => return Ok(None),
        };
        Ok(Some((i, q)))
    }
}

/// Soft-bit input: one float per bit, sign encodes the bit value. The
/// magnitude is informational only and discarded here.
pub struct SoftBitSource<R: Read> {
    reader: R,
}

impl<R: Read> SoftBitSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn read_bit(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 4];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {
                let v = f32::from_le_bytes(buf);
                Ok(Some((v >= 0.0) as u8))
            }
            Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
