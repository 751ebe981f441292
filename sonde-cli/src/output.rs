//! Frame and detection rendering
//!
//! Text output mirrors the reference tools: one detection line per
//! confirmed sync (`RS41: 0.7654`), frames as hex dumps with an
//! `[OK]`/`[NO]` verdict. `--json` switches to line-delimited objects.

use serde::Serialize;
use sonde_core::catalog::FamilyTag;
use sonde_core::config::{Config, RawMode};
use sonde_core::correlator::DetectionResult;
use sonde_core::dispatch::FrameRecord;

/// JSON frame envelope; telemetry fields belong to the external family
/// decoders and are omitted here.
#[derive(Debug, Serialize)]
pub struct JsonFrame<'a> {
    #[serde(rename = "type")]
    pub family: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<&'a str>,
    /// Receiver frequency tag in kHz (`--jsn_cfq`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq: Option<u32>,
    pub crc_ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rs_corrected: Option<usize>,
    pub capture_sample: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq_offset_hz: Option<f32>,
    pub raw: String,
}

/// The WXR PN9 framing reports as WXR301 with a subtype marker.
fn family_labels(tag: FamilyTag) -> (&'static str, Option<&'static str>) {
    match tag {
        FamilyTag::WxrPn9 => ("WXR301", Some("WXR_PN9")),
        other => (other.name(), None),
    }
}

pub fn print_detection(det: &DetectionResult, cfg: &Config) {
    let score = if det.inverted {
        -det.correlation_peak
    } else {
        det.correlation_peak
    };
    if cfg.verbosity > 0 {
        println!("sample: {}", det.peak_position);
    }
    match det.frequency_offset_hz {
        Some(df) if cfg.dc && cfg.iq.is_iq() => {
            println!("{}: {:.4} , {:+.1}Hz", det.family, score, df);
        }
        _ => println!("{}: {:.4}", det.family, score),
    }
}

fn verdict(frame: &FrameRecord) -> &'static str {
    match frame.crc_ok {
        Some(true) => "[OK]",
        Some(false) => "[NO]",
        None => "",
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

pub fn print_frame(frame: &FrameRecord, cfg: &Config) {
    if cfg.json {
        let (family, subtype) = family_labels(frame.family);
        let json = JsonFrame {
            family,
            subtype,
            freq: cfg.json_freq_hz.map(|hz| hz / 1000),
            crc_ok: frame.crc_ok,
            rs_corrected: frame.rs_corrected_errors,
            capture_sample: frame.capture_time_samples,
            freq_offset_hz: frame.detection.frequency_offset_hz,
            raw: hex_string(&frame.bytes),
        };
        match serde_json::to_string(&json) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("json error: {}", e),
        }
        return;
    }

    match cfg.raw {
        RawMode::Bits => {
            let bits: String = frame
                .raw_bits
                .iter()
                .map(|&b| match b {
                    0 => '0',
                    1 => '1',
                    _ => 'x',
                })
                .collect();
            println!("{}", bits);
        }
        RawMode::Bytes | RawMode::Off => {
            let mut line = String::new();
            for b in &frame.bytes {
                line.push_str(&format!("{:02X} ", b));
            }
            let mark = verdict(frame);
            if mark.is_empty() {
                println!("{}: {}", frame.family, line.trim_end());
            } else {
                println!("{}: {} # {}", frame.family, line.trim_end(), mark);
            }
            if let Some(n) = frame.rs_corrected_errors {
                if cfg.verbosity > 0 {
                    println!("# RS corrected: {}", n);
                }
            }
        }
    }
}
