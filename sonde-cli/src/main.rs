mod logging;
mod output;

use clap::{ArgAction, Parser};
use color_eyre::eyre::eyre;
use logging::StderrLogger;
use sonde_core::config::{Config, IqMode, RawMode};
use sonde_core::pipeline::{Pipeline, PipelineEvent, SoftBitPipeline};
use sonde_core::source::{PcmSource, SoftBitSource};
use std::fs::File;
use std::io::{BufReader, Read};

/// Auto-detecting radiosonde telemetry decoder.
///
/// Reads a WAVE file (or raw PCM / IQ from stdin with `- <sr> <bits>`),
/// scans for the sync preambles of the supported sonde families and emits
/// detections and assembled frames.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity (-v info, -vv aux, -vvv config dump)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Emit raw frame bytes instead of decoded output
    #[arg(short = 'r', long = "raw")]
    raw_bytes: bool,

    /// Emit the raw bit stream
    #[arg(short = 'R')]
    raw_bits: bool,

    /// Force polarity inversion of the bit stream
    #[arg(short = 'i', long = "invert")]
    invert: bool,

    /// Flip polarity automatically on a sustained inverted sync
    #[arg(long = "auto")]
    auto: bool,

    /// IQ input at IF rate, normalized center frequency
    #[arg(long = "iq", value_name = "fq", allow_hyphen_values = true)]
    iq: Option<f64>,

    /// Baseband IQ: rotate, low-pass and decimate to the IF rate
    #[arg(long = "IQ", value_name = "fq", allow_hyphen_values = true)]
    iq_baseband: Option<f64>,

    /// Enable the IF low-pass bank
    #[arg(long = "lpIQ")]
    lp_iq: bool,

    /// Enable the FM-audio low-pass
    #[arg(long = "lpFM")]
    lp_fm: bool,

    /// IF low-pass bandwidth in kHz (forces a single IF stream)
    #[arg(long = "lpbw", value_name = "kHz")]
    lp_bw_khz: Option<f32>,

    /// Decimate the FM-audio stream by 4 after demodulation
    #[arg(long = "decFM")]
    dec_fm: bool,

    /// Track the DC offset (frequency lock hint)
    #[arg(long = "dc")]
    dc: bool,

    /// Reduce the target IF rate from 48 kHz to 32 kHz
    #[arg(long = "min")]
    min: bool,

    /// Verify frame CRCs
    #[arg(long = "crc")]
    crc: bool,

    /// Enable Reed-Solomon / Hamming error correction
    #[arg(long = "ecc")]
    ecc: bool,

    /// Correlation threshold override
    #[arg(long = "ths", value_name = "f")]
    threshold: Option<f32>,

    /// Baud-rate override (within ~2% of nominal)
    #[arg(long = "br", value_name = "baud")]
    baud: Option<f32>,

    /// Emit line-delimited JSON frames
    #[arg(long = "json")]
    json: bool,

    /// Attach a receiver frequency tag to JSON frames, in Hz
    #[arg(long = "jsn_cfq", value_name = "Hz")]
    json_freq_hz: Option<u32>,

    /// Bit offset shift for alignment, clamped to [-4, 4]
    #[arg(short = 'd', value_name = "n", allow_hyphen_values = true)]
    bit_offset: Option<i8>,

    /// Select the right audio channel
    #[arg(long = "ch2")]
    ch2: bool,

    /// Require two confirmed headers before accepting a family
    #[arg(long = "d2")]
    detect_twice: bool,

    /// Keep scanning after the first detection
    #[arg(short = 'c', long = "cnt")]
    continuous: bool,

    /// Stop after this many seconds of samples
    #[arg(short = 't', long = "time", value_name = "seconds")]
    time_limit: Option<f32>,

    /// De-whiten WXR-301D payloads with the PN9 sequence
    #[arg(long = "pn9")]
    pn9: bool,

    /// Read soft bits (one IEEE-754 float per bit) instead of PCM samples
    #[arg(long = "softin")]
    softin: bool,

    /// Input file, or `- <sample_rate> <bits_sample>` for raw PCM on stdin
    #[arg(value_name = "audio.wav", trailing_var_arg = true, allow_hyphen_values = true)]
    inputs: Vec<String>,
}

impl Cli {
    fn to_config(&self) -> Config {
        let iq = if let Some(fq) = self.iq_baseband {
            IqMode::Baseband { center: fq }
        } else if let Some(fq) = self.iq {
            IqMode::Direct { center: fq }
        } else {
            IqMode::Off
        };
        Config {
            verbosity: self.verbose,
            raw: if self.raw_bits {
                RawMode::Bits
            } else if self.raw_bytes {
                RawMode::Bytes
            } else {
                RawMode::Off
            },
            invert: self.invert,
            auto_polarity: self.auto,
            iq,
            lp_iq: self.lp_iq,
            lp_fm: self.lp_fm,
            lp_bw_hz: self.lp_bw_khz.filter(|&khz| khz >= 1.0).map(|khz| khz * 1e3),
            dec_fm: self.dec_fm,
            dc: self.dc,
            min_if: self.min,
            crc: self.crc,
            ecc: self.ecc,
            threshold: self.threshold,
            baud_override: self.baud,
            json: self.json,
            json_freq_hz: self.json_freq_hz,
            bit_offset: self.bit_offset.unwrap_or(0),
            channel: if self.ch2 { 1 } else { 0 },
            detect_twice: self.detect_twice,
            continuous: self.continuous,
            time_limit_secs: self.time_limit,
            pn9: self.pn9,
        }
        .normalized()
    }
}

fn open_source(cli: &Cli, cfg: &Config) -> color_eyre::Result<PcmSource<Box<dyn Read>>> {
    let channel = cfg.channel;
    match cli.inputs.first().map(String::as_str) {
        Some("-") => {
            // Raw PCM: `- <sample_rate> <bits_sample>`.
            let rate: i64 = cli
                .inputs
                .get(1)
                .ok_or_else(|| eyre!("- <sr> <bs>"))?
                .parse()?;
            let bits: i64 = cli
                .inputs
                .get(2)
                .ok_or_else(|| eyre!("- <sr> <bs>"))?
                .parse()?;
            let channels = if cfg.iq.is_iq() { 2 } else { 1 };
            let reader: Box<dyn Read> = Box::new(BufReader::new(std::io::stdin()));
            Ok(PcmSource::raw(reader, rate, bits, channels, channel)?)
        }
        Some(path) => {
            let reader: Box<dyn Read> = Box::new(BufReader::new(File::open(path)?));
            Ok(PcmSource::open_wav(reader, channel)?)
        }
        None => {
            let reader: Box<dyn Read> = Box::new(BufReader::new(std::io::stdin()));
            Ok(PcmSource::open_wav(reader, channel)?)
        }
    }
}

fn run_softbit(cli: &Cli, cfg: &Config, logger: &StderrLogger) -> color_eyre::Result<i32> {
    let reader: Box<dyn Read> = match cli.inputs.first().map(String::as_str) {
        Some("-") | None => Box::new(BufReader::new(std::io::stdin())),
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
    };
    let mut pipeline = SoftBitPipeline::new(SoftBitSource::new(reader), cfg.clone());

    loop {
        let event = match pipeline.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => {
                logger.drain(pipeline.log_mut());
                return Err(e.into());
            }
        };
        logger.drain(pipeline.log_mut());

        match event {
            PipelineEvent::Detection(det) => {
                if !cfg.json {
                    output::print_detection(&det, cfg);
                }
                if !cfg.continuous && !pipeline.has_pending_frame() {
                    break;
                }
            }
            PipelineEvent::Frame(frame) => {
                output::print_frame(&frame, cfg);
                if !cfg.continuous {
                    break;
                }
            }
        }
    }
    logger.drain(pipeline.log_mut());

    Ok(pipeline.exit_code())
}

fn run() -> color_eyre::Result<i32> {
    let cli = Cli::parse();
    let cfg = cli.to_config();
    let logger = StderrLogger::new(cfg.verbosity);

    if cfg.verbosity >= 3 {
        eprintln!("config: {:?}", cfg);
    }

    if cli.softin {
        return run_softbit(&cli, &cfg, &logger);
    }

    let source = open_source(&cli, &cfg)?;
    let fmt = source.format();
    if cfg.verbosity >= 1 {
        eprintln!("sample_rate: {}", fmt.sample_rate);
        eprintln!("bits       : {}", fmt.bits_per_sample);
        eprintln!("channels   : {}", fmt.channels);
    }

    let mut pipeline = Pipeline::new(source, cfg.clone())?;

    loop {
        let event = match pipeline.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => {
                logger.drain(pipeline.log_mut());
                return Err(e.into());
            }
        };
        logger.drain(pipeline.log_mut());

        match event {
            PipelineEvent::Detection(det) => {
                if !cfg.json {
                    output::print_detection(&det, &cfg);
                }
                // The frame for this detection comes on the next pull;
                // detection-only families stop here unless scanning
                // continuously.
                if !cfg.continuous && !pipeline.has_pending_frame() {
                    break;
                }
            }
            PipelineEvent::Frame(frame) => {
                output::print_frame(&frame, &cfg);
                if !cfg.continuous {
                    break;
                }
            }
        }
    }
    logger.drain(pipeline.log_mut());

    Ok(pipeline.exit_code())
}

fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("error: {}", e);
        std::process::exit(-1);
    }
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(-1);
        }
    }
}
