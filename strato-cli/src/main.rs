mod logging;
mod output;

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use color_eyre::eyre::{eyre, Result};

use logging::{LogEvent, LogFormat, StructuredLogger};
use strato_core::pipeline::{make_decoder, Pipeline, RawHexPipeline, SoftBitPipeline};
use strato_core::source::{
    open_wav, HexFrameReader, PcmInfo, PcmReader, ScalarSource, SoftBitReader,
};
use strato_core::{DemodConfig, EccLevel, IqMode, SondeKind, SondeRecord};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SondeArg {
    Rs41,
    Dfm,
    Lms6,
    M10,
    M20,
    Ims100,
    Imet54,
    Mrz,
    Mts01,
}

impl From<SondeArg> for SondeKind {
    fn from(s: SondeArg) -> SondeKind {
        match s {
            SondeArg::Rs41 => SondeKind::Rs41,
            SondeArg::Dfm => SondeKind::Dfm,
            SondeArg::Lms6 => SondeKind::Lms6,
            SondeArg::M10 => SondeKind::M10,
            SondeArg::M20 => SondeKind::M20,
            SondeArg::Ims100 => SondeKind::Ims100,
            SondeArg::Imet54 => SondeKind::Imet54,
            SondeArg::Mrz => SondeKind::Mp3h1,
            SondeArg::Mts01 => SondeKind::Mts01,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Radiosonde telemetry decoder", long_about = None)]
struct Cli {
    /// Sonde family to decode
    #[arg(value_enum)]
    sonde: SondeArg,

    /// Input file; "-" or absent reads stdin
    file: Option<PathBuf>,

    /// Complex input, FM demodulation only
    #[arg(long = "iq0")]
    iq0: bool,
    /// Complex input, dual-tone symbol decision
    #[arg(long = "iq2")]
    iq2: bool,
    /// Like --iq2 with DC/carrier handling in the correlator
    #[arg(long = "iq3")]
    iq3: bool,
    /// High-rate baseband rotation, fraction of the sample rate
    #[arg(long = "IQ", value_name = "FQ", allow_hyphen_values = true)]
    iq_shift: Option<f64>,

    /// Enable the IF low-pass
    #[arg(long = "lpIQ")]
    lp_iq: bool,
    /// IF low-pass bandwidth [kHz]
    #[arg(long = "lpbw", value_name = "KHZ")]
    lp_bw: Option<f32>,
    /// Enable the FM audio low-pass
    #[arg(long = "lpFM")]
    lp_fm: bool,
    /// Shorthand for --lpIQ --lpFM
    #[arg(long = "lp")]
    lp: bool,

    /// DC/carrier tracking in the correlator
    #[arg(long)]
    dc: bool,

    /// Correlation threshold (0..1)
    #[arg(long, value_name = "X")]
    ths: Option<f32>,

    /// Bit-offset shift, -4..=4
    #[arg(short = 'd', value_name = "SHIFT", allow_hyphen_values = true)]
    bit_offset: Option<i32>,

    /// Invert the decision signal
    #[arg(long)]
    inv: bool,

    /// Symbol spike filter
    #[arg(long)]
    spike: bool,

    /// Block-code error correction
    #[arg(long)]
    ecc: bool,
    /// ECC with known-byte patching
    #[arg(long)]
    ecc2: bool,
    /// ECC with soft erasures and bit toggles
    #[arg(long)]
    ecc3: bool,
    /// ECC with predictive frame patching
    #[arg(long)]
    ecc4: bool,

    /// Viterbi decoding (LMS6)
    #[arg(long)]
    vit: bool,
    /// Viterbi with retry shift (LMS6)
    #[arg(long)]
    vit2: bool,

    /// PTU output
    #[arg(long)]
    ptu: bool,
    /// Advanced humidity computation
    #[arg(long)]
    ptu2: bool,

    /// Emit raw frames
    #[arg(long)]
    raw: bool,

    /// One JSON object per frame on stdout
    #[arg(long)]
    json: bool,
    /// Receiver frequency [Hz] for the JSON output
    #[arg(long = "jsn_cfq", value_name = "HZ")]
    jsn_cfq: Option<u64>,
    /// Include the RS41 calibration subframe in JSON
    #[arg(long = "jsn_subfrm1")]
    jsn_subfrm1: bool,
    /// Include the full RS41 calibration store once complete
    #[arg(long = "jsn_subfrm2")]
    jsn_subfrm2: bool,

    /// Read float32 soft symbols from stdin
    #[arg(long)]
    softin: bool,
    /// Like --softin with inverted sign
    #[arg(long)]
    softinv: bool,

    /// Read pre-decoded hex frames from stdin (interpreter only)
    #[arg(long)]
    rawhex: bool,
    /// Like --rawhex with the whitening mask applied on ingestion
    #[arg(long)]
    xorhex: bool,

    /// Headerless PCM: sample rate [Hz]
    #[arg(long, value_name = "SR")]
    sr: Option<u32>,
    /// Headerless PCM: bits per sample (8, 16, 32)
    #[arg(long, value_name = "BPS")]
    bps: Option<u16>,
    /// Headerless PCM: channel count
    #[arg(long, value_name = "CH", default_value = "1")]
    ch: u16,
    /// Select channel for multi-channel audio
    #[arg(long = "ch2")]
    ch2: bool,

    /// Use the 32 kHz minimum IF in baseband mode
    #[arg(long = "IFmin")]
    if_min: bool,
    /// Disable the baseband rotation lookup table
    #[arg(long = "nolut")]
    no_lut: bool,

    /// Reference year for two-digit year fields
    #[arg(long, value_name = "YYYY")]
    year: Option<i32>,

    /// Structured stderr logging as JSON
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn demod_config(&self) -> DemodConfig {
        let iq = if self.iq_shift.is_some() {
            IqMode::Baseband
        } else if self.iq3 {
            IqMode::IqSymDc
        } else if self.iq2 {
            IqMode::IqSym
        } else if self.iq0 {
            IqMode::IqFm
        } else {
            IqMode::Audio
        };

        let ecc = if self.ecc4 {
            EccLevel::Predictive
        } else if self.ecc3 {
            EccLevel::SoftErasures
        } else if self.ecc2 {
            EccLevel::KnownBytes
        } else if self.ecc {
            EccLevel::Standard
        } else {
            EccLevel::Off
        };

        DemodConfig {
            iq,
            baseband_shift: self.iq_shift.unwrap_or(0.0),
            dc_tracking: self.dc || self.iq3,
            lp_iq: self.lp || self.lp_iq,
            lp_iq_bw: self.lp_bw.map(|k| k * 1e3).unwrap_or(0.0),
            lp_fm: self.lp || self.lp_fm,
            lp_fm_bw: 0.0,
            threshold: self.ths.unwrap_or(0.7),
            max_header_errors: 2,
            bit_offset: self.bit_offset.unwrap_or(0),
            invert: self.inv,
            spike_filter: self.spike,
            if_min: self.if_min,
            no_lut: self.no_lut,
            ecc,
            viterbi: if self.vit2 {
                2
            } else if self.vit {
                1
            } else {
                0
            },
            raw: self.raw,
            ptu: if self.ptu2 {
                2
            } else if self.ptu {
                1
            } else {
                0
            },
            ref_year: self.year.unwrap_or(2024),
            emit_subframe: if self.jsn_subfrm2 {
                2
            } else if self.jsn_subfrm1 {
                1
            } else {
                0
            },
        }
    }

    fn open_input(&self) -> Result<Box<dyn Read>> {
        match &self.file {
            Some(p) if p.as_os_str() != "-" => Ok(Box::new(File::open(p)?)),
            _ => Ok(Box::new(io::stdin())),
        }
    }
}

fn main() -> ExitCode {
    color_eyre::install().ok();
    let args = Cli::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            // fatal configuration or allocation error
            ExitCode::from(255)
        }
    }
}

fn run(args: &Cli) -> Result<()> {
    let cfg = args.demod_config();
    let kind: SondeKind = args.sonde.into();
    let mut logger = StructuredLogger::new(if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    let mut frames_total = 0u64;
    let mut frames_ok = 0u64;
    {
        let json = args.json;
        let cfq = args.jsn_cfq;
        let mut sink = |rec: SondeRecord| {
            frames_total += 1;
            if rec.crc_ok {
                frames_ok += 1;
            }
            if json {
                if let Some(line) = output::json_line(&rec, cfq) {
                    println!("{}", line);
                }
            } else {
                println!("{}", output::text_line(&rec));
            }
        };

        if args.rawhex || args.xorhex {
            let reader: Box<dyn BufRead> = Box::new(BufReader::new(args.open_input()?));
            let mut p = RawHexPipeline::new(
                HexFrameReader::new(reader),
                make_decoder(kind, &cfg),
                cfg.clone(),
                args.xorhex,
            );
            logger.log(LogEvent::Info {
                message: format!("{}: raw hex frame input", kind),
            });
            p.run(&mut sink)?;
        } else if args.softin || args.softinv {
            let mut p = SoftBitPipeline::new(
                SoftBitReader::new(args.open_input()?, args.softinv),
                make_decoder(kind, &cfg),
                cfg.clone(),
            );
            logger.log(LogEvent::Info {
                message: format!("{}: float32 soft symbol input", kind),
            });
            p.run(&mut sink)?;
        } else {
            let decoder = make_decoder(kind, &cfg);
            let mut pipeline = if let (Some(sr), Some(bps)) = (args.sr, args.bps) {
                // headerless PCM with out-of-band parameters
                let info = PcmInfo {
                    sample_rate: sr,
                    bits_per_sample: bps,
                    channels: if cfg.iq.is_iq() { 2 } else { args.ch },
                    sel_channel: args.ch2 as u16,
                };
                let src = PcmReader::new(args.open_input()?, info)?;
                echo_config(&mut logger, kind, &cfg, ScalarSource::info(&src));
                if cfg.iq.is_iq() {
                    Pipeline::from_iq(Box::new(src), decoder, cfg.clone())?
                } else {
                    Pipeline::from_audio(Box::new(src), decoder, cfg.clone())?
                }
            } else {
                let src = open_wav(BufReader::new(args.open_input()?), args.ch2 as u16)?;
                echo_config(&mut logger, kind, &cfg, ScalarSource::info(&src));
                if cfg.iq.is_iq() {
                    if ScalarSource::info(&src).channels < 2 {
                        return Err(eyre!("IQ input needs a 2-channel stream"));
                    }
                    Pipeline::from_iq(Box::new(src), decoder, cfg.clone())?
                } else {
                    Pipeline::from_audio(Box::new(src), decoder, cfg.clone())?
                }
            };
            pipeline.run(&mut sink)?;
        }
    }

    let duration_secs = logger.elapsed();
    logger.log(LogEvent::Statistics {
        timestamp: chrono::Utc::now(),
        frames_total,
        frames_ok,
        duration_secs,
    });

    Ok(())
}

fn echo_config(logger: &mut StructuredLogger, kind: SondeKind, cfg: &DemodConfig, info: PcmInfo) {
    logger.log(LogEvent::Config {
        sonde: kind.to_string(),
        sample_rate: info.sample_rate,
        bits_per_sample: info.bits_per_sample,
        channels: info.channels,
        iq: format!("{:?}", cfg.iq),
        ecc: format!("{:?}", cfg.ecc),
    });
}
