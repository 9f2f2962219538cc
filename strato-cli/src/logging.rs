//! Structured event logging for the decoder CLI.
//!
//! The configuration echo and per-run statistics go to stderr so stdout
//! stays clean for frame output (one line per frame, text or JSON).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Events the CLI reports on stderr.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    Config {
        sonde: String,
        sample_rate: u32,
        bits_per_sample: u16,
        channels: u16,
        iq: String,
        ecc: String,
    },
    Info {
        message: String,
    },
    Statistics {
        timestamp: DateTime<Utc>,
        frames_total: u64,
        frames_ok: u64,
        duration_secs: f64,
    },
}

pub struct StructuredLogger {
    format: LogFormat,
    started: std::time::Instant,
}

impl StructuredLogger {
    pub fn new(format: LogFormat) -> Self {
        StructuredLogger {
            format,
            started: std::time::Instant::now(),
        }
    }

    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn log(&mut self, event: LogEvent) {
        let mut err = std::io::stderr().lock();
        match self.format {
            LogFormat::Json => {
                if let Ok(line) = serde_json::to_string(&event) {
                    let _ = writeln!(err, "{}", line);
                }
            }
            LogFormat::Pretty => match &event {
                LogEvent::Config {
                    sonde,
                    sample_rate,
                    bits_per_sample,
                    channels,
                    iq,
                    ecc,
                } => {
                    let _ = writeln!(err, "sonde      : {}", sonde);
                    let _ = writeln!(err, "sample_rate: {}", sample_rate);
                    let _ = writeln!(err, "bits       : {}", bits_per_sample);
                    let _ = writeln!(err, "channels   : {}", channels);
                    let _ = writeln!(err, "input      : {}", iq);
                    let _ = writeln!(err, "ecc        : {}", ecc);
                }
                LogEvent::Info { message } => {
                    let _ = writeln!(err, "{}", message);
                }
                LogEvent::Statistics {
                    frames_total,
                    frames_ok,
                    duration_secs,
                    ..
                } => {
                    let _ = writeln!(
                        err,
                        "frames: {} ({} ok) in {:.1}s",
                        frames_total, frames_ok, duration_secs
                    );
                }
            },
        }
    }
}
