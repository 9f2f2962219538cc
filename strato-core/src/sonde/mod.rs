//! Per-family frame interpreters and the common output record.

pub mod dfm;
pub mod imet54;
pub mod lms6;
pub mod m10;
pub mod m20;
pub mod meisei;
pub mod mp3h1;
pub mod mts01;
pub mod rs41;

use serde::Serialize;

use crate::dsp::{HeaderSpec, SoftBit};
use crate::fec::Validity;

/// Supported radiosonde families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SondeKind {
    Rs41,
    Dfm,
    Lms6,
    Lms6X,
    M10,
    M20,
    Ims100,
    Rs11g,
    Imet54,
    Mp3h1,
    Mts01,
}

impl std::fmt::Display for SondeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SondeKind::Rs41 => "RS41",
            SondeKind::Dfm => "DFM",
            SondeKind::Lms6 => "LMS6",
            SondeKind::Lms6X => "LMS6X",
            SondeKind::M10 => "M10",
            SondeKind::M20 => "M20",
            SondeKind::Ims100 => "IMS100",
            SondeKind::Rs11g => "RS11G",
            SondeKind::Imet54 => "IMET54",
            SondeKind::Mp3h1 => "MRZ-H1",
            SondeKind::Mts01 => "MTS01",
        };
        f.write_str(s)
    }
}

/// Date and time of a frame; GPS or UTC per `is_utc`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct RecordTime {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub min: u32,
    pub sec: f64,
    pub is_utc: bool,
}

/// One decoded telemetry frame. Fields are `None` when their carrying
/// packet failed its check or the value failed plausibility.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SondeRecord {
    #[serde(rename = "type")]
    pub kind: Option<SondeKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime: Option<RecordTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    /// horizontal speed [m/s]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v_h: Option<f64>,
    /// heading [deg]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v_d: Option<f64>,
    /// vertical speed [m/s]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v_v: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_sv: Option<u32>,
    /// air temperature [Celsius]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// relative humidity [%]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    /// pressure [hPa]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    /// frame-level checks passed
    pub crc_ok: bool,
    /// block-code corrections applied (per codeword where applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecc_corrected: Option<u32>,
    /// GPS week for families that transmit it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub week: Option<i32>,
    /// encrypted payload (RS41-SGM): position withheld
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
    /// raw frame hex, populated when raw output is requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    /// calibration subframe hex (RS41, on request)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subframe: Option<String>,
}

impl SondeRecord {
    pub fn new(kind: SondeKind) -> Self {
        SondeRecord {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Altitude plausibility gate shared by the families.
    pub fn plausible_alt(alt: f64) -> bool {
        (-1000.0..=80000.0).contains(&alt)
    }
}

/// Context the pipeline hands to the interpreter with each frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCtx {
    /// stream time of the header hit [s]
    pub time_s: f64,
    /// correlation score of the header hit
    pub score: f32,
    /// emit raw frames
    pub raw: bool,
}

/// A sonde family's framer + interpreter.
pub trait SondeDecoder {
    fn kind(&self) -> SondeKind;

    /// Sync header and symbol geometry for the DSP layer.
    fn header_spec(&self) -> HeaderSpec;

    /// Symbol rate [Bd].
    fn baud(&self) -> f32;

    /// Data bits to slice per frame after the header.
    fn frame_bits(&self) -> usize;

    /// Consume one frame of sliced soft bits; may emit zero or more
    /// records (block-structured families buffer internally).
    fn process(&mut self, bits: &[SoftBit], ctx: &FrameCtx) -> Vec<SondeRecord>;

    /// Interpreter-only bypass for pre-decoded frames (`--rawhex`).
    fn process_bytes(&mut self, bytes: &[u8], ctx: &FrameCtx) -> Vec<SondeRecord>;
}

/// Hard bits to soft bits with unit confidence (rawbit/softin paths).
pub fn soft_from_hard(bits: &[u8]) -> Vec<SoftBit> {
    bits.iter()
        .map(|&b| SoftBit {
            hb: b & 1,
            sb: if b & 1 == 1 { 1.0 } else { -1.0 },
        })
        .collect()
}

/// Map a validity to the record `crc_ok`/`ecc_corrected` pair.
pub fn apply_validity(rec: &mut SondeRecord, v: Validity) {
    match v {
        Validity::Ok => rec.crc_ok = true,
        Validity::Recovered(n) => {
            rec.crc_ok = true;
            rec.ecc_corrected = Some(n as u32);
        }
        Validity::Failed => rec.crc_ok = false,
    }
}
