//! Decoder configuration shared between the CLI surface and the core
//! pipeline.

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, Result};

/// How the input stream is demodulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IqMode {
    /// Scalar FM-discriminator audio (no IQ processing)
    #[default]
    Audio,
    /// Complex input, FM demodulation only (`--iq0`)
    IqFm,
    /// Complex input, dual-tone symbol decision (`--iq2`)
    IqSym,
    /// `--iq3`: like IqSym with DC/carrier handling in the correlator
    IqSymDc,
    /// High-rate baseband with translation and decimation (`--IQ <fq>`)
    Baseband,
}

impl IqMode {
    pub fn is_iq(self) -> bool {
        !matches!(self, IqMode::Audio)
    }

    /// Modes that slice symbols from the dual-tone DFT sums rather than
    /// the FM audio.
    pub fn symbol_decision(self) -> bool {
        matches!(self, IqMode::IqSym | IqMode::IqSymDc | IqMode::Baseband)
    }
}

/// Level of RS41-style error-correction escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum EccLevel {
    /// no FEC decode, checksum only
    #[default]
    Off,
    /// straight block decode
    Standard,
    /// + known packet headers / zero padding before retry
    KnownBytes,
    /// + erasure pairs and low-score bit toggles
    SoftErasures,
    /// + patch id, calibration slot and extrapolated frame counter
    Predictive,
}

impl EccLevel {
    pub fn enabled(self) -> bool {
        self != EccLevel::Off
    }
}

/// Demodulator configuration; defaults mirror the per-sonde binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemodConfig {
    pub iq: IqMode,
    /// baseband translation, fraction of the sample rate (-0.5..0.5)
    pub baseband_shift: f64,
    /// enable DC/carrier tracking in the correlator (`--dc`)
    pub dc_tracking: bool,
    /// IF low-pass enable (`--lpIQ`) and bandwidth [Hz] (0 = default)
    pub lp_iq: bool,
    pub lp_iq_bw: f32,
    /// FM low-pass enable (`--lpFM`) and bandwidth [Hz] (0 = default)
    pub lp_fm: bool,
    pub lp_fm_bw: f32,
    /// correlation threshold (`--ths`)
    pub threshold: f32,
    /// max header bit errors accepted
    pub max_header_errors: u32,
    /// bit-offset shift (`-d`), -4..=4
    pub bit_offset: i32,
    /// invert the decision signal
    pub invert: bool,
    /// symbol spike filter
    pub spike_filter: bool,
    /// use the minimum 32 kHz IF instead of 48 kHz in baseband mode
    pub if_min: bool,
    /// disable the rotation lookup table in baseband mode
    pub no_lut: bool,
    /// ECC escalation level
    pub ecc: EccLevel,
    /// Viterbi decoding (LMS6): 1 = on, 2 = with retry shift
    pub viterbi: u8,
    /// emit raw frames even when checks fail
    pub raw: bool,
    /// PTU output level: 0 off, 1 standard, 2 advanced humidity
    pub ptu: u8,
    /// reference year for families that transmit two-digit years
    pub ref_year: i32,
    /// RS41: emit the received calibration subframe (1) or the full
    /// calibration store once complete (2)
    pub emit_subframe: u8,
}

impl Default for DemodConfig {
    fn default() -> Self {
        DemodConfig {
            iq: IqMode::Audio,
            baseband_shift: 0.0,
            dc_tracking: false,
            lp_iq: false,
            lp_iq_bw: 0.0,
            lp_fm: false,
            lp_fm_bw: 0.0,
            threshold: 0.7,
            max_header_errors: 2,
            bit_offset: 0,
            invert: false,
            spike_filter: false,
            if_min: false,
            no_lut: false,
            ecc: EccLevel::Off,
            viterbi: 0,
            raw: false,
            ptu: 0,
            ref_year: 2024,
            emit_subframe: 0,
        }
    }
}

impl DemodConfig {
    pub fn validate(&self) -> Result<()> {
        if !(-0.5..0.5).contains(&self.baseband_shift) {
            return Err(ConfigError::ShiftOutOfRange {
                fq: self.baseband_shift,
            }
            .into());
        }
        if !(-4..=4).contains(&self.bit_offset) {
            return Err(ConfigError::BitOffsetOutOfRange {
                ofs: self.bit_offset,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DemodConfig::default().validate().unwrap();
    }

    #[test]
    fn shift_range_enforced() {
        let cfg = DemodConfig {
            baseband_shift: 0.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bit_offset_range() {
        let cfg = DemodConfig {
            bit_offset: 5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ecc_levels_order() {
        assert!(EccLevel::Predictive > EccLevel::Standard);
        assert!(!EccLevel::Off.enabled());
        assert!(EccLevel::SoftErasures.enabled());
    }
}
