//! Strato error types with granular categories

use thiserror::Error;

/// Top-level error type for all Strato operations
#[derive(Debug, Error)]
pub enum StratoError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("DSP processing error: {0}")]
    Dsp(#[from] DspError),

    #[error("FEC error: {0}")]
    Fec(#[from] FecError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors, fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid sample rate: {rate} Hz (must be > 0)")]
    InvalidSampleRate { rate: i64 },

    #[error("Invalid bits per sample: {bits} (must be 8, 16 or 32)")]
    InvalidBitsPerSample { bits: u16 },

    #[error("Invalid channel count: {channels} (must be 1 or 2)")]
    InvalidChannelCount { channels: u16 },

    #[error("IQ input requires 2 channels, got {channels}")]
    IqNeedsTwoChannels { channels: u16 },

    #[error("Samples per symbol too low: {sps:.2} (need >= 8 samples/symbol)")]
    SampleRateTooLow { sps: f32 },

    #[error("Baseband shift {fq} out of range (-0.5..0.5)")]
    ShiftOutOfRange { fq: f64 },

    #[error("Bit offset {ofs} out of range (-4..=4)")]
    BitOffsetOutOfRange { ofs: i32 },

    #[error("Invalid flag combination: {details}")]
    InvalidFlagCombination { details: String },
}

/// DSP processing errors
#[derive(Debug, Error)]
pub enum DspError {
    #[error("Correlation window K+L = {needed} exceeds DFT size {n}")]
    WindowExceedsDft { needed: usize, n: usize },

    #[error("Filter design failed: {reason}")]
    FilterDesignFailed { reason: String },

    #[error("Buffer underrun: requested {requested}, available {available}")]
    BufferUnderrun { requested: usize, available: usize },
}

/// Forward-error-correction failures
#[derive(Debug, Error)]
pub enum FecError {
    #[error("Reed-Solomon decode failed: {syndromes} nonzero syndromes, locator degree mismatch")]
    RsUncorrectable { syndromes: usize },

    #[error("Too many erasures: {nera} > {max}")]
    TooManyErasures { nera: usize, max: usize },

    #[error("BCH decode failed: more than {t} errors")]
    BchUncorrectable { t: usize },

    #[error("Viterbi input too short: {len} soft bits")]
    ViterbiInputTooShort { len: usize },
}

/// Frame assembly and validation errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Frame too short: {len} bytes, need {need}")]
    FrameTooShort { len: usize, need: usize },

    #[error("Invalid hex frame input: {reason}")]
    InvalidHexInput { reason: String },
}

/// Result type alias for Strato operations
pub type Result<T> = std::result::Result<T, StratoError>;
