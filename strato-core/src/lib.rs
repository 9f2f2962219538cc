//! Strato core library
//!
//! Demodulation and decoding of meteorological radiosonde telemetry in
//! the 400 MHz band: FM/FSK signal processing front end, matched-filter
//! frame synchronization, forward error correction (Reed-Solomon, BCH,
//! Hamming, Viterbi, CRC variants) and per-family frame interpreters
//! producing position, time and calibrated PTU records.
//!
//! The crate is organized as a one-way pull pipeline:
//! [`source`] -> [`dsp`] -> [`framing`]/[`fec`] -> [`sonde`] -> records,
//! driven by [`pipeline::Pipeline`].

pub mod config;
pub mod dsp;
pub mod errors;
pub mod fec;
pub mod framing;
pub mod geo;
pub mod pipeline;
pub mod ptu;
pub mod sonde;
pub mod source;

pub use config::{DemodConfig, EccLevel, IqMode};
pub use errors::{Result, StratoError};
pub use pipeline::{make_decoder, Pipeline, RawHexPipeline, SoftBitPipeline};
pub use sonde::{SondeKind, SondeRecord};
