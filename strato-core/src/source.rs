//! Sample sources: WAV and headerless PCM ingestion, float32 soft-bit
//! streams and pre-decoded hex frames.
//!
//! All readers normalize to f32 in [-1, 1): 8-bit unsigned centers on
//! 128, 16-bit signed divides by 32768, 32-bit float passes through. For
//! two-channel IQ input channel 0 is I and channel 1 is Q.

use std::io::{self, BufRead, Read};

use hound::{SampleFormat, WavReader};
use num_complex::Complex32;

use crate::errors::{ConfigError, Result, StratoError};

/// PCM stream parameters.
#[derive(Debug, Clone, Copy)]
pub struct PcmInfo {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    /// channel to decode in scalar mode; ignored for IQ
    pub sel_channel: u16,
}

impl PcmInfo {
    pub fn validate(mut self) -> Result<Self> {
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate { rate: 0 }.into());
        }
        // work around upstream tooling that writes 900001 Hz
        if self.sample_rate == 900001 {
            self.sample_rate = 900000;
        }
        match self.bits_per_sample {
            8 | 16 | 32 => {}
            bits => return Err(ConfigError::InvalidBitsPerSample { bits }.into()),
        }
        match self.channels {
            1 | 2 => {}
            channels => return Err(ConfigError::InvalidChannelCount { channels }.into()),
        }
        if self.sel_channel >= self.channels {
            self.sel_channel = 0;
        }
        Ok(self)
    }
}

/// A source of real (FM discriminator) samples.
pub trait ScalarSource {
    /// `Ok(None)` signals clean end of stream.
    fn next_scalar(&mut self) -> Result<Option<f32>>;
    fn info(&self) -> PcmInfo;
}

/// A source of complex baseband samples.
pub trait IqSource {
    fn next_iq(&mut self) -> Result<Option<Complex32>>;
    fn info(&self) -> PcmInfo;
}

/// Raw interleaved PCM from any byte reader.
pub struct PcmReader<R> {
    inner: R,
    info: PcmInfo,
    frame: Vec<u8>,
}

impl<R: Read> PcmReader<R> {
    pub fn new(inner: R, info: PcmInfo) -> Result<Self> {
        let info = info.validate()?;
        let bytes = info.bits_per_sample as usize / 8 * info.channels as usize;
        Ok(PcmReader {
            inner,
            info,
            frame: vec![0u8; bytes],
        })
    }

    /// Read one multi-channel frame; None at EOF (also on a trailing
    /// partial frame).
    fn read_frame(&mut self) -> Result<Option<()>> {
        match self.inner.read_exact(&mut self.frame) {
            Ok(()) => Ok(Some(())),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(StratoError::Io(e)),
        }
    }

    fn decode_channel(&self, ch: usize) -> f32 {
        let bps = self.info.bits_per_sample as usize / 8;
        let at = ch * bps;
        match self.info.bits_per_sample {
            8 => (self.frame[at] as f32 - 128.0) / 128.0,
            16 => {
                let v = i16::from_le_bytes([self.frame[at], self.frame[at + 1]]);
                v as f32 / 32768.0
            }
            _ => f32::from_le_bytes([
                self.frame[at],
                self.frame[at + 1],
                self.frame[at + 2],
                self.frame[at + 3],
            ]),
        }
    }
}

impl<R: Read> ScalarSource for PcmReader<R> {
    fn next_scalar(&mut self) -> Result<Option<f32>> {
        Ok(self
            .read_frame()?
            .map(|_| self.decode_channel(self.info.sel_channel as usize)))
    }

    fn info(&self) -> PcmInfo {
        self.info
    }
}

impl<R: Read> IqSource for PcmReader<R> {
    fn next_iq(&mut self) -> Result<Option<Complex32>> {
        Ok(self
            .read_frame()?
            .map(|_| Complex32::new(self.decode_channel(0), self.decode_channel(1))))
    }

    fn info(&self) -> PcmInfo {
        self.info
    }
}

/// Open a WAV (RIFF or RF64) container and return a PCM reader over its
/// data chunk.
pub fn open_wav<R: Read>(reader: R, sel_channel: u16) -> Result<WavSource<R>> {
    let wav = WavReader::new(reader)
        .map_err(|e| StratoError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    let spec = wav.spec();
    let info = PcmInfo {
        sample_rate: spec.sample_rate,
        bits_per_sample: spec.bits_per_sample,
        channels: spec.channels,
        sel_channel,
    }
    .validate()?;
    Ok(WavSource { wav, info })
}

/// WAV-backed sample source.
pub struct WavSource<R> {
    wav: WavReader<R>,
    info: PcmInfo,
}

impl<R: Read> WavSource<R> {
    fn next_frame(&mut self) -> Result<Option<Vec<f32>>> {
        let nch = self.info.channels as usize;
        let mut out = Vec::with_capacity(nch);
        for _ in 0..nch {
            let s = match self.wav.spec().sample_format {
                SampleFormat::Float => self.wav.samples::<f32>().next().transpose(),
                SampleFormat::Int => match self.info.bits_per_sample {
                    8 => self
                        .wav
                        .samples::<i8>()
                        .next()
                        .transpose()
                        .map(|o| o.map(|v| v as f32 / 128.0)),
                    _ => self
                        .wav
                        .samples::<i16>()
                        .next()
                        .transpose()
                        .map(|o| o.map(|v| v as f32 / 32768.0)),
                },
            }
            .map_err(|e| StratoError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
            match s {
                Some(v) => out.push(v),
                None => return Ok(None),
            }
        }
        Ok(Some(out))
    }
}

impl<R: Read> ScalarSource for WavSource<R> {
    fn next_scalar(&mut self) -> Result<Option<f32>> {
        Ok(self
            .next_frame()?
            .map(|f| f[self.info.sel_channel as usize]))
    }

    fn info(&self) -> PcmInfo {
        self.info
    }
}

impl<R: Read> IqSource for WavSource<R> {
    fn next_iq(&mut self) -> Result<Option<Complex32>> {
        Ok(self.next_frame()?.map(|f| Complex32::new(f[0], f[1])))
    }

    fn info(&self) -> PcmInfo {
        self.info
    }
}

/// Float32 little-endian soft-symbol stream (`--softin`); one value per
/// symbol, sign optionally inverted on ingestion.
pub struct SoftBitReader<R> {
    inner: R,
    invert: bool,
}

impl<R: Read> SoftBitReader<R> {
    pub fn new(inner: R, invert: bool) -> Self {
        SoftBitReader { inner, invert }
    }

    pub fn next_soft(&mut self) -> Result<Option<f32>> {
        let mut buf = [0u8; 4];
        match self.inner.read_exact(&mut buf) {
            Ok(()) => {
                let mut s = f32::from_le_bytes(buf);
                if self.invert {
                    s = -s;
                }
                Ok(Some(s))
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(StratoError::Io(e)),
        }
    }
}

/// Line-oriented hex frame reader (`--rawhex`/`--xorhex`).
pub struct HexFrameReader<R> {
    inner: R,
    line: String,
}

impl<R: BufRead> HexFrameReader<R> {
    pub fn new(inner: R) -> Self {
        HexFrameReader {
            inner,
            line: String::new(),
        }
    }

    /// Next frame's bytes; empty/invalid lines are skipped.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            self.line.clear();
            let n = self.inner.read_line(&mut self.line)?;
            if n == 0 {
                return Ok(None);
            }
            if let Some(bytes) = crate::framing::hex_to_bytes(&self.line) {
                return Ok(Some(bytes));
            }
        }
    }
}
