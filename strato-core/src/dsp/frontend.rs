//! High-rate baseband front end: frequency translation, decimation and
//! IQ DC removal.
//!
//! SDR captures arrive at a multiple of the designated IF rate (48 kHz,
//! or 32 kHz minimum). The band of interest is rotated to zero by a
//! complex exponential — precomputed as a lookup table whose length is
//! the base rate over the largest divisor <= 16 matching the rounded
//! translation frequency — then filtered with a Blackman-windowed sinc
//! and decimated M:1.

use num_complex::Complex32;

use super::filters;
use crate::errors::Result;
use crate::source::{IqSource, PcmInfo};

pub const IF_SAMPLE_RATE: u32 = 48000;
pub const IF_SAMPLE_RATE_MIN: u32 = 32000;

/// Exponentially-growing-window DC estimator for IQ baseband. The
/// averaging window doubles each time it fills, up to one second of
/// input, so the estimate settles quickly and then stays stable.
#[derive(Debug, Clone)]
pub struct IqDcTracker {
    sum_x: f64,
    sum_y: f64,
    avg: Complex32,
    cnt: u32,
    max_cnt: u32,
    max_lim: u32,
}

impl IqDcTracker {
    pub fn new(sample_rate: u32) -> Self {
        IqDcTracker {
            sum_x: 0.0,
            sum_y: 0.0,
            avg: Complex32::new(0.0, 0.0),
            cnt: 0,
            max_cnt: (sample_rate / 32).max(1),
            max_lim: sample_rate,
        }
    }

    pub fn offset(&self) -> Complex32 {
        self.avg
    }

    /// Track one raw sample and return it DC-corrected.
    #[inline]
    pub fn feed(&mut self, z: Complex32) -> Complex32 {
        let out = z - self.avg;
        self.sum_x += z.re as f64;
        self.sum_y += z.im as f64;
        self.cnt += 1;
        if self.cnt == self.max_cnt {
            self.avg = Complex32::new(
                (self.sum_x / self.max_cnt as f64) as f32,
                (self.sum_y / self.max_cnt as f64) as f32,
            );
            self.sum_x = 0.0;
            self.sum_y = 0.0;
            self.cnt = 0;
            if self.max_cnt < self.max_lim {
                self.max_cnt *= 2;
            }
        }
        out
    }
}

/// Pick the decimation factor and adjusted IF rate for a base rate.
pub fn choose_if_rate(sr_base: u32, if_min: bool) -> (u32, u32) {
    let mut if_sr = if if_min { IF_SAMPLE_RATE_MIN } else { IF_SAMPLE_RATE };
    if if_sr > sr_base {
        if_sr = sr_base;
    }
    let mut dec_m = 1;
    if if_sr < sr_base {
        while sr_base % if_sr != 0 {
            if_sr += 1;
        }
        dec_m = sr_base / if_sr;
    }
    (if_sr, dec_m)
}

/// Rotation table: length sr_base/d where d is the largest divisor <= 16
/// of the base rate that also divides the translation frequency after
/// nudging it by at most +-8 Hz.
fn build_lut(xlt_fq: f64, sr_base: u32) -> Vec<Complex32> {
    const W: u32 = 16;
    let freq = (xlt_fq * sr_base as f64 + 0.5).floor() as i64;

    let mut d = 1u32;
    for cand in (1..=W).rev() {
        if sr_base % cand == 0 {
            d = cand;
            break;
        }
    }

    let mut freq0 = freq;
    for k in 0..(W / 2) as i64 {
        if (freq + k) % d as i64 == 0 {
            freq0 = freq + k;
            break;
        }
        if (freq - k) % d as i64 == 0 {
            freq0 = freq - k;
            break;
        }
    }

    let lut_len = (sr_base / d) as usize;
    let f0 = freq0 as f64 / sr_base as f64;
    (0..lut_len)
        .map(|n| {
            let t = f0 * n as f64;
            let ph = 2.0 * std::f64::consts::PI * t;
            Complex32::new(ph.cos() as f32, ph.sin() as f32)
        })
        .collect()
}

/// Decimating IQ reader: wraps a base-rate source and yields IF-rate
/// samples, rotated and low-passed.
pub struct BasebandDecimator {
    src: Box<dyn IqSource>,
    dc: IqDcTracker,
    lut: Option<Vec<Complex32>>,
    xlt_fq: f64,
    sr_base: u32,
    dec_m: u32,
    taps: usize,
    ws_dec: Vec<f32>,
    xbuf: Vec<Complex32>,
    sample_base: u64,
    sample_lut: usize,
    sample_x: usize,
    info: PcmInfo,
}

impl BasebandDecimator {
    /// `xlt_fq` is the translation as a fraction of the base rate
    /// (-0.5..0.5); `no_lut` switches to per-sample exp rotation.
    pub fn new(src: Box<dyn IqSource>, xlt_fq: f64, if_min: bool, no_lut: bool) -> Result<Self> {
        let base_info = src.info();
        let sr_base = base_info.sample_rate;
        let (if_sr, dec_m) = choose_if_rate(sr_base, if_min);

        let f_lp = (if_sr as f32 + 20e3) / (4.0 * sr_base as f32);
        let mut t_bw = if if_min {
            if_sr as f64 - 12e3
        } else {
            if_sr as f64 - 20e3
        };
        if t_bw < 0.0 {
            t_bw = 10e3;
        }
        t_bw /= sr_base as f64;
        let taps = filters::taps_for_transition(t_bw);

        let ws_dec = filters::lowpass_design(f_lp, taps);
        let taps = ws_dec.len() / 2;

        let lut = if no_lut {
            None
        } else {
            Some(build_lut(xlt_fq, sr_base))
        };

        let mut info = base_info;
        info.sample_rate = if_sr;

        Ok(BasebandDecimator {
            src,
            dc: IqDcTracker::new(sr_base),
            lut,
            xlt_fq,
            sr_base,
            dec_m,
            taps,
            ws_dec,
            xbuf: vec![Complex32::new(0.0, 0.0); taps],
            sample_base: 0,
            sample_lut: 0,
            sample_x: 0,
            info,
        })
    }

    pub fn decimation(&self) -> u32 {
        self.dec_m
    }
}

impl IqSource for BasebandDecimator {
    fn next_iq(&mut self) -> Result<Option<Complex32>> {
        for _ in 0..self.dec_m {
            let Some(raw) = self.src.next_iq()? else {
                return Ok(None);
            };
            // baseband input: DC removal is mandatory
            let raw = self.dc.feed(raw);

            let z = match &self.lut {
                Some(lut) => {
                    let r = lut[self.sample_lut];
                    self.sample_lut += 1;
                    if self.sample_lut >= lut.len() {
                        self.sample_lut = 0;
                    }
                    raw * r
                }
                None => {
                    let t = self.sample_base as f64;
                    let ph = 2.0 * std::f64::consts::PI * self.xlt_fq * t;
                    raw * Complex32::new(ph.cos() as f32, ph.sin() as f32)
                }
            };
            self.sample_base += 1;

            self.xbuf[self.sample_x] = z;
            self.sample_x += 1;
            if self.sample_x >= self.taps {
                self.sample_x = 0;
            }
        }

        let out = if self.dec_m > 1 {
            // oldest sample sits at sample_x
            filters::lowpass_c(&self.xbuf, self.sample_x as u64, self.taps, &self.ws_dec)
        } else {
            self.xbuf[(self.sample_x + self.taps - 1) % self.taps]
        };
        Ok(Some(out))
    }

    fn info(&self) -> PcmInfo {
        self.info
    }
}
