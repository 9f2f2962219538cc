//! Central demodulator state: sample ring buffers, matched-filter
//! prototype, FFT scratch, low-pass chains and carrier bookkeeping.
//!
//! Buffer sizing is fixed at construction: L = header length in samples,
//! M = ring size (power of two >= 3L, at least 0x2000), K = correlation
//! stride, delay = L/16. After every processed sample
//! `sample_out == sample_in - delay`.

use num_complex::{Complex32, Complex64};
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use super::filters::{self, FirC, FirR};
use super::FM_GAIN;
use crate::config::{DemodConfig, IqMode};
use crate::errors::{ConfigError, Result};
use crate::source::{IqSource, ScalarSource};

const IF_TRANSITION_BW: f32 = 4e3;
const FM_TRANSITION_BW: f32 = 2e3;

/// Expected sync header of a sonde family.
#[derive(Debug, Clone)]
pub struct HeaderSpec {
    /// header bits, one per transmitted symbol
    pub bits: Vec<u8>,
    /// symbols per data bit for the payload (1 = FSK, 2 = Manchester)
    pub symlen: u8,
    /// symbols per header bit (M10 uses 1 while the payload uses 2)
    pub symhd: u8,
    /// Gaussian pulse bandwidth-time product (ISI model)
    pub bt: f32,
    /// FSK modulation index
    pub h: f32,
}

impl HeaderSpec {
    pub fn from_str(hdr: &str, symlen: u8, symhd: u8, bt: f32, h: f32) -> Self {
        HeaderSpec {
            bits: hdr.bytes().map(|b| b & 1).collect(),
            symlen,
            symhd,
            bt,
            h,
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

/// Input feed: scalar discriminator audio or complex baseband.
pub enum SampleFeed {
    Audio(Box<dyn ScalarSource>),
    Iq(Box<dyn IqSource>),
}

/// FFT scratch shared by the correlator passes.
pub(crate) struct DftScratch {
    pub n: usize,
    pub fwd: Arc<dyn Fft<f32>>,
    pub inv: Arc<dyn Fft<f32>>,
    /// matched-filter spectrum, FFT of the time-reversed header prototype
    pub fm: Vec<Complex32>,
    /// real input window (K+L samples, zero-padded)
    pub xn: Vec<f32>,
    pub x: Vec<Complex32>,
    pub z: Vec<Complex32>,
    pub cx: Vec<Complex32>,
}

/// Demodulator state; one per decode run.
pub struct DspState {
    pub(crate) feed: SampleFeed,
    pub cfg: DemodConfig,

    pub sr: u32,
    pub sps: f32,
    pub baud: f32,

    pub(crate) hdr: HeaderSpec,

    pub(crate) sample_in: u64,
    pub(crate) sample_out: u64,
    pub(crate) delay: u64,
    /// slicer sample counter within the current frame
    pub(crate) sc: u64,
    /// samples already pulled past the reported header position
    pub(crate) buffered: i64,

    pub(crate) l: usize,
    pub(crate) m: usize,
    pub(crate) k: usize,

    /// decision-signal ring buffer (size M)
    pub(crate) bufs: Vec<f32>,
    /// FM-discriminator ring buffer (size M), correlator alternate input
    pub(crate) fm_buffer: Vec<f32>,
    /// pulse-shaped header prototype (L samples, unit L2 norm)
    pub(crate) match_proto: Vec<f32>,

    /// rolling mean / mean-square over Nvar samples
    pub(crate) nvar: usize,
    pub(crate) xsum: f32,
    pub(crate) qsum: f32,
    pub(crate) xs: Vec<f32>,
    pub(crate) qs: Vec<f32>,

    // correlation results
    pub(crate) mv: f32,
    pub(crate) mv_pos: u64,
    pub(crate) mv2: f32,
    pub(crate) mv2_pos: u64,
    pub(crate) dc: f32,
    /// residual carrier offset estimate [Hz]
    pub(crate) ddf: f64,
    /// accumulated carrier correction [Hz]
    pub(crate) df: f64,

    // IQ path
    pub(crate) n_iqbuf: usize,
    pub(crate) rot_iqbuf: Vec<Complex32>,
    pub(crate) f1sum: Complex64,
    pub(crate) f2sum: Complex64,
    /// dual-tone frequencies [Hz]: f1 = -h*sr/(2*sps), f2 = -f1
    pub(crate) f1: f64,
    pub(crate) f2: f64,

    // low-pass chains
    pub(crate) lp_iq: Option<IqLowpass>,
    pub(crate) lp_fm: Option<FmLowpass>,
    pub(crate) locked: bool,

    pub(crate) dft: DftScratch,
    /// header re-slice scratch
    pub(crate) rawbits: Vec<u8>,
}

pub(crate) struct IqLowpass {
    pub taps: usize,
    /// acquisition table (1.5x bandwidth)
    pub ws_acq: Vec<f32>,
    /// locked table
    pub ws_locked: Vec<f32>,
    pub fir: FirC,
}

pub(crate) struct FmLowpass {
    pub taps: usize,
    pub ws: Vec<f32>,
    pub fir: FirR,
}

/// Gaussian FM pulse: Q((t-1/2)/sigma) - Q((t+1/2)/sigma).
fn pulse(t: f64, sigma: f64) -> f64 {
    q_func((t - 0.5) / sigma) - q_func((t + 0.5) / sigma)
}

fn q_func(x: f64) -> f64 {
    0.5 - 0.5 * erf(x / std::f64::consts::SQRT_2)
}

/// Error function, Abramowitz & Stegun 7.1.26 (|eps| < 1.5e-7); plenty
/// for pulse shaping.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let y = 1.0
        - (((((1.061405429 * t - 1.453152027) * t) + 1.421413741) * t - 0.284496736) * t
            + 0.254829592)
            * t
            * (-x * x).exp();
    sign * y
}

impl DspState {
    /// Build the demodulator for one sonde family. `sr` is the sample
    /// rate the feed delivers (post-decimation for baseband input) and
    /// `baud` the family symbol rate.
    pub fn new(feed: SampleFeed, cfg: DemodConfig, sr: u32, baud: f32, hdr: HeaderSpec) -> Result<Self> {
        let sps = sr as f32 / baud;
        if sps < 8.0 {
            return Err(ConfigError::SampleRateTooLow { sps }.into());
        }

        let l = (hdr.len() as f32 * sps + 0.5) as usize;
        let mut m = 3 * l;
        let mut p2 = 1usize;
        while p2 < m {
            p2 <<= 1;
        }
        while p2 < 0x2000 {
            p2 <<= 1;
        }
        m = p2;
        let n = p2;
        let delay = (l / 16) as u64;
        let k = m - l - delay as usize;

        // pulse-shaped header prototype, unit L2 norm
        let sigma = (2f64.ln()).sqrt() / (2.0 * std::f64::consts::PI * hdr.bt as f64);
        let mut match_proto = vec![0f32; l];
        for (i, mp) in match_proto.iter_mut().enumerate() {
            let pos = (i as f32 / sps) as usize;
            let t = ((i as f32 - pos as f32 * sps) / sps - 0.5) as f64;

            let b1 = (hdr.bits[pos] as f64 - 0.5) * 2.0;
            let mut b = b1 * pulse(t, sigma);
            if pos > 0 {
                let b0 = (hdr.bits[pos - 1] as f64 - 0.5) * 2.0;
                b += b0 * pulse(t + 1.0, sigma);
            }
            if pos < hdr.len() - 1 {
                let b2 = (hdr.bits[pos + 1] as f64 - 0.5) * 2.0;
                b += b2 * pulse(t - 1.0, sigma);
            }
            *mp = b as f32;
        }
        let norm: f64 = match_proto.iter().map(|&x| (x as f64) * (x as f64)).sum();
        let norm = norm.sqrt() as f32;
        for x in &mut match_proto {
            *x /= norm;
        }

        let mut planner = FftPlanner::<f32>::new();
        let fwd = planner.plan_fft_forward(n);
        let inv = planner.plan_fft_inverse(n);

        // Fm = FFT of the time-reversed prototype
        let mut fm = vec![Complex32::new(0.0, 0.0); n];
        for i in 0..l {
            fm[l - 1 - i] = Complex32::new(match_proto[i], 0.0);
        }
        fwd.process(&mut fm);

        let dft = DftScratch {
            n,
            fwd,
            inv,
            fm,
            xn: vec![0.0; n],
            x: vec![Complex32::new(0.0, 0.0); n],
            z: vec![Complex32::new(0.0, 0.0); n],
            cx: vec![Complex32::new(0.0, 0.0); n],
        };

        // IF low-pass: default 24 kHz full bandwidth, acquisition 1.5x
        let lp_iq = if cfg.iq.is_iq() && cfg.lp_iq {
            let f_lp = if cfg.lp_iq_bw > 0.0 {
                cfg.lp_iq_bw / sr as f32 / 2.0
            } else {
                24e3 / sr as f32 / 2.0
            };
            let taps = {
                let t = (4 * sr) as usize / IF_TRANSITION_BW as usize;
                if t % 2 == 0 {
                    t + 1
                } else {
                    t
                }
            };
            let ws_acq = filters::lowpass_design(1.5 * f_lp, taps);
            let ws_locked = filters::lowpass_design(f_lp, taps);
            let taps = ws_locked.len() / 2;
            Some(IqLowpass {
                taps,
                ws_acq,
                ws_locked,
                fir: FirC::new(taps),
            })
        } else {
            None
        };

        // FM audio low-pass: default 10 kHz
        let lp_fm = if cfg.lp_fm {
            let f_lp = if cfg.lp_fm_bw > 0.0 {
                cfg.lp_fm_bw / sr as f32
            } else {
                10e3 / sr as f32
            };
            let taps = {
                let t = (4 * sr) as usize / FM_TRANSITION_BW as usize;
                if t % 2 == 0 {
                    t + 1
                } else {
                    t
                }
            };
            let ws = filters::lowpass_design(f_lp, taps);
            let taps = ws.len() / 2;
            Some(FmLowpass {
                taps,
                ws,
                fir: FirR::new(taps),
            })
        } else {
            None
        };

        let f1 = -(hdr.h as f64) * sr as f64 / (2.0 * sps as f64);
        let f2 = -f1;

        let nvar = l;
        // start unlocked (wide acquisition filter) when DC tracking is on
        let locked = !cfg.dc_tracking;

        Ok(DspState {
            feed,
            cfg,
            sr,
            sps,
            baud,
            rawbits: vec![0; 2 * hdr.len() + 1],
            hdr,
            sample_in: 0,
            sample_out: 0,
            delay,
            sc: 0,
            buffered: 0,
            l,
            m,
            k,
            bufs: vec![0.0; m],
            fm_buffer: vec![0.0; m],
            match_proto,
            nvar,
            xsum: 0.0,
            qsum: 0.0,
            xs: vec![0.0; m],
            qs: vec![0.0; m],
            mv: 0.0,
            mv_pos: 0,
            mv2: 0.0,
            mv2_pos: 0,
            dc: 0.0,
            ddf: 0.0,
            df: 0.0,
            n_iqbuf: n,
            rot_iqbuf: vec![Complex32::new(0.0, 0.0); n],
            f1sum: Complex64::new(0.0, 0.0),
            f2sum: Complex64::new(0.0, 0.0),
            f1,
            f2,
            lp_iq,
            lp_fm,
            locked,
            dft,
        })
    }

    pub fn header_len_samples(&self) -> usize {
        self.l
    }

    pub fn dft_size(&self) -> usize {
        self.dft.n
    }

    pub fn current_sample(&self) -> u64 {
        self.sample_in
    }

    pub fn last_header_score(&self) -> f32 {
        self.mv
    }

    pub fn last_header_pos(&self) -> u64 {
        self.mv_pos
    }

    /// FM low-pass group-delay alignment between the decision buffer and
    /// the FM buffer.
    pub(crate) fn fm_delay_shift(&self) -> i64 {
        match &self.lp_fm {
            Some(lp) => (lp.taps as i64 - (self.sps as i64 - 1)) / 2,
            None => 0,
        }
    }

    /// Pull one sample through the front end into the ring buffers.
    /// Returns false on end of input.
    pub(crate) fn feed_sample(&mut self, inv: bool) -> Result<bool> {
        let t = self.sample_in as f64 / self.sr as f64;
        let s: f32;
        let mut s_fm: f32;

        match &mut self.feed {
            SampleFeed::Iq(src) => {
                let Some(mut z) = src.next_iq()? else {
                    return Ok(false);
                };

                // retroactive carrier correction accumulated by the tracker
                if self.cfg.dc_tracking && self.df != 0.0 {
                    let ph = -2.0 * std::f64::consts::PI * self.df * t;
                    let rot = Complex64::from_polar(1.0, ph);
                    z = Complex32::new(
                        (z.re as f64 * rot.re - z.im as f64 * rot.im) as f32,
                        (z.re as f64 * rot.im + z.im as f64 * rot.re) as f32,
                    );
                }

                if let Some(lp) = &mut self.lp_iq {
                    let ws = if self.locked { &lp.ws_locked } else { &lp.ws_acq };
                    z = lp.fir.push_filter(self.sample_in, z, ws);
                }

                let z0 = self.rot_iqbuf
                    [((self.sample_in.wrapping_sub(1)) % self.n_iqbuf as u64) as usize];
                let w = z * z0.conj();
                s_fm = FM_GAIN * w.im.atan2(w.re) / std::f32::consts::PI;

                self.rot_iqbuf[(self.sample_in % self.n_iqbuf as u64) as usize] = z;

                if self.cfg.iq.symbol_decision() {
                    // incremental dual-tone DFT over the last sps samples
                    let n = self.sps as u64;
                    let tn = (self.sample_in as f64 - n as f64) / self.sr as f64;
                    let z0 = self.rot_iqbuf[((self.sample_in + self.n_iqbuf as u64 - n)
                        % self.n_iqbuf as u64) as usize];
                    let zc = Complex64::new(z.re as f64, z.im as f64);
                    let z0c = Complex64::new(z0.re as f64, z0.im as f64);

                    let tau = 2.0 * std::f64::consts::PI;
                    let x0 = z0c * Complex64::from_polar(1.0, -tau * self.f1 * tn);
                    let x = zc * Complex64::from_polar(1.0, -tau * self.f1 * t);
                    self.f1sum += x - x0;

                    let x0 = z0c * Complex64::from_polar(1.0, -tau * self.f2 * tn);
                    let x = zc * Complex64::from_polar(1.0, -tau * self.f2 * t);
                    self.f2sum += x - x0;

                    let xbit = self.f2sum.norm() - self.f1sum.norm();
                    s = (xbit / self.sps as f64) as f32;
                } else {
                    s = s_fm;
                }
            }
            SampleFeed::Audio(src) => {
                let Some(v) = src.next_scalar()? else {
                    return Ok(false);
                };
                s = v;
                s_fm = v;
            }
        }

        let mut s = s;
        if let Some(lp) = &mut self.lp_fm {
            s_fm = lp.fir.push_filter(self.sample_in, s_fm, &lp.ws);
            if !self.cfg.iq.symbol_decision() {
                s = s_fm;
            }
        }

        let mi = (self.sample_in % self.m as u64) as usize;
        self.fm_buffer[mi] = s_fm;

        if inv {
            s = -s;
        }
        self.bufs[mi] = s;

        // rolling mean and mean-square over the last Nvar samples
        let xneu = self.bufs[mi];
        let xalt = self.bufs
            [((self.sample_in + self.m as u64 - self.nvar as u64) % self.m as u64) as usize];
        self.xsum += xneu - xalt;
        self.qsum += (xneu - xalt) * (xneu + xalt);
        self.xs[mi] = self.xsum;
        self.qs[mi] = self.qsum;

        self.sample_out = self.sample_in.wrapping_sub(self.delay);
        self.sample_in += 1;

        Ok(true)
    }

    /// Mean of the decision buffer over the last Nvar samples ending at
    /// `pos` (energy bookkeeping readout).
    pub fn buf_mean(&self, pos: u64) -> f32 {
        self.xs[(pos % self.m as u64) as usize] / self.nvar as f32
    }

    /// Mean square over the same window.
    pub fn buf_var(&self, pos: u64) -> f32 {
        self.qs[(pos % self.m as u64) as usize] / self.nvar as f32
    }
}
