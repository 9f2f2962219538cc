//! FFT-domain matched-filter header correlation and carrier tracking.
//!
//! Every K-4 new samples a window of the last K+L decision samples is
//! cross-correlated against the pulse-shaped header prototype. The peak
//! is normalized by the signal energy under the header so the score lands
//! in [-1, 1]; boundary peaks are rejected. With DC tracking enabled a
//! DC-removed pass and an FM-buffer alternate pass can rescue headers
//! that the carrier offset pushed under the threshold, and the measured
//! DC bias is converted into a frequency correction.

use num_complex::{Complex32, Complex64};

use super::state::DspState;
use super::FM_GAIN;
use crate::errors::Result;

/// A hypothesized header match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeaderHit {
    /// normalized correlation score, sign carries polarity
    pub score: f32,
    /// sample index of the last header sample
    pub pos: u64,
    /// residual carrier offset estimate [Hz] at detection time
    pub freq_offset: f64,
}

enum CorrOutcome {
    Peak(usize),
    Boundary,
    NotReady,
}

impl DspState {
    /// One correlation pass over `source` samples (either the decision
    /// buffer or the FM buffer); fills the scratch and returns the peak.
    fn corr_pass(&mut self, use_fm_buffer: bool, remove_dc: bool) -> CorrOutcome {
        let n = self.dft.n;
        let kl = self.k + self.l;
        if kl > n {
            return CorrOutcome::NotReady;
        }
        if self.sample_out < self.l as u64 {
            return CorrOutcome::NotReady;
        }
        let pos = self.sample_out;

        let src: &[f32] = if use_fm_buffer {
            &self.fm_buffer
        } else {
            &self.bufs
        };
        for i in 0..kl {
            let idx =
                ((pos + self.m as u64 - (kl as u64 - 1) + i as u64) % self.m as u64) as usize;
            self.dft.xn[i] = src[idx];
        }
        for i in kl..n {
            self.dft.xn[i] = 0.0;
        }

        // forward transform of the (real) window
        for (x, &v) in self.dft.x.iter_mut().zip(self.dft.xn.iter()) {
            *x = Complex32::new(v, 0.0);
        }
        self.dft.fwd.process(&mut self.dft.x);

        if remove_dc {
            // zero the DC bin and rebuild the time series for the
            // energy normalization below
            self.dft.x[0] = Complex32::new(0.0, 0.0);
            self.dft.cx.copy_from_slice(&self.dft.x);
            self.dft.inv.process(&mut self.dft.cx);
            for (xn, cx) in self.dft.xn.iter_mut().zip(self.dft.cx.iter()) {
                *xn = cx.re / n as f32;
            }
        }

        for i in 0..n {
            self.dft.z[i] = self.dft.x[i] * self.dft.fm[i];
        }
        self.dft.cx.copy_from_slice(&self.dft.z);
        self.dft.inv.process(&mut self.dft.cx);

        // scan re(cx)^2 over the valid lag range t = L-1 .. K+L-1
        let mut mx = 0f32;
        let mut mx2 = 0f32;
        let mut mp = 0usize;
        for i in self.l - 1..kl {
            let re = self.dft.cx[i].re;
            if re * re > mx2 {
                mx = re;
                mx2 = re * re;
                mp = i;
            }
        }
        if mp == self.l - 1 || mp == kl - 1 {
            return CorrOutcome::Boundary;
        }

        // normalize by the energy under the header window
        let mut xnorm = 0f32;
        for i in 0..self.l {
            xnorm += self.dft.xn[mp - i] * self.dft.xn[mp - i];
        }
        let xnorm = xnorm.sqrt();
        self.mv = mx / (xnorm * n as f32);
        self.mv_pos = pos - (kl as u64 - 1) + mp as u64;

        CorrOutcome::Peak(mp)
    }

    /// Full correlation step: main pass, optional
    /// FM-buffer rescue pass, DC estimate over the header window.
    pub(crate) fn correlate(&mut self, threshold: f32) -> bool {
        self.mv = 0.0;
        self.dc = 0.0;
        self.mv2 = 0.0;
        self.mv2_pos = 0;

        let pos = self.sample_out;
        let remove_dc = self.cfg.dc_tracking;
        match self.corr_pass(false, remove_dc) {
            CorrOutcome::Peak(_) => {}
            _ => {
                self.mv = 0.0;
                return false;
            }
        }
        if pos == self.sample_out {
            self.buffered = (self.sample_out - self.mv_pos) as i64;
        }

        let mut mpos = self.mv_pos;
        if self.cfg.dc_tracking
            && self.cfg.iq.symbol_decision()
            && self.mv.abs() < threshold
        {
            // rescue pass over the FM history, shifted by the FM filter
            // group delay
            let keep = (self.mv, self.mv_pos);
            match self.corr_pass(true, true) {
                CorrOutcome::Peak(_) => {
                    self.mv2 = self.mv;
                    self.mv2_pos = self.mv_pos.wrapping_sub(self.fm_delay_shift() as u64);
                    mpos = self.mv_pos;
                    if self.mv2.abs() > threshold {
                        self.mv_pos = self.mv2_pos;
                        if pos == self.sample_out {
                            self.buffered = (self.sample_out - self.mv2_pos) as i64;
                        }
                    } else {
                        self.mv = keep.0;
                        self.mv_pos = keep.1;
                    }
                }
                _ => {
                    self.mv = keep.0;
                    self.mv_pos = keep.1;
                }
            }
        }

        if self.cfg.dc_tracking {
            let mp_ofs = if self.cfg.iq.symbol_decision() && self.mv2_pos == 0 {
                self.fm_delay_shift()
            } else {
                0
            };
            let mut dc = 0f64;
            for i in 0..self.l as u64 {
                let idx = ((mp_ofs as u64)
                    .wrapping_add(mpos)
                    .wrapping_sub(i)
                    .wrapping_add(self.m as u64)
                    % self.m as u64) as usize;
                dc += self.fm_buffer[idx] as f64;
            }
            self.dc = (dc / self.l as f64) as f32;
        }

        // FM: s = gain * dphi/pi, so the DC bias maps to a frequency
        self.ddf = self.sr as f64 * self.dc as f64 / (2.0 * FM_GAIN as f64);

        true
    }

    /// Integrate one header bit (or Manchester pair) from the ring for
    /// the bit-error check.
    fn read_bufbit(&self, symlen: u8, mvp: u64, pos: usize) -> u8 {
        let sps = self.sps as f64;
        let mut grenze = pos as f64 * symlen as f64 * sps;
        let mut count = grenze.ceil() as i64;

        let dc = if self.cfg.dc_tracking && !self.cfg.iq.symbol_decision() {
            self.dc
        } else {
            0.0
        } as f64;

        let mut sum = 0f64;
        grenze += sps;
        while (count as f64) < grenze {
            let idx = ((count as u64)
                .wrapping_add(mvp)
                .wrapping_add(self.m as u64)
                % self.m as u64) as usize;
            sum += self.bufs[idx] as f64 - dc;
            count += 1;
        }
        if symlen == 2 {
            grenze += sps;
            while (count as f64) < grenze {
                let idx = ((count as u64)
                    .wrapping_add(mvp)
                    .wrapping_add(self.m as u64)
                    % self.m as u64) as usize;
                sum -= self.bufs[idx] as f64 - dc;
                count += 1;
            }
        }
        (sum >= 0.0) as u8
    }

    /// Re-slice the header at the reported position and count bit errors
    /// against the reference pattern.
    pub(crate) fn header_errors(&mut self) -> u32 {
        let symhd = self.hdr.symhd;
        let len = self.hdr.len() / symhd as usize;
        let inv = self.mv < 0.0;
        let mvp = self.mv_pos + 1 - self.l as u64;

        let step = if symhd != 1 { 2usize } else { 1 };
        for pos in 0..len {
            let b = self.read_bufbit(symhd, mvp, pos);
            if symhd == 2 {
                // Manchester pair: sum>=0 reads as "10"
                self.rawbits[pos * step] = b;
                self.rawbits[pos * step + 1] = b ^ 1;
            } else {
                self.rawbits[pos] = b;
            }
        }

        let n = len * step;
        let sign = inv as u8;
        let mut errs = 0u32;
        for i in 0..n {
            if (self.rawbits[i] ^ sign) != self.hdr.bits[i] {
                errs += 1;
            }
        }
        errs
    }

    /// Apply the proportional carrier correction and the low-pass lock
    /// hysteresis after a threshold crossing.
    fn track_carrier(&mut self) {
        if !self.cfg.dc_tracking || !self.cfg.iq.is_iq() {
            return;
        }
        if self.ddf.abs() > 100.0 {
            let diff_df = self.ddf * 0.6;
            if self.cfg.iq.symbol_decision() {
                // rotate the last sps IQ samples and rebuild the
                // dual-tone sums
                let tau = 2.0 * std::f64::consts::PI;
                let mut x1 = Complex64::new(0.0, 0.0);
                let mut x2 = Complex64::new(0.0, 0.0);
                let mut n = self.sps as u64;
                while n > 0 {
                    let tn = (self.sample_in as f64 - n as f64) / self.sr as f64;
                    let idx = ((self.sample_in + self.n_iqbuf as u64 - n)
                        % self.n_iqbuf as u64) as usize;
                    let rot = Complex64::from_polar(1.0, -tn * tau * diff_df);
                    let z = self.rot_iqbuf[idx];
                    let zr = Complex64::new(z.re as f64, z.im as f64) * rot;
                    self.rot_iqbuf[idx] = Complex32::new(zr.re as f32, zr.im as f32);

                    x1 += zr * Complex64::from_polar(1.0, -tn * tau * self.f1);
                    x2 += zr * Complex64::from_polar(1.0, -tn * tau * self.f2);
                    n -= 1;
                }
                self.f1sum = x1;
                self.f2sum = x2;
            }
            self.df += diff_df;
        }
        // lock hysteresis toggles between acquisition and locked low-pass
        if self.ddf.abs() > 1e3 {
            if self.locked {
                self.locked = false;
            }
        } else if !self.locked {
            self.locked = true;
        }
    }

    /// Scan the stream for the next header. Returns `None` on end of
    /// input.
    pub fn find_header(&mut self, threshold: f32, max_bit_errors: u32) -> Result<Option<HeaderHit>> {
        let mut k = 0usize;
        let mut mvpos0 = self.mv_pos;

        loop {
            if !self.feed_sample(self.cfg.invert)? {
                return Ok(None);
            }

            k += 1;
            if k < self.k.saturating_sub(4) {
                self.mv = 0.0;
                continue;
            }
            mvpos0 = self.mv_pos;
            self.correlate(threshold);
            k = 0;

            if self.mv.abs() > threshold {
                self.track_carrier();

                if self.mv_pos > mvpos0 {
                    let errs = self.header_errors();
                    if errs <= max_bit_errors {
                        return Ok(Some(HeaderHit {
                            score: self.mv,
                            pos: self.mv_pos,
                            freq_offset: self.ddf,
                        }));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DemodConfig;
    use crate::dsp::state::{HeaderSpec, SampleFeed};
    use crate::source::{PcmInfo, PcmReader};
    use std::io::Cursor;

    const RS41_HDR: &str = "0000100001101101010100111000100001000100011010010100100000011111";

    /// Render a bit string as rectangular FM pulses at `sps` samples/bit.
    fn render_bits(bits: &str, sps: usize, amp: f32) -> Vec<f32> {
        bits.bytes()
            .flat_map(|b| {
                let v = if b & 1 == 1 { amp } else { -amp };
                std::iter::repeat(v).take(sps)
            })
            .collect()
    }

    fn state_for(samples: Vec<f32>) -> DspState {
        let mut bytes = Vec::with_capacity(samples.len() * 4);
        for s in &samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let info = PcmInfo {
            sample_rate: 48000,
            bits_per_sample: 32,
            channels: 1,
            sel_channel: 0,
        };
        let src = PcmReader::new(Cursor::new(bytes), info).unwrap();
        let hdr = HeaderSpec::from_str(RS41_HDR, 1, 1, 0.5, 0.8);
        DspState::new(
            SampleFeed::Audio(Box::new(src)),
            DemodConfig::default(),
            48000,
            4800.0,
            hdr,
        )
        .unwrap()
    }

    #[test]
    fn finds_clean_header() {
        let sps = 10;
        let mut signal = vec![0.0f32; 4000];
        signal.extend(render_bits(RS41_HDR, sps, 0.8));
        // payload keeps the stream going past the correlation stride
        signal.extend(render_bits(&"01".repeat(4000), sps, 0.8));

        let mut st = state_for(signal);
        let hit = st
            .find_header(0.6, 3)
            .unwrap()
            .expect("header must be detected");
        assert!(hit.score > 0.6, "score {}", hit.score);

        // position: header ends after silence + header samples
        let expect = 4000 + 64 * sps as u64 - 1;
        let err = hit.pos as i64 - expect as i64;
        assert!(err.abs() <= 2, "position off by {}", err);
    }

    #[test]
    fn inverted_signal_gives_negative_score() {
        let sps = 10;
        let mut signal = vec![0.0f32; 4000];
        let inv: String = RS41_HDR
            .bytes()
            .map(|b| if b & 1 == 1 { '0' } else { '1' })
            .collect();
        signal.extend(render_bits(&inv, sps, 0.8));
        signal.extend(render_bits(&"10".repeat(4000), sps, 0.8));

        let mut st = state_for(signal);
        let hit = st
            .find_header(0.6, 3)
            .unwrap()
            .expect("inverted header must be detected");
        assert!(hit.score < -0.6, "score {}", hit.score);
    }

    #[test]
    fn noise_only_yields_no_hit() {
        // deterministic pseudo-noise, well below threshold
        let mut x = 0x12345678u32;
        let noise: Vec<f32> = (0..40000)
            .map(|_| {
                x = x.wrapping_mul(1664525).wrapping_add(1013904223);
                (x >> 16) as f32 / 32768.0 - 1.0
            })
            .map(|v| v * 0.3)
            .collect();
        let mut st = state_for(noise);
        let hit = st.find_header(0.65, 2).unwrap();
        assert!(hit.is_none());
    }

    #[test]
    fn header_bit_error_rejection() {
        let sps = 10;
        // corrupt 8 of 64 header bits: correlation may still peak, but
        // the bit-error check must reject with hdmax=2
        let mut corrupted: Vec<u8> = RS41_HDR.bytes().map(|b| b & 1).collect();
        for i in [3usize, 11, 19, 27, 35, 43, 51, 59] {
            corrupted[i] ^= 1;
        }
        let cstr: String = corrupted
            .iter()
            .map(|&b| if b == 1 { '1' } else { '0' })
            .collect();
        let mut signal = vec![0.0f32; 4000];
        signal.extend(render_bits(&cstr, sps, 0.8));
        signal.extend(render_bits(&"01".repeat(4000), sps, 0.8));

        let mut st = state_for(signal);
        let hit = st.find_header(0.5, 2).unwrap();
        if let Some(h) = hit {
            // if some later window correlates, it must be a genuine pass
            assert!(st.header_errors() <= 2, "score {}", h.score);
        }
    }
}
