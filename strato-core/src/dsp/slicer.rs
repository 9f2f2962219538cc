//! Symbol slicer: integrate the decision signal over symbol windows into
//! hard and soft bits.
//!
//! For Manchester symbols (symlen = 2) the two sub-symbols are integrated
//! with opposite signs. An optional center window `l` restricts
//! integration to `[mid-l, mid+l]` to reject inter-symbol interference,
//! and a spike filter blends outliers toward their neighbours.

use super::state::DspState;
use super::SoftBit;
use crate::errors::Result;

const SPIKE_THS: f32 = 0.5;
const SPIKE_SCALE: f32 = 0.27;

impl DspState {
    #[inline]
    fn buf_at(&self, ofs: i64) -> f32 {
        let idx = (self.sample_out as i64 - self.buffered + ofs).rem_euclid(self.m as i64);
        self.bufs[idx as usize]
    }

    /// Fetch the sample under the slicer cursor, optionally de-spiked.
    fn cursor_sample(&mut self, ofs: i64, spike: bool, avg: &mut f32) -> f32 {
        let mut sample = self.buf_at(ofs);
        if spike && (sample - *avg).abs() > SPIKE_THS {
            *avg = 0.5 * (self.buf_at(ofs - 1) + self.buf_at(ofs + 1));
            sample = *avg + SPIKE_SCALE * (sample - *avg);
        }
        sample
    }

    /// Ensure one more sample is available under the cursor. Returns
    /// false on end of input.
    fn advance(&mut self, inv: bool) -> Result<bool> {
        if self.buffered > 0 {
            self.buffered -= 1;
            Ok(true)
        } else {
            self.feed_sample(inv)
        }
    }

    /// Read one soft bit at symbol index `pos` after a header hit.
    ///
    /// `ofs` shifts the sampling grid in samples (the `-d` bit offset),
    /// `center` is the half-width of the integration window (negative =
    /// whole symbol). Position 0 resets the slicer cursor.
    pub fn read_softbit(
        &mut self,
        inv: bool,
        ofs: i64,
        pos: usize,
        center: f32,
        spike: bool,
    ) -> Result<Option<SoftBit>> {
        let symlen = self.hdr.symlen;
        let sps = self.sps as f64;
        let mut bg = pos as f64 * symlen as f64 * sps;

        let dc = if self.cfg.dc_tracking && !self.cfg.iq.symbol_decision() {
            self.dc
        } else {
            0.0
        };

        if pos == 0 {
            bg = 0.0;
            self.sc = 0;
        }

        let mut avg = 0f32;
        let mut sum = 0f64;

        if symlen == 2 {
            let mid = bg + (sps - 1.0) / 2.0;
            bg += sps;
            while (self.sc as f64) < bg {
                if !self.advance(inv)? {
                    return Ok(None);
                }
                let sample = self.cursor_sample(ofs, spike, &mut avg) - dc;
                if center < 0.0
                    || (mid - center as f64) < self.sc as f64 && (self.sc as f64) < mid + center as f64
                {
                    sum -= sample as f64;
                }
                self.sc += 1;
            }
        }

        let mid = bg + (sps - 1.0) / 2.0;
        bg += sps;
        while (self.sc as f64) < bg {
            if !self.advance(inv)? {
                return Ok(None);
            }
            let sample = self.cursor_sample(ofs, spike, &mut avg) - dc;
            if center < 0.0
                || (mid - center as f64) < self.sc as f64 && (self.sc as f64) < mid + center as f64
            {
                sum += sample as f64;
            }
            self.sc += 1;
        }

        Ok(Some(SoftBit {
            hb: (sum >= 0.0) as u8,
            sb: sum as f32,
        }))
    }

    /// Like [`read_softbit`] but also returns the decision one sample
    /// earlier ("soft2" sub-symbol decision used by RS41 and M10).
    pub fn read_softbit2p(
        &mut self,
        inv: bool,
        ofs: i64,
        pos: usize,
        center: f32,
        spike: bool,
    ) -> Result<Option<(SoftBit, SoftBit)>> {
        let symlen = self.hdr.symlen;
        let sps = self.sps as f64;
        let mut bg = pos as f64 * symlen as f64 * sps;

        let dc = if self.cfg.dc_tracking && !self.cfg.iq.symbol_decision() {
            self.dc
        } else {
            0.0
        };

        if pos == 0 {
            bg = 0.0;
            self.sc = 0;
        }

        let mut avg = 0f32;
        let mut sum = 0f64;
        let mut sum1 = 0f64;

        let mut pass = |st: &mut Self,
                        bg: &mut f64,
                        sum: &mut f64,
                        sum1: &mut f64,
                        avg: &mut f32,
                        sign: f64|
         -> Result<bool> {
            let mid = *bg + (sps - 1.0) / 2.0;
            *bg += sps;
            while (st.sc as f64) < *bg {
                if !st.advance(inv)? {
                    return Ok(false);
                }
                let sample = st.cursor_sample(ofs, spike, avg) - dc;
                let sample1 = st.buf_at(ofs - 1) - dc;
                if center < 0.0
                    || (mid - center as f64) < st.sc as f64 && (st.sc as f64) < mid + center as f64
                {
                    *sum += sign * sample as f64;
                    *sum1 += sign * sample1 as f64;
                }
                st.sc += 1;
            }
            Ok(true)
        };

        if symlen == 2 && !pass(self, &mut bg, &mut sum, &mut sum1, &mut avg, -1.0)? {
            return Ok(None);
        }
        if !pass(self, &mut bg, &mut sum, &mut sum1, &mut avg, 1.0)? {
            return Ok(None);
        }

        Ok(Some((
            SoftBit {
                hb: (sum >= 0.0) as u8,
                sb: sum as f32,
            },
            SoftBit {
                hb: (sum1 >= 0.0) as u8,
                sb: sum1 as f32,
            },
        )))
    }
}
