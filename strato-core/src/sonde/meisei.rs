//! Meisei iMS-100 / RS-11G interpreter.
//!
//! 2400 Bd biphase-S; frames come as subframe pairs of 300 bits each: a
//! 24-bit header (0x049DCE, partner 0xFB6230) plus six BCH(63,51)
//! codewords shortened to 46 bits (12 parity + two 17-bit words, each
//! one odd-parity bit and 16 data bits). A 64-slot float32 configuration
//! ring keyed by the frame counter carries the serial number, frequency,
//! the R/T interpolation table and the humidity polynomial; PTU values
//! are frequency ratios against a reference channel.

use crate::config::DemodConfig;
use crate::dsp::{HeaderSpec, SoftBit};
use crate::fec::ReedSolomon;
use crate::framing::{biphase_s, bits_to_val};
use crate::sonde::{FrameCtx, RecordTime, SondeDecoder, SondeKind, SondeRecord};

pub const HEADER: &str = "101010101011010100101011001101001100101011001101";
const HEADER_BITS_0: &str = "000001001001110111001110"; // 0x049DCE
const HEADER_BITS_1: &str = "111110110110001000110000"; // 0xFB6230

const BAUD: f32 = 2400.0;
const HEADLEN: usize = 24;
const SUBFRAME_BITS: usize = 300;
/// raw symbols per read: both subframes minus the consumed raw header
const RAW_READ: usize = 2 * 2 * SUBFRAME_BITS - 48;

pub struct Meisei {
    cfg_demod: DemodConfig,
    rs: ReedSolomon,

    /// iMS-100 (true) vs RS-11G (false), auto-detected
    ims100: bool,
    cfg: [f32; 64],
    cfg_valid: u64,
    sn: f64,
    f_ref: u32,

    counter: u32,
    temperature: f64,
    humidity: f64,
    date: (i32, u32, u32),
    time: (u32, u32, f64),
    lat: f64,
    lon: f64,
    alt: f64,
    v_h: f64,
    v_d: f64,
    v_v: Option<f64>,
    frm0_valid: bool,
    frm0_count: u32,
}

impl Meisei {
    pub fn new(cfg: DemodConfig) -> Self {
        Meisei {
            cfg_demod: cfg,
            rs: ReedSolomon::bch64(),
            ims100: true,
            cfg: [0.0; 64],
            cfg_valid: 0,
            sn: -1.0,
            f_ref: 0,
            counter: 0,
            temperature: f64::NAN,
            humidity: f64::NAN,
            date: (0, 0, 0),
            time: (0, 0, 0.0),
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            v_h: 0.0,
            v_d: 0.0,
            v_v: None,
            frm0_valid: false,
            frm0_count: 0,
        }
    }

    /// Resolve a single-digit year against the reference year.
    fn est_year(y_digit: u32, ref_year: i32) -> i32 {
        let r = ref_year.rem_euclid(10) as u32;
        ref_year - ((10 + r - y_digit) % 10) as i32
    }

    /// BCH-decode the six codewords of one subframe in place. Returns
    /// (corrected bits per block, hard-failure count).
    fn ecc_subframe(&self, bits: &mut [u8]) -> ([i32; 6], u32) {
        let mut block_err = [0i32; 6];
        let mut failures = 0u32;
        for block in 0..6 {
            let mut cw = [0u8; 63];
            for j in 0..46 {
                cw[45 - j] = bits[HEADLEN + block * 46 + j] & 1;
            }
            let res = self.rs.decode_bch_gf2t2(&mut cw);
            let ok = match res {
                Ok(n) => {
                    // shortened positions must stay zero, and the two
                    // odd-parity bits must hold
                    let mut check = cw[46..63].iter().all(|&b| b == 0);
                    let mut par = 1u8;
                    for j in 13..29 {
                        par ^= cw[j];
                    }
                    check &= cw[12] == par;
                    par = 1;
                    for j in 30..46 {
                        par ^= cw[j];
                    }
                    check &= cw[29] == par;
                    if check {
                        block_err[block] = n as i32;
                        true
                    } else {
                        block_err[block] = -3;
                        false
                    }
                }
                Err(_) => {
                    block_err[block] = -2;
                    false
                }
            };
            if ok {
                for j in 0..46 {
                    bits[HEADLEN + block * 46 + j] = cw[45 - j];
                }
            } else {
                failures += 1;
            }
        }
        (block_err, failures)
    }

    /// 16-bit word j of a subframe: two per block, skipping the leading
    /// parity bit of each 17-bit group.
    fn w16(bits: &[u8], j: usize) -> u32 {
        bits_to_val(bits, HEADLEN + 46 * (j / 2) + 17 * (j % 2), 16)
    }

    fn temp_ims100(&self, t_raw: u32) -> f64 {
        // cfg[56:53] transform, cfg[44:33] resistances, cfg[28:17] temps
        let f0 = (t_raw as f64 / self.f_ref as f64) * 4.0;
        if f0 <= 1.0 {
            return f64::NAN;
        }
        let f = 1.0 / (f0 - 1.0);
        let c = &self.cfg;
        let r = c[53] as f64 + c[54] as f64 * f + c[55] as f64 * f * f - c[56] as f64;
        if r <= c[33] as f64 {
            return c[17] as f64;
        }
        if r >= c[44] as f64 {
            return c[28] as f64;
        }
        for j in 0..11 {
            if r < c[34 + j] as f64 {
                let f = (r.ln() - (c[33 + j] as f64).ln())
                    / ((c[34 + j] as f64).ln() - (c[33 + j] as f64).ln());
                return c[17 + j] as f64 - f * (c[17 + j] as f64 - c[18 + j] as f64);
            }
        }
        f64::NAN
    }

    fn rh_ims100(&self, u_raw: u32) -> f64 {
        let f = (u_raw as f64 / self.f_ref as f64) * 4.0;
        let c = &self.cfg;
        let rh = c[49] as f64 + c[50] as f64 * f + c[51] as f64 * f * f
            + c[52] as f64 * f * f * f;
        rh.clamp(0.0, 100.0)
    }

    fn ims100_temp_config_sane(&self) -> bool {
        // resistances strictly increasing, temperatures strictly
        // decreasing over the 12 sampling points
        let mut r_old = 0.0f32;
        let mut t_old = f32::INFINITY;
        for i in 0..12 {
            if self.cfg[33 + i] <= r_old {
                return false;
            }
            r_old = self.cfg[33 + i];
            if self.cfg[17 + i] >= t_old {
                return false;
            }
            t_old = self.cfg[17 + i];
        }
        true
    }

    /// iMS-100 even-counter subframe pair: cfg/time from the 049DCE
    /// half, date/position from the FB6230 half.
    fn process_pair(
        &mut self,
        sub0: &[u8],
        sub1: &[u8],
        err_frm: u32,
        block_err: &[i32; 6],
        ctx: &FrameCtx,
    ) -> Option<SondeRecord> {
        // GPS checksum spans both subframes
        let mut gps_sum = 0u32;
        for j in 10..12 {
            gps_sum = gps_sum.wrapping_add(Self::w16(sub0, j));
        }
        for j in 0..11 {
            gps_sum = gps_sum.wrapping_add(Self::w16(sub1, j));
        }
        let gps_ok = (gps_sum & 0xFFFF) == Self::w16(sub1, 11);

        let counter = Self::w16(sub0, 0);
        self.counter = counter;

        // configuration ring (counter ok and cfg words clean)
        if err_frm == 0 && block_err[0] < 2 && block_err[1] < 2 {
            let w0 = Self::w16(sub0, 2);
            let w1 = Self::w16(sub0, 3);
            let w32 = (w1 << 16) | w0;
            let fcfg = f32::from_bits(w32);
            self.cfg[(counter % 64) as usize] = fcfg;
            self.cfg_valid |= 1u64 << (counter % 64);

            if counter % 0x10 == 0 {
                self.sn = fcfg as f64;
            }
            if counter % 4 == 0 {
                self.f_ref = Self::w16(sub0, 1);
            }
            if counter % 4 == 3 {
                self.f_ref = Self::w16(sub0, 6);
            }
        }

        if counter % 2 == 0 {
            // time from block 5 of the 049DCE half
            let t1 = bits_to_val(sub0, HEADLEN + 5 * 46, 8);
            let t2 = bits_to_val(sub0, HEADLEN + 5 * 46 + 8, 8);
            let ms = (t1 << 8) | t2;
            let hour = bits_to_val(sub0, HEADLEN + 5 * 46 + 17, 8);
            let min = bits_to_val(sub0, HEADLEN + 5 * 46 + 25, 8);
            self.time = (hour, min, ms as f64 / 1000.0);

            if self.cfg_demod.ptu > 0 && self.f_ref != 0 {
                const T_CFG: u64 = 0x01E0_1FFE_1FFE_0000;
                const U_CFG: u64 = 0x001E_0000_0000_0000;
                self.temperature = f64::NAN;
                self.humidity = f64::NAN;
                if self.cfg_valid & T_CFG == T_CFG && self.ims100_temp_config_sane() {
                    let t_raw = Self::w16(sub0, 5);
                    self.temperature = self.temp_ims100(t_raw);
                }
                if self.cfg_valid & U_CFG == U_CFG {
                    let u_raw = Self::w16(sub0, 6);
                    self.humidity = self.rh_ims100(u_raw);
                }
            }

            // date + NMEA-style position from the FB6230 half
            let dat2 = Self::w16(sub1, 0);
            let day = dat2 / 1000;
            let month = (dat2 / 10) % 100;
            let year = Self::est_year(dat2 % 10, self.cfg_demod.ref_year);
            self.date = (year, month, day);

            let lat = (Self::w16(sub1, 1) << 16) | Self::w16(sub1, 2);
            let lon = (Self::w16(sub1, 3) << 16) | Self::w16(sub1, 4);
            let alt = (Self::w16(sub1, 5) << 8) | (Self::w16(sub1, 6) >> 8);

            let lat_deg = (lat as i32 as f64 / 1e6).trunc();
            let lat_min = (lat as i32 as f64 / 1e6 - lat_deg) * 100.0 / 60.0;
            self.lat = lat_deg + lat_min;
            let lon_deg = (lon as i32 as f64 / 1e6).trunc();
            let lon_min = (lon as i32 as f64 / 1e6 - lon_deg) * 100.0 / 60.0;
            self.lon = lon_deg + lon_min;
            self.alt = alt as f64 / 1e2;

            self.v_d = Self::w16(sub1, 9) as f64 / 1e2;
            self.v_h = Self::w16(sub1, 10) as f64 / 1.94384e2; // knots

            self.frm0_valid = err_frm == 0 && gps_ok;
            self.frm0_count = counter;
            None
        } else {
            // odd counter: vertical velocity, then emit the pair
            let vu = Self::w16(sub1, 1);
            self.v_v = if vu != 0 {
                Some(vu as i32 as f64 / 1.94384e1)
            } else {
                None
            };

            if !self.frm0_valid || counter != self.frm0_count + 1 {
                return None;
            }
            let mut rec = SondeRecord::new(SondeKind::Ims100);
            rec.crc_ok = true;
            rec.frame = Some(self.frm0_count);
            if self.sn > 0.0 && self.sn < 1e9 {
                rec.id = Some(format!("IMS100-{:.0}", self.sn));
            }
            rec.datetime = Some(RecordTime {
                year: self.date.0,
                month: self.date.1,
                day: self.date.2,
                hour: self.time.0,
                min: self.time.1,
                sec: self.time.2,
                is_utc: true,
            });
            rec.lat = Some(self.lat);
            rec.lon = Some(self.lon);
            if SondeRecord::plausible_alt(self.alt) {
                rec.alt = Some(self.alt);
            }
            rec.v_h = Some(self.v_h);
            rec.v_d = Some(self.v_d);
            rec.v_v = self.v_v;
            if self.temperature.is_finite() {
                rec.temperature = Some(self.temperature);
            }
            if self.humidity.is_finite() {
                rec.humidity = Some(self.humidity);
            }
            let _ = ctx;
            Some(rec)
        }
    }
}

impl SondeDecoder for Meisei {
    fn kind(&self) -> SondeKind {
        if self.ims100 {
            SondeKind::Ims100
        } else {
            SondeKind::Rs11g
        }
    }

    fn header_spec(&self) -> HeaderSpec {
        HeaderSpec::from_str(HEADER, 1, 1, 1.2, 2.4)
    }

    fn baud(&self) -> f32 {
        BAUD
    }

    fn frame_bits(&self) -> usize {
        RAW_READ
    }

    fn process(&mut self, bits: &[SoftBit], ctx: &FrameCtx) -> Vec<SondeRecord> {
        if bits.len() < RAW_READ {
            return Vec::new();
        }
        // biphase-S decode; re-seed the consumed header
        let raw: Vec<u8> = bits.iter().map(|b| b.hb).collect();
        let mut frame_bits: Vec<u8> = HEADER_BITS_0.bytes().map(|b| b & 1).collect();
        frame_bits.extend(biphase_s(&raw));
        if frame_bits.len() < 2 * SUBFRAME_BITS {
            return Vec::new();
        }

        // partner header sanity: subframe 1 must open on 0xFB6230
        let hdr1: Vec<u8> = HEADER_BITS_1.bytes().map(|b| b & 1).collect();
        let mism = frame_bits[SUBFRAME_BITS..SUBFRAME_BITS + HEADLEN]
            .iter()
            .zip(hdr1.iter())
            .filter(|(a, b)| a != b)
            .count();
        if mism > 4 {
            return Vec::new();
        }

        let (mut sub0, rest) = {
            let (a, b) = frame_bits.split_at_mut(SUBFRAME_BITS);
            (a.to_vec(), b[..SUBFRAME_BITS].to_vec())
        };
        let mut sub1 = rest;

        let (mut err_frm, mut block_err) = (0u32, [0i32; 6]);
        if self.cfg_demod.ecc.enabled() {
            let (be0, f0) = self.ecc_subframe(&mut sub0);
            let (_be1, f1) = self.ecc_subframe(&mut sub1);
            err_frm = f0 + f1;
            block_err = be0;
        }

        self.process_pair(&sub0, &sub1, err_frm, &block_err, ctx)
            .into_iter()
            .collect()
    }

    fn process_bytes(&mut self, _bytes: &[u8], _ctx: &FrameCtx) -> Vec<SondeRecord> {
        // the bit-interleaved subframe pair has no byte-aligned hex form
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EccLevel;
    use crate::sonde::soft_from_hard;

    /// Binary BCH(63,51) generator (roots over C1 and C3).
    fn bch_generator(rs: &ReedSolomon) -> Vec<u8> {
        use crate::fec::gf::poly;
        let mut g = vec![1u8];
        for e in [1u32, 2, 4, 8, 16, 32, 3, 6, 12, 24, 48, 33] {
            g = poly::mul(&rs.gf, &g, &[rs.gf.exp(e), 1]);
        }
        g
    }

    /// Build one 46-bit block from two 16-bit words. Wire layout:
    /// word0 (16) + odd-parity bit, word1 (16) + odd-parity bit, then
    /// the 12 BCH parity bits; wire bit j maps to coefficient 45-j.
    fn encode_block(rs: &ReedSolomon, g: &[u8], w0: u16, w1: u16) -> [u8; 46] {
        let mut wire = [0u8; 46];
        for j in 0..16 {
            wire[j] = ((w0 >> (15 - j)) & 1) as u8;
        }
        wire[16] = 1 ^ (w0.count_ones() & 1) as u8;
        for j in 0..16 {
            wire[17 + j] = ((w1 >> (15 - j)) & 1) as u8;
        }
        wire[33] = 1 ^ (w1.count_ones() & 1) as u8;

        let mut cw = [0u8; 63];
        for j in 0..34 {
            cw[45 - j] = wire[j];
        }
        // systematic remainder over GF(2)
        let mut rem = cw;
        for i in (12..63).rev() {
            if rem[i] == 1 {
                for (k, &gk) in g.iter().enumerate() {
                    rem[i - 12 + k] ^= gk;
                }
            }
        }
        for j in 0..12 {
            // parity coefficient j sits at wire position 45-j
            wire[45 - j] = rem[j];
        }
        wire
    }

    fn wire_parity_check(rs: &ReedSolomon, wire: &[u8; 46]) -> bool {
        let mut cw = [0u8; 63];
        for j in 0..46 {
            cw[45 - j] = wire[j];
        }
        rs.decode_bch_gf2t2(&mut cw).is_ok()
    }

    fn subframe(header: &str, words: [[u16; 2]; 6]) -> Vec<u8> {
        let rs = ReedSolomon::bch64();
        let g = bch_generator(&rs);
        let mut bits: Vec<u8> = header.bytes().map(|b| b & 1).collect();
        for w in words {
            let block = encode_block(&rs, &g, w[0], w[1]);
            assert!(wire_parity_check(&rs, &block));
            bits.extend_from_slice(&block);
        }
        assert_eq!(bits.len(), SUBFRAME_BITS);
        bits
    }

    /// Render a decoded bit stream as biphase-S raw symbols.
    fn to_biphase(bits: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(bits.len() * 2);
        let mut level = 0u8;
        for &b in bits {
            // biphase-S: transition at every bit start; 1 = no mid-bit
            // transition, 0 = mid-bit transition
            level ^= 1;
            out.push(level);
            if b == 0 {
                level ^= 1;
            }
            out.push(level);
        }
        out
    }

    fn pair_to_soft(sub0: &[u8], sub1: &[u8]) -> Vec<SoftBit> {
        let mut bits = sub0.to_vec();
        bits.extend_from_slice(sub1);
        let raw = to_biphase(&bits);
        // the pipeline consumes the 48 raw header symbols
        soft_from_hard(&raw[48..])
    }

    fn gps_checksum(sub0_words: &[[u16; 2]; 6], sub1_words: &mut [[u16; 2]; 6]) {
        // words 10,11 of sub0 and 0..11 of sub1
        let w16 = |words: &[[u16; 2]; 6], j: usize| words[j / 2][j % 2] as u32;
        let mut sum = 0u32;
        for j in 10..12 {
            sum = sum.wrapping_add(w16(sub0_words, j));
        }
        for j in 0..11 {
            sum = sum.wrapping_add(w16(sub1_words, j));
        }
        sub1_words[5][1] = (sum & 0xFFFF) as u16;
    }

    #[test]
    fn biphase_reference() {
        // to_biphase must invert at every bit boundary and encode 1 as a
        // level-hold: decoded equal pairs = 1
        let bits = [1u8, 0, 0, 1];
        let raw = to_biphase(&bits);
        assert_eq!(biphase_s(&raw), bits.to_vec());
    }

    #[test]
    fn decodes_position_pair() {
        // even-counter pair
        let counter = 4u16;
        // lat 48.1234 deg -> NMEA-ish fixed point: deg*1e6 + min-coded
        // inverse of: deg + frac*100/60 -> stored = (deg + frac*0.6)*1e6
        let lat_val: u32 = 48_074_040; // 48 + 0.1234: 0.1234*0.6=0.07404
        let lon_val: u32 = 11_345_010; // 11.5750 -> 0.575*0.6=0.34501*...
        let alt_val: u32 = 532_000 / 10; // 532.0 m at 1e-2
        let mut sub0_words = [[0u16; 2]; 6];
        sub0_words[0][0] = counter;
        // time block 5: ms16 then hour/min
        let ms: u16 = 12_500;
        sub0_words[5][0] = ms;
        sub0_words[5][1] = (9 << 8) | 41; // 09:41 in the two 8-bit fields

        let mut sub1_words = [[0u16; 2]; 6];
        sub1_words[0][0] = 15_064; // day 15, month 06, year digit 4
        sub1_words[0][1] = (lat_val >> 16) as u16;
        sub1_words[1][0] = (lat_val & 0xFFFF) as u16;
        sub1_words[1][1] = (lon_val >> 16) as u16;
        sub1_words[2][0] = (lon_val & 0xFFFF) as u16;
        sub1_words[2][1] = (alt_val >> 8) as u16;
        sub1_words[3][0] = ((alt_val & 0xFF) << 8) as u16;
        sub1_words[4][1] = 9000; // heading 90.00
        sub1_words[5][0] = 1944; // 10 kn -> ~5.14 m/s
        gps_checksum(&sub0_words, &mut sub1_words);

        let sub0 = subframe(HEADER_BITS_0, sub0_words);
        let sub1 = subframe(HEADER_BITS_1, sub1_words);

        let mut meisei = Meisei::new(DemodConfig {
            ecc: EccLevel::Standard,
            ref_year: 2024,
            ..Default::default()
        });
        let recs = meisei.process(&pair_to_soft(&sub0, &sub1), &FrameCtx::default());
        // even pair stores, no record yet
        assert!(recs.is_empty());
        assert_eq!(meisei.counter, 4);
        assert_eq!(meisei.date, (2024, 6, 15));
        assert_eq!(meisei.time.0, 9);
        assert_eq!(meisei.time.1, 41);
        assert!((meisei.time.2 - 12.5).abs() < 1e-9);
        assert!((meisei.alt - 532.0).abs() < 1e-9);
        assert!((meisei.v_d - 90.0).abs() < 1e-9);
        assert!(meisei.frm0_valid);

        // odd-counter pair completes the cycle
        let mut sub0b_words = [[0u16; 2]; 6];
        sub0b_words[0][0] = counter + 1;
        let mut sub1b_words = [[0u16; 2]; 6];
        sub1b_words[0][1] = 97; // vV 5 m/s ~ 9.7 kn*10
        gps_checksum(&sub0b_words, &mut sub1b_words);
        let sub0b = subframe(HEADER_BITS_0, sub0b_words);
        let sub1b = subframe(HEADER_BITS_1, sub1b_words);
        let recs = meisei.process(&pair_to_soft(&sub0b, &sub1b), &FrameCtx::default());
        assert_eq!(recs.len(), 1);
        let r = &recs[0];
        assert_eq!(r.frame, Some(4));
        let dt = r.datetime.unwrap();
        assert_eq!((dt.year, dt.month, dt.day), (2024, 6, 15));
        assert!((r.v_v.unwrap() - 97.0 / 19.4384).abs() < 1e-6);
        assert!((r.alt.unwrap() - 532.0).abs() < 1e-9);
    }

    #[test]
    fn bch_repairs_subframe_bit_errors() {
        let mut sub0_words = [[0u16; 2]; 6];
        sub0_words[0][0] = 2;
        let mut sub1_words = [[0u16; 2]; 6];
        gps_checksum(&sub0_words, &mut sub1_words);
        let sub0 = subframe(HEADER_BITS_0, sub0_words);
        let sub1 = subframe(HEADER_BITS_1, sub1_words);

        let mut meisei = Meisei::new(DemodConfig {
            ecc: EccLevel::Standard,
            ..Default::default()
        });
        let mut soft = pair_to_soft(&sub0, &sub1);
        // corrupt one decoded bit inside the counter word (decoded bit
        // 30 of subframe 0 = raw pair starting at (30-24)*2 after the
        // consumed header); making the pair equal flips the bit
        let raw_idx = (30 - 24) * 2;
        soft[raw_idx + 1].hb = soft[raw_idx].hb ^ soft[raw_idx + 1].hb ^ 1;
        let _ = meisei.process(&soft, &FrameCtx::default());
        assert_eq!(meisei.counter, 2, "BCH must repair the counter block");
    }

    #[test]
    fn year_estimation() {
        assert_eq!(Meisei::est_year(4, 2024), 2024);
        assert_eq!(Meisei::est_year(9, 2024), 2019);
        assert_eq!(Meisei::est_year(0, 2024), 2020);
    }
}
