//! Vaisala RS41 frame interpreter.
//!
//! 4800 Bd GFSK, 320-byte standard frames (518 with xdata), whitened
//! with a 64-byte XOR mask and protected by two interleaved RS(255,231)
//! codewords plus per-packet CRC-16. Sub-packets are (type, len) tagged:
//! 7928 frame/id/battery + one calibration subframe per frame, 7A2A PTU,
//! 7C1E week/TOW, 7D59 raw GPS, 7B15 ECEF position/velocity, 7E00 xdata,
//! 7611 zero padding; 7F1B/80A7 on the SGM military variant, 8226/8329
//! on newer GNSS firmware.

use crate::config::{DemodConfig, EccLevel};
use crate::dsp::{HeaderSpec, SoftBit};
use crate::fec::crc::crc16_ccitt;
use crate::fec::ReedSolomon;
use crate::framing::dewhiten_rs41;
use crate::geo::{self, Geodetic};
use crate::ptu;
use crate::sonde::{FrameCtx, RecordTime, SondeDecoder, SondeKind, SondeRecord};

pub const HEADER: &str = "0000100001101101010100111000100001000100011010010100100000011111";
const HDR_BYTES: [u8; 8] = [0x86, 0x35, 0xF4, 0x40, 0x93, 0xDF, 0x1A, 0x60];

const NDATA_LEN: usize = 320;
const XDATA_LEN: usize = 198;
const FRAME_LEN: usize = NDATA_LEN + XDATA_LEN;
const FRAMESTART: usize = 8;

const BAUD: f32 = 4800.0;

// sub-packet ids and fixed positions
const PCK_FRAME: u16 = 0x7928;
const POS_FRAME: usize = 0x039;
const POS_FRAME_NB: usize = 0x03B;
const POS_SONDE_ID: usize = 0x03D;
const POS_BATT: usize = 0x045;
const POS_CALDATA: usize = 0x052;
const PCK_PTU: u16 = 0x7A2A;
const POS_PTU: usize = 0x065;
const PCK_GPS1: u16 = 0x7C1E;
const POS_GPS1: usize = 0x093;
const POS_GPS_WEEK: usize = 0x095;
const POS_GPS_ITOW: usize = 0x097;
const PCK_GPS2: u16 = 0x7D59;
const POS_GPS2: usize = 0x0B5;
const PCK_GPS3: u16 = 0x7B15;
const POS_GPS3: usize = 0x112;
const POS_NUM_SATS: usize = 0x126;
const PCK_ZERO: u16 = 0x7600;
const POS_ZERO_STD: usize = 0x12B;
const PCK_SGM_XTU: u16 = 0x7F1B;
const PCK_SGM_CRYPT: u16 = 0x80A7;
const PCK_POSDATETIME: u16 = 0x8226;
const PCK_SATS: u16 = 0x8329;

// crc status bits
const CRC_FRAME: u32 = 1 << 0;
const CRC_PTU: u32 = 1 << 1;
const CRC_GPS1: u32 = 1 << 2;
const CRC_GPS2: u32 = 1 << 3;
const CRC_GPS3: u32 = 1 << 4;
const CRC_AUX: u32 = 1 << 5;
const CRC_ZERO: u32 = 1 << 6;

// RS(255,231) interleave geometry
const RS_R: usize = 24;
const RS_K: usize = 231;
const PAR_POS: usize = 8;
const MSG_POS: usize = 56;

fn u2(b: &[u8]) -> u32 {
    b[0] as u32 | (b[1] as u32) << 8
}

fn u3(b: &[u8]) -> u32 {
    b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16
}

fn i2(b: &[u8]) -> i32 {
    i16::from_le_bytes([b[0], b[1]]) as i32
}

fn i4(b: &[u8]) -> i32 {
    i32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn cal_f32(cal: &[u8], ofs: usize) -> f32 {
    f32::from_le_bytes([cal[ofs], cal[ofs + 1], cal[ofs + 2], cal[ofs + 3]])
}

/// PTU calibration constants gathered from the subframe store.
#[derive(Debug, Clone)]
struct PtuCal {
    rf1: f32,
    rf2: f32,
    co1: [f32; 3],
    cal_t1: [f32; 3],
    co2: [f32; 3],
    cal_t2: [f32; 3],
    cal_h: [f32; 2],
    cf1: f32,
    cf2: f32,
    mtx_h: [f32; 42],
    cor_hp: [f32; 3],
    cor_ht: [f32; 12],
    cal_p: [f32; 25],
}

impl Default for PtuCal {
    fn default() -> Self {
        PtuCal {
            rf1: f32::default(),
            rf2: f32::default(),
            co1: Default::default(),
            cal_t1: Default::default(),
            co2: Default::default(),
            cal_t2: Default::default(),
            cal_h: Default::default(),
            cf1: f32::default(),
            cf2: f32::default(),
            mtx_h: [0.0; 42],
            cor_hp: Default::default(),
            cor_ht: Default::default(),
            cal_p: Default::default(),
        }
    }
}

impl PtuCal {
    fn from_calibytes(cal: &[u8]) -> Self {
        let mut c = PtuCal {
            rf1: cal_f32(cal, 61),
            rf2: cal_f32(cal, 65),
            cf1: cal_f32(cal, 69),
            cf2: cal_f32(cal, 73),
            ..Default::default()
        };
        for j in 0..3 {
            c.co1[j] = cal_f32(cal, 77 + 4 * j);
            c.cal_t1[j] = cal_f32(cal, 89 + 4 * j);
            c.co2[j] = cal_f32(cal, 293 + 4 * j);
            c.cal_t2[j] = cal_f32(cal, 305 + 4 * j);
        }
        c.cal_h[0] = cal_f32(cal, 117);
        c.cal_h[1] = cal_f32(cal, 121);
        for j in 0..42 {
            c.mtx_h[j] = cal_f32(cal, 125 + 4 * j);
        }
        for j in 0..3 {
            c.cor_hp[j] = cal_f32(cal, 678 + 4 * j);
        }
        for j in 0..12 {
            c.cor_ht[j] = cal_f32(cal, 698 + 4 * j);
        }
        // pressure polynomial, row-major scatter as stored on the sonde
        const CALP_MAP: [(usize, usize); 18] = [
            (0, 606),
            (4, 610),
            (8, 614),
            (12, 618),
            (16, 622),
            (20, 626),
            (24, 630),
            (1, 634),
            (5, 638),
            (9, 642),
            (13, 646),
            (2, 650),
            (6, 654),
            (10, 658),
            (14, 662),
            (3, 666),
            (7, 670),
            (11, 674),
        ];
        for &(idx, ofs) in &CALP_MAP {
            c.cal_p[idx] = cal_f32(cal, ofs);
        }
        c
    }
}

/// Error-correction bookkeeping carried across frames for the
/// predictive (level 4) stage.
#[derive(Debug, Clone, Copy, Default)]
struct EcData {
    ts: f64,
    last_frnb: u32,
    last_frnb_ts: f64,
    last_calfrm: u8,
    last_calfrm_ts: f64,
}

pub struct Rs41 {
    cfg: DemodConfig,
    rs: ReedSolomon,

    frame: [u8; FRAME_LEN],
    byte_score: [f32; FRAME_LEN],
    /// per byte: mask with the weakest bit set (level-3 toggles)
    bit_score: [u8; FRAME_LEN],

    id: String,
    calibytes: [u8; 51 * 16],
    calfrchk: [bool; 51],
    calconf_complete: bool,

    crc: u32,
    week: i32,
    gps_sec: u32,
    tow_ms: u32,
    alt: f64,
    ecdat: EcData,
}

impl Rs41 {
    pub fn new(cfg: DemodConfig) -> Self {
        Rs41 {
            cfg,
            rs: ReedSolomon::rs255(),
            frame: [0; FRAME_LEN],
            byte_score: [0.0; FRAME_LEN],
            bit_score: [0; FRAME_LEN],
            id: String::new(),
            calibytes: [0; 51 * 16],
            calfrchk: [false; 51],
            calconf_complete: false,
            crc: 0,
            week: 0,
            gps_sec: 0,
            tow_ms: 0,
            alt: 0.0,
            ecdat: EcData::default(),
        }
    }

    /// +4 for a standard 320-byte frame marker (0x0F), -4 for the
    /// extended 518-byte marker (0xF0).
    fn frametype(&self) -> i32 {
        let b = self.frame[POS_FRAME - 1];
        let mut ft = 0i32;
        for i in 0..4 {
            ft += ((b >> i) & 1) as i32 - ((b >> (i + 4)) & 1) as i32;
        }
        ft
    }

    fn frame_len(&self) -> usize {
        if self.frametype() < 0 {
            FRAME_LEN
        } else {
            NDATA_LEN
        }
    }

    /// Packet CRC: frame[pos] must carry the type byte, frame[pos+1] the
    /// payload length, followed by payload and CRC-16.
    fn check_crc(&self, pos: usize, pck: u16) -> bool {
        if self.frame[pos] != (pck >> 8) as u8 {
            return false;
        }
        let len = self.frame[pos + 1] as usize;
        if pos + len + 4 > FRAME_LEN {
            return false;
        }
        let stored = u2(&self.frame[pos + 2 + len..]);
        stored == crc16_ccitt(&self.frame[pos + 2..pos + 2 + len], 0xFFFF) as u32
    }

    // ---- ECC ---------------------------------------------------------

    fn fill_codewords(&self, cw1: &mut [u8; 255], cw2: &mut [u8; 255]) {
        for i in 0..RS_R {
            cw1[i] = self.frame[PAR_POS + i];
            cw2[i] = self.frame[PAR_POS + RS_R + i];
        }
        for i in 0..RS_K {
            cw1[RS_R + i] = self.frame[MSG_POS + 2 * i];
            cw2[RS_R + i] = self.frame[MSG_POS + 2 * i + 1];
        }
    }

    fn store_codewords(&mut self, cw1: &[u8; 255], cw2: &[u8; 255]) {
        for i in 0..RS_R {
            self.frame[PAR_POS + i] = cw1[i];
            self.frame[PAR_POS + RS_R + i] = cw2[i];
        }
        for i in 0..RS_K {
            self.frame[MSG_POS + 2 * i] = cw1[RS_R + i];
            self.frame[MSG_POS + 2 * i + 1] = cw2[RS_R + i];
        }
    }

    /// Frame position -> codeword position for codeword `sub` (1 or 2).
    fn cw_pos(pos_frm: usize, sub: u8) -> Option<usize> {
        let pos = if pos_frm < MSG_POS {
            let par_base = if sub == 2 { PAR_POS + RS_R } else { PAR_POS };
            (pos_frm as i64) - par_base as i64
        } else {
            RS_R as i64 + ((pos_frm - MSG_POS) / 2) as i64
        };
        if (0..255).contains(&pos) {
            Some(pos as usize)
        } else {
            None
        }
    }

    fn in_fixed(&self, idx: usize, frmset: &[usize]) -> bool {
        for &p in &[POS_FRAME, POS_PTU, POS_GPS1, POS_GPS2, POS_GPS3] {
            if idx == p || idx == p + 1 {
                return true;
            }
        }
        if self.frametype() >= -2 && (POS_ZERO_STD..NDATA_LEN).contains(&idx) {
            return true;
        }
        frmset.contains(&idx)
    }

    /// Frame positions of codeword `sub`, sorted by ascending byte score.
    fn sorted_positions(&self, sub: u8) -> Vec<usize> {
        let mut idx: Vec<usize> = if sub == 1 {
            (PAR_POS..PAR_POS + RS_R)
                .chain((0..RS_K).map(|i| MSG_POS + 2 * i))
                .collect()
        } else {
            (PAR_POS + RS_R..PAR_POS + 2 * RS_R)
                .chain((0..RS_K).map(|i| MSG_POS + 2 * i + 1))
                .collect()
        };
        idx.sort_by(|&a, &b| {
            self.byte_score[a]
                .partial_cmp(&self.byte_score[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        idx
    }

    /// Write the known bytes `src` into the frame, restricted to the
    /// byte positions belonging to codeword `sub`; records set positions.
    fn set_bytes(&mut self, pos: usize, src: &[u8], sub: u8, frmset: &mut Vec<usize>) {
        let rem = if sub == 2 { 1 } else { 0 };
        for (i, &b) in src.iter().enumerate() {
            if (pos + i) % 2 == rem {
                self.frame[pos + i] = b;
                frmset.push(pos + i);
            }
        }
    }

    /// Full ECC pass with escalation; returns the corrected-symbol count
    /// or None when a codeword stays uncorrectable.
    fn rs41_ecc(&mut self, frmlen: usize) -> Option<u32> {
        let frmlen = frmlen.min(FRAME_LEN);
        for i in frmlen..FRAME_LEN {
            self.frame[i] = 0;
        }

        let mut cw1 = [0u8; 255];
        let mut cw2 = [0u8; 255];
        self.fill_codewords(&mut cw1, &mut cw2);

        let mut errors1 = self.rs.decode(&mut cw1).ok();
        let mut errors2 = self.rs.decode(&mut cw2).ok();

        if self.cfg.ecc >= EccLevel::KnownBytes && (errors1.is_none() || errors2.is_none()) {
            // second pass: force the packet type bytes and padding to
            // their known values
            for (pos, pck) in [
                (POS_FRAME, PCK_FRAME),
                (POS_PTU, PCK_PTU),
                (POS_GPS1, PCK_GPS1),
                (POS_GPS2, PCK_GPS2),
                (POS_GPS3, PCK_GPS3),
            ] {
                self.frame[pos] = (pck >> 8) as u8;
                self.frame[pos + 1] = pck as u8;
            }
            if self.frametype() < -2 {
                for i in NDATA_LEN + 7..FRAME_LEN - 2 {
                    self.frame[i] = 0;
                }
            } else {
                for i in NDATA_LEN..FRAME_LEN {
                    self.frame[i] = 0;
                }
                self.frame[POS_ZERO_STD] = 0x76;
                self.frame[POS_ZERO_STD + 1] = 0x11;
                for i in POS_ZERO_STD + 2..NDATA_LEN - 2 {
                    self.frame[i] = 0;
                }
                self.frame[NDATA_LEN - 2] = 0xEC;
                self.frame[NDATA_LEN - 1] = 0xC7;
            }
            self.fill_codewords(&mut cw1, &mut cw2);
            errors1 = self.rs.decode(&mut cw1).ok();
            errors2 = self.rs.decode(&mut cw2).ok();
        }

        let mut frmset: Vec<usize> = Vec::new();
        if self.cfg.ecc >= EccLevel::Predictive {
            // patch in the id, the expected calibration subframe and the
            // extrapolated frame number, per codeword
            let frnb_ts = self.ecdat.ts - self.ecdat.last_frnb_ts + 0.5;
            let frnb = self.ecdat.last_frnb.wrapping_add(frnb_ts as u32);
            let calfr_ts = self.ecdat.ts - self.ecdat.last_calfrm_ts + 0.5;
            let calfr = ((self.ecdat.last_calfrm as u32 + calfr_ts as u32) % 51) as u8;

            for sub in [1u8, 2u8] {
                let failed = if sub == 1 {
                    errors1.is_none()
                } else {
                    errors2.is_none()
                };
                if !failed {
                    continue;
                }
                if !self.check_crc(POS_FRAME, PCK_FRAME) {
                    if !self.id.is_empty()
                        && self.frame[POS_SONDE_ID..POS_SONDE_ID + 8] != *self.id.as_bytes()
                    {
                        let id = self.id.clone().into_bytes();
                        self.set_bytes(POS_SONDE_ID, &id, sub, &mut frmset);
                    }
                    if !self.check_crc(POS_FRAME, PCK_FRAME)
                        && self.calfrchk[calfr as usize]
                        && self.frame[POS_CALDATA] == calfr
                    {
                        let slot: Vec<u8> = self.calibytes
                            [calfr as usize * 16..calfr as usize * 16 + 16]
                            .to_vec();
                        self.set_bytes(POS_CALDATA + 1, &slot, sub, &mut frmset);
                    }
                    if !self.check_crc(POS_FRAME, PCK_FRAME) && self.ecdat.last_frnb > 0 {
                        if sub == 1 && ((frnb >> 8) & 0xFF) as u8 != self.frame[POS_FRAME_NB + 1] {
                            self.frame[POS_FRAME_NB + 1] = (frnb >> 8) as u8;
                            frmset.push(POS_FRAME_NB + 1);
                        }
                        if sub == 2 && (frnb & 0xFF) as u8 != self.frame[POS_FRAME_NB] {
                            self.frame[POS_FRAME_NB] = frnb as u8;
                            frmset.push(POS_FRAME_NB);
                        }
                    }
                }
                if sub == 1 {
                    for i in 0..RS_K {
                        cw1[RS_R + i] = self.frame[MSG_POS + 2 * i];
                    }
                    errors1 = self.rs.decode(&mut cw1).ok();
                } else {
                    for i in 0..RS_K {
                        cw2[RS_R + i] = self.frame[MSG_POS + 2 * i + 1];
                    }
                    errors2 = self.rs.decode(&mut cw2).ok();
                }
            }
        }

        if self.cfg.ecc >= EccLevel::SoftErasures {
            // erasure pairs over the lowest-score bytes, optionally
            // toggling one weak bit; 11 errors + 2 erasures per codeword
            const ERA_MAX: usize = 12;
            for sub in [1u8, 2u8] {
                let failed = if sub == 1 {
                    errors1.is_none()
                } else {
                    errors2.is_none()
                };
                if !failed {
                    continue;
                }
                let sorted = self.sorted_positions(sub);
                let cw: &mut [u8; 255] = if sub == 1 { &mut cw1 } else { &mut cw2 };
                let mut result = None;

                'outer: for i in 1..ERA_MAX {
                    let pos_i = sorted[i];
                    if self.in_fixed(pos_i, &frmset) {
                        continue;
                    }
                    let Some(cw_i) = Self::cw_pos(pos_i, sub) else {
                        continue;
                    };
                    for j in 0..i {
                        let pos_j = sorted[j];
                        if self.in_fixed(pos_j, &frmset) {
                            continue;
                        }
                        let Some(cw_j) = Self::cw_pos(pos_j, sub) else {
                            continue;
                        };
                        let era = [cw_i as u8, cw_j as u8];

                        for k in 0..=j {
                            if k > 0 {
                                let pos_k = sorted[k - 1];
                                if self.in_fixed(pos_k, &frmset) {
                                    continue;
                                }
                                let Some(cw_k) = Self::cw_pos(pos_k, sub) else {
                                    continue;
                                };
                                cw[cw_k] ^= self.bit_score[pos_k];
                            }
                            if let Ok(n) = self.rs.decode_with_erasures(cw, &era) {
                                result = Some(n);
                                break 'outer;
                            }
                        }
                    }
                }
                if sub == 1 {
                    errors1 = errors1.or(result);
                } else {
                    errors2 = errors2.or(result);
                }
            }
        }

        match (errors1, errors2) {
            (Some(e1), Some(e2)) => {
                self.store_codewords(&cw1, &cw2);
                Some((e1 + e2) as u32)
            }
            _ => None,
        }
    }

    // ---- field extraction -------------------------------------------

    fn get_frame_conf(&mut self, rec: &mut SondeRecord) {
        let crc_ok = self.check_crc(POS_FRAME, PCK_FRAME);
        if !crc_ok {
            self.crc |= CRC_FRAME;
        }

        let frnr = u2(&self.frame[POS_FRAME_NB..]);
        let batt = self.frame[POS_BATT] as f64 / 10.0;

        if crc_ok {
            let id_bytes = &self.frame[POS_SONDE_ID..POS_SONDE_ID + 8];
            let id = String::from_utf8_lossy(id_bytes).into_owned();
            if self.id != id {
                // new sonde: drop all calibration-derived state
                self.calfrchk = [false; 51];
                self.calconf_complete = false;
                self.week = 0;
                self.ecdat.last_frnb = 0;
                self.id = id;
            }

            rec.frame = Some(frnr);
            rec.id = Some(self.id.clone());
            rec.battery = Some(batt);

            self.ecdat.last_frnb = frnr;
            self.ecdat.last_frnb_ts = self.ecdat.ts;

            let calfr = self.frame[POS_CALDATA] as usize;
            if calfr < 51 {
                if !self.calfrchk[calfr] {
                    for i in 0..16 {
                        self.calibytes[calfr * 16 + i] = self.frame[POS_CALDATA + 1 + i];
                    }
                    self.calfrchk[calfr] = true;
                }
                match self.cfg.emit_subframe {
                    1 => {
                        let hex: String = self.frame[POS_CALDATA..POS_CALDATA + 17]
                            .iter()
                            .map(|b| format!("{:02x}", b))
                            .collect();
                        rec.subframe = Some(hex);
                    }
                    2 if self.calconf_complete => {
                        rec.subframe = Some(
                            self.calibytes.iter().map(|b| format!("{:02x}", b)).collect(),
                        );
                    }
                    _ => {}
                }
                self.ecdat.last_calfrm = calfr as u8;
                self.ecdat.last_calfrm_ts = self.ecdat.ts;

                if !self.calconf_complete && self.calfrchk.iter().all(|&c| c) {
                    // CRC over the constant part seals completeness
                    // (subframe 0x32 is variable and excluded)
                    let dat = u2(&self.calibytes[0..2]);
                    let crc = crc16_ccitt(&self.calibytes[2..50 * 16], 0xFFFF) as u32;
                    if dat == crc {
                        self.calconf_complete = true;
                    }
                }
            }
        }
    }

    fn get_gps1(&mut self, pos: usize, rec: &mut SondeRecord) {
        if !self.check_crc(pos, PCK_GPS1) {
            self.crc |= CRC_GPS1;
            return;
        }
        let ofs = pos - POS_GPS1;
        let week = u2(&self.frame[POS_GPS_WEEK + ofs..]) as i32;
        let itow = u2(&self.frame[POS_GPS_ITOW + ofs..])
            | (u2(&self.frame[POS_GPS_ITOW + ofs + 2..]) << 16);

        self.week = week;
        self.tow_ms = itow;
        let t = geo::tow_ms_split(itow);
        self.gps_sec = t.gps_sec;

        let date = geo::gps_to_date(week, t.gps_sec);
        rec.week = Some(week);
        rec.datetime = Some(RecordTime {
            year: date.year,
            month: date.month,
            day: date.day,
            hour: t.hour,
            min: t.min,
            sec: t.sec,
            is_utc: false,
        });
    }

    fn get_ecef(&mut self, pos_ecef: usize, rec: &mut SondeRecord) -> bool {
        let mut x = [0f64; 3];
        let mut v = [0f64; 3];
        for k in 0..3 {
            x[k] = i4(&self.frame[pos_ecef + 4 * k..]) as f64 / 100.0;
            v[k] = i2(&self.frame[pos_ecef + 12 + 2 * k..]) as f64 / 100.0;
        }

        let g = geo::ecef_to_geodetic(x);
        if !SondeRecord::plausible_alt(g.alt) {
            return false;
        }
        let vel = geo::ecef_vel_to_hdv(v, Geodetic { ..g });

        self.alt = g.alt;
        rec.lat = Some(g.lat);
        rec.lon = Some(g.lon);
        rec.alt = Some(g.alt);
        rec.v_h = Some(vel.v_h);
        rec.v_d = Some(vel.v_d);
        rec.v_v = Some(vel.v_v);
        true
    }

    fn get_gps3(&mut self, pos: usize, rec: &mut SondeRecord) {
        if !self.check_crc(pos, PCK_GPS3) {
            self.crc |= CRC_GPS3;
            return;
        }
        if self.get_ecef(pos + 2, rec) {
            rec.num_sv = Some(self.frame[POS_NUM_SATS + (pos - POS_GPS3)] as u32);
        }
    }

    /// Newer GNSS firmware: ECEF + UTC date/time in one packet.
    fn get_posdatetime(&mut self, pos: usize, rec: &mut SondeRecord) {
        if !self.check_crc(pos, PCK_POSDATETIME) {
            self.crc |= CRC_GPS1 | CRC_GPS3;
            return;
        }
        self.get_ecef(pos + 2, rec);
        let year = u2(&self.frame[pos + 20..]) as i32;
        let sec = self.frame[pos + 26] as f64
            + if self.frame[pos + 27] < 100 {
                self.frame[pos + 27] as f64 / 100.0
            } else {
                0.0
            };
        rec.datetime = Some(RecordTime {
            year,
            month: self.frame[pos + 22] as u32,
            day: self.frame[pos + 23] as u32,
            hour: self.frame[pos + 24] as u32,
            min: self.frame[pos + 25] as u32,
            sec,
            is_utc: true,
        });
    }

    /// GNSS sat-status packet: count active entries for numSV.
    fn get_gnss_svs(&mut self, pos: usize, rec: &mut SondeRecord) {
        if !self.check_crc(pos, PCK_SATS) {
            self.crc |= CRC_GPS2;
            return;
        }
        let mut cnt = 0u32;
        for j in 0..16 {
            let b = self.frame[pos + 2 + 4 + 21 + j];
            if b & 0x0F != 0 {
                cnt += 1;
            }
            if b & 0xF0 != 0 {
                cnt += 1;
            }
        }
        rec.num_sv = Some(cnt);
    }

    // ---- PTU ---------------------------------------------------------

    fn get_t(&self, cal: &PtuCal, f: u32, f1: u32, f2: u32, co: &[f32; 3], cal_t: &[f32; 3]) -> f64 {
        let g = (f2 as f64 - f1 as f64) / (cal.rf2 as f64 - cal.rf1 as f64);
        let rb = (f1 as f64 * cal.rf2 as f64 - f2 as f64 * cal.rf1 as f64)
            / (f2 as f64 - f1 as f64);
        let rc = f as f64 / g - rb;
        let r = rc * cal_t[0] as f64;
        (co[0] as f64 + co[1] as f64 * r + co[2] as f64 * r * r + cal_t[1] as f64)
            * (1.0 + cal_t[2] as f64)
    }

    fn get_rh_emp(&self, cal: &PtuCal, f: u32, f1: u32, f2: u32, t: f64) -> f64 {
        let a0 = 7.5;
        let a1 = 350.0 / cal.cal_h[0] as f64;
        let fh = (f as f64 - f1 as f64) / (f2 as f64 - f1 as f64);
        let mut rh = 100.0 * (a1 * fh - a0);
        rh += -t / 5.5;
        if t < -20.0 {
            rh *= 1.0 + (-20.0 - t) / 100.0;
        }
        if t < -40.0 {
            rh *= 1.0 + (-40.0 - t) / 120.0;
        }
        rh = rh.clamp(0.0, 100.0);
        if t < -273.0 {
            rh = -1.0;
        }
        rh
    }

    fn get_rh2_adv(
        &self,
        cal: &PtuCal,
        f: u32,
        f1: u32,
        f2: u32,
        t: f64,
        th: f64,
        p: f64,
    ) -> f64 {
        let cfh = (f as f64 - f1 as f64) / (f2 as f64 - f1 as f64);
        let cap = cal.cf1 as f64 + (cal.cf2 as f64 - cal.cf1 as f64) * cfh;
        let mut cp = (cap / cal.cal_h[0] as f64 - 1.0) * cal.cal_h[1] as f64;
        let trh = (th - 20.0) / 180.0;

        let mut b = [1.0f64; 6];
        for k in 1..6 {
            b[k] = b[k - 1] * trh;
        }

        if p > 0.0 {
            let pb = p / 1000.0;
            let mut cpj = 1.0;
            let mut bp = [0.0f64; 3];
            for j in 0..3 {
                let hp = cal.cor_hp[j] as f64;
                bp[j] = hp * (pb / (1.0 + hp * pb) - cpj / (1.0 + hp));
                cpj *= cp;
            }
            let mut corr = 0.0;
            for j in 0..3 {
                let mut bt = 0.0;
                for k in 0..4 {
                    bt += cal.cor_ht[4 * j + k] as f64 * b[k];
                }
                corr += bp[j] * bt;
            }
            cp -= corr;
        }

        let mut rh = 0.0;
        let mut aj = 1.0;
        for j in 0..7 {
            for k in 0..6 {
                rh += aj * b[k] * cal.mtx_h[6 * j + k] as f64;
            }
            aj *= cp;
        }

        if p <= 0.0 && t < -40.0 {
            rh += (t + 40.0) / 12.0;
        }

        rh *= ptu::vapor_sat_p(th) / ptu::vapor_sat_p(t);
        rh.clamp(0.0, 100.0)
    }

    fn get_p(&self, cal: &PtuCal, f: u32, f1: u32, f2: u32, fx: i32) -> f64 {
        if f1 == f2 || f1 == f {
            return 0.0;
        }
        let a0 = cal.cal_p[24] as f64 / ((f as f64 - f1 as f64) / (f2 as f64 - f1 as f64));
        let a1 = fx as f64 * 0.01;

        let mut p = 0.0;
        let mut a0j = 1.0;
        for j in 0..6 {
            let mut a1k = 1.0;
            for k in 0..4 {
                p += a0j * a1k * cal.cal_p[j * 4 + k] as f64;
                a1k *= a1;
            }
            a0j *= a0;
        }
        p
    }

    fn get_ptu(&mut self, pos: usize, pck: u16, valid_alt: bool, rec: &mut SondeRecord) {
        if !self.check_crc(pos, pck) {
            self.crc |= CRC_PTU;
            return;
        }
        if self.cfg.ptu == 0 {
            return;
        }

        let cal = PtuCal::from_calibytes(&self.calibytes);
        let mut meas = [0u32; 12];
        for (i, m) in meas.iter_mut().enumerate() {
            *m = u3(&self.frame[pos + 2 + 3 * i..]);
        }

        let chk = &self.calfrchk;
        let b_r = chk[0x03] && chk[0x04];
        let b_c1 = chk[0x04] && chk[0x05];
        let b_t1 = chk[0x05] && chk[0x06];
        let b_c2 = chk[0x12] && chk[0x13];
        let b_t2 = chk[0x13];
        let b_h = chk[0x07];
        let b_h2 = (0x07..=0x12).all(|i| chk[i]) && (0x2A..=0x2E).all(|i| chk[i]);
        let b_p = chk[0x21]
            && self.calibytes[0x21F] == b'P'
            && (0x25..=0x2A).all(|i| chk[i]);

        let mut tc = -273.15;
        let mut th = -273.15;
        if b_r && b_c1 && b_t1 {
            tc = self.get_t(&cal, meas[0], meas[1], meas[2], &cal.co1, &cal.cal_t1);
            rec.temperature = Some(tc);
        }
        if b_r && b_c2 && b_t2 {
            th = self.get_t(&cal, meas[6], meas[7], meas[8], &cal.co2, &cal.cal_t2);
        }
        if b_h && tc > -273.0 {
            rec.humidity = Some(self.get_rh_emp(&cal, meas[3], meas[4], meas[5], tc));
        }
        let mut p = -1.0;
        if b_p {
            p = self.get_p(&cal, meas[9], meas[10], meas[11], i2(&self.frame[pos + 2 + 38..]));
            if p > 0.0 {
                rec.pressure = Some(p);
            }
        }
        if self.cfg.ptu == 2 {
            // advanced humidity needs a pressure estimate
            let p_est = if b_p && p > 0.0 {
                p
            } else if valid_alt {
                ptu::pressure_from_alt(self.alt)
            } else {
                -1.0
            };
            if b_h && b_h2 && tc > -273.0 && th > -273.0 {
                rec.humidity = Some(self.get_rh2_adv(
                    &cal, meas[3], meas[4], meas[5], tc, th, p_est,
                ));
            }
        }
    }

    /// Walk the (type, len)-tagged sub-packets of a corrected frame.
    fn interpret(&mut self, ctx: &FrameCtx, ecc: Option<u32>) -> SondeRecord {
        let mut rec = SondeRecord::new(SondeKind::Rs41);
        self.crc = 0;
        self.ecdat.ts = ctx.time_s;

        let flen = self.frame_len();
        let mut ptu_pos = 0usize;
        let mut ptu_pck = 0u16;

        let mut pos = POS_FRAME;
        while pos < flen - 1 {
            let blk = self.frame[pos];
            let len = self.frame[pos + 1] as usize;
            let pck = (blk as u16) << 8 | len as u16;

            if !self.check_crc(pos, (blk as u16) << 8) {
                // unknown or corrupt sub-packet ends the walk; flag the
                // region it belongs to
                match pos {
                    POS_FRAME => self.crc |= CRC_FRAME,
                    POS_PTU => self.crc |= CRC_PTU,
                    POS_GPS1 => self.crc |= CRC_GPS1,
                    POS_GPS2 => self.crc |= CRC_GPS2,
                    POS_GPS3 => self.crc |= CRC_GPS3,
                    _ => self.crc |= CRC_AUX,
                }
                break;
            }

            match pck {
                PCK_FRAME => self.get_frame_conf(&mut rec),
                PCK_PTU => {
                    ptu_pos = pos;
                    ptu_pck = PCK_PTU;
                }
                PCK_GPS1 => self.get_gps1(pos, &mut rec),
                PCK_GPS2 => {} // raw pseudorange/doppler block, not used
                PCK_GPS3 => self.get_gps3(pos, &mut rec),
                PCK_SGM_XTU => {
                    ptu_pos = pos;
                    ptu_pck = PCK_SGM_XTU;
                }
                PCK_SGM_CRYPT => {
                    rec.encrypted = true;
                }
                PCK_POSDATETIME => self.get_posdatetime(pos, &mut rec),
                PCK_SATS => self.get_gnss_svs(pos, &mut rec),
                // 0x7Exx xdata chains and 0x76xx zero padding walk by,
                // already CRC-validated above
                _ => {}
            }
            pos += 2 + len + 2;
        }

        if ptu_pck != 0 {
            let valid_alt = rec.alt.is_some();
            self.get_ptu(ptu_pos, ptu_pck, valid_alt, &mut rec);
        }

        rec.crc_ok = self.crc & (CRC_FRAME | CRC_GPS1 | CRC_GPS3) == 0;
        rec.ecc_corrected = ecc.filter(|&n| n > 0);
        if ctx.raw {
            rec.raw = Some(
                self.frame[..self.frame_len()]
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect(),
            );
        }
        rec
    }

    fn decode_frame(&mut self, ctx: &FrameCtx) -> Vec<SondeRecord> {
        let ecc = if self.cfg.ecc.enabled() {
            let flen = self.frame_len();
            self.rs41_ecc(flen)
        } else {
            None
        };
        // an unrepaired frame is still walked; the per-packet CRCs gate
        // every field
        vec![self.interpret(ctx, ecc)]
    }
}

impl SondeDecoder for Rs41 {
    fn kind(&self) -> SondeKind {
        SondeKind::Rs41
    }

    fn header_spec(&self) -> HeaderSpec {
        HeaderSpec::from_str(HEADER, 1, 1, 0.5, 0.6)
    }

    fn baud(&self) -> f32 {
        BAUD
    }

    fn frame_bits(&self) -> usize {
        (FRAME_LEN - FRAMESTART) * 8
    }

    fn process(&mut self, bits: &[SoftBit], ctx: &FrameCtx) -> Vec<SondeRecord> {
        self.frame = [0; FRAME_LEN];
        self.frame[..FRAMESTART].copy_from_slice(&HDR_BYTES);
        self.byte_score = [0.0; FRAME_LEN];
        self.bit_score = [0; FRAME_LEN];

        // LSB-first byte assembly with per-byte confidence bookkeeping
        let nbytes = (bits.len() / 8).min(FRAME_LEN - FRAMESTART);
        for i in 0..nbytes {
            let mut byte = 0u8;
            let mut score = 0f32;
            let mut weakest = (f32::INFINITY, 0usize);
            for j in 0..8 {
                let sb = bits[8 * i + j];
                byte |= (sb.hb & 1) << j;
                score += sb.sb.abs();
                if sb.sb.abs() < weakest.0 {
                    weakest = (sb.sb.abs(), j);
                }
            }
            self.frame[FRAMESTART + i] = byte;
            self.byte_score[FRAMESTART + i] = score;
            self.bit_score[FRAMESTART + i] = 1 << weakest.1;
        }
        dewhiten_rs41(&mut self.frame[FRAMESTART..FRAMESTART + nbytes], FRAMESTART);

        self.decode_frame(ctx)
    }

    fn process_bytes(&mut self, bytes: &[u8], ctx: &FrameCtx) -> Vec<SondeRecord> {
        self.frame = [0; FRAME_LEN];
        let n = bytes.len().min(FRAME_LEN);
        self.frame[..n].copy_from_slice(&bytes[..n]);
        // equal confidence everywhere in bypass mode
        self.byte_score = [8.0; FRAME_LEN];
        self.bit_score = [1; FRAME_LEN];
        self.decode_frame(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sonde::soft_from_hard;

    /// Build a minimal valid standard frame: FRAME + GPS1 + GPS3
    /// sub-packets with correct CRCs, RS parity and whitening.
    fn build_frame(frnr: u16, id: &[u8; 8], ecef: [f64; 3]) -> ([u8; FRAME_LEN], Rs41) {
        let mut rs41 = Rs41::new(DemodConfig {
            ecc: EccLevel::Standard,
            ptu: 1,
            ..Default::default()
        });

        let mut f = [0u8; FRAME_LEN];
        f[..8].copy_from_slice(&HDR_BYTES);
        f[POS_FRAME - 1] = 0x0F; // standard frame

        // FRAME sub-packet: type 0x79, len 0x28
        f[POS_FRAME] = 0x79;
        f[POS_FRAME + 1] = 0x28;
        f[POS_FRAME_NB] = frnr as u8;
        f[POS_FRAME_NB + 1] = (frnr >> 8) as u8;
        f[POS_SONDE_ID..POS_SONDE_ID + 8].copy_from_slice(id);
        f[POS_BATT] = 29; // 2.9 V
        f[POS_CALDATA] = 0x00;
        let crc = crc16_ccitt(&f[POS_FRAME + 2..POS_FRAME + 2 + 0x28], 0xFFFF);
        f[POS_FRAME + 2 + 0x28] = crc as u8;
        f[POS_FRAME + 2 + 0x28 + 1] = (crc >> 8) as u8;

        // PTU: zero measurements (no calibration captured in the test)
        f[POS_PTU] = 0x7A;
        f[POS_PTU + 1] = 0x2A;
        let crc = crc16_ccitt(&f[POS_PTU + 2..POS_PTU + 2 + 0x2A], 0xFFFF);
        f[POS_PTU + 2 + 0x2A] = crc as u8;
        f[POS_PTU + 2 + 0x2A + 1] = (crc >> 8) as u8;

        // GPS1: week + iTOW
        f[POS_GPS1] = 0x7C;
        f[POS_GPS1 + 1] = 0x1E;
        let week = 2300u16;
        f[POS_GPS_WEEK] = week as u8;
        f[POS_GPS_WEEK + 1] = (week >> 8) as u8;
        let itow: u32 = ((2 * 24 + 10) * 3600 + 30 * 60) * 1000;
        f[POS_GPS_ITOW..POS_GPS_ITOW + 4].copy_from_slice(&itow.to_le_bytes());
        let crc = crc16_ccitt(&f[POS_GPS1 + 2..POS_GPS1 + 2 + 0x1E], 0xFFFF);
        f[POS_GPS1 + 2 + 0x1E] = crc as u8;
        f[POS_GPS1 + 2 + 0x1E + 1] = (crc >> 8) as u8;

        // GPS2: raw sat block, zero payload
        f[POS_GPS2] = 0x7D;
        f[POS_GPS2 + 1] = 0x59;
        let crc = crc16_ccitt(&f[POS_GPS2 + 2..POS_GPS2 + 2 + 0x59], 0xFFFF);
        f[POS_GPS2 + 2 + 0x59] = crc as u8;
        f[POS_GPS2 + 2 + 0x59 + 1] = (crc >> 8) as u8;

        // GPS3: ECEF cm + vel
        f[POS_GPS3] = 0x7B;
        f[POS_GPS3 + 1] = 0x15;
        for k in 0..3 {
            let cm = (ecef[k] * 100.0) as i32;
            f[POS_GPS3 + 2 + 4 * k..POS_GPS3 + 2 + 4 * k + 4]
                .copy_from_slice(&cm.to_le_bytes());
        }
        for k in 0..3 {
            let v = (k as i16 + 1) * 100; // 1, 2, 3 m/s ECEF
            f[POS_GPS3 + 14 + 2 * k..POS_GPS3 + 14 + 2 * k + 2]
                .copy_from_slice(&v.to_le_bytes());
        }
        f[POS_NUM_SATS] = 9;
        let crc = crc16_ccitt(&f[POS_GPS3 + 2..POS_GPS3 + 2 + 0x15], 0xFFFF);
        f[POS_GPS3 + 2 + 0x15] = crc as u8;
        f[POS_GPS3 + 2 + 0x15 + 1] = (crc >> 8) as u8;

        // zero block seals the standard frame
        f[POS_ZERO_STD] = 0x76;
        f[POS_ZERO_STD + 1] = 0x11;
        let zlen = 0x11;
        let crc = crc16_ccitt(&f[POS_ZERO_STD + 2..POS_ZERO_STD + 2 + zlen], 0xFFFF);
        f[POS_ZERO_STD + 2 + zlen] = crc as u8;
        f[POS_ZERO_STD + 2 + zlen + 1] = (crc >> 8) as u8;

        // RS parity over the interleaved codewords
        let rs = ReedSolomon::rs255();
        let mut cw1 = [0u8; 255];
        let mut cw2 = [0u8; 255];
        for i in 0..RS_K {
            cw1[RS_R + i] = f[MSG_POS + 2 * i];
            cw2[RS_R + i] = f[MSG_POS + 2 * i + 1];
        }
        rs.encode(&mut cw1);
        rs.encode(&mut cw2);
        for i in 0..RS_R {
            f[PAR_POS + i] = cw1[i];
            f[PAR_POS + RS_R + i] = cw2[i];
        }

        (f, rs41)
    }

    fn frame_to_bits(f: &[u8; FRAME_LEN]) -> Vec<u8> {
        // whiten and serialize LSB-first, as on the wire
        let mut w = *f;
        dewhiten_rs41(&mut w[FRAMESTART..], FRAMESTART);
        w[FRAMESTART..]
            .iter()
            .flat_map(|&b| (0..8).map(move |j| (b >> j) & 1))
            .collect()
    }

    #[test]
    fn decodes_clean_frame() {
        let ecef = geo::geodetic_to_ecef(geo::Geodetic {
            lat: 51.2345,
            lon: 12.3456,
            alt: 10123.45,
        });
        let (f, mut rs41) = build_frame(1234, b"R1234567", ecef);
        let bits = frame_to_bits(&f);
        let recs = rs41.process(&soft_from_hard(&bits), &FrameCtx::default());
        assert_eq!(recs.len(), 1);
        let r = &recs[0];
        assert!(r.crc_ok);
        assert_eq!(r.frame, Some(1234));
        assert_eq!(r.id.as_deref(), Some("R1234567"));
        assert!((r.lat.unwrap() - 51.2345).abs() < 1e-5);
        assert!((r.lon.unwrap() - 12.3456).abs() < 1e-5);
        assert!((r.alt.unwrap() - 10123.45).abs() < 0.5);
        assert_eq!(r.num_sv, Some(9));
        let dt = r.datetime.unwrap();
        assert_eq!((dt.year, dt.month, dt.day), (2024, 2, 6));
        assert_eq!((dt.hour, dt.min), (10, 30));
    }

    #[test]
    fn corrects_byte_errors_with_rs() {
        let ecef = geo::geodetic_to_ecef(geo::Geodetic {
            lat: 40.0,
            lon: -105.0,
            alt: 5000.0,
        });
        let (f, mut rs41) = build_frame(77, b"S0123456", ecef);
        let mut bits = frame_to_bits(&f);
        // corrupt 10 whole bytes spread over both codewords
        for byte in [20usize, 60, 61, 100, 101, 160, 161, 200, 240, 280] {
            for j in 0..8 {
                bits[8 * byte + j] ^= 1;
            }
        }
        let recs = rs41.process(&soft_from_hard(&bits), &FrameCtx::default());
        let r = &recs[0];
        assert!(r.crc_ok, "RS must repair 10 byte errors");
        assert!(r.ecc_corrected.unwrap_or(0) >= 10);
        assert_eq!(r.frame, Some(77));
    }

    #[test]
    fn uncorrectable_without_ecc_flags_crc() {
        let ecef = geo::geodetic_to_ecef(geo::Geodetic {
            lat: 40.0,
            lon: -105.0,
            alt: 5000.0,
        });
        let (f, _) = build_frame(5, b"T7654321", ecef);
        let mut rs41 = Rs41::new(DemodConfig::default()); // ecc off
        let mut bits = frame_to_bits(&f);
        // hit the FRAME packet payload
        for j in 0..8 {
            bits[8 * (POS_FRAME_NB - FRAMESTART) + j] ^= 1;
        }
        let recs = rs41.process(&soft_from_hard(&bits), &FrameCtx::default());
        assert!(!recs[0].crc_ok);
        assert_eq!(recs[0].frame, None);
    }

    #[test]
    fn rawhex_bypass_decodes() {
        let ecef = geo::geodetic_to_ecef(geo::Geodetic {
            lat: -33.9,
            lon: 18.4,
            alt: 100.0,
        });
        let (f, mut rs41) = build_frame(9999, b"N1111111", ecef);
        let recs = rs41.process_bytes(&f, &FrameCtx::default());
        let r = &recs[0];
        assert!(r.crc_ok);
        assert_eq!(r.frame, Some(9999));
        assert!((r.lat.unwrap() + 33.9).abs() < 1e-4);
    }

    #[test]
    fn id_change_resets_calibration() {
        let ecef = geo::geodetic_to_ecef(geo::Geodetic {
            lat: 50.0,
            lon: 8.0,
            alt: 300.0,
        });
        let (f1, mut rs41) = build_frame(1, b"A0000001", ecef);
        rs41.process_bytes(&f1, &FrameCtx::default());
        assert!(rs41.calfrchk[0]);

        let (f2, _) = build_frame(2, b"B0000002", ecef);
        rs41.process_bytes(&f2, &FrameCtx::default());
        assert_eq!(rs41.id, "B0000002");
        // slot 0 re-captured from the new sonde, later slots still clear
        assert!(rs41.calfrchk[0]);
        assert!(!rs41.calfrchk[1]);
    }

    #[test]
    fn frametype_markers() {
        let mut rs41 = Rs41::new(DemodConfig::default());
        rs41.frame[POS_FRAME - 1] = 0x0F;
        assert_eq!(rs41.frametype(), 4);
        assert_eq!(rs41.frame_len(), NDATA_LEN);
        rs41.frame[POS_FRAME - 1] = 0xF0;
        assert_eq!(rs41.frametype(), -4);
        assert_eq!(rs41.frame_len(), FRAME_LEN);
    }

    #[test]
    fn ecc_level4_recovers_patched_frame() {
        let ecef = geo::geodetic_to_ecef(geo::Geodetic {
            lat: 47.0,
            lon: 11.0,
            alt: 2500.0,
        });
        // first frame trains id/frame-number state
        let (f1, _) = build_frame(100, b"P2468135", ecef);
        let mut rs41 = Rs41::new(DemodConfig {
            ecc: EccLevel::Predictive,
            ..Default::default()
        });
        rs41.process_bytes(&f1, &FrameCtx { time_s: 0.0, ..Default::default() });

        // second frame: 14 byte errors in codeword 1 (beyond t=12), four
        // of them in the id field the predictor knows
        let (f2, _) = build_frame(101, b"P2468135", ecef);
        let mut bits = frame_to_bits(&f2);
        let mut hits = 0;
        // codeword 1 carries the even message positions
        for pos_frm in (POS_SONDE_ID..POS_SONDE_ID + 8).filter(|p| (p - MSG_POS) % 2 == 0) {
            let byte = pos_frm - FRAMESTART;
            for j in 0..8 {
                bits[8 * byte + j] ^= 1;
            }
            hits += 1;
        }
        // plus ten even positions inside the GPS2 payload
        for pos_frm in (0xC0..0xD4).step_by(2) {
            let byte = pos_frm - FRAMESTART;
            for j in 0..8 {
                bits[8 * byte + j] ^= 1;
            }
            hits += 1;
        }
        assert_eq!(hits, 14, "need more than t errors in codeword 1");

        let recs = rs41.process(
            &soft_from_hard(&bits),
            &FrameCtx { time_s: 1.0, ..Default::default() },
        );
        let r = &recs[0];
        assert!(r.crc_ok, "level-4 patching must rescue the frame");
        assert_eq!(r.id.as_deref(), Some("P2468135"));
        assert_eq!(r.frame, Some(101));
    }
}
