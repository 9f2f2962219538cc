//! Graw DFM-06/09/17 interpreter.
//!
//! 2500 Bd Manchester; a 280-bit frame carries three bit-interleaved
//! blocks of Hamming(8,4) codewords: CONF (7), DAT1 (13), DAT2 (13).
//! GPS fields arrive as numbered 52-bit data channels (0 frame counter,
//! 1 UTC seconds, 2 lat+vH, 3 lon+vD, 4 alt+vV, 8 date+sats); the
//! serial number is reconstructed from the configuration channel stream,
//! which also carries the float24 sensor measurements.

use crate::config::DemodConfig;
use crate::dsp::{HeaderSpec, SoftBit};
use crate::fec::hamming::{dfm_block, HammingResult};
use crate::framing::{bits_to_val, deinterleave_dfm};
use crate::sonde::{soft_from_hard, FrameCtx, RecordTime, SondeDecoder, SondeKind, SondeRecord};

pub const HEADER: &str = "10011010100110010101101001010101";
const BAUD: f32 = 2500.0;

/// data bits per frame after the 16-bit header
const FRAME_BITS: usize = 264;
const CONF_CW: usize = 7;
const DAT_CW: usize = 13;

const SN_BIT: u16 = 0x0100;

/// Per-channel reception bookkeeping (staleness + error count).
#[derive(Debug, Clone, Copy, Default)]
struct PckState {
    ts: f64,
    /// corrected bits; -1 = uncorrectable, -2 = over threshold
    ec: i32,
}

/// Serial-number channel detective state.
#[derive(Debug, Clone, Copy, Default)]
struct SnConf {
    nul_ch: u32,
    max_ch: u32,
    sn_ch: u8,
    ch_x: [u32; 2],
    ch_x_bit: u8,
    sn_x: u32,
}

pub struct Dfm {
    cfg: DemodConfig,
    frmcnt: f64,

    sonde_typ: u16,
    sn6: u32,
    sn: u32,
    sonde_id: String,
    snc: SnConf,
    /// measurement configuration: 6 = DFM-06, 0xA/0xB/0xC/0xD = STM32
    ptu_out: u8,
    meas24: [f64; 7],

    frnr: u32,
    lat: f64,
    lon: f64,
    alt: f64,
    hori_v: f64,
    dir: f64,
    vert_v: f64,
    sek: f64,
    date: (i32, u32, u32, u32, u32),
    n_sv: u32,
    pck: [PckState; 9],
}

impl Dfm {
    pub fn new(cfg: DemodConfig) -> Self {
        Dfm {
            cfg,
            frmcnt: 0.0,
            sonde_typ: 0,
            sn6: 0,
            sn: 0,
            sonde_id: String::new(),
            snc: SnConf::default(),
            ptu_out: 0,
            meas24: [0.0; 7],
            frnr: 0,
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            hori_v: 0.0,
            dir: 0.0,
            vert_v: 0.0,
            sek: 0.0,
            date: (0, 0, 0, 0, 0),
            n_sv: 0,
            pck: [PckState::default(); 9],
        }
    }

    /// float24: value / 2^p with a 4-bit exponent
    fn fl24(d: u32) -> f64 {
        let p = (d >> 20) & 0xF;
        let val = d & 0xFFFFF;
        val as f64 / (1u32 << p) as f64
    }

    /// NTC approximation over the measurement ratio channels.
    /// meas0 = g*(R + Rs), meas3 = g*Rs, meas4 = g*Rf with Rf = 220k.
    fn get_temp(&self) -> f64 {
        let (f, f1, f2) = if self.ptu_out >= 0xC {
            (self.meas24[1], self.meas24[5], self.meas24[6])
        } else {
            (self.meas24[0], self.meas24[3], self.meas24[4])
        };
        let b0 = 3260.0;
        let t0 = 25.0 + 273.15;
        let r0 = 5.0e3;
        let rf = 220e3;
        let g = f2 / rf;
        let mut r = (f - f1) / g;
        if f * f1 * f2 == 0.0 {
            r = 0.0;
        }
        if r > 0.0 {
            1.0 / (1.0 / t0 + (r / r0).ln() / b0) - 273.15
        } else {
            -273.15
        }
    }

    fn conf_out(&mut self, conf_bits: &[u8], ec: i32) {
        let conf_id = bits_to_val(conf_bits, 0, 4);

        if conf_id > 4 && bits_to_val(conf_bits, 8, 20) == 0 {
            self.snc.nul_ch = bits_to_val(conf_bits, 0, 8);
        }

        let dfm6typ = (self.snc.nul_ch & 0xF0) == 0x50 && (self.snc.nul_ch & 0x0F) != 0;
        if dfm6typ {
            self.ptu_out = 6;
        }
        if dfm6typ && (self.sonde_typ & 0xF) > 6 {
            self.sonde_typ = 0;
            self.snc.max_ch = conf_id;
        }

        if conf_id > 5 && conf_id > self.snc.max_ch && ec == 0 {
            if bits_to_val(conf_bits, 4, 4) == 0xC {
                self.snc.max_ch = conf_id;
            }
        }

        if conf_id > 5 && (conf_id == (self.snc.nul_ch >> 4) + 1 || conf_id == self.snc.max_ch) {
            let sn2_ch = bits_to_val(conf_bits, 0, 8);
            let sn_ch = ((sn2_ch >> 4) & 0xF) as u8;

            if (self.snc.nul_ch & 0x58) == 0x58 {
                // DFM-06: 6-nibble serial on channel 6, must repeat once
                let sn6 = bits_to_val(conf_bits, 4, 24);
                if sn6 == self.sn6 && sn6 != 0 {
                    self.sonde_typ = SN_BIT | 6;
                    self.ptu_out = 6;
                    self.sonde_id = format!("ID06:{:6X}", self.sn6);
                } else {
                    self.sonde_typ = 0;
                }
                self.sn6 = sn6;
            } else if (sn2_ch & 0xF) == 0xC || (sn2_ch & 0xF) == 0x0 {
                // DFM-09/09P/17: two 16-bit halves tagged by hl
                let val = bits_to_val(conf_bits, 8, 20);
                let hl = (val & 0xF) as usize;
                if hl < 2 {
                    if self.snc.sn_ch != sn_ch {
                        self.snc.ch_x_bit = 0;
                        self.snc.ch_x = [0, 0];
                    }
                    self.snc.sn_ch = sn_ch;
                    self.snc.ch_x[hl] = (val >> 4) & 0xFFFF;
                    self.snc.ch_x_bit |= 1 << hl;
                    if self.snc.ch_x_bit == 3 {
                        let sn = (self.snc.ch_x[0] << 16) | self.snc.ch_x[1];
                        if sn == self.snc.sn_x || self.snc.sn_x == 0 {
                            self.sonde_typ = SN_BIT | sn_ch as u16;
                            self.sn = sn;
                            self.ptu_out = match sn_ch {
                                0xA | 0xB | 0xC | 0xD => sn_ch,
                                _ => 0,
                            };
                            if sn_ch == 0xA {
                                self.sonde_id = format!("ID09:{:6}", self.sn);
                            } else {
                                self.sonde_id =
                                    format!("ID-{:1X}:{:6}", self.sonde_typ & 0xF, self.sn);
                            }
                        } else {
                            self.sonde_typ = 0;
                        }
                        self.snc.sn_x = sn;
                        self.snc.ch_x_bit = 0;
                    }
                }
            }
        }

        // measurement channels (float24)
        if conf_id <= 4 {
            self.meas24[conf_id as usize] = Self::fl24(bits_to_val(conf_bits, 4, 24));
        }
        if self.ptu_out >= 0xC && (5..=6).contains(&conf_id) {
            self.meas24[conf_id as usize] = Self::fl24(bits_to_val(conf_bits, 4, 24));
        }
    }

    fn dat_out(&mut self, dat_bits: &[u8], ec: i32) -> u32 {
        let fr_id = bits_to_val(dat_bits, 48, 4);

        if fr_id <= 8 {
            self.pck[fr_id as usize].ts = self.frmcnt;
            let mut e = ec;
            if e > 4 {
                e = -2; // too many corrections, data not trusted
            }
            self.pck[fr_id as usize].ec = e;
        }

        match fr_id {
            0 => {
                self.frnr = bits_to_val(dat_bits, 24, 8);
            }
            1 => {
                let msek = bits_to_val(dat_bits, 32, 16);
                self.sek = msek as f64 / 1000.0;
            }
            2 => {
                self.lat = bits_to_val(dat_bits, 0, 32) as i32 as f64 / 1e7;
                self.hori_v = bits_to_val(dat_bits, 32, 16) as i16 as f64 / 1e2;
            }
            3 => {
                self.lon = bits_to_val(dat_bits, 0, 32) as i32 as f64 / 1e7;
                self.dir = bits_to_val(dat_bits, 32, 16) as f64 / 1e2;
            }
            4 => {
                self.alt = bits_to_val(dat_bits, 0, 32) as i32 as f64 / 1e2;
                self.vert_v = bits_to_val(dat_bits, 32, 16) as i16 as f64 / 1e2;
            }
            8 => {
                self.date = (
                    bits_to_val(dat_bits, 0, 12) as i32,
                    bits_to_val(dat_bits, 12, 4),
                    bits_to_val(dat_bits, 16, 5),
                    bits_to_val(dat_bits, 21, 5),
                    bits_to_val(dat_bits, 26, 6),
                );
                self.n_sv = bits_to_val(dat_bits, 32, 8);
            }
            _ => {}
        }
        fr_id
    }

    /// Block result: corrected-bit count, or -1 when a codeword stayed
    /// uncorrectable.
    fn block_ec(results: &[HammingResult]) -> i32 {
        let mut n = 0i32;
        for r in results {
            match r {
                HammingResult::Ok => {}
                HammingResult::Corrected(_) => n += 1,
                HammingResult::TwoError => return -1,
            }
        }
        n
    }

    fn emit(&self, ctx: &FrameCtx) -> SondeRecord {
        let mut rec = SondeRecord::new(SondeKind::Dfm);
        rec.frame = Some(self.frnr);
        if !self.sonde_id.is_empty() {
            rec.id = Some(self.sonde_id.clone());
        }

        // a channel is promoted while fresh (< 6 frames) and clean
        let fresh = |i: usize| {
            self.pck[8].ts - self.pck[i].ts < 6.0 && self.pck[i].ec >= 0
        };

        if fresh(8) && fresh(1) {
            let (y, mo, d, h, mi) = self.date;
            rec.datetime = Some(RecordTime {
                year: y,
                month: mo,
                day: d,
                hour: h,
                min: mi,
                sec: self.sek,
                is_utc: true,
            });
            rec.num_sv = Some(self.n_sv);
        }
        if fresh(2) {
            rec.lat = Some(self.lat);
            rec.v_h = Some(self.hori_v);
        }
        if fresh(3) {
            rec.lon = Some(self.lon);
            rec.v_d = Some(self.dir);
        }
        if fresh(4) {
            if SondeRecord::plausible_alt(self.alt) {
                rec.alt = Some(self.alt);
            }
            rec.v_v = Some(self.vert_v);
        }
        if self.cfg.ptu > 0 && self.ptu_out != 0 {
            let t = self.get_temp();
            if t > -270.0 {
                rec.temperature = Some(t);
            }
        }
        rec.crc_ok = (0..=4).all(fresh) && fresh(8);
        let corrected: i32 = self.pck.iter().map(|p| p.ec.max(0)).sum();
        if corrected > 0 {
            rec.ecc_corrected = Some(corrected as u32);
        }
        let _ = ctx;
        rec
    }
}

impl SondeDecoder for Dfm {
    fn kind(&self) -> SondeKind {
        SondeKind::Dfm
    }

    fn header_spec(&self) -> HeaderSpec {
        HeaderSpec::from_str(HEADER, 2, 2, 0.5, 1.8)
    }

    fn baud(&self) -> f32 {
        BAUD
    }

    fn frame_bits(&self) -> usize {
        FRAME_BITS
    }

    fn process(&mut self, bits: &[SoftBit], ctx: &FrameCtx) -> Vec<SondeRecord> {
        if bits.len() < FRAME_BITS {
            return Vec::new();
        }
        self.frmcnt += 1.0;
        // --ecc2 and up adds the distance-2 soft list decode
        let soft = self.cfg.ecc >= crate::config::EccLevel::KnownBytes;

        let mut block = vec![SoftBit::default(); 8 * DAT_CW];
        let mut records = Vec::new();

        // CONF block: 7 codewords at frame offset 0
        deinterleave_dfm(&bits[0..8 * CONF_CW], CONF_CW, &mut block[..8 * CONF_CW]);
        let (conf_sym, conf_res) = dfm_block(&block[..8 * CONF_CW], CONF_CW, soft);
        let conf_ec = Self::block_ec(&conf_res);
        if conf_ec >= 0 || !self.cfg.ecc.enabled() {
            self.conf_out(&conf_sym, conf_ec.max(0));
        }

        // DAT1 + DAT2 blocks
        let mut last_id = 0;
        for ofs in [56usize, 160] {
            deinterleave_dfm(&bits[ofs..ofs + 8 * DAT_CW], DAT_CW, &mut block);
            let (sym, res) = dfm_block(&block, DAT_CW, soft);
            let ec = Self::block_ec(&res);
            if ec >= 0 || !self.cfg.ecc.enabled() {
                last_id = self.dat_out(&sym, ec);
            }
        }

        // the date channel closes one telemetry cycle
        if last_id == 8 {
            records.push(self.emit(ctx));
        }
        records
    }

    fn process_bytes(&mut self, bytes: &[u8], ctx: &FrameCtx) -> Vec<SondeRecord> {
        // hex bypass: bytes carry the 264 frame bits MSB-first
        let bits: Vec<u8> = bytes
            .iter()
            .flat_map(|&b| (0..8).rev().map(move |j| (b >> j) & 1))
            .take(FRAME_BITS)
            .collect();
        if bits.len() < FRAME_BITS {
            return Vec::new();
        }
        self.process(&soft_from_hard(&bits), ctx)
    }
}
