//! Lockheed Martin LMS6 / LMS6X interpreter.
//!
//! The downlink is rate-1/2 convolutionally coded (K=7, 0x4F/0x6D) over
//! CCSDS-framed blocks: a 5-byte sync (0x00 58 F3 3F B8 in decoded
//! order) followed by one RS(255,223) codeword. Inside the concatenated
//! data stream, telemetry frames are delimited by a 4-byte frame sync:
//! 24 54 00 00 for the original LMS6 (binary-angle lat/lon, 24-bit ENU
//! velocity), 24 46 05 00 for the LMS6X (1e-7 lat/lon, float64 TOW,
//! 16-bit H/D/V velocity). The type is auto-detected per frame sync.

use crate::config::DemodConfig;
use crate::dsp::{HeaderSpec, SoftBit};
use crate::fec::crc::crc16_ccitt;
use crate::fec::viterbi::{deconv, Viterbi};
use crate::fec::ReedSolomon;
use crate::framing::bits_to_bytes_lsb;
use crate::geo;
use crate::sonde::{FrameCtx, RecordTime, SondeDecoder, SondeKind, SondeRecord};

/// coded block sync as it appears on the air (c0, inv(c1))
pub const HEADER: &str =
    "0101011000001000000111001001011100011010101001110011110100111110";
/// 16 zero warm-up raw bits + the coded sync
const BLK_SYNCBITS: &str =
    "00000000000000000000001101011101010010011100001001001111111100100110100001101011";

const BAUD: f32 = 4800.0;

const FRM_LEN: usize = 223;
const BLOCK_CW: usize = 255;
const SYNC_LEN: usize = 5;
/// raw coded bits per block read (LMS6X 300-byte bit-frames)
const RAWBIT_BLOCK: usize = 300 * 8 * 2;

const FRM_SYNC6: [u8; 4] = [0x24, 0x54, 0x00, 0x00];
const FRM_SYNC_X: [u8; 4] = [0x24, 0x46, 0x05, 0x00];

const OFS: usize = 4;
const POS_SONDE_SN: usize = OFS;
const POS_FRAME_NB: usize = OFS + 0x04;
const POS_GPS_TOW: usize = OFS + 0x06;
const POS_GPS_LAT: usize = OFS + 0x0E;
const POS_GPS_LON: usize = OFS + 0x12;
const POS_GPS_ALT: usize = OFS + 0x16;
const POS_GPS_VE: usize = OFS + 0x1A;
const POS_GPS_VH: usize = OFS + 0x1A;

const B60B60: f64 = (1u32 << 30) as f64 / 90.0;

fn u4be(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn i4be(b: &[u8]) -> i32 {
    i32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn i2be(b: &[u8]) -> i32 {
    i16::from_be_bytes([b[0], b[1]]) as i32
}

fn i3be(b: &[u8]) -> i32 {
    let mut v = (b[0] as i32) << 16 | (b[1] as i32) << 8 | b[2] as i32;
    if v > 0x7FFFFF {
        v -= 0x1000000;
    }
    v
}

pub struct Lms6 {
    cfg: DemodConfig,
    vit: Viterbi,
    rs: ReedSolomon,
    /// concatenated RS-corrected data bytes, frames scanned out of it
    frm_buf: Vec<u8>,
    /// detected family: 6 or 10 (LMS6X)
    typ: u8,
    gpstow_start: i64,
    week: i32,
}

impl Lms6 {
    pub fn new(cfg: DemodConfig) -> Self {
        Lms6 {
            cfg,
            vit: Viterbi::new(BLK_SYNCBITS.len() + RAWBIT_BLOCK + 16),
            rs: ReedSolomon::rs255_ccsds(),
            frm_buf: Vec::with_capacity(3 * FRM_LEN),
            typ: 6,
            gpstow_start: -1,
            week: 0,
        }
    }

    pub fn detected(&self) -> SondeKind {
        if self.typ == 10 {
            SondeKind::Lms6X
        } else {
            SondeKind::Lms6
        }
    }

    fn check_crc(frame: &[u8]) -> bool {
        let stored = (frame[221] as u32) << 8 | frame[222] as u32;
        stored == crc16_ccitt(&frame[..221], 0x0000) as u32
    }

    fn parse_frame(&mut self, frame: &[u8], ecc: Option<u32>, _ctx: &FrameCtx) -> Option<SondeRecord> {
        if frame[POS_SONDE_SN + 1] == 0 {
            return None;
        }
        let crc_ok = Self::check_crc(frame);

        let mut rec = SondeRecord::new(self.detected());
        rec.crc_ok = crc_ok;
        rec.ecc_corrected = ecc.filter(|&n| n > 0);

        let sn = u4be(&frame[POS_SONDE_SN..]) & 0xFFFFFF;
        rec.id = Some(format!("{}", sn));
        rec.frame = Some(((frame[POS_FRAME_NB] as u32) << 8) + frame[POS_FRAME_NB + 1] as u32);

        // time of week
        let (tow_ms, sec_frac) = if self.typ == 6 {
            (u4be(&frame[POS_GPS_TOW..]) as i64, 0.0)
        } else {
            let towx = f64::from_be_bytes([
                frame[POS_GPS_TOW],
                frame[POS_GPS_TOW + 1],
                frame[POS_GPS_TOW + 2],
                frame[POS_GPS_TOW + 3],
                frame[POS_GPS_TOW + 4],
                frame[POS_GPS_TOW + 5],
                frame[POS_GPS_TOW + 6],
                frame[POS_GPS_TOW + 7],
            ]);
            ((towx * 1e3) as i64, towx - towx.floor())
        };

        if (0..7 * 24 * 3600 * 1000).contains(&tow_ms) {
            let t = geo::tow_ms_split(tow_ms as u32);
            // week rollover on TOW wrap-around
            if self.gpstow_start < 0 && crc_ok {
                self.gpstow_start = tow_ms;
            }
            if self.week > 0 && crc_ok && tow_ms < self.gpstow_start {
                self.week += 1;
                self.gpstow_start = tow_ms;
            }
            let date = if self.week > 0 {
                geo::gps_to_date(self.week, t.gps_sec)
            } else {
                geo::Date::default()
            };
            rec.datetime = Some(RecordTime {
                year: date.year,
                month: date.month,
                day: date.day,
                hour: t.hour,
                min: t.min,
                sec: if self.typ == 6 { t.sec } else { t.sec.floor() + sec_frac },
                is_utc: false,
            });
        }

        // position
        let (lat, lon, alt) = if self.typ == 6 {
            (
                i4be(&frame[POS_GPS_LAT..]) as f64 / B60B60,
                i4be(&frame[POS_GPS_LON..]) as f64 / B60B60,
                i4be(&frame[POS_GPS_ALT..]) as f64 / 1e3,
            )
        } else {
            (
                i4be(&frame[POS_GPS_LAT..]) as f64 / 1e7,
                i4be(&frame[POS_GPS_LON..]) as f64 / 1e7,
                i4be(&frame[POS_GPS_ALT..]) as f64 / 1e2,
            )
        };
        rec.lat = Some(lat);
        rec.lon = Some(lon);
        if SondeRecord::plausible_alt(alt) {
            rec.alt = Some(alt);
        }

        // velocity
        if self.typ == 6 {
            let ve = i3be(&frame[POS_GPS_VE..]) as f64 / 1e3;
            let vn = i3be(&frame[POS_GPS_VE + 3..]) as f64 / 1e3;
            let vu = i3be(&frame[POS_GPS_VE + 6..]) as f64 / 1e3;
            let v = geo::enu_to_hdv(ve, vn, vu);
            rec.v_h = Some(v.v_h);
            rec.v_d = Some(v.v_d);
            rec.v_v = Some(v.v_v);
        } else {
            rec.v_h = Some(i2be(&frame[POS_GPS_VH..]) as f64 / 1e2);
            rec.v_d = Some(i2be(&frame[POS_GPS_VH + 2..]) as f64 / 1e2);
            rec.v_v = Some(i2be(&frame[POS_GPS_VH + 4..]) as f64 / 1e2);
        }

        Some(rec)
    }

    /// Scan the accumulated data stream for frame syncs and parse every
    /// complete frame.
    fn scan_frames(&mut self, ecc: Option<u32>, ctx: &FrameCtx) -> Vec<SondeRecord> {
        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos + FRM_LEN <= self.frm_buf.len() {
            let is6 = self.frm_buf[pos..pos + 4] == FRM_SYNC6;
            let isx = self.frm_buf[pos..pos + 4] == FRM_SYNC_X;
            if is6 || isx {
                self.typ = if isx { 10 } else { 6 };
                let frame: Vec<u8> = self.frm_buf[pos..pos + FRM_LEN].to_vec();
                if let Some(rec) = self.parse_frame(&frame, ecc, ctx) {
                    records.push(rec);
                }
                pos += FRM_LEN;
            } else {
                pos += 1;
            }
        }
        self.frm_buf.drain(..pos);
        // cap leftover to one frame of history
        if self.frm_buf.len() > 2 * FRM_LEN {
            let excess = self.frm_buf.len() - 2 * FRM_LEN;
            self.frm_buf.drain(..excess);
        }
        records
    }
}

impl SondeDecoder for Lms6 {
    fn kind(&self) -> SondeKind {
        self.detected()
    }

    fn header_spec(&self) -> HeaderSpec {
        HeaderSpec::from_str(HEADER, 1, 1, 1.2, 0.9)
    }

    fn baud(&self) -> f32 {
        // LMS6X transmits at 4797.8 Bd; within the slicer's tolerance of
        // the nominal rate
        BAUD
    }

    fn frame_bits(&self) -> usize {
        RAWBIT_BLOCK
    }

    fn process(&mut self, bits: &[SoftBit], ctx: &FrameCtx) -> Vec<SondeRecord> {
        // re-seed the decoder with the sync the header search consumed
        let mut raw: Vec<SoftBit> = BLK_SYNCBITS
            .bytes()
            .map(|b| SoftBit {
                hb: b & 1,
                sb: if b & 1 == 1 { 1.0 } else { -1.0 },
            })
            .collect();
        // on the air the stream is (c0, inv(c1)): undo the alternating
        // inversion on ingestion
        raw.extend(bits.iter().enumerate().map(|(bc, b)| SoftBit {
            hb: b.hb ^ (bc % 2) as u8,
            sb: if bc % 2 == 1 { -b.sb } else { b.sb },
        }));

        let coded: Vec<u8> = if self.cfg.viterbi > 0 {
            match self.vit.decode(&raw) {
                Ok(c) => c,
                Err(_) => return Vec::new(),
            }
        } else {
            raw.iter().map(|b| b.hb).collect()
        };

        let (data_bits, _err_pos) = deconv(&coded);
        // LSB-first packing: the decoded sync reads 00 58 F3 3F B8
        // (CCSDS 0x1ACFFC1D in transmission bit order)
        let mut bytes = vec![0u8; data_bits.len() / 8];
        let n = bits_to_bytes_lsb(&data_bits, &mut bytes);
        bytes.truncate(n);

        // block structure: 5 sync bytes, then one RS codeword
        // transmitted highest coefficient first
        let mut total_corrected = 0u32;
        let mut rs_failed = false;
        let mut ofs = 0usize;
        while ofs + SYNC_LEN + BLOCK_CW <= bytes.len() {
            let wire = &bytes[ofs + SYNC_LEN..ofs + SYNC_LEN + BLOCK_CW];
            let mut cw = [0u8; BLOCK_CW];
            for (i, &b) in wire.iter().enumerate() {
                cw[BLOCK_CW - 1 - i] = b;
            }
            if self.cfg.ecc.enabled() {
                match self.rs.decode(&mut cw) {
                    Ok(nerr) => total_corrected += nerr as u32,
                    Err(_) => rs_failed = true,
                }
            }
            for i in 0..FRM_LEN {
                self.frm_buf.push(cw[BLOCK_CW - 1 - i]);
            }
            ofs += SYNC_LEN + BLOCK_CW;
        }
        // a trailing partial codeword cannot be corrected; the next
        // header hit re-syncs the block stream

        let ecc = if self.cfg.ecc.enabled() && !rs_failed {
            Some(total_corrected)
        } else {
            None
        };
        self.scan_frames(ecc, ctx)
    }

    fn process_bytes(&mut self, bytes: &[u8], ctx: &FrameCtx) -> Vec<SondeRecord> {
        // bypass: bytes are one decoded 223-byte frame
        if bytes.len() < FRM_LEN {
            return Vec::new();
        }
        if bytes[..4] == FRM_SYNC_X {
            self.typ = 10;
        } else if bytes[..4] == FRM_SYNC6 {
            self.typ = 6;
        }
        self.parse_frame(&bytes[..FRM_LEN], None, ctx)
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EccLevel;
    use crate::fec::viterbi::conv_encode;

    fn build_frame_x(sn: u32, frnr: u16, lat: f64, lon: f64, alt: f64) -> Vec<u8> {
        let mut f = vec![0u8; FRM_LEN];
        f[..4].copy_from_slice(&FRM_SYNC_X);
        f[POS_SONDE_SN..POS_SONDE_SN + 4]
            .copy_from_slice(&(0x7A0000u32 | (sn & 0xFFFF)).to_be_bytes());
        f[POS_FRAME_NB] = (frnr >> 8) as u8;
        f[POS_FRAME_NB + 1] = frnr as u8;
        let tow: f64 = (4 * 24 * 3600 + 11 * 3600 + 22 * 60 + 33) as f64 + 0.25;
        f[POS_GPS_TOW..POS_GPS_TOW + 8].copy_from_slice(&tow.to_be_bytes());
        f[POS_GPS_LAT..POS_GPS_LAT + 4]
            .copy_from_slice(&((lat * 1e7) as i32).to_be_bytes());
        f[POS_GPS_LON..POS_GPS_LON + 4]
            .copy_from_slice(&((lon * 1e7) as i32).to_be_bytes());
        f[POS_GPS_ALT..POS_GPS_ALT + 4]
            .copy_from_slice(&((alt * 1e2) as i32).to_be_bytes());
        f[POS_GPS_VH..POS_GPS_VH + 2].copy_from_slice(&(550i16).to_be_bytes());
        f[POS_GPS_VH + 2..POS_GPS_VH + 4].copy_from_slice(&(18000i16).to_be_bytes());
        f[POS_GPS_VH + 4..POS_GPS_VH + 6].copy_from_slice(&(-320i16).to_be_bytes());
        let crc = crc16_ccitt(&f[..221], 0x0000);
        f[221] = (crc >> 8) as u8;
        f[222] = crc as u8;
        f
    }

    /// Wrap a frame into sync + RS codeword + convolutional coding with
    /// the on-air (c0, inv(c1)) inversion.
    fn encode_block(frame: &[u8]) -> Vec<SoftBit> {
        let rs = ReedSolomon::rs255_ccsds();
        let mut cw = [0u8; 255];
        // wire order is highest coefficient first: frame byte i sits at
        // polynomial position 254-i
        for (i, &b) in frame.iter().enumerate() {
            cw[254 - i] = b;
        }
        rs.encode(&mut cw);
        let wire: Vec<u8> = (0..255).map(|i| cw[254 - i]).collect();

        let mut bytes = vec![0x00, 0x58, 0xF3, 0x3F, 0xB8];
        bytes.extend_from_slice(&wire);

        // LSB-first serialization matches the decoder's byte packing
        let data_bits: Vec<u8> = bytes
            .iter()
            .flat_map(|&b| (0..8).map(move |j| (b >> j) & 1))
            .collect();
        let coded = conv_encode(&data_bits);
        // the transmitted stream starts after the 80 sync raw bits the
        // header search consumes; drop them and invert every second bit
        let skip = BLK_SYNCBITS.len();
        coded[skip..]
            .iter()
            .enumerate()
            .map(|(bc, &b)| {
                let hb = b ^ (bc % 2) as u8;
                SoftBit {
                    hb,
                    sb: 2.0 * hb as f32 - 1.0,
                }
            })
            .collect()
    }

    #[test]
    fn decodes_lmsx_block_and_autodetects() {
        let frame = build_frame_x(4711, 321, -34.6037, -58.3816, 12345.0);
        let soft = encode_block(&frame);
        let mut lms = Lms6::new(DemodConfig {
            ecc: EccLevel::Standard,
            viterbi: 1,
            ..Default::default()
        });
        assert_eq!(lms.detected(), SondeKind::Lms6);
        let recs = lms.process(&soft, &FrameCtx::default());
        assert_eq!(lms.detected(), SondeKind::Lms6X);
        assert_eq!(recs.len(), 1);
        let r = &recs[0];
        assert!(r.crc_ok);
        assert_eq!(r.frame, Some(321));
        assert!((r.lat.unwrap() + 34.6037).abs() < 1e-6);
        assert!((r.lon.unwrap() + 58.3816).abs() < 1e-6);
        assert!((r.alt.unwrap() - 12345.0).abs() < 0.01);
        assert!((r.v_h.unwrap() - 5.5).abs() < 1e-9);
        assert!((r.v_d.unwrap() - 180.0).abs() < 1e-9);
        let t = r.datetime.unwrap();
        assert_eq!((t.hour, t.min), (11, 22));
        assert!((t.sec - 33.25).abs() < 1e-9);
    }

    #[test]
    fn viterbi_cleans_coded_errors() {
        let frame = build_frame_x(1000, 5, 51.0, 7.0, 1000.0);
        let mut soft = encode_block(&frame);
        // sprinkle isolated coded-bit errors
        for i in (100..soft.len()).step_by(997) {
            soft[i].hb ^= 1;
            soft[i].sb = -0.3 * soft[i].sb.signum();
        }
        let mut lms = Lms6::new(DemodConfig {
            ecc: EccLevel::Standard,
            viterbi: 1,
            ..Default::default()
        });
        let recs = lms.process(&soft, &FrameCtx::default());
        assert_eq!(recs.len(), 1);
        assert!(recs[0].crc_ok);
        assert_eq!(recs[0].frame, Some(5));
    }

    #[test]
    fn rawhex_frame_parses() {
        let frame = build_frame_x(2222, 99, 10.0, 20.0, 500.0);
        let mut lms = Lms6::new(DemodConfig::default());
        let recs = lms.process_bytes(&frame, &FrameCtx::default());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].frame, Some(99));
        assert_eq!(recs[0].kind, Some(SondeKind::Lms6X));
    }
}
