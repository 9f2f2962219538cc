//! Meteomodem M20 interpreter.
//!
//! Successor of the M10 at 9600 Bd with a compacted 0x45-byte frame:
//! 3-byte TOW in seconds, lat/lon in microdegrees, 3-byte altitude in
//! cm, and both a frame checksum and an inner block checksum over the
//! essential GPS block. The 3-byte serial encodes year/month plus a
//! 13-bit counter.

use crate::config::DemodConfig;
use crate::dsp::{HeaderSpec, SoftBit};
use crate::fec::crc::{blk_check_m10, check_m10};
use crate::framing::bits_to_bytes_msb;
use crate::geo;
use crate::ptu::steinhart_hart;
use crate::sonde::{FrameCtx, RecordTime, SondeDecoder, SondeKind, SondeRecord};

pub const HEADER: &str = "10011001100110010100110010011001";
const BAUD: f32 = 9600.0;

const STD_FLEN: usize = 0x45;
const AUX_LEN: usize = 0x6F - STD_FLEN;
const MAX_LEN: usize = STD_FLEN + AUX_LEN + 2;

const POS_TOW: usize = 0x0F;
const POS_ALT: usize = 0x08;
const POS_LAT: usize = 0x1C;
const POS_LON: usize = 0x20;
const POS_WEEK: usize = 0x1A;
const POS_VE: usize = 0x0B;
const POS_VN: usize = 0x0D;
const POS_VU: usize = 0x18;
const POS_SN: usize = 0x12;
const POS_CNT: usize = 0x15;
const POS_BLK_CHK: usize = 0x16;
const LEN_BLK_CHK: u8 = 0x16;

fn u2be(b: &[u8]) -> u32 {
    (b[0] as u32) << 8 | b[1] as u32
}

fn u3be(b: &[u8]) -> u32 {
    (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32
}

fn i2be(b: &[u8]) -> i32 {
    i16::from_be_bytes([b[0], b[1]]) as i32
}

fn i4be(b: &[u8]) -> i32 {
    i32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub struct M20 {
    cfg: DemodConfig,
    frame: [u8; MAX_LEN + 4],
}

impl M20 {
    pub fn new(cfg: DemodConfig) -> Self {
        M20 {
            cfg,
            frame: [0; MAX_LEN + 4],
        }
    }

    fn get_temp(&self) -> f64 {
        // same thermistor network family as the M10
        let p = [1.07303516e-03, 2.41296733e-04, 2.26744154e-06, 6.52855181e-08];
        let rs = [12.1e3, 36.5e3, 475.0e3];
        let rp = [1e20, 330.0e3, 2000.0e3];

        let sc_t = self.frame[0x02] as usize & 0x3;
        let adc_rt = ((self.frame[0x04] as u16) << 8 | self.frame[0x03] as u16)
            .wrapping_sub(0xA000);
        let x = (4095.0 - adc_rt as f64) / adc_rt as f64;
        if sc_t >= 3 {
            return -273.15;
        }
        let r = rs[sc_t] / (x - rs[sc_t] / rp[sc_t]);
        steinhart_hart(p, r)
    }

    fn serial(&self) -> String {
        let b0 = self.frame[POS_SN];
        let s2 = (self.frame[POS_SN + 2] as u32) << 8 | self.frame[POS_SN + 1] as u32;
        let ym = b0 & 0x7F;
        let y = ym / 12;
        let m = (ym % 12) + 1;
        format!(
            "{}{:02}-{}-{}{:04}",
            y,
            m,
            (s2 & 0x3) + 2,
            (s2 >> 15) & 0x1,
            (s2 >> 2) & 0x1FFF
        )
    }

    fn interpret(&mut self, ctx: &FrameCtx) -> SondeRecord {
        let mut rec = SondeRecord::new(SondeKind::M20);

        let mut flen = self.frame[0] as usize;
        if flen < STD_FLEN || flen > STD_FLEN + AUX_LEN {
            flen = STD_FLEN;
        }
        let pos_check = flen - 1;

        let cs1 = u2be(&self.frame[pos_check..]);
        let cs2 = check_m10(&self.frame[..pos_check]) as u32;
        // inner check covers the essential block up to (not including)
        // its stored 16-bit check
        let bc1 = u2be(&self.frame[POS_BLK_CHK..]);
        let bc2 = blk_check_m10(LEN_BLK_CHK, &self.frame[2..POS_BLK_CHK]) as u32;

        rec.crc_ok = cs1 == cs2;
        let blk_ok = bc1 == bc2;

        let tow_s = u3be(&self.frame[POS_TOW..]);
        let t = geo::tow_ms_split(tow_s.wrapping_mul(1000));
        let mut week = u2be(&self.frame[POS_WEEK..]) as i32;
        if week < 1304 {
            week += 1024;
        }

        if blk_ok || rec.crc_ok {
            if t.wday <= 6 && week <= 4000 + 1024 {
                rec.week = Some(week);
                let date = geo::gps_to_date(week, t.gps_sec);
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

            rec.lat = Some(i4be(&self.frame[POS_LAT..]) as f64 / 1e6);
            rec.lon = Some(i4be(&self.frame[POS_LON..]) as f64 / 1e6);
            let alt = u3be(&self.frame[POS_ALT..]) as f64 / 100.0;
            if SondeRecord::plausible_alt(alt) {
                rec.alt = Some(alt);
            }

            let vx = i2be(&self.frame[POS_VE..]) as f64 / 1e2;
            let vy = i2be(&self.frame[POS_VN..]) as f64 / 1e2;
            let vu = i2be(&self.frame[POS_VU..]) as f64 / 1e2;
            let v = geo::enu_to_hdv(vx, vy, vu);
            rec.v_h = Some(v.v_h);
            rec.v_d = Some(v.v_d);
            rec.v_v = Some(v.v_v);

            rec.id = Some(self.serial());
            rec.frame = Some(self.frame[POS_CNT] as u32);

            if self.cfg.ptu > 0 {
                let tc = self.get_temp();
                if tc > -270.0 {
                    rec.temperature = Some(tc);
                }
            }
        }

        if ctx.raw {
            rec.raw = Some(
                self.frame[..flen + 1]
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect(),
            );
        }
        rec
    }
}

impl SondeDecoder for M20 {
    fn kind(&self) -> SondeKind {
        SondeKind::M20
    }

    fn header_spec(&self) -> HeaderSpec {
        HeaderSpec::from_str(HEADER, 2, 1, 1.8, 0.9)
    }

    fn baud(&self) -> f32 {
        BAUD
    }

    fn frame_bits(&self) -> usize {
        MAX_LEN * 8
    }

    fn process(&mut self, bits: &[SoftBit], ctx: &FrameCtx) -> Vec<SondeRecord> {
        let hard: Vec<u8> = bits.iter().map(|b| b.hb).collect();
        let mut bytes = [0u8; MAX_LEN];
        let n = bits_to_bytes_msb(&hard, &mut bytes);
        self.frame = [0; MAX_LEN + 4];
        self.frame[..n].copy_from_slice(&bytes[..n]);
        vec![self.interpret(ctx)]
    }

    fn process_bytes(&mut self, bytes: &[u8], ctx: &FrameCtx) -> Vec<SondeRecord> {
        self.frame = [0; MAX_LEN + 4];
        let n = bytes.len().min(MAX_LEN);
        self.frame[..n].copy_from_slice(&bytes[..n]);
        vec![self.interpret(ctx)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_frame() -> Vec<u8> {
        let mut f = vec![0u8; STD_FLEN + 1];
        f[0] = STD_FLEN as u8;
        f[1] = 0x20;

        let tow_s: u32 = (5 * 24 + 8) * 3600 + 45 * 60 + 12;
        f[POS_TOW..POS_TOW + 3].copy_from_slice(&tow_s.to_be_bytes()[1..]);
        f[POS_WEEK..POS_WEEK + 2].copy_from_slice(&2290u16.to_be_bytes());

        f[POS_LAT..POS_LAT + 4].copy_from_slice(&(59_437_000i32).to_be_bytes()); // 59.437
        f[POS_LON..POS_LON + 4].copy_from_slice(&(24_753_600i32).to_be_bytes()); // 24.7536
        f[POS_ALT..POS_ALT + 3].copy_from_slice(&(1_500_000u32).to_be_bytes()[1..]); // 15 km

        f[POS_VE..POS_VE + 2].copy_from_slice(&(-300i16).to_be_bytes());
        f[POS_VN..POS_VN + 2].copy_from_slice(&(300i16).to_be_bytes());
        f[POS_VU..POS_VU + 2].copy_from_slice(&(450i16).to_be_bytes());

        f[POS_SN] = 5 * 12 + 3; // year 5, month 4
        f[POS_SN + 1] = 0x2A;
        f[POS_SN + 2] = 0x15;
        f[POS_CNT] = 42;

        let bc = blk_check_m10(LEN_BLK_CHK, &f[2..POS_BLK_CHK]);
        f[POS_BLK_CHK] = (bc >> 8) as u8;
        f[POS_BLK_CHK + 1] = bc as u8;

        let cs = check_m10(&f[..STD_FLEN - 1]);
        f[STD_FLEN - 1] = (cs >> 8) as u8;
        f[STD_FLEN] = cs as u8;
        f
    }

    #[test]
    fn decodes_m20_frame() {
        let f = build_frame();
        let mut m20 = M20::new(DemodConfig::default());
        let recs = m20.process_bytes(&f, &FrameCtx::default());
        let r = &recs[0];
        assert!(r.crc_ok);
        assert!((r.lat.unwrap() - 59.437).abs() < 1e-9);
        assert!((r.lon.unwrap() - 24.7536).abs() < 1e-9);
        assert!((r.alt.unwrap() - 15000.0).abs() < 1e-9);
        assert!((r.v_v.unwrap() - 4.5).abs() < 1e-9);
        // vx=-3, vy=3 -> 315 deg
        assert!((r.v_d.unwrap() - 315.0).abs() < 1e-9);
        assert_eq!(r.frame, Some(42));
        let t = r.datetime.unwrap();
        assert_eq!((t.hour, t.min), (8, 45));
        let id = r.id.clone().unwrap();
        assert!(id.starts_with("504-"), "id {}", id);
    }

    #[test]
    fn block_check_rescues_gps_fields() {
        let mut f = build_frame();
        // damage outside the essential block: frame check fails, block
        // check still validates the GPS fields
        f[0x40] ^= 0xFF;
        let mut m20 = M20::new(DemodConfig::default());
        let recs = m20.process_bytes(&f, &FrameCtx::default());
        let r = &recs[0];
        assert!(!r.crc_ok);
        assert!(r.lat.is_some());
    }

    #[test]
    fn corrupt_block_and_frame_yields_nothing() {
        let mut f = build_frame();
        // altitude sits inside the essential block: both checks fail
        f[POS_ALT + 1] ^= 0x01;
        let mut m20 = M20::new(DemodConfig::default());
        let recs = m20.process_bytes(&f, &FrameCtx::default());
        assert!(!recs[0].crc_ok);
        assert_eq!(recs[0].lat, None);
        assert_eq!(recs[0].alt, None);
    }
}
