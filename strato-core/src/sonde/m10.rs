//! Meteomodem M10 interpreter (Trimble GPS variant).
//!
//! 9615 Bd Manchester, 101-byte frames (plus optional aux block) guarded
//! by a 16-bit rolling checksum. Fields are big-endian: TOW in ms,
//! lat/lon as 2^32/360 binary angles, altitude in mm, ENU velocity in
//! units of 1/200 m/s (centi-knots). The serial number is nibble-packed
//! date + counter.

use crate::config::DemodConfig;
use crate::dsp::{HeaderSpec, SoftBit};
use crate::fec::crc::check_m10;
use crate::framing::bits_to_bytes_msb;
use crate::geo;
use crate::ptu::steinhart_hart;
use crate::sonde::{FrameCtx, RecordTime, SondeDecoder, SondeKind, SondeRecord};

pub const HEADER: &str = "10011001100110010100110010011001";
const BAUD: f32 = 9615.0;

const STD_FLEN: usize = 0x64;
const AUX_LEN: usize = 20;
const FRAME_LEN: usize = 101;

const POS_TOW: usize = 0x0A;
const POS_LAT: usize = 0x0E;
const POS_LON: usize = 0x12;
const POS_ALT: usize = 0x16;
const POS_SATS: usize = 0x1E;
const POS_WEEK: usize = 0x20;
const POS_VE: usize = 0x04;
const POS_VN: usize = 0x06;
const POS_VU: usize = 0x08;
const POS_SN: usize = 0x5D;
const POS_CHECK: usize = STD_FLEN - 1;

/// lat/lon scale: 2^32/360 deg
const B60B60: f64 = (1u32 << 30) as f64 / 90.0;
/// velocity: centi-knots to m/s
const MS2KN100: f64 = 2e2;

fn u2be(b: &[u8]) -> u32 {
    (b[0] as u32) << 8 | b[1] as u32
}

fn i2be(b: &[u8]) -> i32 {
    i16::from_be_bytes([b[0], b[1]]) as i32
}

fn i4be(b: &[u8]) -> i32 {
    i32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub struct M10 {
    cfg: DemodConfig,
    frame: [u8; FRAME_LEN + AUX_LEN + 4],
    auxlen: usize,
}

impl M10 {
    pub fn new(cfg: DemodConfig) -> Self {
        M10 {
            cfg,
            frame: [0; FRAME_LEN + AUX_LEN + 4],
            auxlen: 0,
        }
    }

    /// NTC over a 3-range voltage divider; Shibaura PB5-41E fit.
    fn get_temp(&self) -> f64 {
        let p = [1.07303516e-03, 2.41296733e-04, 2.26744154e-06, 6.52855181e-08];
        let rs = [12.1e3, 36.5e3, 475.0e3];
        let rp = [1e20, 330.0e3, 2000.0e3];

        let sc_t = self.frame[0x3E] as usize;
        let adc_rt = ((self.frame[0x40] as u16) << 8 | self.frame[0x3F] as u16)
            .wrapping_sub(0xA000);
        let adc_max = 4095.0;
        let x = (adc_max - adc_rt as f64) / adc_rt as f64;
        if sc_t >= 3 {
            return -273.15;
        }
        let r = rs[sc_t] / (x - rs[sc_t] / rp[sc_t]);
        steinhart_hart(p, r)
    }

    fn serial(&self) -> String {
        let raw = &self.frame[POS_SN..POS_SN + 5];
        let byte = raw[2];
        let s2 = raw[3] as u32 | (raw[4] as u32) << 8;
        format!(
            "{:1X}{:02} {:1X} {:1}{:04}",
            (byte >> 4) & 0xF,
            byte & 0xF,
            raw[0] & 0xF,
            (s2 >> 13) & 0x7,
            s2 & 0x1FFF
        )
    }

    fn interpret(&mut self, ctx: &FrameCtx) -> SondeRecord {
        let mut rec = SondeRecord::new(SondeKind::M10);

        // frame length byte selects std vs aux frame
        let flen = self.frame[0] as usize;
        self.auxlen = if flen == STD_FLEN {
            0
        } else {
            let aux = flen as i64 - STD_FLEN as i64;
            if (0..=AUX_LEN as i64).contains(&aux) {
                aux as usize
            } else {
                0
            }
        };

        let chk_pos = POS_CHECK + self.auxlen;
        let cs1 = u2be(&self.frame[chk_pos..]);
        let cs2 = check_m10(&self.frame[..chk_pos]) as u32;
        rec.crc_ok = cs1 == cs2;

        let tow_ms = i4be(&self.frame[POS_TOW..]) as u32;
        let t = geo::tow_ms_split(tow_ms);

        let mut week = u2be(&self.frame[POS_WEEK..]) as i32;
        // Trimble Copernicus II week-number rollover
        if week < 1304 {
            week += 1024;
        }
        let week_ok = week <= 4000 + 1024 && t.wday <= 6;

        if rec.crc_ok && week_ok {
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
            rec.num_sv = Some(self.frame[POS_SATS] as u32);
        }

        if rec.crc_ok {
            rec.lat = Some(i4be(&self.frame[POS_LAT..]) as f64 / B60B60);
            rec.lon = Some(i4be(&self.frame[POS_LON..]) as f64 / B60B60);
            let alt = i4be(&self.frame[POS_ALT..]) as f64 / 1000.0;
            if SondeRecord::plausible_alt(alt) {
                rec.alt = Some(alt);
            }

            let vx = i2be(&self.frame[POS_VE..]) as f64 / MS2KN100;
            let vy = i2be(&self.frame[POS_VN..]) as f64 / MS2KN100;
            let vu = i2be(&self.frame[POS_VU..]) as f64 / MS2KN100;
            let v = geo::enu_to_hdv(vx, vy, vu);
            rec.v_h = Some(v.v_h);
            rec.v_d = Some(v.v_d);
            rec.v_v = Some(v.v_v);

            rec.id = Some(self.serial());

            if self.cfg.ptu > 0 {
                let t = self.get_temp();
                if t > -270.0 {
                    rec.temperature = Some(t);
                }
            }
        }

        if ctx.raw {
            rec.raw = Some(
                self.frame[..FRAME_LEN + self.auxlen]
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect(),
            );
        }
        rec
    }
}

impl SondeDecoder for M10 {
    fn kind(&self) -> SondeKind {
        SondeKind::M10
    }

    fn header_spec(&self) -> HeaderSpec {
        // header symbols are unpaired, payload is Manchester
        HeaderSpec::from_str(HEADER, 2, 1, 1.8, 0.9)
    }

    fn baud(&self) -> f32 {
        BAUD
    }

    fn frame_bits(&self) -> usize {
        (FRAME_LEN + AUX_LEN) * 8
    }

    fn process(&mut self, bits: &[SoftBit], ctx: &FrameCtx) -> Vec<SondeRecord> {
        let hard: Vec<u8> = bits.iter().map(|b| b.hb).collect();
        let mut bytes = [0u8; FRAME_LEN + AUX_LEN];
        let n = bits_to_bytes_msb(&hard, &mut bytes);
        self.frame = [0; FRAME_LEN + AUX_LEN + 4];
        self.frame[..n].copy_from_slice(&bytes[..n]);
        vec![self.interpret(ctx)]
    }

    fn process_bytes(&mut self, bytes: &[u8], ctx: &FrameCtx) -> Vec<SondeRecord> {
        self.frame = [0; FRAME_LEN + AUX_LEN + 4];
        let n = bytes.len().min(FRAME_LEN + AUX_LEN);
        self.frame[..n].copy_from_slice(&bytes[..n]);
        vec![self.interpret(ctx)]
    }
}
