//! Meteosis MTS01 interpreter.
//!
//! 1200 Bd FSK with an ASCII comma-separated payload: id, frame number,
//! YYMMDDhhmmss, battery, lat, lon, alt, heading, speed and raw sensor
//! channels, protected by CRC-16 (0x8005 MSB-first, reflected output).

use crate::config::DemodConfig;
use crate::dsp::{HeaderSpec, SoftBit};
use crate::fec::crc::crc16_8005;
use crate::framing::bits_to_bytes_msb;
use crate::sonde::{FrameCtx, RecordTime, SondeDecoder, SondeKind, SondeRecord};

pub const HEADER: &str = "10101010101010101011010000101011";

const BAUD: f32 = 1200.0;
const OFS: usize = 1;
const FRAME_LEN: usize = 130 + OFS;
const DAT_LEN: usize = 128;

pub struct Mts01 {
    cfg: DemodConfig,
    frame: [u8; FRAME_LEN + 2],
}

impl Mts01 {
    pub fn new(cfg: DemodConfig) -> Self {
        Mts01 {
            cfg,
            frame: [0; FRAME_LEN + 2],
        }
    }

    /// Thermistor approximation over the raw resistance channel.
    fn get_temp(r: f64) -> f64 {
        let b0 = 3000.0;
        let t0 = 273.15;
        let r0 = 15.0;
        if r > 0.0 {
            1.0 / (1.0 / t0 + (r / r0).ln() / b0) - 273.15
        } else {
            -273.15
        }
    }

    /// Reflected CRC over the ASCII region.
    fn crc(data: &[u8]) -> u16 {
        crc16_8005(data).reverse_bits()
    }

    fn interpret(&mut self, ctx: &FrameCtx) -> SondeRecord {
        let mut rec = SondeRecord::new(SondeKind::Mts01);

        let stored = (self.frame[OFS + DAT_LEN + 1] as u32) << 8
            | self.frame[OFS + DAT_LEN] as u32;
        let calc = Self::crc(&self.frame[OFS..OFS + DAT_LEN]) as u32;
        rec.crc_ok = stored == calc;

        if rec.crc_ok {
            let text: String = self.frame[OFS..OFS + DAT_LEN]
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| b as char)
                .collect();
            let fields: Vec<&str> = text.split(',').collect();

            let field = |n: usize| fields.get(n).copied().unwrap_or("");

            let id = field(0);
            if !id.is_empty() {
                rec.id = Some(format!("MTS01-{}", &id[..id.len().min(8)]));
            }
            rec.frame = field(2).trim().parse().ok();

            // YYMMDDhhmmss
            let dt = field(3);
            if dt.len() >= 12 && dt.chars().take(12).all(|c| c.is_ascii_digit()) {
                let num = |a: usize, b: usize| dt[a..b].parse::<u32>().unwrap_or(0);
                let (hour, min, sec) = (num(6, 8), num(8, 10), num(10, 12));
                if num(2, 4) >= 1 && num(2, 4) <= 12 && hour < 24 && min < 60 && sec < 60 {
                    rec.datetime = Some(RecordTime {
                        year: 2000 + num(0, 2) as i32,
                        month: num(2, 4),
                        day: num(4, 6),
                        hour,
                        min,
                        sec: sec as f64,
                        is_utc: true,
                    });
                }
            }

            rec.battery = field(4).trim().parse::<f64>().ok().map(|mv| mv / 1000.0);
            rec.lat = field(5).trim().parse().ok();
            rec.lon = field(6).trim().parse().ok();
            rec.alt = field(7)
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|&a| SondeRecord::plausible_alt(a));
            rec.v_d = field(8).trim().parse().ok();
            rec.v_h = field(9).trim().parse().ok();

            if self.cfg.ptu > 0 {
                if let Ok(raw_t) = field(11).trim().parse::<f64>() {
                    let t = Self::get_temp(raw_t);
                    if t > -270.0 {
                        rec.temperature = Some(t);
                    }
                }
            }
        }

        if ctx.raw {
            rec.raw = Some(
                self.frame[..FRAME_LEN]
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect(),
            );
        }
        rec
    }
}

impl SondeDecoder for Mts01 {
    fn kind(&self) -> SondeKind {
        SondeKind::Mts01
    }

    fn header_spec(&self) -> HeaderSpec {
        HeaderSpec::from_str(HEADER, 1, 1, 1.5, 0.9)
    }

    fn baud(&self) -> f32 {
        BAUD
    }

    fn frame_bits(&self) -> usize {
        FRAME_LEN * 8
    }

    fn process(&mut self, bits: &[SoftBit], ctx: &FrameCtx) -> Vec<SondeRecord> {
        let hard: Vec<u8> = bits.iter().map(|b| b.hb).collect();
        let mut bytes = [0u8; FRAME_LEN];
        let n = bits_to_bytes_msb(&hard, &mut bytes);
        self.frame = [0; FRAME_LEN + 2];
        self.frame[..n].copy_from_slice(&bytes[..n]);
        vec![self.interpret(ctx)]
    }

    fn process_bytes(&mut self, bytes: &[u8], ctx: &FrameCtx) -> Vec<SondeRecord> {
        self.frame = [0; FRAME_LEN + 2];
        let n = bytes.len().min(FRAME_LEN);
        self.frame[..n].copy_from_slice(&bytes[..n]);
        vec![self.interpret(ctx)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_frame(text: &str) -> Vec<u8> {
        let mut f = vec![0u8; FRAME_LEN + 2];
        f[0] = 0x80; // residual sync byte ahead of the payload
        let bytes = text.as_bytes();
        f[OFS..OFS + bytes.len()].copy_from_slice(bytes);
        let crc = Mts01::crc(&f[OFS..OFS + DAT_LEN]);
        f[OFS + DAT_LEN] = crc as u8;
        f[OFS + DAT_LEN + 1] = (crc >> 8) as u8;
        f
    }

    const PAYLOAD: &str =
        "A1B2C3D4,0,1234,240715094530,2980,52.123456,13.654321,12345.0,270.5,15.2,0,204.0,204.0,55.0";

    #[test]
    fn decodes_csv_payload() {
        let f = build_frame(PAYLOAD);
        let mut mts = Mts01::new(DemodConfig {
            ptu: 1,
            ..Default::default()
        });
        let recs = mts.process_bytes(&f, &FrameCtx::default());
        let r = &recs[0];
        assert!(r.crc_ok);
        assert_eq!(r.id.as_deref(), Some("MTS01-A1B2C3D4"));
        assert_eq!(r.frame, Some(1234));
        let t = r.datetime.unwrap();
        assert_eq!((t.year, t.month, t.day), (2024, 7, 15));
        assert_eq!((t.hour, t.min), (9, 45));
        assert!((r.lat.unwrap() - 52.123456).abs() < 1e-9);
        assert!((r.lon.unwrap() - 13.654321).abs() < 1e-9);
        assert!((r.alt.unwrap() - 12345.0).abs() < 1e-9);
        assert!((r.v_d.unwrap() - 270.5).abs() < 1e-9);
        assert!((r.v_h.unwrap() - 15.2).abs() < 1e-9);
        assert_eq!(r.battery, Some(2.98));
        // R = 204 kOhm is deep cold on the 15k/0C curve
        assert!(r.temperature.unwrap() < -30.0);
    }

    #[test]
    fn crc_failure_suppresses_fields() {
        let mut f = build_frame(PAYLOAD);
        f[OFS + 10] ^= 0x01;
        let mut mts = Mts01::new(DemodConfig::default());
        let recs = mts.process_bytes(&f, &FrameCtx::default());
        assert!(!recs[0].crc_ok);
        assert_eq!(recs[0].id, None);
    }

    #[test]
    fn implausible_date_rejected() {
        let f = build_frame("X,0,1,009915996099,0,0,0,0,0,0");
        let mut mts = Mts01::new(DemodConfig::default());
        let recs = mts.process_bytes(&f, &FrameCtx::default());
        assert!(recs[0].crc_ok);
        assert_eq!(recs[0].datetime, None);
    }
}
