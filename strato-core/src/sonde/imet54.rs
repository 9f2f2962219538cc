//! InterMet iMET-54 interpreter.
//!
//! 4798 Bd GFSK with 8N1 byte framing. After stripping start/stop bits
//! the payload is 8x8 block-interleaved and Hamming(8,4) coded, one
//! nibble per codeword. Fields are big-endian and fixed-position: SN,
//! packed-decimal time-of-day in ms, NMEA-style lat/lon, altitude in
//! decimeters.

use crate::config::DemodConfig;
use crate::dsp::{HeaderSpec, SoftBit};
use crate::fec::hamming::{imet54_decode, HammingResult};
use crate::framing::{deinter64, strip_8n1};
use crate::sonde::{FrameCtx, RecordTime, SondeDecoder, SondeKind, SondeRecord};

pub const HEADER: &str = concat!(
    "0000000001",
    "0101010101",
    "0000000001",
    "0101010101",
    "0000000001",
    "0101010101",
    "0000000001",
    "0101010101",
    "0000000001",
    "0101010101",
    "0000000001",
    "0101010101",
    "0001001001",
    "0001001001",
);

const BAUD: f32 = 4798.0;
const FRAME_LEN: usize = 220;
const BIT_FRAME_LEN: usize = FRAME_LEN * 8;
/// remaining sync bytes (0x24 0x24 0x42) after the header
const SYNC_OFS: usize = 3 * 8;

const POS_SN: usize = 0x00;
const POS_GPS_TIME: usize = 0x04;
const POS_GPS_LAT: usize = 0x08;
const POS_GPS_LON: usize = 0x0C;
const POS_GPS_ALT: usize = 0x10;

fn i4be(b: &[u8]) -> i32 {
    i32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn u4be(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// NMEA-style fixed point: degrees*1e6 with decimal minutes folded in.
fn nmea_deg(val: i32) -> f64 {
    let deg = (val as f64 / 1e6).trunc();
    let min = (val as f64 / 1e6 - deg) * 100.0 / 60.0;
    deg + min
}

pub struct Imet54 {
    cfg: DemodConfig,
    frame: [u8; FRAME_LEN],
}

impl Imet54 {
    pub fn new(cfg: DemodConfig) -> Self {
        Imet54 {
            cfg,
            frame: [0; FRAME_LEN],
        }
    }

    fn interpret(&mut self, ecc: i32, ctx: &FrameCtx) -> SondeRecord {
        let mut rec = SondeRecord::new(SondeKind::Imet54);
        rec.crc_ok = ecc >= 0;
        if ecc > 0 {
            rec.ecc_corrected = Some(ecc as u32);
        }

        if ecc >= 0 {
            rec.id = Some(format!("{}", u4be(&self.frame[POS_SN..])));

            // packed-decimal hhmmss in milliseconds
            let val = i4be(&self.frame[POS_GPS_TIME..]);
            let sec = (val % 100000) as f64 / 1e3;
            let val = val / 1000 / 100;
            let min = (val % 100) as u32;
            let hour = ((val / 100) % 100) as u32;
            if hour < 24 && min < 60 {
                rec.datetime = Some(RecordTime {
                    hour,
                    min,
                    sec,
                    is_utc: true,
                    ..Default::default()
                });
            }

            rec.lat = Some(nmea_deg(i4be(&self.frame[POS_GPS_LAT..])));
            rec.lon = Some(nmea_deg(i4be(&self.frame[POS_GPS_LON..])));
            let alt = i4be(&self.frame[POS_GPS_ALT..]) as f64 / 1e1;
            if SondeRecord::plausible_alt(alt) {
                rec.alt = Some(alt);
            }
        }

        if ctx.raw {
            rec.raw = Some(self.frame.iter().map(|b| format!("{:02x}", b)).collect());
        }
        rec
    }
}

impl SondeDecoder for Imet54 {
    fn kind(&self) -> SondeKind {
        SondeKind::Imet54
    }

    fn header_spec(&self) -> HeaderSpec {
        HeaderSpec::from_str(HEADER, 1, 1, 1.0, 0.8)
    }

    fn baud(&self) -> f32 {
        BAUD
    }

    fn frame_bits(&self) -> usize {
        BIT_FRAME_LEN
    }

    fn process(&mut self, bits: &[SoftBit], ctx: &FrameCtx) -> Vec<SondeRecord> {
        let hard: Vec<u8> = bits.iter().map(|b| b.hb).collect();
        let mut payload = strip_8n1(&hard);
        if payload.len() <= SYNC_OFS + 64 {
            return Vec::new();
        }
        payload.drain(..SYNC_OFS);
        let leftover = deinter64(&mut payload);
        payload.truncate(payload.len() - leftover);

        // one Hamming codeword per byte, one nibble out
        let mut nibbles = Vec::with_capacity(payload.len() / 8);
        let mut ecc = 0i32;
        for chunk in payload.chunks_exact(8) {
            let mut cwb = [0u8; 8];
            cwb.copy_from_slice(chunk);
            let (nib, res) = imet54_decode(&mut cwb);
            nibbles.push(nib);
            match res {
                HammingResult::Ok => {}
                HammingResult::Corrected(_) => ecc += 1,
                HammingResult::TwoError => {
                    ecc = -1;
                    break;
                }
            }
        }
        if !self.cfg.ecc.enabled() && ecc < 0 {
            ecc = 0; // without ECC the nibbles pass through unchecked
        }

        self.frame = [0; FRAME_LEN];
        for (j, pair) in nibbles.chunks_exact(2).enumerate().take(FRAME_LEN) {
            self.frame[j] = (pair[0] << 4) | (pair[1] & 0xF);
        }

        vec![self.interpret(ecc, ctx)]
    }

    fn process_bytes(&mut self, bytes: &[u8], ctx: &FrameCtx) -> Vec<SondeRecord> {
        self.frame = [0; FRAME_LEN];
        let n = bytes.len().min(FRAME_LEN);
        self.frame[..n].copy_from_slice(&bytes[..n]);
        vec![self.interpret(0, ctx)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EccLevel;
    use crate::sonde::soft_from_hard;

    fn encode_nibble(nib: u8) -> [u8; 8] {
        let byt = crate::fec::hamming::HAM_LUT[nib as usize];
        core::array::from_fn(|j| (byt >> j) & 1)
    }

    /// decoded bytes that fit one wire frame after 8N1 + sync overhead
    const DATA_BYTES: usize = 84;

    fn build_payload() -> Vec<u8> {
        let mut f = vec![0u8; FRAME_LEN];
        f[POS_SN..POS_SN + 4].copy_from_slice(&55001234u32.to_be_bytes());
        // 13:07:25.500
        f[POS_GPS_TIME..POS_GPS_TIME + 4].copy_from_slice(&130725500i32.to_be_bytes());
        // 52.3000 deg -> deg*1e6 + min-fold: 0.3*0.6=0.18
        f[POS_GPS_LAT..POS_GPS_LAT + 4].copy_from_slice(&52_180_000i32.to_be_bytes());
        f[POS_GPS_LON..POS_GPS_LON + 4].copy_from_slice(&(-13_090_000i32).to_be_bytes());
        f[POS_GPS_ALT..POS_GPS_ALT + 4].copy_from_slice(&123456i32.to_be_bytes());
        f
    }

    /// Frame bytes -> 8N1 wire bits (hamming-encoded, interleaved).
    fn to_wire(frame: &[u8]) -> Vec<u8> {
        // post-header sync bytes pass through the 8N1 strip untouched
        let mut cw_bits: Vec<u8> = Vec::new();
        for b in [0x24u8, 0x24, 0x42] {
            for k in 0..8 {
                cw_bits.push((b >> k) & 1);
            }
        }
        let mut data_bits = Vec::new();
        for &byte in &frame[..DATA_BYTES] {
            for nib in [byte >> 4, byte & 0xF] {
                data_bits.extend_from_slice(&encode_nibble(nib));
            }
        }
        assert_eq!(data_bits.len() % 64, 0);
        deinter64(&mut data_bits); // transpose is an involution
        cw_bits.extend_from_slice(&data_bits);

        // 8N1 framing
        let mut wire = Vec::new();
        for chunk in cw_bits.chunks(8) {
            wire.push(0);
            wire.extend_from_slice(chunk);
            wire.push(1);
        }
        wire.resize(BIT_FRAME_LEN, 0);
        wire
    }

    #[test]
    fn decodes_fixed_fields() {
        let frame = build_payload();
        let wire = to_wire(&frame);
        let mut imet = Imet54::new(DemodConfig {
            ecc: EccLevel::Standard,
            ..Default::default()
        });
        let recs = imet.process(&soft_from_hard(&wire), &FrameCtx::default());
        let r = &recs[0];
        assert!(r.crc_ok);
        assert_eq!(r.id.as_deref(), Some("55001234"));
        let t = r.datetime.unwrap();
        assert_eq!((t.hour, t.min), (13, 7));
        assert!((t.sec - 25.5).abs() < 1e-9);
        assert!((r.lat.unwrap() - 52.3).abs() < 1e-6);
        assert!((r.lon.unwrap() + 13.15).abs() < 1e-6);
        assert!((r.alt.unwrap() - 12345.6).abs() < 1e-9);
    }

    #[test]
    fn single_bit_errors_corrected() {
        let frame = build_payload();
        let mut wire = to_wire(&frame);
        // flip two data bits (wire positions clear of start/stop bits,
        // landing in different interleave blocks)
        wire[103] ^= 1;
        wire[405] ^= 1;
        let mut imet = Imet54::new(DemodConfig {
            ecc: EccLevel::Standard,
            ..Default::default()
        });
        let recs = imet.process(&soft_from_hard(&wire), &FrameCtx::default());
        assert!(recs[0].crc_ok);
        assert_eq!(recs[0].id.as_deref(), Some("55001234"));
    }
}
