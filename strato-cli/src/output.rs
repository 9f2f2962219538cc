//! Frame record rendering: human-readable lines or one JSON object per
//! line.

use serde_json::Value;
use strato_core::sonde::SondeRecord;

/// Compose the JSON line for a record; `cfq_hz` injects the receiver
/// frequency the way auto_rx expects it (kHz).
pub fn json_line(rec: &SondeRecord, cfq_hz: Option<u64>) -> Option<String> {
    if !rec.crc_ok && !rec.encrypted {
        return None;
    }
    let mut val = serde_json::to_value(rec).ok()?;
    if let Value::Object(map) = &mut val {
        if let Some(dt) = rec.datetime {
            map.insert(
                "datetime".into(),
                Value::String(format!(
                    "{:04}-{:02}-{:02}T{:02}:{:02}:{:06.3}Z",
                    dt.year, dt.month, dt.day, dt.hour, dt.min, dt.sec
                )),
            );
        }
        if let Some(cfq) = cfq_hz {
            map.insert("freq".into(), Value::from(cfq / 1000));
        }
    }
    serde_json::to_string(&val).ok()
}

/// One human-readable line per frame.
pub fn text_line(rec: &SondeRecord) -> String {
    let mut out = String::new();

    if let Some(frame) = rec.frame {
        out.push_str(&format!("[{:5}] ", frame));
    }
    if let Some(id) = &rec.id {
        out.push_str(&format!("({}) ", id));
    }
    if let Some(dt) = rec.datetime {
        if dt.year != 0 {
            out.push_str(&format!("{:04}-{:02}-{:02} ", dt.year, dt.month, dt.day));
        }
        out.push_str(&format!("{:02}:{:02}:{:06.3} ", dt.hour, dt.min, dt.sec));
    }
    if let (Some(lat), Some(lon)) = (rec.lat, rec.lon) {
        out.push_str(&format!(" lat: {:.5}  lon: {:.5} ", lat, lon));
    }
    if let Some(alt) = rec.alt {
        out.push_str(&format!(" alt: {:.2}m ", alt));
    }
    if let (Some(vh), Some(vd)) = (rec.v_h, rec.v_d) {
        out.push_str(&format!(" vH: {:.1}m/s  D: {:.1}", vh, vd));
        if let Some(vv) = rec.v_v {
            out.push_str(&format!("  vV: {:.1}m/s", vv));
        }
        out.push(' ');
    }
    if let Some(sv) = rec.num_sv {
        out.push_str(&format!(" sats: {} ", sv));
    }
    if let Some(t) = rec.temperature {
        out.push_str(&format!(" T={:.1}C ", t));
    }
    if let Some(rh) = rec.humidity {
        out.push_str(&format!(" RH={:.0}% ", rh));
    }
    if let Some(p) = rec.pressure {
        out.push_str(&format!(" P={:.1}hPa ", p));
    }
    if let Some(batt) = rec.battery {
        out.push_str(&format!(" batt={:.1}V ", batt));
    }
    if rec.encrypted {
        out.push_str(" [encrypted] ");
    }
    if let Some(n) = rec.ecc_corrected {
        out.push_str(&format!(" ({})", n));
    }
    out.push_str(if rec.crc_ok { " [OK]" } else { " [NO]" });

    if let Some(raw) = &rec.raw {
        out.push('\n');
        out.push_str(raw);
    }
    out
}
