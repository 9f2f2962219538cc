//! Geodesy and GPS time: ECEF to WGS-84, velocity decomposition, GPS
//! week/TOW to civil date.

use std::f64::consts::PI;

/// WGS-84 semi-major axis [m]
pub const EARTH_A: f64 = 6378137.0;
/// WGS-84 semi-minor axis [m]
pub const EARTH_B: f64 = 6356752.31424518;

const A2_B2: f64 = EARTH_A * EARTH_A - EARTH_B * EARTH_B;
const E2: f64 = A2_B2 / (EARTH_A * EARTH_A);
const EE2: f64 = A2_B2 / (EARTH_B * EARTH_B);

/// Geodetic position, degrees / meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geodetic {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// ECEF [m] to WGS-84 geodetic, closed form (no iteration).
pub fn ecef_to_geodetic(x: [f64; 3]) -> Geodetic {
    let lam = x[1].atan2(x[0]);

    let p = (x[0] * x[0] + x[1] * x[1]).sqrt();
    let t = (x[2] * EARTH_A).atan2(p * EARTH_B);

    let phi = (x[2] + EE2 * EARTH_B * t.sin().powi(3))
        .atan2(p - E2 * EARTH_A * t.cos().powi(3));

    let r = EARTH_A / (1.0 - E2 * phi.sin() * phi.sin()).sqrt();
    let alt = p / phi.cos() - r;

    Geodetic {
        lat: phi * 180.0 / PI,
        lon: lam * 180.0 / PI,
        alt,
    }
}

/// Geodetic to ECEF [m] (used by tests and plausibility checks).
pub fn geodetic_to_ecef(g: Geodetic) -> [f64; 3] {
    let phi = g.lat * PI / 180.0;
    let lam = g.lon * PI / 180.0;
    let r = EARTH_A / (1.0 - E2 * phi.sin() * phi.sin()).sqrt();
    [
        (r + g.alt) * phi.cos() * lam.cos(),
        (r + g.alt) * phi.cos() * lam.sin(),
        (r * (1.0 - E2) + g.alt) * phi.sin(),
    ]
}

/// Horizontal speed / heading / vertical speed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelocityHdv {
    /// horizontal speed [m/s]
    pub v_h: f64,
    /// heading [deg], 0 = north, clockwise
    pub v_d: f64,
    /// vertical speed [m/s], up positive
    pub v_v: f64,
}

/// ECEF velocity to horizontal/heading/vertical at a geodetic position.
pub fn ecef_vel_to_hdv(v: [f64; 3], pos: Geodetic) -> VelocityHdv {
    let phi = pos.lat * PI / 180.0;
    let lam = pos.lon * PI / 180.0;

    let v_n = -v[0] * phi.sin() * lam.cos() - v[1] * phi.sin() * lam.sin() + v[2] * phi.cos();
    let v_e = -v[0] * lam.sin() + v[1] * lam.cos();
    let v_u = v[0] * phi.cos() * lam.cos() + v[1] * phi.cos() * lam.sin() + v[2] * phi.sin();

    enu_to_hdv(v_e, v_n, v_u)
}

/// East/north/up velocity to horizontal/heading/vertical.
pub fn enu_to_hdv(v_e: f64, v_n: f64, v_u: f64) -> VelocityHdv {
    let v_h = (v_n * v_n + v_e * v_e).sqrt();
    let mut dir = v_e.atan2(v_n) * 180.0 / PI;
    if dir < 0.0 {
        dir += 360.0;
    }
    VelocityHdv {
        v_h,
        v_d: dir,
        v_v: v_u,
    }
}

/// Civil date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Date {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

pub const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// GPS week + seconds-of-week to civil date via Modified Julian Day.
/// Ignores UTC leap seconds (adapted from the sci.astro FAQ formula).
pub fn gps_to_date(week: i32, gps_sec: u32) -> Date {
    let gps_days = week as i64 * 7 + (gps_sec / 86400) as i64;
    let mjd = 44244 + gps_days;

    let mut j = mjd + 2468570;
    let c = 4 * j / 146097;
    j -= (146097 * c + 3) / 4;
    let y = 4000 * (j + 1) / 1461001;
    j = j - 1461 * y / 4 + 31;
    let m = 80 * j / 2447;
    let day = j - 2447 * m / 80;
    let j2 = m / 11;
    let month = m + 2 - 12 * j2;
    let year = 100 * (c - 49) + y + j2;

    Date {
        year: year as i32,
        month: month as u32,
        day: day as u32,
    }
}

/// Time-of-week [ms] split into weekday / hh:mm:ss.sss.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TowTime {
    pub wday: u32,
    pub hour: u32,
    pub min: u32,
    pub sec: f64,
    pub gps_sec: u32,
}

pub fn tow_ms_split(tow_ms: u32) -> TowTime {
    let ms = tow_ms % 1000;
    let mut t = tow_ms / 1000;
    let gps_sec = t;
    let wday = (t / (24 * 3600)) % 7;
    t %= 24 * 3600;
    TowTime {
        wday,
        hour: t / 3600,
        min: (t % 3600) / 60,
        sec: (t % 60) as f64 + ms as f64 / 1000.0,
        gps_sec,
    }
}
