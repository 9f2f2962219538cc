//! Shared PTU sensor math: thermistor polynomials, water vapor
//! saturation pressure, barometric fallback.

/// Steinhart-Hart cubic: 1/T = p0 + p1 ln R + p2 (ln R)^2 + p3 (ln R)^3.
/// Returns Celsius; R in Ohm. Non-positive R yields -273.15.
pub fn steinhart_hart(p: [f64; 4], r: f64) -> f64 {
    if r <= 0.0 {
        return -273.15;
    }
    let lnr = r.ln();
    let t = 1.0 / (p[0] + p[1] * lnr + p[2] * lnr * lnr + p[3] * lnr * lnr * lnr);
    t - 273.15
}

/// Water vapor saturation pressure [Pa] over liquid water by the
/// Hyland-Wexler equation. Numerically sensitive; keep in f64 and do not
/// reorder the terms.
pub fn vapor_sat_p(t_celsius: f64) -> f64 {
    let t = t_celsius + 273.15;
    (-5800.2206 / t + 1.3914993 + 6.5459673 * t.ln() - 4.8640239e-2 * t
        + 4.1764768e-5 * t * t
        - 1.4452093e-8 * t * t * t)
        .exp()
}

/// Pressure [hPa] from altitude [m] by the standard-atmosphere
/// barometric formula, per layer.
pub fn pressure_from_alt(h: f64) -> f64 {
    let g_m_r = 9.80665 * 0.0289644 / 8.31446;

    let (pb, tb, lb, hb) = if h > 32000.0 {
        (8.6802, 228.65, 0.0028, 32000.0)
    } else if h > 20000.0 {
        (54.7489, 216.65, 0.001, 20000.0)
    } else if h > 11000.0 {
        (226.321, 216.65, 0.0, 11000.0)
    } else {
        (1013.25, 288.15, -0.0065, 0.0)
    };

    if lb == 0.0 {
        pb * (-g_m_r * (h - hb) / tb).exp()
    } else {
        pb * (1.0 + lb * (h - hb) / tb).powf(-g_m_r / lb)
    }
}
