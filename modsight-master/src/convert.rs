//! Linear conversion between raw register values and engineering units.
//!
//! `EGU = A * raw + B`, where `A` is the scale factor and `B` the deviation.

/// Convert a raw register value to engineering units.
pub fn to_egu(scale: f64, deviation: f64, raw: u16) -> f64 {
    scale * f64::from(raw) + deviation
}

/// Convert an engineering-unit value back to a raw register value.
///
/// The quotient is truncated toward zero and narrowed with `as`, so values
/// outside `0..=65535` saturate and NaN becomes 0. Callers that need a
/// range check must clamp before calling.
pub fn to_raw(scale: f64, deviation: f64, egu: f64) -> u16 {
    ((egu - deviation) / scale) as u16
}
