//! Fixed-point centi-values: the contract stores two decimal digits as integers scaled by 100.

const SCALE: f64 = 100.0;

/// `round(v * 100)` as a signed integer. None for non-finite or out-of-range input.
pub fn to_centi_signed(v: f64) -> Option<i64> {
    let scaled = (v * SCALE).round();
    if scaled.is_finite() && scaled >= i64::MIN as f64 && scaled < i64::MAX as f64 {
        Some(scaled as i64)
    } else {
        None
    }
}

/// `round(v * 100)` as an unsigned integer. None for negative, non-finite or out-of-range input.
pub fn to_centi_unsigned(v: f64) -> Option<u64> {
    let scaled = (v * SCALE).round();
    // -0.004 rounds to -0.0, which is still a valid zero
    if scaled.is_finite() && scaled >= 0.0 && scaled < u64::MAX as f64 {
        Some(scaled as u64)
    } else {
        None
    }
}

/// `n / 100.0`.
pub fn from_centi(n: i128) -> f64 {
    n as f64 / SCALE
}

/// `n / 100.0` for unsigned on-chain values, which may exceed `i128::MAX`.
pub fn from_centi_unsigned(n: u128) -> f64 {
    n as f64 / SCALE
}
