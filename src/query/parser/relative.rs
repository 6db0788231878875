//! Relative time resolution
//!
//! Relative windows use the OpenTSDB form `<N><unit>-ago`. Months count as
//! 30 days and years as 365, matching the dialect's fixed-width units.

use crate::error::{Error, Result};

/// Milliseconds covered by `relative`, e.g. `90m-ago` -> 5_400_000
pub fn relative_duration_ms(relative: &str) -> Result<i64> {
    let spec = relative
        .strip_suffix("-ago")
        .ok_or_else(|| Error::validation(format!("invalid relative time: {relative}")))?;
    if !spec.is_ascii() {
        return Err(Error::validation(format!(
            "invalid relative time: {relative}"
        )));
    }

    let (digits, unit) = if spec.len() > 2 && spec.ends_with("ms") {
        (&spec[..spec.len() - 2], "ms")
    } else if spec.len() > 1 {
        spec.split_at(spec.len() - 1)
    } else {
        return Err(Error::validation(format!(
            "invalid relative time: {relative}"
        )));
    };

    let value: i64 = digits
        .parse()
        .map_err(|_| Error::validation(format!("invalid relative value: {digits}")))?;
    if value <= 0 {
        return Err(Error::validation(format!(
            "relative value must be positive: {value}"
        )));
    }

    let unit_ms: i64 = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        "n" => 30 * 86_400_000,
        "y" => 365 * 86_400_000,
        _ => {
            return Err(Error::validation(format!(
                "invalid relative unit: {unit}"
            )))
        }
    };

    value
        .checked_mul(unit_ms)
        .ok_or_else(|| Error::validation(format!("relative time out of range: {relative}")))
}

/// Window start for `relative` against `now_ms`
pub fn resolve_relative_start(now_ms: i64, relative: &str) -> Result<i64> {
    Ok(now_ms - relative_duration_ms(relative)?)
}
