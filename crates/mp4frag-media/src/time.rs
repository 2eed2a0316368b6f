//! Timescale conversion helpers.

/// Convert a time value between timescales, rounding to the nearest unit.
///
/// A zero source timescale yields 0.
pub fn convert_time(value: u64, from_timescale: u32, to_timescale: u32) -> u64 {
    if from_timescale == 0 {
        return 0;
    }
    let from = from_timescale as u128;
    let scaled = (value as u128 * to_timescale as u128 + from / 2) / from;
    scaled.min(u64::MAX as u128) as u64
}

/// Signed variant of [`convert_time`], used for composition offsets and edit list media times.
pub fn convert_time_signed(value: i64, from_timescale: u32, to_timescale: u32) -> i64 {
    let magnitude = convert_time(value.unsigned_abs(), from_timescale, to_timescale) as i64;
    if value < 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Express a media time in milliseconds.
pub fn duration_ms(value: u64, timescale: u32) -> u64 {
    convert_time(value, timescale, 1000)
}
