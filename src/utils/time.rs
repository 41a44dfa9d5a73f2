//! Windows time conversions and fixed-format ISO-8601 rendering.

use jiff::Timestamp;
use jiff::tz::Offset;

/// 100-ns intervals between 1601-01-01 (FILETIME epoch) and 1970-01-01
/// (Unix epoch).
const EPOCH_DIFFERENCE_TICKS: i128 = 116_444_736_000_000_000;

/// Convert a Windows FILETIME tick count (100-ns intervals since 1601-01-01
/// UTC) into a `jiff::Timestamp`.
///
/// Returns `None` when the tick count falls outside the representable range.
pub(crate) fn filetime_to_timestamp(ticks: u64) -> Option<Timestamp> {
    let nanos = (ticks as i128 - EPOCH_DIFFERENCE_TICKS) * 100;
    Timestamp::from_nanosecond(nanos).ok()
}

/// Render a FILETIME as `YYYY-MM-DDTHH:MM:SS.fffffffZ` (7 fractional digits,
/// one per 100-ns tick). Zero ticks render as the empty string.
pub(crate) fn write_filetime(ticks: u64, out: &mut String) {
    if ticks == 0 {
        return;
    }
    let Some(ts) = filetime_to_timestamp(ticks) else {
        return;
    };
    let dt = Offset::UTC.to_datetime(ts);
    write_4_digits(dt.year() as u32, out);
    out.push('-');
    write_2_digits(dt.month() as u32, out);
    out.push('-');
    write_2_digits(dt.day() as u32, out);
    out.push('T');
    write_2_digits(dt.hour() as u32, out);
    out.push(':');
    write_2_digits(dt.minute() as u32, out);
    out.push(':');
    write_2_digits(dt.second() as u32, out);
    out.push('.');
    write_n_digits((ticks % 10_000_000) as u32, 7, out);
    out.push('Z');
}

/// Render the eight `u16` fields of a Windows SYSTEMTIME
/// (`year, month, dayOfWeek, day, hour, minute, second, milliseconds`) as
/// `YYYY-MM-DDTHH:MM:SS.fffZ`.
pub(crate) fn write_systemtime(fields: [u16; 8], out: &mut String) {
    let [year, month, _day_of_week, day, hour, minute, second, millis] = fields;
    write_4_digits(u32::from(year), out);
    out.push('-');
    write_2_digits(u32::from(month), out);
    out.push('-');
    write_2_digits(u32::from(day), out);
    out.push('T');
    write_2_digits(u32::from(hour), out);
    out.push(':');
    write_2_digits(u32::from(minute), out);
    out.push(':');
    write_2_digits(u32::from(second), out);
    out.push('.');
    write_n_digits(u32::from(millis), 3, out);
    out.push('Z');
}

fn write_2_digits(value: u32, out: &mut String) {
    out.push((b'0' + ((value / 10) % 10) as u8) as char);
    out.push((b'0' + (value % 10) as u8) as char);
}

fn write_4_digits(value: u32, out: &mut String) {
    write_2_digits(value / 100, out);
    write_2_digits(value, out);
}

fn write_n_digits(value: u32, n: u32, out: &mut String) {
    for i in (0..n).rev() {
        let digit = (value / 10u32.pow(i)) % 10;
        out.push((b'0' + digit as u8) as char);
    }
}
