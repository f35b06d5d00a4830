//! Conversion between Unix time and exFAT local date/time fields.
//!
//! exFAT stores timestamps in local time with a 1980 epoch and 2 second
//! granularity. `timezone` is the offset of local time from UTC in seconds,
//! positive west of Greenwich.

use log::error;

const SEC_IN_MIN: i64 = 60;
const SEC_IN_HOUR: i64 = 60 * SEC_IN_MIN;
const SEC_IN_DAY: i64 = 24 * SEC_IN_HOUR;
const SEC_IN_YEAR: i64 = 365 * SEC_IN_DAY;
const EXFAT_EPOCH_YEAR: i64 = 1980;
const EPOCH_DIFF_YEAR: i64 = EXFAT_EPOCH_YEAR - 1970;
const EPOCH_DIFF_DAYS: i64 = EPOCH_DIFF_YEAR * 365 + EPOCH_DIFF_YEAR / 4;
pub const EPOCH_DIFF_SEC: i64 = EPOCH_DIFF_DAYS * SEC_IN_DAY;

/// Days before the first day of each month in a non-leap year, 1-based
const DAYS_IN_YEAR: [i64; 13] = [0, 0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];

/// Leap years between the exFAT epoch and `year`, excluding `year`
fn leap_years(year: i64) -> i64 {
    (EXFAT_EPOCH_YEAR + year - 1) / 4 - (EXFAT_EPOCH_YEAR - 1) / 4
}

fn is_leap_year(year: i64) -> bool {
    (EXFAT_EPOCH_YEAR + year) % 4 == 0
}

/// Encoded exFAT timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub date: u16,
    pub time: u16,
    /// Centiseconds, 0..=199
    pub centisec: u8,
}

/// Unix time of an on-disk timestamp, 0 for malformed fields
pub fn exfat_to_unix(stamp: Timestamp, timezone: i64) -> i64 {
    let day = (stamp.date & 0x1f) as i64;
    let month = (stamp.date >> 5 & 0xf) as i64;
    let year = (stamp.date >> 9) as i64;
    let twosec = (stamp.time & 0x1f) as i64;
    let min = (stamp.time >> 5 & 0x3f) as i64;
    let hour = (stamp.time >> 11) as i64;

    if day == 0 || month == 0 || month > 12 {
        error!(
            "Bad date {}-{month:02}-{day:02}",
            year + EXFAT_EPOCH_YEAR
        );
        return 0;
    }
    if hour > 23 || min > 59 || twosec > 29 {
        error!("Bad time {hour}:{min:02}:{:02}", twosec * 2);
        return 0;
    }
    if stamp.centisec > 199 {
        error!("Bad centiseconds count {}", stamp.centisec);
        return 0;
    }

    let mut unix = EPOCH_DIFF_SEC;
    unix += year * SEC_IN_YEAR + leap_years(year) * SEC_IN_DAY;
    unix += DAYS_IN_YEAR[month as usize] * SEC_IN_DAY;
    if is_leap_year(year) && month > 2 {
        unix += SEC_IN_DAY;
    }
    unix += (day - 1) * SEC_IN_DAY;
    unix += hour * SEC_IN_HOUR + min * SEC_IN_MIN + twosec * 2;
    unix += stamp.centisec as i64 / 100;
    unix + timezone
}

/// On-disk timestamp of a Unix time, clamped to the exFAT epoch
pub fn unix_to_exfat(unix: i64, timezone: i64) -> Timestamp {
    let shift = EPOCH_DIFF_SEC + timezone;
    let unix = unix.max(shift) - shift;

    let mut days = unix / SEC_IN_DAY;
    let year = (4 * days) / (4 * 365 + 1);
    days -= year * 365 + leap_years(year);

    let mut month = 12;
    for i in 1..=12 {
        let leap_day = (is_leap_year(year) && i == 2) as i64;
        let leap_sub = (is_leap_year(year) && i >= 3) as i64;
        if i == 12 || days - leap_sub < DAYS_IN_YEAR[i + 1] + leap_day {
            month = i;
            days -= DAYS_IN_YEAR[i] + leap_sub;
            break;
        }
    }
    let day = days + 1;
    let hour = (unix % SEC_IN_DAY) / SEC_IN_HOUR;
    let min = (unix % SEC_IN_HOUR) / SEC_IN_MIN;
    let twosec = (unix % SEC_IN_MIN) / 2;

    Timestamp {
        date: (day | (month as i64) << 5 | year << 9) as u16,
        time: (twosec | min << 5 | hour << 11) as u16,
        centisec: ((unix % 2) * 100) as u8,
    }
}

/// Local time offset from UTC in seconds, positive west of Greenwich
#[cfg(unix)]
pub fn local_timezone() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as libc::time_t)
        .unwrap_or(0);
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::localtime_r(&now, &mut tm) };
    if result.is_null() {
        return 0;
    }
    -(tm.tm_gmtoff as i64)
}

#[cfg(not(unix))]
pub fn local_timezone() -> i64 {
    0
}

/// Current Unix time in seconds
pub fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
