// SPDX-License-Identifier: Apache-2.0

use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::{DhcpError, ErrorKind};

/// Largest representable absolute time. Lease arithmetic that would
/// overflow clamps here instead of wrapping.
pub(crate) const TIME_MAX: i64 = i64::MAX;

pub(crate) const USEC_PER_SEC: i64 = 1_000_000;

/// Wall-clock microseconds since the epoch.
pub(crate) fn now_usec() -> i64 {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    unsafe {
        libc::gettimeofday(&mut tv as *mut libc::timeval, std::ptr::null_mut());
    }
    (tv.tv_sec as i64) * USEC_PER_SEC + (tv.tv_usec as i64)
}

/// Add an unsigned offset to an absolute time, clamping to TIME_MAX on
/// overflow. A lease length can never make time run backwards.
pub(crate) fn clamped_add(base: i64, offset: i64) -> i64 {
    match base.checked_add(offset) {
        Some(t) if t >= base => t,
        _ => TIME_MAX,
    }
}

/// Format an absolute time the way the lease database expects:
/// `W Y/M/D H:M:S` in UTC, where W is the day of week (0 = Sunday).
pub(crate) fn format_lease_time(t: i64) -> String {
    if t == TIME_MAX {
        return "never".to_string();
    }
    match Utc.timestamp_opt(t, 0).single() {
        Some(dt) => dt.format("%w %Y/%m/%d %H:%M:%S").to_string(),
        None => "never".to_string(),
    }
}

/// Parse a `W Y/M/D H:M:S` lease time (or the keyword `never`). The
/// leading day of week is accepted and ignored; the date is what counts.
pub(crate) fn parse_lease_time(words: &[&str]) -> Result<i64, DhcpError> {
    if words.first() == Some(&"never") {
        return Ok(TIME_MAX);
    }
    if words.len() != 3 {
        return Err(DhcpError::new(
            ErrorKind::InvalidLeaseFile,
            format!("Invalid lease time {words:?}, expecting 'W Y/M/D H:M:S'"),
        ));
    }
    let date_time = format!("{} {}", words[1], words[2]);
    let dt = NaiveDateTime::parse_from_str(&date_time, "%Y/%m/%d %H:%M:%S")
        .map_err(|e| {
            DhcpError::new(
                ErrorKind::InvalidLeaseFile,
                format!("Invalid lease time {date_time}: {e}"),
            )
        })?;
    Ok(dt.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamped_add_overflow() {
        assert_eq!(clamped_add(TIME_MAX - 10, 600), TIME_MAX);
        assert_eq!(clamped_add(1000, 600), 1600);
    }

    #[test]
    fn test_lease_time_round_trip() {
        let t = 1700000000;
        let s = format_lease_time(t);
        let words: Vec<&str> = s.split_whitespace().collect();
        assert_eq!(parse_lease_time(&words).unwrap(), t);
    }

    #[test]
    fn test_lease_time_never() {
        assert_eq!(format_lease_time(TIME_MAX), "never");
        assert_eq!(parse_lease_time(&["never"]).unwrap(), TIME_MAX);
    }
}
