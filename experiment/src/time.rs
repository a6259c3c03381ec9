// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};

use crate::error::{Error, Result};

///
/// Parse an ISO-8601 duration (`PnW`, `PnDTnHnMnS`). The seconds component may
/// be fractional. Calendar components (years, months) have no fixed length and
/// are rejected.
///
pub fn parse_iso_duration(input: &str) -> Result<Duration> {
    let bad = || Error::syntax(format!("invalid ISO-8601 duration '{input}'"));

    let mut chars = input.chars().peekable();
    if chars.next() != Some('P') {
        return Err(bad());
    }

    let mut total = Duration::ZERO;
    let mut in_time = false;
    let mut saw_component = false;

    while let Some(&c) = chars.peek() {
        if c == 'T' {
            if in_time {
                return Err(bad());
            }
            in_time = true;
            chars.next();
            continue;
        }

        let mut number = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() || d == '.' {
                number.push(d);
                chars.next();
            } else {
                break;
            }
        }
        let value: f64 = number.parse().map_err(|_| bad())?;
        let designator = chars.next().ok_or_else(bad)?;

        let seconds = match (in_time, designator) {
            (false, 'W') => value * 7.0 * 86_400.0,
            (false, 'D') => value * 86_400.0,
            (false, 'Y') | (false, 'M') => {
                return Err(Error::syntax(format!(
                    "calendar components are not supported in duration '{input}'"
                )));
            }
            (true, 'H') => value * 3_600.0,
            (true, 'M') => value * 60.0,
            (true, 'S') => value,
            _ => return Err(bad()),
        };
        total += Duration::from_secs_f64(seconds);
        saw_component = true;
    }

    // "P" and "PT" alone carry no duration.
    if !saw_component {
        return Err(bad());
    }
    Ok(total)
}

///
/// Parse an absolute timestamp: RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS`
/// (`T` separator also accepted) interpreted in the controller's local time.
///
pub fn parse_timestamp(input: &str) -> Result<DateTime<Local>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Local));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Local.from_local_datetime(&naive).earliest().ok_or_else(|| {
                Error::syntax(format!("timestamp '{input}' does not exist in local time"))
            });
        }
    }
    Err(Error::syntax(format!("invalid timestamp '{input}'")))
}
