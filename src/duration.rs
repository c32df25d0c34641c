//! Duration strings used by mirror intervals, schedules and the staleness filter.
//!
//! Two dialects are accepted:
//!
//! - Go-style durations (`8h0m0s`, `90m`, `1.5h`, `0`), which is what hosting
//!   services report for mirror intervals.
//! - Staleness strings, which allow calendar prefixes for years (`y`), months (`M`)
//!   and days (`d`) in front of a Go-style remainder (`1y6M`, `30d12h`).

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Months, Utc};
use std::time::Duration;

/// Parse a Go-style duration such as `8h0m0s`, `90m`, `1.5h` or `0`.
pub fn parse_go_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("empty duration"));
    }
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let mut nanos = 0f64;
    let mut rest = trimmed;

    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return Err(anyhow!("expected a number in duration {:?}", input));
        }

        let value: f64 = rest[..number_end]
            .parse()
            .with_context(|| format!("invalid number in duration {:?}", input))?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(anyhow!("missing unit in duration {:?}", input)),
            other => return Err(anyhow!("unknown unit {:?} in duration {:?}", other, input)),
        };

        nanos += value * scale;
        rest = &rest[unit_end..];
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Format a duration the way Go prints it (`8h0m0s`, `30m0s`, `45s`).
///
/// Sub-second precision is dropped; mirror intervals never carry it.
pub fn format_go_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Maximum time since the last activity of a repository.
///
/// Calendar parts are resolved against an explicit `now`, so evaluating the
/// same staleness twice with the same clock always yields the same cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Staleness {
    years: u32,
    months: u32,
    days: u32,
    rest: Duration,
}

impl Staleness {
    /// No time restriction.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Parse a staleness string like `1y2M3d4h30m`. Empty and `0` mean unlimited.
    pub fn parse(input: &str) -> Result<Self> {
        let mut rest = input.trim();
        if rest.is_empty() {
            return Ok(Self::unlimited());
        }

        let years = take_calendar_part(&mut rest, 'y', input)?;
        let months = take_calendar_part(&mut rest, 'M', input)?;
        let days = take_calendar_part(&mut rest, 'd', input)?;

        let rest = if rest.trim().is_empty() {
            Duration::ZERO
        } else {
            parse_go_duration(rest)?
        };

        Ok(Self {
            years,
            months,
            days,
            rest,
        })
    }

    pub fn is_unlimited(&self) -> bool {
        self.years == 0 && self.months == 0 && self.days == 0 && self.rest.is_zero()
    }

    /// Oldest activity timestamp that is still considered fresh at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let months = self.years.saturating_mul(12).saturating_add(self.months);
        let rest = chrono::Duration::from_std(self.rest).unwrap_or_else(|_| chrono::Duration::zero());

        now.checked_sub_months(Months::new(months))
            .and_then(|t| t.checked_sub_signed(chrono::Duration::days(i64::from(self.days))))
            .and_then(|t| t.checked_sub_signed(rest))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// True when `last_activity` lies before the cutoff. Unlimited never rejects.
    pub fn is_stale(&self, last_activity: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        !self.is_unlimited() && last_activity < self.cutoff(now)
    }
}

fn take_calendar_part(rest: &mut &str, marker: char, input: &str) -> Result<u32> {
    match rest.find(marker) {
        Some(index) => {
            let value = rest[..index]
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid '{}' component in {:?}", marker, input))?;
            *rest = &rest[index + marker.len_utf8()..];
            Ok(value)
        }
        None => Ok(0),
    }
}
