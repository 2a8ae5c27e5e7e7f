//! Thin natural-language schedule parser.
//!
//! Recognises shorthands like `every day at 9am` and lowers them to 5-field
//! cron before storage; anything it does not recognise falls through to the
//! cron/RFC-3339 parsers. Storage is always canonical cron or an absolute
//! timestamp — never the English form.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

use anyhow::{Result, bail};

use super::types::{JobSchedule, validate_cron_expr};

/// Detect the system's IANA timezone (e.g. "America/New_York").
/// Returns None if detection fails.
pub fn detect_system_timezone() -> Option<String> {
    iana_time_zone::get_timezone().ok()
}

/// Parse any accepted schedule input: RFC-3339 timestamp, 5-field cron, or a
/// natural-language shorthand.
pub fn parse_schedule(input: &str, tz: Option<String>) -> Result<JobSchedule> {
    let trimmed = input.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(JobSchedule::At {
            at: at.with_timezone(&Utc),
        });
    }
    if validate_cron_expr(trimmed).is_ok() && trimmed.split_whitespace().count() == 5 {
        return Ok(JobSchedule::Cron {
            expr: trimmed.to_string(),
            tz,
        });
    }
    if let Some(expr) = lower_natural(trimmed) {
        return Ok(JobSchedule::Cron { expr, tz });
    }
    bail!(
        "unrecognised schedule '{}'; use 5-field cron, RFC-3339, or a shorthand like 'every day at 9am'",
        input
    )
}

fn time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bat\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?").expect("static regex"))
}

fn every_n_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bevery\s+(\d+)\s+(minute|hour)s?\b").expect("static regex"))
}

fn weekday_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bevery\s+(monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b")
            .expect("static regex")
    })
}

/// Extract `(hour, minute)` from an `at HH[:MM][am|pm]` clause; defaults to
/// 09:00 when the phrase names no time.
fn extract_time(input: &str) -> (u32, u32) {
    let Some(caps) = time_regex().captures(input) else {
        return (9, 0);
    };
    let mut hour: u32 = caps
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(9);
    let minute: u32 = caps
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    match caps.get(3).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(ref ampm) if ampm == "pm" && hour < 12 => hour += 12,
        Some(ref ampm) if ampm == "am" && hour == 12 => hour = 0,
        _ => {}
    }
    (hour.min(23), minute.min(59))
}

/// Lower a recognised shorthand to a 5-field cron expression.
pub fn lower_natural(input: &str) -> Option<String> {
    let lower = input.to_ascii_lowercase();

    if let Some(caps) = every_n_regex().captures(&lower) {
        let n: u32 = caps.get(1)?.as_str().parse().ok()?;
        if n == 0 {
            return None;
        }
        return match caps.get(2)?.as_str() {
            "minute" => Some(format!("*/{} * * * *", n)),
            "hour" => Some(format!("0 */{} * * *", n)),
            _ => None,
        };
    }

    if lower.contains("every minute") {
        return Some("* * * * *".to_string());
    }
    if lower.contains("every hour") || lower.contains("hourly") {
        return Some("0 * * * *".to_string());
    }

    if let Some(caps) = weekday_regex().captures(&lower) {
        let day = match caps.get(1)?.as_str() {
            "sunday" => 0,
            "monday" => 1,
            "tuesday" => 2,
            "wednesday" => 3,
            "thursday" => 4,
            "friday" => 5,
            "saturday" => 6,
            _ => return None,
        };
        let (hour, minute) = extract_time(&lower);
        return Some(format!("{} {} * * {}", minute, hour, day));
    }

    if lower.contains("weekday") {
        let (hour, minute) = extract_time(&lower);
        return Some(format!("{} {} * * 1-5", minute, hour));
    }

    if lower.contains("every day") || lower.contains("daily") || lower.contains("every morning") {
        let (hour, minute) = extract_time(&lower);
        return Some(format!("{} {} * * *", minute, hour));
    }

    None
}
