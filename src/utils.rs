//! Small helpers shared by commands and features

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Parse a human duration like `10s`, `5m`, `2h` or `1d`
///
/// Returns `None` for an unknown unit, a missing or zero amount, or a value
/// too large to represent.
#[must_use]
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    let unit = input.chars().last()?;
    let amount: i64 = input[..input.len() - unit.len_utf8()].trim().parse().ok()?;
    if amount <= 0 {
        return None;
    }

    let per_unit = match unit.to_ascii_lowercase() {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        _ => return None,
    };
    amount.checked_mul(per_unit).and_then(Duration::try_seconds)
}

/// Render a duration the way `parse_duration` accepts it, largest unit first
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.num_seconds().max(0);
    if secs == 0 {
        return "0s".to_string();
    }

    let mut parts = Vec::new();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
        if secs >= size {
            parts.push(format!("{}{unit}", secs / size));
            secs %= size;
        }
    }
    parts.join(" ")
}

/// Parse a `MM-DD` birthday. February 29 is accepted.
#[must_use]
pub fn parse_month_day(input: &str) -> Option<(u32, u32)> {
    let date = NaiveDate::parse_from_str(&format!("2000-{}", input.trim()), "%Y-%m-%d").ok()?;
    Some((chrono::Datelike::month(&date), chrono::Datelike::day(&date)))
}

/// User ids from `<@id>` / `<@!id>` mentions in free text
#[must_use]
pub fn parse_mentions(input: &str) -> Vec<u64> {
    input
        .split_whitespace()
        .filter_map(|token| {
            token
                .strip_prefix("<@")?
                .strip_suffix('>')
                .map(|id| id.trim_start_matches('!'))
                .and_then(|id| id.parse().ok())
        })
        .collect()
}

/// Discord timestamp markup, shown to each reader in their own timezone
#[must_use]
pub fn discord_timestamp(at: DateTime<Utc>) -> String {
    format!("<t:{}:F>", at.timestamp())
}
