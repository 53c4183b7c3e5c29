//! Human-readable formatting for progress output.

use chrono::{DateTime, Local, Utc};

/// Compact elapsed time such as `1h 2m 3s`. Leading zero units are dropped,
/// later ones kept (`1h 0m 5s`).
pub fn elapsed(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    let values = [
        (total / 86_400, "d"),
        (total / 3_600 % 24, "h"),
        (total / 60 % 60, "m"),
        (total % 60, "s"),
    ];

    let parts: Vec<String> = values
        .iter()
        .skip_while(|(v, _)| *v == 0)
        .map(|(v, unit)| format!("{v}{unit}"))
        .collect();
    if parts.is_empty() {
        "0s".to_string()
    } else {
        parts.join(" ")
    }
}

/// Binary-prefixed size such as `1.5MiB`.
pub fn size(bytes: u64) -> String {
    const UNITS: [&str; 8] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value.abs() < 1024.0 {
            return format!("{value:.1}{unit}B");
        }
        value /= 1024.0;
    }
    format!("{value:.1}YiB")
}

/// Millisecond epoch timestamp in local time.
pub fn local_timestamp(millis: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(utc) => utc
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string(),
        None => millis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn elapsed_drops_leading_zero_units() {
        assert_eq!(elapsed(Duration::zero()), "0s");
        assert_eq!(elapsed(Duration::seconds(42)), "42s");
        assert_eq!(elapsed(Duration::seconds(3_605)), "1h 0m 5s");
        assert_eq!(elapsed(Duration::seconds(90_061)), "1d 1h 1m 1s");
    }

    #[test]
    fn sizes() {
        assert_eq!(size(512), "512.0B");
        assert_eq!(size(1_536), "1.5KiB");
        assert_eq!(size(3 * 1024 * 1024), "3.0MiB");
    }
}
