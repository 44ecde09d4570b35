use chrono::{DateTime, Utc};

// ============== Timestamp Helpers ==============

/// Microsecond wall-clock stamp used to keep media file names unique.
pub fn unix_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Human date shown in subscription texts, e.g. `2026-10-16 09:30 UTC`.
pub fn fmt_dt(ts: i64) -> String {
    match DateTime::<Utc>::from_timestamp(ts, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M UTC").to_string(),
        None => ts.to_string(),
    }
}

// ============== Text Helpers ==============

/// Trim and cap `s` at `max_chars` characters, ending with `...` when cut.
///
/// Empty input becomes `[empty]` so notifications never carry a blank body.
pub fn clip_text(s: &str, max_chars: usize) -> String {
    let t = s.trim();
    if t.is_empty() {
        return "[empty]".to_string();
    }
    if t.chars().count() <= max_chars {
        return t.to_string();
    }
    let mut out = t
        .chars()
        .take(max_chars.saturating_sub(3))
        .collect::<String>();
    out.push_str("...");
    out
}

/// Hard cap without trimming, for long admin listings.
pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = s.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmt_dt_is_utc() {
        assert_eq!(fmt_dt(0), "1970-01-01 00:00 UTC");
        assert_eq!(fmt_dt(1_700_000_000), "2023-11-14 22:13 UTC");
    }

    #[test]
    fn clip_text_caps_length_including_ellipsis() {
        let s = "я".repeat(2000);
        let t = clip_text(&s, 1500);
        assert_eq!(t.chars().count(), 1500);
        assert!(t.ends_with("..."));
        assert_eq!(clip_text("  hi  ", 10), "hi");
        assert_eq!(clip_text("   ", 10), "[empty]");
    }

    #[test]
    fn truncate_text_adds_ellipsis() {
        let s = "a".repeat(20);
        let t = truncate_text(&s, 10);
        assert_eq!(t, format!("{}...", "a".repeat(10)));
        assert_eq!(truncate_text("abc", 10), "abc");
    }
}
