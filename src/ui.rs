use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use safeguard::ResourceState;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Colored label for a resource state
pub fn state_badge(state: ResourceState) -> ColoredString {
    let label = state.as_str();
    match state {
        ResourceState::Unknown => label.dimmed(),
        ResourceState::Unlocked => label.green(),
        ResourceState::Locked => label.yellow(),
        ResourceState::Mutating => label.magenta().bold(),
        ResourceState::Deleted => label.red(),
    }
}

// ============================================================================
// Time Formatting
// ============================================================================

/// Format the time elapsed since `at` as a short age ("42s", "3m", "5h", "2d")
pub fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3_600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3_600),
        s => format!("{}d", s / 86_400),
    }
}

/// Truncate a string for display, keeping the start
pub fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let kept: String = text.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_age_units() {
        let now = Utc::now();
        assert_eq!(format_age(now, now), "0s");
        assert_eq!(format_age(now - Duration::seconds(59), now), "59s");
        assert_eq!(format_age(now - Duration::seconds(61), now), "1m");
        assert_eq!(format_age(now - Duration::minutes(90), now), "1h");
        assert_eq!(format_age(now - Duration::hours(49), now), "2d");
    }

    #[test]
    fn test_format_age_future_is_zero() {
        let now = Utc::now();
        assert_eq!(format_age(now + Duration::seconds(30), now), "0s");
    }

    #[test]
    fn test_truncate_short() {
        assert_eq!(truncate("short", 20), "short");
        assert_eq!(truncate("exact", 5), "exact");
        assert_eq!(truncate("", 10), "");
    }

    #[test]
    fn test_truncate_long() {
        assert_eq!(truncate("permission denied by policy", 12), "permissio...");
        assert_eq!(truncate("test", 3), "...");
    }

    #[test]
    fn test_state_badge_keeps_label() {
        colored::control::set_override(false);
        assert_eq!(state_badge(ResourceState::Mutating).to_string(), "mutating");
        colored::control::unset_override();
    }
}
