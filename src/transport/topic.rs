//! Topic string matching
//!
//! Subscriptions use `/`-separated topic strings where `+` matches exactly one
//! level and a trailing `#` matches any remaining levels (including none).

/// Does `topic` match the subscription `filter`?
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
