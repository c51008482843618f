//! Small pure text helpers.

/// Keep up to `max_content` characters of `raw`, then append `suffix`.
///
/// The suffix does NOT count toward the budget. Strings at or under the
/// budget are returned unchanged.
#[must_use]
pub fn truncate_preview(raw: &str, max_content: usize, suffix: &str) -> String {
    if raw.chars().count() <= max_content {
        return raw.to_string();
    }
    let head: String = raw.chars().take(max_content).collect();
    format!("{head}{suffix}")
}

/// Join at most `max` items with `", "`, noting how many were left out.
///
/// `["a", "b", "c"]` with `max = 2` becomes `"a, b (+1 more)"`.
#[must_use]
pub fn join_capped<S: AsRef<str>>(items: &[S], max: usize) -> String {
    let mut joined = items
        .iter()
        .take(max)
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(", ");
    if items.len() > max {
        joined.push_str(&format!(" (+{} more)", items.len() - max));
    }
    joined
}
