/// Whether `value` contains any whitelist entry, case-insensitively.
///
/// An empty whitelist allows everything. Entries are trimmed before
/// comparison; an empty `value` never matches a non-empty whitelist.
pub fn matches_whitelist(value: &str, whitelist: &[String]) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    if value.is_empty() {
        return false;
    }
    let input = value.to_lowercase();
    whitelist
        .iter()
        .any(|entry| input.contains(&entry.trim().to_lowercase()))
}

/// Decide whether a message should be forwarded.
///
/// Each list is checked on its own (empty means pass) and the two results
/// are OR-ed, so either whitelist alone is enough to admit a message.
pub fn accept(
    sender: &str,
    body: &str,
    sender_filter: &[String],
    keyword_filter: &[String],
) -> bool {
    matches_whitelist(sender, sender_filter) || matches_whitelist(body, keyword_filter)
}
