//! Character-budget helpers.
//!
//! Budgets are measured in bytes of UTF-8, which is what every provider
//! bills against most closely without a tokenizer. Cuts always land on a
//! char boundary.

/// Appended to a segment that was cut.
pub const TRUNCATION_MARKER: &str = "\n[…truncated]";

/// Largest prefix of `s` no longer than `max` bytes.
pub fn floor_prefix(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Cut `s` to at most `cap` bytes, marker included.
///
/// Returns the text and whether it was cut. A cap too small to hold the
/// marker yields a bare prefix.
pub fn truncate_to(s: &str, cap: usize) -> (String, bool) {
    if s.len() <= cap {
        return (s.to_string(), false);
    }
    if cap < TRUNCATION_MARKER.len() {
        return (floor_prefix(s, cap).to_string(), true);
    }
    let head = floor_prefix(s, cap - TRUNCATION_MARKER.len()).trim_end();
    (format!("{head}{TRUNCATION_MARKER}"), true)
}
