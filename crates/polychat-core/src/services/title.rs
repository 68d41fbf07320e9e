/// Fallback title for conversations with no usable first input.
const PLACEHOLDER_TITLE: &str = "New Chat";

/// Maximum title length before truncation.
const MAX_TITLE_LEN: usize = 60;

/// Truncate text to at most `max_len` characters.
fn truncate_text(text: &str, max_len: usize) -> String {
    text.chars().take(max_len).collect()
}

/// Derive a display title from the first user input: first line, trimmed,
/// quotes stripped, truncated with an ellipsis.
pub fn derive_title(first_input: &str) -> String {
    let cleaned = first_input
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string();

    if cleaned.is_empty() {
        PLACEHOLDER_TITLE.to_string()
    } else if cleaned.chars().count() > MAX_TITLE_LEN {
        format!("{}...", truncate_text(&cleaned, MAX_TITLE_LEN - 3))
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_first_line_only() {
        assert_eq!(derive_title("explain borrowck\nplease"), "explain borrowck");
    }

    #[test]
    fn empty_input_gets_placeholder() {
        assert_eq!(derive_title("   \n  "), "New Chat");
    }

    #[test]
    fn long_input_is_truncated_with_ellipsis() {
        let long = "x".repeat(200);
        let title = derive_title(&long);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= MAX_TITLE_LEN);
    }

    #[test]
    fn surrounding_quotes_are_stripped() {
        assert_eq!(derive_title("\"hello\""), "hello");
    }
}
