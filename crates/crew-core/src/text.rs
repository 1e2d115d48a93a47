//! Small text helpers for excerpts and titles.

/// Words taken from a prompt when generating a title.
const TITLE_WORDS: usize = 6;

/// Returns at most `max_chars` characters of `text`, marking the cut.
///
/// Counts characters, not bytes, so multi-byte input never splits.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Short summary of a prompt: its first line, first few words.
pub fn prompt_summary(prompt: &str) -> String {
    let first_line = prompt.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let words: Vec<&str> = first_line.split_whitespace().collect();
    let mut summary = words
        .iter()
        .take(TITLE_WORDS)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    if words.len() > TITLE_WORDS {
        summary.push_str("...");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_short_text_unchanged() {
        assert_eq!(excerpt("  hello  ", 10), "hello");
    }

    #[test]
    fn test_excerpt_cuts_on_char_boundary() {
        assert_eq!(excerpt("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn test_prompt_summary() {
        assert_eq!(prompt_summary("fix the bug"), "fix the bug");
        assert_eq!(
            prompt_summary("\nplease refactor the parser module into smaller files\nthanks"),
            "please refactor the parser module into..."
        );
        assert_eq!(prompt_summary("   "), "");
    }
}
