//! Post-processing: deterministic cleanup of model output.
//!
//! Even well-prompted models wrap answers in fences, add preambles, emit
//! `\r\n`, or break pipe tables. These rules fix such quirks without
//! touching content, so prompts can stay focused on *what* to extract.
//!
//! Three entry points:
//! * [`clean_table_markup`] — table structuring output
//! * [`clean_caption`]      — caption output
//! * [`extract_json`]       — locate the JSON payload in a structured answer

use once_cell::sync::Lazy;
use regex::Regex;

/// Clean a reconstructed table. Returns `None` when nothing table-like is left.
///
/// Rules (in order):
/// 1. Strip outer code fences
/// 2. Normalise line endings
/// 3. Strip invisible Unicode
/// 4. Trim trailing whitespace per line
/// 5. Collapse runs of blank lines
/// 6. Insert a missing header separator row
/// 7. Remove spurious mid-table separator rows
pub fn clean_table_markup(input: &str) -> Option<String> {
    let s = strip_fences(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = fix_broken_tables(&s);
    let s = remove_mid_table_separators(&s);
    let s = s.trim().to_string();

    if s.lines().any(is_table_row) {
        Some(s)
    } else {
        None
    }
}

/// Clean a caption: one paragraph of plain text, `None` if empty.
pub fn clean_caption(input: &str) -> Option<String> {
    let s = strip_fences(input);
    let s = remove_invisible_chars(&s);
    let s = s.split_whitespace().collect::<Vec<_>>().join(" ");
    (!s.is_empty()).then_some(s)
}

// ── Rule 1: Strip outer fences ───────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\s*\n(.*?)\n?```\s*$").unwrap());

fn strip_fences(input: &str) -> String {
    let trimmed = input.trim();
    if let Some(caps) = RE_OUTER_FENCES.captures(trimmed) {
        caps[1].to_string()
    } else {
        trimmed.to_string()
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 6: Fix broken GFM tables ───────────────────────────────────────────

/// Insert a separator after a table's first row when the model left it out.
fn fix_broken_tables(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut result = Vec::with_capacity(lines.len() + 4);
    let mut prev_is_row = false;

    for (i, line) in lines.iter().enumerate() {
        result.push(line.to_string());
        let is_row = is_table_row(line);
        let starts_table = is_row && !prev_is_row && !is_separator_row(line);
        if starts_table {
            let next = lines.get(i + 1).copied().unwrap_or("");
            if is_table_row(next) && !is_separator_row(next) {
                let col_count = line.matches('|').count().saturating_sub(1).max(1);
                let sep: String = std::iter::once("|")
                    .chain(std::iter::repeat_n(" --- |", col_count))
                    .collect();
                result.push(sep);
            }
        }
        prev_is_row = is_row;
    }

    result.join("\n")
}

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.ends_with('|') && trimmed.len() > 2
}

fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|')
        && trimmed.contains('-')
        && trimmed
            .chars()
            .all(|c| c == '|' || c == '-' || c == ':' || c == ' ')
}

// ── Rule 7: Remove spurious mid-table separator rows ────────────────────────
//
// GFM only allows a separator directly after the header row; models
// sometimes repeat it between body rows.

fn remove_mid_table_separators(input: &str) -> String {
    let mut result: Vec<&str> = Vec::new();
    let mut table_line_count = 0usize;

    for line in input.lines() {
        if is_table_row(line) {
            table_line_count += 1;
            if is_separator_row(line) && table_line_count != 2 {
                continue;
            }
        } else {
            table_line_count = 0;
        }
        result.push(line);
    }

    result.join("\n")
}

// ── JSON extraction ─────────────────────────────────────────────────────────

/// Locate the JSON value in a model answer.
///
/// Accepts a bare value, a fenced block, or a value surrounded by prose, and
/// returns the outermost balanced `{…}` / `[…]` span. Strings are skipped
/// while balancing so braces inside titles do not confuse the scan.
pub fn extract_json(input: &str) -> Option<&str> {
    let start = input.find(['{', '['])?;
    let bytes = input.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&input[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences("```markdown\n| a |\n```"), "| a |");
        assert_eq!(strip_fences("```\n| a |\n```"), "| a |");
        assert_eq!(strip_fences("| a |"), "| a |");
    }

    #[test]
    fn test_fix_broken_table() {
        let result = fix_broken_tables("| A | B |\n| 1 | 2 |");
        let lines: Vec<&str> = result.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(is_separator_row(lines[1]));
    }

    #[test]
    fn test_table_with_separator_unchanged() {
        let input = "| A | B |\n| --- | --- |\n| 1 | 2 |";
        assert_eq!(fix_broken_tables(input), input);
    }

    #[test]
    fn test_remove_mid_table_separator() {
        let input = "| A | B |\n| --- | --- |\n| 1 | 2 |\n| --- | --- |\n| 3 | 4 |";
        let result = remove_mid_table_separators(input);
        let sep_count = result.lines().filter(|l| is_separator_row(l)).count();
        assert_eq!(sep_count, 1);
        assert!(result.contains("| 3 | 4 |"));
    }

    #[test]
    fn clean_table_markup_full_pipeline() {
        let raw = "```markdown\r\n**GDP**\r\n\r\n\r\n\r\n| Year | GDP |  \r\n| 2022 | 2.1% |\r\n| --- | --- |\r\n| 2023 | 2.5% |\r\n```";
        let t = clean_table_markup(raw).unwrap();
        assert!(t.starts_with("**GDP**"));
        assert!(!t.contains('\r'));
        assert!(!t.contains("\n\n\n"));
        assert_eq!(t.lines().filter(|l| is_separator_row(l)).count(), 1);
        assert!(t.contains("| 2023 | 2.5% |"));
    }

    #[test]
    fn clean_table_markup_rejects_prose() {
        assert_eq!(clean_table_markup("I cannot read this table."), None);
        assert_eq!(clean_table_markup(""), None);
    }

    #[test]
    fn clean_caption_flattens_whitespace() {
        assert_eq!(
            clean_caption("  A bar chart\n\nshowing\u{200B} growth. ").as_deref(),
            Some("A bar chart showing growth.")
        );
        assert_eq!(clean_caption(" \n "), None);
    }

    #[test]
    fn extract_json_finds_payload() {
        assert_eq!(extract_json(r#"{"a":1}"#), Some(r#"{"a":1}"#));
        assert_eq!(
            extract_json("```json\n{\"elements\": []}\n```"),
            Some("{\"elements\": []}")
        );
        assert_eq!(
            extract_json(r#"Here you go: [{"t":"a}b"}] hope it helps"#),
            Some(r#"[{"t":"a}b"}]"#)
        );
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("{\"open\": true"), None);
    }
}
