//! Post-conversion cleanup pipeline.
//!
//! Each pass is a function `&str -> String` applied in sequence.

use std::sync::LazyLock;

use regex::Regex;

/// Run the cleanup pipeline. `from_pdf` enables the passes that only make
/// sense for text extracted from paginated documents.
pub(crate) fn run_pipeline(text: &str, from_pdf: bool) -> String {
    let mut result = normalize_line_endings(text);

    if from_pdf {
        result = mark_page_breaks(&result);
        result = strip_page_furniture(&result);
    }
    result = normalize_whitespace(&result);
    result = clean_blank_lines(&result);
    result = ensure_trailing_newline(&result);

    result
}

// ---------------------------------------------------------------------------
// Pass 1: Line endings
// ---------------------------------------------------------------------------

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

// ---------------------------------------------------------------------------
// Pass 2: Page breaks (PDF only)
// ---------------------------------------------------------------------------

/// Replace form feeds between pages with a page marker line so page
/// boundaries survive into the Markdown.
fn mark_page_breaks(text: &str) -> String {
    if !text.contains('\x0c') {
        return text.to_string();
    }
    text.split('\x0c')
        .enumerate()
        .filter(|(_, page)| !page.trim().is_empty())
        .map(|(i, page)| format!("<!-- page {} -->\n{}", i + 1, page.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ---------------------------------------------------------------------------
// Pass 3: Page furniture (PDF only)
// ---------------------------------------------------------------------------

/// Drop lines that are only page numbers ("7", "- 7 -", "Page 7 of 12").
fn strip_page_furniture(text: &str) -> String {
    static PAGE_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)^\s*(?:-\s*\d+\s*-|page\s+\d+(?:\s+of\s+\d+)?|\d+)\s*$")
            .expect("valid regex")
    });

    text.lines()
        .filter(|line| !PAGE_NUMBER_RE.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Pass 4: Whitespace
// ---------------------------------------------------------------------------

/// Strip trailing whitespace on every line.
fn normalize_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Pass 5: Blank lines
// ---------------------------------------------------------------------------

/// Collapse runs of blank lines into one and drop leading blank lines.
fn clean_blank_lines(text: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE
        .replace_all(text, "\n\n")
        .trim_start_matches('\n')
        .to_string()
}

// ---------------------------------------------------------------------------
// Pass 6: Trailing newline
// ---------------------------------------------------------------------------

fn ensure_trailing_newline(text: &str) -> String {
    let trimmed = text.trim_end_matches('\n');
    if trimmed.is_empty() {
        return String::new();
    }
    format!("{trimmed}\n")
}
