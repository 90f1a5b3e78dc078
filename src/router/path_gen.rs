//! File name generation for documents.

use std::path::{Path, PathBuf};

/// Longest file stem produced from a title, in characters.
pub const MAX_STEM_CHARS: usize = 200;

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '^'];

const RESERVED_STEMS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Turn a title into a file stem that is valid on every platform.
pub fn sanitize_title(title: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|c| {
            if FORBIDDEN.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();

    let trimmed = replaced.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        return "_".to_string();
    }
    if RESERVED_STEMS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(trimmed))
    {
        return format!("_{trimmed}");
    }
    trimmed.to_string()
}

/// Generate a free path for `title` under `root`.
///
/// Appends `_1`, `_2`, ... to the stem while `is_taken` reports a clash.
pub fn generate(
    root: &Path,
    title: &str,
    extension: &str,
    is_taken: &dyn Fn(&Path) -> bool,
) -> PathBuf {
    let stem = sanitize_title(title);
    let mut candidate = root.join(format!("{stem}.{extension}"));
    let mut suffix = 1u32;

    while is_taken(&candidate) {
        candidate = root.join(format!("{stem}_{suffix}.{extension}"));
        suffix += 1;
    }

    candidate
}
