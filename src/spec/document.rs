//! Line-level editing of the spec text.
//!
//! Only two regions are ever rewritten: the top-level `out:` block and the
//! `spec_sha256:` line inside `system:`. Every other line, including comments
//! and quoting, is carried through untouched.
use anyhow::{anyhow, Result};
use regex::Regex;
use std::sync::OnceLock;

fn top_level_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_\-]*)\s*:(\s|$)").expect("regex for top-level keys")
    })
}

fn digest_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\s+)spec_sha256\s*:").expect("regex for digest line")
    })
}

fn top_level_key(line: &str) -> Option<&str> {
    top_level_key_re()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn is_trivia(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// Line range `[start, end)` of a top-level block. Comment and blank lines
/// directly above the next top-level key belong to that next key.
fn block_range(lines: &[&str], key: &str) -> Option<(usize, usize)> {
    let start = lines.iter().position(|line| top_level_key(line) == Some(key))?;
    let mut end = lines[start + 1..]
        .iter()
        .position(|line| top_level_key(line).is_some() || line.starts_with("---"))
        .map(|offset| start + 1 + offset)
        .unwrap_or(lines.len());
    while end > start + 1 && is_trivia(lines[end - 1]) {
        end -= 1;
    }
    Some((start, end))
}

fn join_lines(lines: &[String], had_trailing_newline: bool) -> String {
    let mut text = lines.join("\n");
    if had_trailing_newline && !text.is_empty() {
        text.push('\n');
    }
    text
}

/// Replace (or remove, or append) the top-level block named `key`.
///
/// `block` is the complete replacement text starting with `key:`.
pub fn replace_block(text: &str, key: &str, block: Option<&str>) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let new_lines: Vec<String> = block
        .map(|block| block.trim_end().lines().map(str::to_string).collect())
        .unwrap_or_default();
    match block_range(&lines, key) {
        Some((start, end)) => {
            out.extend(lines[..start].iter().map(|line| line.to_string()));
            let removed_at_eof = new_lines.is_empty() && end == lines.len();
            out.extend(new_lines);
            out.extend(lines[end..].iter().map(|line| line.to_string()));
            if removed_at_eof {
                while out.last().is_some_and(|line| line.trim().is_empty()) {
                    out.pop();
                }
            }
        }
        None => {
            out.extend(lines.iter().map(|line| line.to_string()));
            if !new_lines.is_empty() {
                while out.last().is_some_and(|line| line.trim().is_empty()) {
                    out.pop();
                }
                if !out.is_empty() {
                    out.push(String::new());
                }
                out.extend(new_lines);
            }
        }
    }
    join_lines(&out, true)
}

/// Set, blank, or drop the `spec_sha256` line inside the `system:` block.
pub fn set_digest_line(text: &str, digest: Option<&str>) -> Result<String> {
    let lines: Vec<&str> = text.lines().collect();
    let (start, end) =
        block_range(&lines, "system").ok_or_else(|| anyhow!("spec has no system block"))?;
    let header_rest = lines[start]
        .split_once(':')
        .map(|(_, rest)| rest.trim())
        .unwrap_or("");
    if !header_rest.is_empty() && !header_rest.starts_with('#') {
        return Err(anyhow!("flow-style system block cannot carry a digest line"));
    }

    let existing = (start + 1..end).find(|&idx| digest_line_re().is_match(lines[idx]));
    let indent = (start + 1..end)
        .map(|idx| lines[idx])
        .find(|line| !is_trivia(line))
        .map(|line| line[..line.len() - line.trim_start().len()].to_string())
        .unwrap_or_else(|| "  ".to_string());

    let mut out: Vec<String> = lines.iter().map(|line| line.to_string()).collect();
    match (existing, digest) {
        (Some(idx), Some(digest)) => {
            let caps_indent = digest_line_re()
                .captures(lines[idx])
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or(indent);
            out[idx] = format!("{caps_indent}spec_sha256: \"{digest}\"");
        }
        (Some(idx), None) => {
            out.remove(idx);
        }
        (None, Some(digest)) => {
            let last_content = (start..end)
                .rev()
                .find(|&idx| !is_trivia(lines[idx]))
                .unwrap_or(start);
            out.insert(last_content + 1, format!("{indent}spec_sha256: \"{digest}\""));
        }
        (None, None) => {}
    }
    Ok(join_lines(&out, text.ends_with('\n') || text.is_empty()))
}

#[cfg(test)]
#[path = "document_tests.rs"]
mod tests;
