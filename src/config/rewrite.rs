// src/config/rewrite.rs

//! Line-oriented access to HOCON-style `.conf` files.
//!
//! The service configuration files contain templated placeholders
//! (`<SUBZONE_ID>` and friends) that a strict parser rejects, so instead of a
//! full parse-and-serialize round trip every mutation goes through this
//! module: a field is located by its dotted path, and only the value span of
//! the matching line is replaced. Indentation, comments and key order are
//! preserved.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[A-Z][A-Z0-9_]*>").expect("placeholder pattern is valid"));

/// Structural parse failure, pointing at the offending source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    /// 1-based line number
    pub line: usize,

    /// The raw source line that failed
    pub source_line: String,

    /// Human readable reason
    pub message: String,
}

impl ParseFailure {
    /// Whether the failing line carries a templated placeholder token.
    ///
    /// Such lines are filled in later by the bootstrap protocols, so a failure
    /// on them is not a real configuration error.
    pub fn is_templated_placeholder(&self) -> bool {
        contains_placeholder(&self.source_line)
    }
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {} (`{}`)", self.line, self.message, self.source_line.trim())
    }
}

/// Error while rewriting a configuration file
#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Field {field} not found in {path}")]
    FieldNotFound { path: PathBuf, field: String },
}

/// Whether `line` contains a `<UPPER_SNAKE>` placeholder token
pub fn contains_placeholder(line: &str) -> bool {
    PLACEHOLDER.is_match(line)
}

/// Quotes a string value for HOCON
pub fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Replaces every occurrence of `placeholder`, returning the new text and the
/// number of replacements
pub fn replace_placeholder(contents: &str, placeholder: &str, value: &str) -> (String, usize) {
    let count = contents.matches(placeholder).count();
    if count == 0 {
        return (contents.to_string(), 0);
    }
    (contents.replace(placeholder, value), count)
}

/// Reads the (unquoted) value of the field at `path`, if present. The last
/// occurrence wins, as in HOCON.
pub fn read_field(contents: &str, path: &str) -> Option<String> {
    let lines: Vec<&str> = contents.lines().collect();
    walk(contents)
        .into_iter()
        .filter(|field| field.path == path)
        .last()
        .map(|field| unquote(&lines[field.line][field.value.clone()]))
}

/// Sets the field at `path` to the raw HOCON `value` (quote strings with
/// [`quote`]). Every occurrence of the field is rewritten.
pub fn set_field(contents: &str, path: &str, value: &str) -> Option<String> {
    let fields: Vec<Field> = walk(contents).into_iter().filter(|f| f.path == path).collect();
    if fields.is_empty() {
        return None;
    }

    let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
    for field in fields {
        let line = &mut lines[field.line];
        line.replace_range(field.value, value);
    }

    let mut rewritten = lines.join("\n");
    if contents.ends_with('\n') {
        rewritten.push('\n');
    }
    Some(rewritten)
}

/// Sets every `key` whose line names it directly, including entries inside
/// arrays of objects that [`set_field`] cannot address by path. Returns the
/// new text and the number of lines rewritten.
pub fn set_key_anywhere(contents: &str, key: &str, value: &str) -> (String, usize) {
    let mut count = 0;
    let mut lines: Vec<String> = Vec::new();
    for line in contents.lines() {
        let scan = scan_line(line);
        let target = scan
            .separator
            .filter(|sep| scan.open_brace.map_or(true, |brace| *sep < brace))
            .filter(|sep| unquote(line[..*sep].trim()) == key)
            .map(|sep| value_span(&line[..scan.code_end], sep + 1));

        match target {
            Some(span) if !span.is_empty() => {
                let mut rewritten = line.to_string();
                rewritten.replace_range(span, value);
                lines.push(rewritten);
                count += 1;
            }
            _ => lines.push(line.to_string()),
        }
    }

    let mut rewritten = lines.join("\n");
    if contents.ends_with('\n') {
        rewritten.push('\n');
    }
    (rewritten, count)
}

/// Reads `path`, applies `edit` and writes the result back through a
/// temporary sibling file
pub fn rewrite_file<F>(path: &Path, edit: F) -> Result<(), RewriteError>
where
    F: FnOnce(&str) -> Result<String, RewriteError>,
{
    let contents = fs::read_to_string(path).map_err(|source| RewriteError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let updated = edit(&contents)?;
    if updated == contents {
        return Ok(());
    }

    let tmp = path.with_extension("rewrite.tmp");
    fs::write(&tmp, updated)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|source| RewriteError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Sets several fields of the file at `path` in one pass
pub fn set_fields_in_file(path: &Path, fields: &[(&str, String)]) -> Result<(), RewriteError> {
    rewrite_file(path, |contents| {
        let mut current = contents.to_string();
        for (field, value) in fields {
            current = set_field(&current, field, value).ok_or_else(|| RewriteError::FieldNotFound {
                path: path.to_path_buf(),
                field: field.to_string(),
            })?;
        }
        Ok(current)
    })
}

/// Performs a structural check of a HOCON-style document: quotes, brace and
/// bracket balance, key separators, and stray `<`/`>` in unquoted values.
pub fn check_syntax(contents: &str) -> Result<(), ParseFailure> {
    let mut openers: Vec<(u8, usize)> = Vec::new();
    let lines: Vec<&str> = contents.lines().collect();

    let fail = |idx: usize, message: String| ParseFailure {
        line: idx + 1,
        source_line: lines[idx].to_string(),
        message,
    };

    for (idx, line) in lines.iter().enumerate() {
        let scan = scan_line(line);
        if scan.unterminated_quote {
            return Err(fail(idx, "unterminated quoted string".to_string()));
        }

        let code = &line[..scan.code_end];
        let trimmed = code.trim();
        let in_array = matches!(openers.last(), Some((b'[', _)));

        if !trimmed.is_empty() && !in_array && !starts_with_closer(trimmed) && !trimmed.starts_with("include ") {
            let key_end = scan.separator.or(scan.open_brace);
            match key_end {
                None => return Err(fail(idx, "expected '=', ':' or '{' after key".to_string())),
                Some(end) if code[..end].trim().is_empty() => {
                    if scan.open_brace != Some(end) {
                        return Err(fail(idx, "missing key before separator".to_string()));
                    }
                }
                Some(_) => {}
            }
        }

        let value_start = if in_array { 0 } else { scan.separator.map(|s| s + 1).unwrap_or(scan.code_end) };
        if let Some(c) = first_unquoted(&code[value_start.min(code.len())..], &[b'<', b'>']) {
            return Err(fail(idx, format!("unexpected character '{}'", c as char)));
        }

        for &(_, ch) in &scan.structure {
            match ch {
                b'{' | b'[' => openers.push((ch, idx)),
                b'}' | b']' => {
                    let expected = if ch == b'}' { b'{' } else { b'[' };
                    match openers.pop() {
                        Some((open, _)) if open == expected => {}
                        _ => return Err(fail(idx, format!("unbalanced '{}'", ch as char))),
                    }
                }
                _ => {}
            }
        }
    }

    if let Some((ch, idx)) = openers.pop() {
        return Err(fail(idx, format!("unclosed '{}'", ch as char)));
    }
    Ok(())
}

/// A value-bearing field found while walking a document
#[derive(Debug)]
struct Field {
    line: usize,
    path: String,
    value: Range<usize>,
}

/// Result of scanning one line outside of quoted strings
#[derive(Debug, Default)]
struct LineScan {
    code_end: usize,
    separator: Option<usize>,
    open_brace: Option<usize>,
    structure: Vec<(usize, u8)>,
    unterminated_quote: bool,
}

impl LineScan {
    fn delta(&self, open: u8, close: u8) -> i32 {
        self.structure.iter().fold(0, |acc, &(_, ch)| {
            if ch == open {
                acc + 1
            } else if ch == close {
                acc - 1
            } else {
                acc
            }
        })
    }
}

fn scan_line(line: &str) -> LineScan {
    let bytes = line.as_bytes();
    let mut scan = LineScan {
        code_end: bytes.len(),
        ..LineScan::default()
    };
    let mut in_quote = false;
    let mut escaped = false;

    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_quote {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_quote = false;
            }
            i += 1;
            continue;
        }

        match b {
            b'"' => in_quote = true,
            b'#' => {
                scan.code_end = i;
                break;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                scan.code_end = i;
                break;
            }
            b'=' | b':' if scan.separator.is_none() && scan.open_brace.is_none() => {
                scan.separator = Some(i);
            }
            b'{' => {
                if scan.open_brace.is_none() {
                    scan.open_brace = Some(i);
                }
                scan.structure.push((i, b));
            }
            b'}' | b'[' | b']' => scan.structure.push((i, b)),
            _ => {}
        }
        i += 1;
    }

    scan.unterminated_quote = in_quote;
    scan
}

fn walk(contents: &str) -> Vec<Field> {
    let mut fields = Vec::new();
    let mut stack: Vec<(String, i32)> = Vec::new();
    let mut depth = 0i32;
    let mut array_depth = 0i32;

    for (idx, line) in contents.lines().enumerate() {
        let scan = scan_line(line);
        let code = &line[..scan.code_end];
        let trimmed = code.trim();
        if trimmed.is_empty() {
            continue;
        }

        if array_depth > 0 {
            array_depth += scan.delta(b'[', b']');
            continue;
        }

        let brace_delta = scan.delta(b'{', b'}');
        if !starts_with_closer(trimmed) {
            if let Some(key_end) = scan.separator.or(scan.open_brace) {
                let key = unquote(code[..key_end].trim());
                if !key.is_empty() {
                    let path = stack
                        .iter()
                        .map(|(name, _)| name.as_str())
                        .chain(std::iter::once(key.as_str()))
                        .collect::<Vec<_>>()
                        .join(".");

                    let value_from = if scan.separator == Some(key_end) { key_end + 1 } else { key_end };
                    let value = value_span(code, value_from);
                    let value_text = &code[value.clone()];

                    if value_text.starts_with('{') && brace_delta > 0 {
                        stack.push((path, depth + 1));
                    } else if value_text.starts_with('[') && scan.delta(b'[', b']') > 0 {
                        array_depth = scan.delta(b'[', b']');
                    } else if scan.separator == Some(key_end) && !value.is_empty() {
                        fields.push(Field { line: idx, path, value });
                    }
                }
            }
        }

        depth += brace_delta;
        while matches!(stack.last(), Some((_, opened)) if depth < *opened) {
            stack.pop();
        }
    }

    fields
}

fn value_span(code: &str, from: usize) -> Range<usize> {
    let rest = &code[from..];
    let start = from + (rest.len() - rest.trim_start().len());
    let mut end = code.trim_end().len().max(start);
    if end > start && code[..end].ends_with(',') {
        end -= 1;
        end = start + code[start..end].trim_end().len();
    }
    start..end
}

fn starts_with_closer(trimmed: &str) -> bool {
    trimmed.starts_with('}') || trimmed.starts_with(']')
}

fn first_unquoted(text: &str, needles: &[u8]) -> Option<u8> {
    let mut in_quote = false;
    let mut escaped = false;
    for &b in text.as_bytes() {
        if in_quote {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_quote = false;
            }
            continue;
        }
        if b == b'"' {
            in_quote = true;
        } else if needles.contains(&b) {
            return Some(b);
        }
    }
    None
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        value.to_string()
    }
}
