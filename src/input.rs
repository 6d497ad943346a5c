//! Item list parsing.
//!
//! Two formats are accepted: plain text with one identifier per line
//! (blank lines and `#` comments ignored) and delimited text whose header
//! row contains an `identifier` column. Identifiers are case-sensitive.

use std::path::Path;

/// Errors from reading an items list.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    /// File missing or unreadable.
    #[error("items file not readable: {0}")]
    Unreadable(String),

    /// Delimited file without an `identifier` header column.
    #[error("delimited items file has no 'identifier' column")]
    MissingIdentifierColumn,

    /// No identifiers found after parsing.
    #[error("items file contains no identifiers")]
    Empty,
}

/// Load identifiers from a list file, dispatching on the `.csv` suffix.
pub fn load_identifiers(path: &Path) -> Result<Vec<String>, InputError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| InputError::Unreadable(format!("{}: {e}", path.display())))?;

    let is_delimited = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    let identifiers = if is_delimited {
        parse_delimited(&contents)?
    } else {
        parse_plain(&contents)
    };

    if identifiers.is_empty() {
        return Err(InputError::Empty);
    }
    Ok(identifiers)
}

/// One identifier per line; `#` comments and blanks ignored.
pub fn parse_plain(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Header row names the `identifier` column; remaining rows supply values.
pub fn parse_delimited(contents: &str) -> Result<Vec<String>, InputError> {
    let mut lines = contents.lines().filter(|line| !line.trim().is_empty());
    let header = lines.next().ok_or(InputError::MissingIdentifierColumn)?;

    let column = header
        .split(',')
        .position(|col| col.trim().eq_ignore_ascii_case("identifier"))
        .ok_or(InputError::MissingIdentifierColumn)?;

    Ok(lines
        .filter_map(|line| {
            line.split(',')
                .nth(column)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
        .collect())
}
