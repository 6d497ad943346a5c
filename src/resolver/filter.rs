//! Filter pipeline applied to manifest entries.
//!
//! Order matters: the anti-clutter prefilter runs first, then the
//! metadata-only whitelist, then the extension whitelist, then the name
//! regex. A file must survive every configured stage to be persisted.

use regex::Regex;

/// Well-known incidental names the archive attaches to every item.
const SYSTEM_FILE_SUFFIXES: &[&str] = &[
    "_meta.xml",
    "_meta.sqlite",
    "_files.xml",
    "_thumb.jpg",
    "_itemimage.jpg",
];

/// Suffix/substring markers of manifest and descriptive files.
const METADATA_MARKERS: &[&str] = &[".xml", ".json", ".txt", "readme"];

/// Compiled filter configuration for one job.
#[derive(Debug)]
pub struct FileFilter {
    metadata_only: bool,
    extensions: Vec<String>,
    name_regex: Option<Regex>,
}

impl FileFilter {
    /// Build a filter. `extensions` must already be lowercased without a
    /// leading dot; `name_regex` is matched unanchored.
    pub fn new(
        metadata_only: bool,
        extensions: Vec<String>,
        name_regex: Option<&str>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            metadata_only,
            extensions,
            name_regex: name_regex.map(Regex::new).transpose()?,
        })
    }

    /// Whether a manifest entry survives all configured stages.
    pub fn retains(&self, name: &str) -> bool {
        if name.is_empty() || is_system_file(name) {
            return false;
        }

        if self.metadata_only && !is_metadata_file(name) {
            return false;
        }

        if !self.extensions.is_empty() {
            let lower = name.to_ascii_lowercase();
            if !self
                .extensions
                .iter()
                .any(|ext| lower.ends_with(&format!(".{ext}")))
            {
                return false;
            }
        }

        if let Some(regex) = &self.name_regex {
            if !regex.is_match(name) {
                return false;
            }
        }

        true
    }
}

/// Anti-clutter prefilter over well-known system file names.
pub fn is_system_file(name: &str) -> bool {
    SYSTEM_FILE_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

/// Manifest/descriptive files retained by metadata-only mode.
pub fn is_metadata_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    METADATA_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Replace filesystem-hostile characters so any manifest name maps to a
/// usable destination path.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect()
}
