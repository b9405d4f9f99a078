//! Output file naming
//!
//! Results land in `{base_dir}/{clean_keyword}_PRODUCTS.{ext}`, where the keyword is reduced to
//! lowercase word characters joined by underscores.
//!
//! ```rust
//! use listing_scraper::output::{OutputFormat, OutputPathBuilder};
//! use std::path::PathBuf;
//!
//! let path = OutputPathBuilder::new(PathBuf::from("outputs"), "Desk Lamp (LED)")
//!     .with_format(OutputFormat::Csv)
//!     .build()
//!     .unwrap();
//! assert_eq!(path, PathBuf::from("outputs/desk_lamp_led_PRODUCTS.csv"));
//! ```

use super::{OutputError, OutputResult};
use std::path::PathBuf;

/// Serialized result format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Marketplace CSV layout
    #[default]
    Csv,
    /// JSON report with rejection summary
    Json,
}

impl OutputFormat {
    /// File extension without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }
}

/// Keyword reduced to a file-name-safe stem.
///
/// Characters other than word characters, whitespace and `-` are removed, runs of whitespace and
/// `-` become a single `_`, and the result is lowercased.
pub fn clean_keyword(keyword: &str) -> String {
    let kept: String = keyword
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();

    let mut out = String::with_capacity(kept.len());
    let mut pending_sep = false;
    for c in kept.chars() {
        if c == '-' || c.is_whitespace() {
            pending_sep = true;
            continue;
        }
        if pending_sep && !out.is_empty() {
            out.push('_');
        }
        pending_sep = false;
        out.extend(c.to_lowercase());
    }
    out.trim_matches('_').to_string()
}

/// Builder for result file paths
#[derive(Debug, Clone)]
pub struct OutputPathBuilder {
    base_dir: PathBuf,
    keyword: String,
    format: OutputFormat,
}

impl OutputPathBuilder {
    /// Builder for `keyword` under `base_dir`
    pub fn new(base_dir: PathBuf, keyword: impl Into<String>) -> Self {
        Self {
            base_dir,
            keyword: keyword.into(),
            format: OutputFormat::default(),
        }
    }

    /// Set the output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Build the path. Fails when nothing usable remains of the keyword.
    pub fn build(&self) -> OutputResult<PathBuf> {
        let stem = clean_keyword(&self.keyword);
        if stem.is_empty() {
            return Err(OutputError::InvalidPath(format!(
                "keyword {:?} has no file-name-safe characters",
                self.keyword
            )));
        }
        Ok(self
            .base_dir
            .join(format!("{}_PRODUCTS.{}", stem, self.format.extension())))
    }
}
