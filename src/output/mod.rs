//! Result writers for finished jobs

use crate::ScrapedRecord;

pub mod csv;
pub mod json;
pub mod path;

pub use self::csv::CsvListingWriter;
pub use self::json::{write_json_report, JsonReport};
pub use self::path::{clean_keyword, OutputFormat, OutputPathBuilder};

/// Output writer errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// CSV write error
    #[error("CSV error: {0}")]
    CsvError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Buffer flush error
    #[error("flush error: {0}")]
    FlushError(String),

    /// Keyword yields no usable file name
    #[error("invalid output path: {0}")]
    InvalidPath(String),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Generic output writer trait
pub trait OutputWriter {
    /// Flush any buffered data to disk
    fn flush(&mut self) -> OutputResult<()>;

    /// Close the writer and finalize output
    fn close(self) -> OutputResult<()>;
}

/// Trait for writing validated listings
pub trait ListingWriter: OutputWriter {
    /// Write a single listing
    fn write_record(&mut self, record: &ScrapedRecord) -> OutputResult<()>;

    /// Write multiple listings in order
    fn write_records(&mut self, records: &[ScrapedRecord]) -> OutputResult<()> {
        for record in records {
            self.write_record(record)?;
        }
        Ok(())
    }
}
