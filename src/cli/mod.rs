//! CLI command implementations

pub mod dead_letters;
pub mod error;
pub mod scrape;

pub use dead_letters::DeadLettersCommand;
pub use error::CliError;
pub use scrape::{BatchArgs, Cli, Commands, OutputFormat, ScrapeArgs};
