//! Dead-letter queue inspection commands

use crate::jobs::JobId;
use crate::recovery::{AttemptRecord, DeadLetterEntry, DeadLetterQueue, Disposition};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use super::{CliError, OutputFormat};

/// File used when `--dead-letter-file` is not given
pub const DEFAULT_DEAD_LETTER_FILE: &str = "dead_letters.json";

/// Dead-letter commands
#[derive(Args, Debug)]
pub struct DeadLettersCommand {
    /// Dead-letter action
    #[command(subcommand)]
    pub action: DeadLettersAction,
}

/// Dead-letter actions
#[derive(Subcommand, Debug)]
pub enum DeadLettersAction {
    /// List dead-lettered jobs
    List,
    /// Remove a dead-lettered job
    Remove {
        /// Job id
        job_id: String,
    },
}

impl DeadLettersCommand {
    /// Execute against the persisted queue.
    pub fn execute(
        &self,
        path: Option<PathBuf>,
        output_format: OutputFormat,
    ) -> Result<(), CliError> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_DEAD_LETTER_FILE));
        let queue = DeadLetterQueue::with_persistence(&path)?;

        match &self.action {
            DeadLettersAction::List => {
                let entries = queue.list();
                match output_format {
                    OutputFormat::Json => {
                        let json = serde_json::to_string_pretty(&entries).map_err(|e| {
                            CliError::InvalidArgument(format!("Failed to serialize entries: {e}"))
                        })?;
                        println!("{json}");
                    }
                    OutputFormat::Human => print_entries(&entries),
                }
            }
            DeadLettersAction::Remove { job_id } => {
                let id: JobId = job_id.parse().map_err(|e| {
                    CliError::InvalidArgument(format!("'{job_id}' is not a job id: {e}"))
                })?;
                if queue.remove(id)? {
                    println!("Removed dead-letter entry for job {id}");
                } else {
                    return Err(CliError::InvalidArgument(format!(
                        "no dead-letter entry for job {id}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn print_entries(entries: &[DeadLetterEntry]) {
    if entries.is_empty() {
        println!("Dead-letter queue is empty");
        return;
    }

    println!("\nDead-lettered jobs:\n");
    for entry in entries {
        let disposition = match entry.disposition {
            Disposition::RetriableExhausted => "awaiting recovery",
            Disposition::Parked => "parked",
        };
        println!("  {} '{}' ({})", entry.job_id, entry.keyword, disposition);
        println!("    Reason: {}", entry.reason);
        println!(
            "    Attempts: {} requests, {} recovery runs",
            entry.request_attempt_count(),
            entry.job_attempt_count()
        );
        if let Some(AttemptRecord::Request(last)) = entry
            .attempts
            .iter()
            .rev()
            .find(|a| matches!(a, AttemptRecord::Request(_)))
        {
            println!(
                "    Last request: page {} attempt {} at {}",
                last.page, last.attempt, last.at
            );
        }
        println!("    Updated: {}", entry.updated_at);
    }
    println!();
}
