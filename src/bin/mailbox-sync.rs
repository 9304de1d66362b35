#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI that prunes a source mailbox of messages already in a target

use clap::Parser;
use mailbox_sync::{
    Approval, AutoApprove, Config, DeletionRequest, ImapConnector, MessageStatus, Mode,
    Orchestrator, SyncResult, TracingReporter,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailbox-sync")]
#[command(
    about = "Delete messages from a source IMAP mailbox once they are confirmed in a target mailbox"
)]
struct Args {
    /// Path to the JSON config file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Search and verify but delete nothing
    #[arg(long)]
    dry_run: bool,

    /// Ask before deleting
    #[arg(long)]
    confirm: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Validate the config file and exit
    #[arg(long)]
    check_config: bool,
}

/// Asks on the terminal before anything is deleted.
struct Prompt;

impl Approval for Prompt {
    fn approve(&mut self, request: &DeletionRequest) -> bool {
        let scope = if request.unbounded {
            " (search matched the whole folder)"
        } else {
            ""
        };
        eprint!(
            "Delete {} of {} message(s) from the source mailbox{scope}? [y/N] ",
            request.confirmed, request.examined
        );
        io::stderr().flush().ok();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let spec = config.search_specification()?;
    let options = config.sync_options(args.dry_run)?;
    if args.check_config {
        println!("Configuration OK: {}", args.config.display());
        return Ok(());
    }

    let (source, target) = config.accounts()?;
    let mut connector = ImapConnector::new(source, target);
    let mut reporter = TracingReporter;
    let mut approval: Box<dyn Approval> = if args.confirm {
        Box::new(Prompt)
    } else {
        Box::new(AutoApprove)
    };

    let result = Orchestrator::new(&mut reporter, approval.as_mut())
        .run(&mut connector, &spec, &options)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_outcomes(&result);
        print_summary(&result);
    }

    if let Some(reason) = &result.aborted {
        anyhow::bail!("Sync aborted: {reason}");
    }
    Ok(())
}

fn print_outcomes(result: &SyncResult) {
    if result.outcomes.is_empty() {
        println!("No messages matched {}.", result.query);
        return;
    }

    println!("{:<8} {:<14} {:<30} {}", "UID", "Status", "From", "Subject");
    println!("{}", "-".repeat(90));
    for outcome in &result.outcomes {
        let status = match outcome.status {
            MessageStatus::NotFound => "not in target",
            MessageStatus::Confirmed if outcome.marked => "marked",
            MessageStatus::Confirmed => "verified",
            MessageStatus::Deleted => "deleted",
            MessageStatus::DeleteFailed => "delete failed",
            MessageStatus::Failed => "error",
        };
        println!(
            "{:<8} {:<14} {:<30} {}",
            outcome.uid.0,
            status,
            truncate(outcome.sender.as_deref().unwrap_or("-"), 28),
            truncate(outcome.subject.as_deref().unwrap_or("(no subject)"), 40),
        );
        if let Some(error) = &outcome.error {
            println!("         {error}");
        }
    }
    println!();
}

fn print_summary(result: &SyncResult) {
    match result.mode {
        Mode::Live => {}
        Mode::DryRun => println!("Dry run: nothing was deleted."),
        Mode::Declined => println!("Deletion declined: nothing was deleted."),
    }
    println!("Processed: {}", result.examined);
    println!("Verified:  {}", result.confirmed);
    println!("Deleted:   {}", result.deleted);
    println!("Errors:    {}", result.errors());
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
