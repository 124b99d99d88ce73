use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use super::{load_config, master_client};

/// Arguments for the status subcommand
#[derive(Args)]
pub struct StatusArgs {
    /// Path to the configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

pub async fn execute(args: StatusArgs) -> Result<()> {
    let config = load_config(args.config)?;
    let client = master_client(&config)?;

    let snapshot = client
        .status()
        .await
        .context("Failed to fetch the master status")?;

    println!("{}", "Workers".bold());
    if snapshot.workers.is_empty() {
        println!("  {}", "none registered".dimmed());
    }
    for worker in &snapshot.workers {
        println!(
            "  {:<30} {:>2}/{:<2} slots free  {:>2} in flight  last heartbeat {}",
            format!("{}:{}", worker.hostname, worker.port).cyan(),
            worker.current_slots,
            worker.max_slots,
            worker.tasks_in_flight,
            worker.last_heartbeat.format("%H:%M:%S"),
        );
    }

    println!();
    println!("{} {}", "Queued tasks:".bold(), snapshot.queued_tasks);

    println!();
    println!("{}", "Matches in flight".bold());
    if snapshot.matches.is_empty() {
        println!("  {}", "none".dimmed());
    }
    for m in &snapshot.matches {
        let scores = if m.has_scores {
            "scores in".green()
        } else {
            "waiting on referee".yellow()
        };
        println!(
            "  match {:<6} {:<8} {}/{} players reported  {}",
            m.match_id.to_string().cyan(),
            m.status,
            m.reported_players,
            m.dispatched_players,
            scores,
        );
    }

    Ok(())
}
