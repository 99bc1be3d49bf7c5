//! `mend` binary: subcommand dispatch over the library facade. No
//! business logic here — parse, call the engine, print.

use clap::Parser;
use colored::*;
use std::path::Path;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use mend::cli::{Args, Command};
use mend::{DiagnosisEngine, EnvironmentContext, MendError, PatternRecord, Solution};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), MendError> {
    let ctx = load_context(args.context.as_deref())?;
    let engine = DiagnosisEngine::open(args.project.clone());
    if engine.degraded() {
        eprintln!("{}", "note: pattern store is in degraded (flat catalog) mode".yellow());
    }

    match args.command {
        Command::Diagnose { description, limit } => {
            let mut candidates = engine.find_candidates(&description, &ctx)?;
            candidates.truncate(limit);
            if args.json {
                let rows: Vec<serde_json::Value> = candidates
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "id": c.pattern.id,
                            "name": c.pattern.name,
                            "category": c.pattern.category,
                            "confidence": c.confidence,
                            "success_rate": c.pattern.success_rate(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if candidates.is_empty() {
                println!("{}", "no known pattern matches this failure".yellow());
            } else {
                for (rank, c) in candidates.iter().enumerate() {
                    println!(
                        "{} {} {} (confidence {:.2}, historical success {:.0}%)",
                        format!("{}.", rank + 1).bold(),
                        c.pattern.name.green().bold(),
                        format!("[{}]", c.pattern.category).dimmed(),
                        c.confidence,
                        c.pattern.success_rate() * 100.0,
                    );
                }
            }
        }

        Command::Apply { solution, pattern_id, timeout_secs } => {
            let raw = std::fs::read_to_string(&solution)?;
            let solution = Solution::from_json(&raw)?;
            let deadline = timeout_secs.map(Duration::from_secs);
            let started = Instant::now();
            let report = engine.apply_with_deadline(&solution, &ctx, deadline).await;

            if let Some(id) = pattern_id {
                engine.record_outcome(&id, report.success, &ctx, started.elapsed().as_millis() as u64);
            }

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.success {
                println!("{} {}", "applied:".green().bold(), report.message);
                for change in &report.changes {
                    println!("  {} {}", "•".green(), change);
                }
                if let Some(backup_id) = &report.backup_id {
                    println!("  backup: {}", backup_id.dimmed());
                }
            } else {
                println!("{} {}", "failed:".red().bold(), report.message);
                if report.rolled_back {
                    println!("  {}", "all changes rolled back".yellow());
                } else if report.backup_id.is_some() {
                    println!("  {}", "rollback incomplete, see logs".red());
                }
            }
            if !report.success {
                return Err(MendError::Step {
                    index: report.failed_step.unwrap_or(0),
                    message: report.message,
                });
            }
        }

        Command::Rollback { id } => {
            let report = engine.rollback(id.as_deref())?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} restored {} file(s) from {}",
                    "rollback:".green().bold(),
                    report.restored.len(),
                    report.backup_id,
                );
                for path in &report.skipped {
                    println!("  {} could not restore {}", "!".red(), path.display());
                }
            }
        }

        Command::Stats => {
            let stats = engine.statistics()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", "pattern catalog".bold());
                println!("  patterns:     {}", stats.total_patterns);
                println!(
                    "  applications: {} ({} successful)",
                    stats.total_applications, stats.successful_applications
                );
                println!("  mean success: {:.0}%", stats.mean_success_rate * 100.0);
                for (category, count) in &stats.per_category {
                    println!("  {:<14} {}", format!("{}:", category), count);
                }
                if !stats.top_by_success.is_empty() {
                    println!("{}", "top patterns".bold());
                    for (name, rate) in &stats.top_by_success {
                        println!("  {} ({:.0}%)", name.green(), rate * 100.0);
                    }
                }
            }
        }

        Command::Import { catalog } => {
            let raw = std::fs::read_to_string(&catalog)?;
            let records: Vec<PatternRecord> = serde_json::from_str(&raw)?;
            let imported = engine.import_catalog(&records)?;
            println!("{} imported {} pattern(s)", "ok:".green().bold(), imported);
        }

        Command::Export => {
            let records = engine.export_catalog()?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }
    Ok(())
}

fn load_context(path: Option<&Path>) -> Result<EnvironmentContext, MendError> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(EnvironmentContext::default()),
    }
}
