//! wpheal command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;

use crate::config::Config;
use crate::engine::Engine;
use crate::errors::HealerError;
use crate::healing::{AutoHealOutcome, DiagnoseOptions, TrendDirection};
use crate::model::{CheckType, DiagnosisProfile, Execution, ExecutionStatus, TriggerSource};
use crate::observability::telemetry::{init_tracing, init_tracing_with_filter};

#[derive(Parser)]
#[command(name = "wpheal")]
#[command(about = "Diagnose and heal remote WordPress sites")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Verbose logging (debug level)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Diagnose a target and record a new execution
    #[command(alias = "d")]
    Diagnose {
        target: String,

        /// full, light, quick or custom
        #[arg(short, long)]
        profile: Option<String>,

        /// Diagnose a subdomain of the target
        #[arg(short, long)]
        subdomain: Option<String>,

        /// Check list for the custom profile (comma separated)
        #[arg(long, value_delimiter = ',')]
        checks: Vec<String>,
    },

    /// Health check that may be served from cache
    Check {
        target: String,

        #[arg(short, long)]
        profile: Option<String>,

        #[arg(short, long)]
        subdomain: Option<String>,
    },

    /// Approve a diagnosed execution and run its healing job
    Heal {
        execution_id: String,

        /// Replace the default remediation (repeatable)
        #[arg(long = "command", value_name = "CMD")]
        commands: Vec<String>,

        /// Only queue the job; a running `wpheal worker` picks it up
        #[arg(long)]
        no_wait: bool,
    },

    /// Diagnose and heal when the target's healing mode allows it
    AutoHeal { target: String },

    /// Restore the backup taken for an execution
    Rollback { execution_id: String },

    /// Close a target's circuit breaker
    ResetBreaker { target: String },

    /// Show one execution
    Show { execution_id: String },

    /// Execution history of a target
    History {
        target: String,

        #[arg(long, default_value = "24")]
        hours: i64,
    },

    /// Health score trend of a target
    Trend {
        target: String,

        #[arg(long, default_value = "168")]
        hours: i64,
    },

    /// List learned healing patterns
    Patterns {
        /// Delete the pattern with this id
        #[arg(long)]
        delete: Option<String>,
    },

    /// Diagnosis cache statistics
    Cache {
        /// Drop every cached diagnosis of this target
        #[arg(long)]
        invalidate: Option<String>,
    },

    /// Run the healing worker until Ctrl-C
    Worker,

    /// Validate the configuration and exit
    CheckConfig,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_profile(name: Option<&str>) -> Result<Option<DiagnosisProfile>> {
    name.map(|n| n.parse::<DiagnosisProfile>().map_err(|e| HealerError::from(e).into()))
        .transpose()
}

fn parse_checks(names: &[String]) -> Result<Option<Vec<CheckType>>> {
    if names.is_empty() {
        return Ok(None);
    }
    names
        .iter()
        .map(|n| n.trim().parse::<CheckType>().map_err(|e| HealerError::from(e).into()))
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn status_label(status: ExecutionStatus) -> colored::ColoredString {
    let s = status.as_str();
    match status {
        ExecutionStatus::Success => s.green().bold(),
        ExecutionStatus::Failed => s.red().bold(),
        ExecutionStatus::RolledBack => s.yellow(),
        _ => s.cyan(),
    }
}

fn score_label(score: u8) -> colored::ColoredString {
    let s = score.to_string();
    match score {
        80..=100 => s.green(),
        50..=79 => s.yellow(),
        _ => s.red(),
    }
}

fn print_execution(execution: &Execution) {
    let diagnosis = &execution.diagnosis.diagnosis;
    println!(
        "{} {} [{}] attempt {}/{}",
        "Execution".bold(),
        execution.id,
        status_label(execution.status),
        execution.attempt,
        execution.max_attempts
    );
    println!("  target     {} ({})", execution.target_id, execution.domain);
    println!(
        "  health     {}  issues {} (critical {}, warning {})",
        score_label(execution.diagnosis.health_score),
        execution.diagnosis.issues_count,
        execution.diagnosis.critical_count,
        execution.diagnosis.warning_count
    );
    println!(
        "  diagnosis  {} confidence {:.2}{}",
        diagnosis.diagnosis_type,
        diagnosis.confidence,
        diagnosis
            .culprit
            .as_ref()
            .map(|c| format!(" culprit {}", c))
            .unwrap_or_default()
    );
    println!("  action     {}", diagnosis.suggested_action);
    if let Some(suggestion) = &execution.learned_suggestion {
        println!(
            "  learned    {} (confidence {:.2}, match {:.2}{})",
            suggestion.pattern_id,
            suggestion.confidence,
            suggestion.match_score,
            if suggestion.auto_approve { ", auto-approved" } else { "" }
        );
    }
    if let Some(score) = execution.verification_score {
        println!("  verified   {}", score_label(score));
    }
    if let Some(error) = &execution.error {
        println!("  error      {}", error.red());
    }
    for entry in &execution.log {
        println!(
            "    {} {:?} {}",
            entry.at.format("%H:%M:%S").to_string().dimmed(),
            entry.level,
            entry.message
        );
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color || std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    let config = Config::load(cli.config.as_deref())?;
    if cli.verbose {
        init_tracing_with_filter("debug", config.logging.json);
    } else {
        init_tracing(&config.logging);
    }

    if let Commands::CheckConfig = cli.command {
        if cli.json {
            return print_json(&config);
        }
        println!(
            "{} configuration valid: {} targets, store {}",
            "✓".green(),
            config.targets.len(),
            config.store.path.display()
        );
        return Ok(());
    }

    let engine = Engine::bootstrap(config)
        .await
        .context("Failed to start engine")?;

    match cli.command {
        Commands::Diagnose {
            target,
            profile,
            subdomain,
            checks,
        } => {
            let options = DiagnoseOptions {
                subdomain,
                profile: parse_profile(profile.as_deref())?,
                checks: parse_checks(&checks)?,
            };
            let execution = engine
                .diagnose(&target, TriggerSource::Manual, &options)
                .await?;
            if cli.json {
                print_json(&execution)?;
            } else {
                print_execution(&execution);
            }
        }
        Commands::Check {
            target,
            profile,
            subdomain,
        } => {
            let options = DiagnoseOptions {
                subdomain,
                profile: parse_profile(profile.as_deref())?,
                checks: None,
            };
            let record = engine.check(&target, &options).await?;
            if cli.json {
                print_json(&record)?;
            } else {
                println!(
                    "{} health {} ({}){}",
                    record.target_id,
                    score_label(record.health_score),
                    record.diagnosis.diagnosis_type,
                    if record.from_cache { " [cached]" } else { "" }
                );
                for result in &record.results {
                    println!(
                        "  {:<22} {:?} {:>3}  {}",
                        result.check_type.as_str(),
                        result.status,
                        result.score,
                        result.message
                    );
                }
            }
        }
        Commands::Heal {
            execution_id,
            commands,
            no_wait,
        } => {
            let custom = (!commands.is_empty()).then_some(commands);
            let response = engine.heal(&execution_id, custom).await?;
            if no_wait {
                if cli.json {
                    print_json(&response)?;
                } else {
                    println!(
                        "Queued job {} for {}",
                        response.job.id, response.execution_id
                    );
                }
                return Ok(());
            }
            engine.run_pending().await?;
            let execution = engine.orchestrator().get_execution(&execution_id).await?;
            if cli.json {
                print_json(&execution)?;
            } else {
                print_execution(&execution);
            }
        }
        Commands::AutoHeal { target } => {
            let outcome = engine.auto_heal(&target).await?;
            if matches!(outcome, AutoHealOutcome::Queued(_)) {
                engine.run_pending().await?;
            }
            if cli.json {
                print_json(&outcome)?;
            } else {
                match outcome {
                    AutoHealOutcome::Disabled => println!("Healing disabled for {}", target),
                    AutoHealOutcome::Healthy { execution_id } => {
                        println!("{} nothing to heal ({})", "✓".green(), execution_id)
                    }
                    AutoHealOutcome::AwaitingApproval {
                        execution_id,
                        reason,
                    } => println!("{} awaiting approval: {}", execution_id, reason),
                    AutoHealOutcome::Queued(response) => {
                        let execution = engine
                            .orchestrator()
                            .get_execution(&response.execution_id)
                            .await?;
                        print_execution(&execution);
                    }
                }
            }
        }
        Commands::Rollback { execution_id } => {
            let execution = engine.rollback(&execution_id).await?;
            if cli.json {
                print_json(&execution)?;
            } else {
                print_execution(&execution);
            }
        }
        Commands::ResetBreaker { target } => {
            let target = engine.reset_circuit_breaker(&target).await?;
            if cli.json {
                print_json(&target)?;
            } else {
                println!("{} breaker for {} is {}", "✓".green(), target.id, target.breaker.state);
            }
        }
        Commands::Show { execution_id } => {
            let execution = engine.orchestrator().get_execution(&execution_id).await?;
            if cli.json {
                print_json(&execution)?;
            } else {
                print_execution(&execution);
            }
        }
        Commands::History { target, hours } => {
            let since = engine.now() - chrono::Duration::hours(hours);
            let executions = engine
                .orchestrator()
                .execution_history(&target, Some(since))
                .await?;
            if cli.json {
                print_json(&executions)?;
            } else if executions.is_empty() {
                println!("No executions for {} in the last {}h", target, hours);
            } else {
                for e in &executions {
                    println!(
                        "{}  {}  {:<11}  {:<18} health {}",
                        e.created_at.format("%Y-%m-%d %H:%M"),
                        e.id,
                        status_label(e.status),
                        e.diagnosis.diagnosis.diagnosis_type.to_string(),
                        score_label(e.diagnosis.health_score)
                    );
                }
            }
        }
        Commands::Trend { target, hours } => {
            let trend = engine
                .orchestrator()
                .health_trend(&target, chrono::Duration::hours(hours))
                .await?;
            if cli.json {
                print_json(&trend)?;
            } else {
                let direction = match trend.direction {
                    TrendDirection::Improving => "improving".green(),
                    TrendDirection::Declining => "declining".red(),
                    TrendDirection::Stable => "stable".normal(),
                };
                println!(
                    "{}: {} samples, min {:?} max {:?} avg {}, {}",
                    target,
                    trend.samples,
                    trend.min,
                    trend.max,
                    trend
                        .average
                        .map(|a| format!("{:.1}", a))
                        .unwrap_or_else(|| "-".to_string()),
                    direction
                );
            }
        }
        Commands::Patterns { delete } => {
            if let Some(id) = delete {
                let removed = engine.patterns().delete(&id).await?;
                if !removed {
                    anyhow::bail!("Pattern '{}' not found", id);
                }
                println!("Deleted pattern {}", id);
                return Ok(());
            }
            let patterns = engine.patterns().list().await?;
            if cli.json {
                print_json(&patterns)?;
            } else {
                for p in &patterns {
                    println!(
                        "{}  {:<18} culprit {:<20} {}/{} conf {:.2}{}{}",
                        p.id,
                        p.diagnosis_type.to_string(),
                        p.culprit,
                        p.success_count,
                        p.failure_count,
                        p.confidence,
                        if p.auto_approve { " auto" } else { "" },
                        if p.verified { " verified" } else { "" }
                    );
                }
            }
        }
        Commands::Cache { invalidate } => {
            if let Some(target) = invalidate {
                let removed = engine
                    .orchestrator()
                    .invalidate_cache(&target)
                    .await?;
                println!("Removed {} cached diagnoses for {}", removed, target);
            }
            let stats = engine.cache_stats().await?;
            if cli.json {
                print_json(&stats)?;
            } else {
                println!(
                    "entries {} (expired {}), hits {}, misses {}, expired evictions {}",
                    stats.entries, stats.expired, stats.hits, stats.misses, stats.expired_evictions
                );
            }
        }
        Commands::Worker => {
            engine
                .run_worker(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
            let stats = engine.stats();
            if cli.json {
                print_json(&stats)?;
            } else {
                println!(
                    "Worker stopped: {} succeeded, {} failed, {} retries scheduled",
                    stats.successes, stats.failures, stats.retries_scheduled
                );
            }
        }
        Commands::CheckConfig => {}
    }
    Ok(())
}
