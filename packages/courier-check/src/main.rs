//! Conformance harness for the courier dispatch engine.
//!
//! Runs every scenario against a live engine and writes a JSON pass/fail
//! log. Exits non-zero if any assertion failed.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use courier::EngineConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod report;
mod scenarios;

use report::{Record, Report, TestInfo};

#[derive(Parser, Debug)]
#[command(name = "courier-check")]
#[command(about = "Run the courier conformance suite")]
#[command(version)]
struct Cli {
    /// Commit id recorded in the log
    #[arg(short, long, default_value = "-")]
    commit_id: String,

    /// User recorded in the log (defaults to $USER)
    #[arg(short, long)]
    user: Option<String>,

    /// Write the JSON log here instead of stdout
    #[arg(short, long)]
    log_path: Option<PathBuf>,

    /// Do not write the JSON log
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env().context("Failed to load engine configuration")?;
    tracing::info!(timer_slack_us = config.timer_slack.as_micros() as u64, "configuration loaded");

    let mut report = Report::start(TestInfo {
        suite: "courier".to_string(),
        kind: "FVT".to_string(),
        name: "courier_check".to_string(),
        desc: "Test the courier dispatch engine".to_string(),
        user: cli
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_default(),
        commit_id: cli.commit_id.clone(),
    });
    for (number, desc) in scenarios::ASSERTIONS {
        report.add_assertion(*number, desc);
    }

    scenarios::run(config, &mut report)
        .await
        .context("Scenario setup failed")?;

    let failed = report.failed();
    let test_id = report.test_id().to_string();
    let records = report.finish();
    if !cli.quiet {
        write_log(&records, cli.log_path.as_ref())?;
    }

    if failed == 0 {
        eprintln!("{} {}", "✓ all assertions passed".bright_green().bold(), test_id.dimmed());
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{}", format!("✗ {failed} assertion(s) failed").bright_red().bold());
        Ok(ExitCode::FAILURE)
    }
}

fn write_log(records: &[Record], path: Option<&PathBuf>) -> Result<()> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            let mut out = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut out, records).context("Failed to write log")?;
            writeln!(out)?;
            out.flush()?;
            tracing::info!(path = %path.display(), "log written");
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            serde_json::to_writer_pretty(&mut out, records).context("Failed to write log")?;
            writeln!(out)?;
        }
    }
    Ok(())
}
