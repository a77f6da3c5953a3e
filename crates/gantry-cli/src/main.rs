//! Gantry - native dependency build & test matrix orchestrator
//!
//! Usage:
//!   gantry run        # provision every cell, test, maybe publish docs
//!   gantry matrix     # show the declared matrix
//!   gantry cache      # inspect the artifact cache

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry_core::cache::ArtifactCache;
use gantry_core::deploy::{DeployDecision, SphinxPublisher};
use gantry_core::pipeline::InstallationPipeline;
use gantry_core::prelude::*;
use gantry_core::testing::PytestRunner;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "Native dependency build & test matrix orchestrator", long_about = None)]
struct Cli {
    /// Path to the matrix declaration
    #[arg(long, short, default_value = gantry_core::config::CONFIG_FILE, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision, install, and test every declared matrix cell
    Run {
        /// Branch evaluated against the deploy target (defaults to
        /// $GANTRY_BRANCH, then to the package root's git HEAD)
        #[arg(long)]
        branch: Option<String>,

        /// Override the persistent build cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Instrument the fast partition with coverage
        #[arg(long)]
        coverage: bool,

        /// Environment variable holding the docs publish token
        #[arg(long, default_value = "GANTRY_DOCS_TOKEN")]
        deploy_token_env: String,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// List declared matrix cells
    Matrix {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// List cached native builds
    Cache {
        /// Override the persistent build cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Re-hash install trees against their markers (slower)
        #[arg(long)]
        verify: bool,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = GantryConfig::load(&cli.config)?;
    tracing::debug!(
        config = %cli.config.display(),
        cells = config.matrix.len(),
        "loaded matrix declaration"
    );

    match cli.command {
        Commands::Run {
            branch,
            cache_dir,
            coverage,
            deploy_token_env,
            format,
        } => {
            let exit_code = run_matrix(
                &config,
                branch,
                cache_dir,
                coverage,
                &deploy_token_env,
                format,
            )?;
            std::process::exit(exit_code);
        }
        Commands::Matrix { format } => show_matrix(&config, format),
        Commands::Cache {
            cache_dir,
            verify,
            format,
        } => show_cache(&config, cache_dir, verify, format),
    }
}

fn run_matrix(
    config: &GantryConfig,
    branch: Option<String>,
    cache_dir: Option<PathBuf>,
    coverage: bool,
    deploy_token_env: &str,
    format: OutputFormat,
) -> Result<i32> {
    let branch = resolve_branch(branch, config)?;
    let cache_dir = match cache_dir {
        Some(dir) => dir,
        None => config.resolved_cache_dir()?,
    };
    let cache = ArtifactCache::open(cache_dir)?;

    let builder = ScriptBuilder::new(config.build.clone(), config.package_root());
    let pipeline = InstallationPipeline::new(config);
    let runner = PytestRunner::new(
        config.package_root(),
        config.coverage_config.as_deref().map(|p| config.resolve(p)),
    );
    let publisher = SphinxPublisher::new(
        config.package_root(),
        config.resolve(&config.publish_script),
    );

    let opts = RunOptions {
        branch,
        coverage,
        credential: std::env::var(deploy_token_env).ok().map(Secret::new),
    };
    let orchestrator = Orchestrator::new(config, &cache, &builder, &pipeline, &runner, &publisher);
    let summary = orchestrator.run(&opts)?;

    match format {
        OutputFormat::Table => print_summary_table(&summary),
        OutputFormat::Json => print_summary_json(&summary)?,
    }
    Ok(summary.status().exit_code())
}

fn resolve_branch(flag: Option<String>, config: &GantryConfig) -> Result<String> {
    if let Some(branch) = flag {
        return Ok(branch);
    }
    if let Ok(branch) = std::env::var("GANTRY_BRANCH") {
        if !branch.is_empty() {
            return Ok(branch);
        }
    }
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(config.package_root())
        .output()
        .context("Failed to invoke git for branch detection")?;
    if !output.status.success() {
        anyhow::bail!("Could not determine branch; pass --branch or set GANTRY_BRANCH");
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn print_summary_table(summary: &RunSummary) {
    for report in summary.result.cells() {
        match &report.outcome {
            CellOutcome::Completed {
                reports,
                partition_errors,
                ..
            } => {
                let verdict = if report.outcome.passed() {
                    "pass"
                } else {
                    "FAIL"
                };
                println!("{:<28} {}", report.cell.label(), verdict);
                for test_report in reports {
                    let coverage = test_report
                        .coverage
                        .as_deref()
                        .map(|c| format!("  cov {}", c))
                        .unwrap_or_default();
                    println!(
                        "    {:<6} {} passed, {} failed, {} skipped{}",
                        test_report.partition,
                        test_report.passed,
                        test_report.failed,
                        test_report.skipped,
                        coverage
                    );
                }
                for err in partition_errors {
                    println!("    {}", err);
                }
            }
            CellOutcome::Aborted(err) => {
                println!("{:<28} ABORTED", report.cell.label());
                println!("    {:#}", err);
            }
        }
    }

    match &summary.decision {
        DeployDecision::Deploying { cells } => {
            for cell in cells {
                println!("deploy: docs published from {}", cell.label());
            }
        }
        DeployDecision::Skipped { reason } => println!("deploy: skipped ({})", reason),
    }
    for failure in &summary.deploy_failures {
        println!("deploy: FAILED - {:#}", failure);
    }
}

fn print_summary_json(summary: &RunSummary) -> Result<()> {
    let cells: Vec<serde_json::Value> = summary
        .result
        .cells()
        .iter()
        .map(|report| match &report.outcome {
            CellOutcome::Completed {
                reports,
                partition_errors,
                ..
            } => serde_json::json!({
                "cell": report.cell,
                "passed": report.outcome.passed(),
                "partitions": reports,
                "partition_errors": partition_errors
                    .iter()
                    .map(|e| format!("{:#}", e))
                    .collect::<Vec<_>>(),
            }),
            CellOutcome::Aborted(err) => serde_json::json!({
                "cell": report.cell,
                "passed": false,
                "aborted": format!("{:#}", err),
            }),
        })
        .collect();

    let deploy = match &summary.decision {
        DeployDecision::Deploying { cells } => serde_json::json!({
            "deploying": cells.iter().map(MatrixCell::label).collect::<Vec<_>>(),
            "failures": summary
                .deploy_failures
                .iter()
                .map(|e| format!("{:#}", e))
                .collect::<Vec<_>>(),
        }),
        DeployDecision::Skipped { reason } => serde_json::json!({
            "skipped": reason.to_string(),
        }),
    };

    let document = serde_json::json!({
        "started_at": summary.result.started_at(),
        "finished_at": summary.result.finished_at(),
        "all_passed": summary.result.all_passed(),
        "cells": cells,
        "deploy": deploy,
    });
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

fn show_matrix(config: &GantryConfig, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            println!("{:<10} {:<10} {:<10}", "python", "gdal", "proj");
            for cell in &config.matrix {
                println!("{:<10} {:<10} {:<10}", cell.python, cell.gdal, cell.proj);
            }
            if let Some(target) = &config.deploy {
                println!(
                    "deploy target: branch {} / python {}",
                    target.branch, target.python
                );
            }
        }
        OutputFormat::Json => {
            let document = serde_json::json!({
                "matrix": config.matrix,
                "deploy": config.deploy,
            });
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
    }
    Ok(())
}

fn show_cache(
    config: &GantryConfig,
    cache_dir: Option<PathBuf>,
    verify: bool,
    format: OutputFormat,
) -> Result<()> {
    let cache_dir = match cache_dir {
        Some(dir) => dir,
        None => config.resolved_cache_dir()?,
    };
    let cache = ArtifactCache::open(cache_dir)?;
    let entries = cache.entries()?;

    let mut rows = Vec::new();
    for entry in entries {
        let state = match &entry.marker {
            None => "partial".to_string(),
            Some(marker) => {
                let key = CacheKey::new(marker.library, marker.version.clone());
                if verify {
                    match cache.verify(&key) {
                        Ok(true) => "ok".to_string(),
                        Ok(false) => "modified".to_string(),
                        Err(err) => format!("corrupt ({})", err),
                    }
                } else {
                    "ok".to_string()
                }
            }
        };
        rows.push((entry, state));
    }

    match format {
        OutputFormat::Table => {
            println!("{:<20} {:<10} built", "entry", "state");
            for (entry, state) in &rows {
                let built_at = entry
                    .marker
                    .as_ref()
                    .map(|m| m.built_at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<20} {:<10} {}", entry.dir_name, state, built_at);
            }
        }
        OutputFormat::Json => {
            let document: Vec<serde_json::Value> = rows
                .iter()
                .map(|(entry, state)| {
                    serde_json::json!({
                        "entry": entry.dir_name,
                        "state": state,
                        "marker": entry.marker,
                        "path": entry.install_root,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
    }
    Ok(())
}
