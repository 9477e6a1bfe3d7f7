//! CLI entry point for the foliofetch tool.

use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use foliofetch_core::config::Config;
use foliofetch_core::input::InputFile;
use foliofetch_core::pipeline::{Pipeline, RunSummary};
use foliofetch_core::state::StateStore;

mod cli;

use cli::Args;

/// Exit code for configuration errors.
const EXIT_CONFIG: u8 = 2;
/// Exit code for input-file errors.
const EXIT_INPUT: u8 = 3;
/// Exit code when a `stop` budget policy drained the run.
const EXIT_BUDGET_STOP: u8 = 4;
/// Exit code on cancellation (SIGINT).
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > --log-level flag
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if args.quota_status {
        return quota_status(&args);
    }
    if args.cleanup_deferred {
        return cleanup_deferred(&args);
    }

    let Some(input_path) = args.input.as_deref() else {
        eprintln!("error: an input CSV path is required (see --help)");
        return ExitCode::from(EXIT_INPUT);
    };
    let mut input = match InputFile::read(input_path) {
        Ok(input) => input,
        Err(error) => {
            eprintln!("input error: {error}");
            return ExitCode::from(EXIT_INPUT);
        }
    };
    info!(
        records = input.records.len(),
        skipped_rows = input.skipped_rows,
        "input file loaded"
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, draining");
                shutdown.cancel();
            }
        });
    }

    let mut pipeline =
        match Pipeline::new(Arc::clone(&config), &args.output_dir, shutdown, args.dry_run) {
            Ok(pipeline) => pipeline,
            Err(error) => {
                eprintln!("cannot prepare output directory: {error}");
                return ExitCode::from(EXIT_INPUT);
            }
        };

    let interactive = if args.force_cli {
        false
    } else {
        args.force_interactive || std::io::stderr().is_terminal()
    };
    if interactive {
        let bar = indicatif::ProgressBar::new(input.records.len() as u64);
        bar.set_style(
            indicatif::ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar()),
        );
        pipeline = pipeline.with_progress(bar);
    }

    let summary = match pipeline.run(&mut input).await {
        Ok(summary) => summary,
        Err(error) => {
            eprintln!("pipeline error: {error}");
            return ExitCode::from(EXIT_INPUT);
        }
    };

    print_summary(&summary);

    if summary.budget_stopped {
        return ExitCode::from(EXIT_BUDGET_STOP);
    }
    if summary.cancelled {
        return ExitCode::from(EXIT_CANCELLED);
    }
    ExitCode::SUCCESS
}

fn print_summary(summary: &RunSummary) {
    println!("run summary:");
    println!("  completed: {}", summary.completed);
    println!("  failed:    {}", summary.failed);
    println!("  no_match:  {}", summary.no_match);
    println!("  deferred:  {}", summary.deferred);
    println!("  skipped:   {}", summary.skipped);
    println!(
        "  pdf:       {} files, {} bytes",
        summary.budget.pdf.files, summary.budget.pdf.bytes
    );
    println!(
        "  image:     {} files, {} bytes",
        summary.budget.image.files, summary.budget.image.bytes
    );
    println!(
        "  metadata:  {} files, {} bytes",
        summary.budget.metadata.files, summary.budget.metadata.bytes
    );
}

fn quota_status(args: &Args) -> ExitCode {
    let store = match StateStore::load_or_default(&args.output_dir) {
        Ok(store) => store,
        Err(error) => {
            eprintln!("cannot read state: {error}");
            return ExitCode::from(EXIT_INPUT);
        }
    };
    println!("quota ledger:");
    let quota = store.quota_snapshot();
    if quota.is_empty() {
        println!("  (empty)");
    }
    for (provider, state) in quota {
        println!(
            "  {provider}: {}/{} used, window since {}, wait_on_exhaustion={}",
            state.used_today,
            if state.daily_limit == 0 {
                "unlimited".to_string()
            } else {
                state.daily_limit.to_string()
            },
            state.window_start_wall,
            state.wait_on_exhaustion
        );
    }
    println!("deferred queue:");
    let deferred = store.deferred_snapshot();
    if deferred.is_empty() {
        println!("  (empty)");
    }
    for item in deferred {
        println!(
            "  {} [{}] provider={} ready_at={}",
            item.entry_id,
            match item.status {
                foliofetch_core::state::DeferredStatus::Pending => "pending",
                foliofetch_core::state::DeferredStatus::Completed => "completed",
                foliofetch_core::state::DeferredStatus::Failed => "failed",
            },
            item.candidate.provider_key,
            item.ready_at
        );
    }
    ExitCode::SUCCESS
}

fn cleanup_deferred(args: &Args) -> ExitCode {
    let store = match StateStore::load_or_default(&args.output_dir) {
        Ok(store) => store,
        Err(error) => {
            eprintln!("cannot read state: {error}");
            return ExitCode::from(EXIT_INPUT);
        }
    };
    let removed = store.compact_deferred(chrono::Utc::now());
    if let Err(error) = store.save() {
        eprintln!("cannot persist state: {error}");
        return ExitCode::from(EXIT_INPUT);
    }
    println!("pruned {removed} deferred item(s)");
    ExitCode::SUCCESS
}
