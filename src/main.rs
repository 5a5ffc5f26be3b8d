//! CLI entry point for the compatibility layer's on-device doctor.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use downloader_compat::bootstrap::{self, CompatContext};
use downloader_compat::check::{CheckOutcome, run_checks};
use downloader_compat::config::{self, CompatConfig, FileConfig};
use downloader_compat::diagnostic;
use downloader_compat::io::FileMode;
use tracing::{debug, info};

mod cli;
mod terminal;

use cli::{Args, Command};

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(error) => {
            eprintln!("Error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    let (file_config, config_path) = load_file_config(&args)?;
    let mut compat_config = CompatConfig::from_env(file_config.as_ref());
    apply_cli_overrides(&mut compat_config, &args);
    if compat_config.disable_descriptor_diagnostic {
        // SAFETY: no thread exists yet; the fetch runtime is built later.
        unsafe { diagnostic::export_diagnostic_env() };
    }

    let default_level = terminal::resolve_default_log_level(&args, compat_config.verbosity);
    terminal::init_tracing(
        default_level,
        terminal::should_force_cli_log_level(&args),
        terminal::is_no_color_requested(&args),
    );
    debug!(?args, "CLI arguments parsed");
    if let Some(path) = &config_path {
        debug!(path = %path.display(), "config file loaded");
    }

    let context = bootstrap::initialize(compat_config)?;

    match args.command() {
        Command::Report { json } => {
            print_report(context, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => {
            let outcomes = run_checks(context);
            print_checks(&outcomes);
            if outcomes.iter().all(|outcome| outcome.passed) {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Fetch { url, output } => {
            fetch_to_file(context, &url, &output)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Loads `--config` when given (a missing file is an error), otherwise the
/// default location if it exists.
fn load_file_config(args: &Args) -> Result<(Option<FileConfig>, Option<PathBuf>)> {
    if let Some(path) = args.config.as_deref() {
        let config = config::load_file_config(path)?;
        return Ok((Some(config), Some(path.to_path_buf())));
    }
    let loaded = config::load_default_file_config()?;
    let path = if loaded.loaded_from_file {
        loaded.path
    } else {
        None
    };
    Ok((loaded.config, path))
}

fn apply_cli_overrides(config: &mut CompatConfig, args: &Args) {
    for category in &args.force_emulate {
        if !config.forces(*category) {
            config.force_emulate.push(*category);
        }
    }
    if args.no_resilient_io {
        config.resilient_io = false;
    }
}

fn print_report(context: &CompatContext, json: bool) -> Result<()> {
    let report = context.report();
    let mut stdout = std::io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut stdout, &report)
            .context("Failed to serialize capability report")?;
        writeln!(stdout)?;
        return Ok(());
    }

    writeln!(stdout, "{:<16} {:<10} {}", "CATEGORY", "PROBE", "BACKING")?;
    for row in &report.categories {
        let probe = if row.available { "ok" } else { "missing" };
        writeln!(stdout, "{:<16} {:<10} {}", row.category, probe, row.backing)?;
    }
    writeln!(stdout)?;
    writeln!(stdout, "descriptor diagnostic: {}", report.diagnostic)?;
    writeln!(
        stdout,
        "resource tracker:      {}",
        if report.tracker_neutralized {
            "neutralized"
        } else {
            "native"
        }
    )?;
    writeln!(stdout, "I/O provider:          {}", report.io_provider)?;
    writeln!(stdout, "stdin:                 {:?}", report.stdin)?;
    writeln!(stdout, "cpu_count:             {}", report.cpu_count)?;

    if !report.patches.is_empty() {
        writeln!(stdout)?;
        writeln!(stdout, "substituted symbols:")?;
        for patch in &report.patches {
            let owner = patch
                .category
                .map_or_else(|| "resource_tracker".to_string(), |c| c.to_string());
            writeln!(stdout, "  {owner}::{}", patch.symbol)?;
        }
    }
    Ok(())
}

fn print_checks(outcomes: &[CheckOutcome]) {
    for outcome in outcomes {
        let status = if outcome.passed { "PASS" } else { "FAIL" };
        let backing = outcome
            .backing
            .map_or_else(|| "-".to_string(), |b| b.to_string());
        if outcome.passed {
            println!("{status}  {:<18} {backing}", outcome.primitive);
        } else {
            println!(
                "{status}  {:<18} {backing}  {}",
                outcome.primitive, outcome.detail
            );
        }
    }
    let failed = outcomes.iter().filter(|outcome| !outcome.passed).count();
    println!("\n{} passed, {failed} failed", outcomes.len() - failed);
}

fn fetch_to_file(context: &CompatContext, url: &str, output: &Path) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let response = runtime
        .block_on(context.io().fetch(url))
        .with_context(|| format!("Failed to fetch {url}"))?;

    let mut file = context
        .io()
        .open(output, FileMode::WRITE_BINARY)
        .with_context(|| format!("Failed to open '{}' for writing", output.display()))?;
    file.write_all(&response.body)
        .and_then(|()| file.flush())
        .with_context(|| format!("Failed to write '{}'", output.display()))?;

    info!(
        url = %response.url,
        status = response.status,
        bytes = response.body.len(),
        output = %output.display(),
        "fetch saved"
    );
    Ok(())
}
