//! # `smoke_test`
//!
//! Release CI step: take one packaged artifact, extract it, start the app
//! headlessly, and fail the job unless it either keeps running until the timeout
//! or exits cleanly.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::error;
use simplelog::TerminalMode;

use rimsort_updater::config;
use rimsort_updater::logfile;
use rimsort_updater::smoke::{self, SmokeOptions};

#[derive(Parser)]
#[command(name = "smoke_test")]
#[command(about = "Launches a packaged RimSort build headlessly and checks it starts", long_about = None)]
struct Cli {
    /// Release archive (.zip, .tar.gz, .tgz, .tar), extracted folder, or executable.
    artifact: PathBuf,

    /// Executable to look for inside the artifact.
    #[arg(long, value_name = "PATH")]
    exe_name: Option<PathBuf>,

    /// Seconds to let the app run before killing it.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Extraction folder for archives, kept after the run. Default: a temporary
    /// folder that is removed afterwards.
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Keep the caller's display settings instead of forcing offscreen rendering.
    #[arg(long)]
    no_headless: bool,

    /// Print the result as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Arguments passed through to the app.
    #[arg(last = true)]
    app_args: Vec<String>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    // Logs stay off stdout so `--json` output can be piped.
    let _ = logfile::init_with(cli.verbose, None, TerminalMode::Stderr);

    let options = SmokeOptions {
        executable: cli.exe_name.unwrap_or_else(config::default_executable),
        timeout: Duration::from_secs(cli.timeout_secs),
        work_dir: cli.work_dir,
        headless: !cli.no_headless,
        args: cli.app_args,
        ..SmokeOptions::default()
    };

    let report = match smoke::run(&cli.artifact, &options) {
        Ok(report) => report,
        Err(e) => {
            error!("Smoke test could not run: {:#}", e);
            std::process::exit(1);
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => error!("Failed to serialize report: {}", e),
        }
    }

    if !report.verdict.passed() {
        std::process::exit(1);
    }
}
