//! CLI definition for `benchmarkoor`.

use crate::{config::Config, runner::RunSupervisor, suite};
use clap::{ArgAction, Args, Parser, Subcommand};
use cli_table::{Cell, Style, Table};
use color_eyre::{eyre::eyre, Result};
use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{error, Level};

/// Exit code for configuration errors.
const EXIT_CONFIG: u8 = 1;
/// Exit code for runtime errors (at least one instance failed).
const EXIT_RUNTIME: u8 = 2;
/// Exit code when a signal cancelled the run.
const EXIT_SIGNAL: u8 = 130;

/// The CLI options for `benchmarkoor`.
#[derive(Parser, Debug, Clone)]
pub(crate) struct Cli {
    /// Verbosity level (0-2)
    #[arg(long, short, action = ArgAction::Count, global = true)]
    pub v: u8,
    /// The subcommand to run.
    #[clap(subcommand)]
    pub subcommand: CliSubcommand,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum CliSubcommand {
    /// Runs the configured benchmark.
    Run(ConfigArgs),
    /// Lists the tests of the configured suite without running anything.
    Suites(ConfigArgs),
}

#[derive(Args, Debug, Clone)]
pub(crate) struct ConfigArgs {
    /// Configuration file(s); later files override earlier ones.
    #[clap(short, long, required = true, num_args = 1..)]
    pub(crate) config: Vec<PathBuf>,
}

impl Cli {
    /// Parses the configuration, initialises tracing and dispatches the
    /// subcommand, mapping outcomes onto the exit-code contract.
    pub(crate) async fn run(self) -> ExitCode {
        color_eyre::install().ok();

        let args = match &self.subcommand {
            CliSubcommand::Run(args) | CliSubcommand::Suites(args) => args.clone(),
        };
        let config = match Config::load(&args.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("configuration error: {e:#}");
                return ExitCode::from(EXIT_CONFIG);
            }
        };
        if let Err(e) = self.init_tracing_subscriber(&config.global.log_level) {
            eprintln!("failed to initialise tracing: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }

        match self.subcommand {
            CliSubcommand::Run(_) => run_benchmark(config).await,
            CliSubcommand::Suites(_) => match list_suite(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(target: "cli", "suite listing failed: {e:#}");
                    ExitCode::from(EXIT_RUNTIME)
                }
            },
        }
    }

    /// Initializes the tracing subscriber.
    ///
    /// `-v` raises verbosity; without it the configured log level applies.
    fn init_tracing_subscriber(&self, log_level: &str) -> Result<()> {
        let level = match self.v {
            0 => log_level
                .parse::<Level>()
                .map_err(|_| eyre!("invalid log_level: {log_level}"))?,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        let subscriber = tracing_subscriber::fmt().with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber).map_err(|e| eyre!(e))?;
        Ok(())
    }
}

/// Runs the benchmark with signal-driven cancellation.
async fn run_benchmark(config: Config) -> ExitCode {
    let cancel = CancellationToken::new();
    let signalled = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(cancel.clone(), signalled.clone());

    let supervisor = RunSupervisor::new(config);
    let outcome = supervisor.run(cancel).await;

    if signalled.load(Ordering::SeqCst) {
        return ExitCode::from(EXIT_SIGNAL);
    }
    match outcome {
        Ok(summary) if summary.failed == 0 => {
            tracing::info!(target: "cli", "{} instance(s) completed", summary.completed);
            ExitCode::SUCCESS
        }
        Ok(summary) => {
            error!(target: "cli", "{} instance(s) failed", summary.failed);
            ExitCode::from(EXIT_RUNTIME)
        }
        Err(e) => {
            error!(target: "cli", "run failed: {e:#}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

fn spawn_signal_handler(cancel: CancellationToken, signalled: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        signalled.store(true, Ordering::SeqCst);
        cancel.cancel();
    });
}

/// Prepares the configured suite and prints its tests as a table.
async fn list_suite(config: Config) -> Result<()> {
    let supervisor = RunSupervisor::new(config);
    let mut provider = supervisor.build_provider()?;
    let prepared = provider.prepare().await?;
    let hash = suite::compute_suite_hash(&prepared)?;

    println!("suite {hash}");
    if !prepared.pre_run_steps.is_empty() {
        let names: Vec<_> = prepared
            .pre_run_steps
            .iter()
            .map(|step| step.name.as_str())
            .collect();
        println!("pre-run steps: {}", names.join(", "));
    }

    let mut table_contents = Vec::with_capacity(prepared.tests.len());
    for test in &prepared.tests {
        let steps = [
            test.setup.as_ref().map(|_| "setup"),
            test.test.as_ref().map(|_| "test"),
            test.cleanup.as_ref().map(|_| "cleanup"),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ");
        let genesis = test
            .genesis_hash
            .map(|hash| hash.to_string())
            .unwrap_or_else(|| "-".into());
        table_contents.push(vec![test.name.as_str().cell(), steps.cell(), genesis.cell()]);
    }

    let table = table_contents
        .table()
        .title(vec!["Test".cell(), "Steps".cell(), "Genesis".cell()])
        .bold(true);
    cli_table::print_stdout(table)?;

    provider.cleanup()?;
    Ok(())
}
