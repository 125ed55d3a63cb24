//! Iterative design refinement CLI.
//!
//! Loads `refiner.toml`, then proposes, applies and validates changes to the
//! target project until validation passes or the attempt budget runs out.
//! Every run is logged under the configured log directory.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};

use refiner::controller::{AttemptEvent, IterationController};
use refiner::core::cancel::CancelToken;
use refiner::core::history::ProjectState;
use refiner::core::types::RunStatus;
use refiner::exit_codes;
use refiner::io::config::{
    DEFAULT_CONFIG_FILE, EngineeringConfig, check_project_path, load_config, write_config,
};
use refiner::io::iteration_log::{RunLog, generate_run_id, load_state, render_summary};
use refiner::io::patch::FileSetApplier;
use refiner::io::proposer::CommandProposer;
use refiner::io::validation::{CommandValidator, ValidationRunner, ValidationVerdict};
use refiner::logging;

#[derive(Parser)]
#[command(
    name = "refiner",
    version,
    about = "Bounded propose/apply/validate loop for code-represented designs"
)]
struct Cli {
    /// Log debug output for this crate to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config template.
    Init {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Load and validate the config and check the project path.
    Check {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Run the refinement loop.
    Run {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Override `iteration_budget`.
        #[arg(short, long)]
        budget: Option<u32>,
        /// Override `log_dir`.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Run the project's validation once and print the verdict.
    Validate {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Print the summary of a finished run (run directory or state.json).
    Report { path: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    ExitCode::from(code as u8)
}

fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Init { config, force } => cmd_init(&config, force),
        Command::Check { config } => cmd_check(&config),
        Command::Run {
            config,
            budget,
            log_dir,
        } => cmd_run(&config, budget, log_dir),
        Command::Validate { config } => cmd_validate(&config),
        Command::Report { path } => cmd_report(&path),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &EngineeringConfig::example())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_check(path: &Path) -> Result<i32> {
    let cfg = load_resolved(path)?;
    check_project_path(&cfg.project_path)
        .with_context(|| format!("project_path {}", cfg.project_path.display()))?;
    println!(
        "ok: budget {}, project {}, model {}",
        cfg.iteration_budget,
        cfg.project_path.display(),
        cfg.model
    );
    Ok(exit_codes::OK)
}

fn cmd_run(path: &Path, budget: Option<u32>, log_dir: Option<PathBuf>) -> Result<i32> {
    let mut cfg = load_resolved(path)?;
    if let Some(budget) = budget {
        cfg.iteration_budget = budget;
    }
    if let Some(log_dir) = log_dir {
        cfg.log_dir = log_dir;
    }
    cfg.validate()?;

    let run_id = generate_run_id();
    let log = RunLog::create(&cfg.log_dir, &run_id)?;
    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    let mut controller = IterationController::new(
        CommandProposer::from_config(&cfg),
        FileSetApplier,
        CommandValidator::from_config(&cfg),
    )
    .with_run_id(run_id)
    .with_cancel(cancel);

    let mut log_error = None;
    let state = controller.run_with(&cfg, |event| {
        print_attempt(event);
        if let Err(err) = persist_attempt(&log, event) {
            warn!(err = %err, "failed to write attempt log");
            log_error.get_or_insert(err);
        }
    })?;

    log.write_state(&state)?;
    log.write_summary(&state)?;
    if let Some(err) = log_error {
        eprintln!("warning: some attempt logs were not written: {err:#}");
    }
    print_outcome(&state);
    println!("logs: {}", log.dir().display());
    Ok(exit_codes::for_status(state.status()))
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let cfg = load_resolved(path)?;
    check_project_path(&cfg.project_path)
        .with_context(|| format!("project_path {}", cfg.project_path.display()))?;
    let runner = ValidationRunner::from_config(CommandValidator::from_config(&cfg), &cfg)?;
    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    match runner.run(&cfg.project_path, &cancel) {
        ValidationVerdict::Pass { output } => {
            print!("{output}");
            println!("validation passed");
            Ok(exit_codes::OK)
        }
        ValidationVerdict::Fail { diagnostic } => {
            println!("{diagnostic}");
            println!("validation failed");
            Ok(exit_codes::INVALID)
        }
        ValidationVerdict::Hung { ceiling } => {
            println!("validation did not terminate within {}s", ceiling.as_secs());
            Ok(exit_codes::FAILED)
        }
        ValidationVerdict::Cancelled => {
            println!("validation cancelled");
            Ok(exit_codes::FAILED)
        }
    }
}

fn cmd_report(path: &Path) -> Result<i32> {
    let state = load_state(path)?;
    print!("{}", render_summary(&state));
    Ok(exit_codes::for_status(state.status()))
}

/// Load config and resolve relative paths against the config file's directory.
fn load_resolved(path: &Path) -> Result<EngineeringConfig> {
    let cfg = load_config(path)?;
    let base = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    debug!(base = %base.display(), "resolving config paths");
    Ok(cfg.resolve_paths(base))
}

fn persist_attempt(log: &RunLog, event: &AttemptEvent<'_>) -> Result<()> {
    log.write_attempt(event)?;
    log.write_state(event.state)
}

fn print_attempt(event: &AttemptEvent<'_>) {
    let record = event.record;
    let retries = if record.transient_retries > 0 {
        format!(" ({} transient retries)", record.transient_retries)
    } else {
        String::new()
    };
    match record.failure() {
        Some((class, _)) => println!("attempt {}: {}{retries}", record.index, class.as_str()),
        None => println!("attempt {}: validation passed{retries}", record.index),
    }
}

fn print_outcome(state: &ProjectState) {
    let attempts = state.history().len();
    match state.status() {
        RunStatus::Converged => println!("converged after {attempts} attempt(s)"),
        RunStatus::Exhausted => println!(
            "exhausted: {attempts} of {} attempt(s) used without converging",
            state.iteration_budget()
        ),
        RunStatus::Failed => println!(
            "failed after {attempts} attempt(s): {}",
            state.fatal().unwrap_or("unknown error")
        ),
        RunStatus::Running => println!("stopped while running"),
    }
}

/// Cancel `token` on Ctrl-C. The loop notices at its next check and kills any
/// child process it is waiting on.
fn install_interrupt_handler(token: CancelToken) {
    let spawned = thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(err = %err, "could not start signal runtime");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupt received, stopping");
                    token.cancel();
                }
            });
        });
    if let Err(err) = spawned {
        warn!(err = %err, "could not install interrupt handler");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_defaults_to_refiner_toml() {
        let cli = Cli::parse_from(["refiner", "init"]);
        match cli.command {
            Command::Init { config, force } => {
                assert_eq!(config, PathBuf::from("refiner.toml"));
                assert!(!force);
            }
            _ => panic!("expected init"),
        }
    }

    #[test]
    fn parse_run_overrides() {
        let cli = Cli::parse_from([
            "refiner",
            "run",
            "--budget",
            "0",
            "--log-dir",
            "/tmp/logs",
            "--verbose",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Command::Run {
                budget, log_dir, ..
            } => {
                assert_eq!(budget, Some(0));
                assert_eq!(log_dir, Some(PathBuf::from("/tmp/logs")));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_report_requires_path() {
        assert!(Cli::try_parse_from(["refiner", "report"]).is_err());
        let cli = Cli::parse_from(["refiner", "report", "runs/run-1"]);
        assert!(matches!(cli.command, Command::Report { .. }));
    }

    #[test]
    fn load_resolved_uses_config_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("refiner.toml");
        write_config(&path, &EngineeringConfig::example()).expect("write");
        let cfg = load_resolved(&path).expect("load");
        assert_eq!(cfg.project_path, temp.path().join("design"));
        assert_eq!(cfg.log_dir, temp.path().join(".refiner/runs"));
    }

    #[test]
    fn report_reads_persisted_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = RunLog::create(temp.path(), "run-x").expect("create");
        log.write_state(&ProjectState::new("run-x", 0)).expect("write");
        assert_eq!(cmd_report(log.dir()).expect("report"), exit_codes::EXHAUSTED);
    }
}
