//! runwatch CLI Entry Point
//!
//! Runs one action group inside a container. Step output and instructions
//! go to stdout; logs and the final summary go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Run the first group
//! runwatch groups.yaml
//!
//! # Run the third group with a custom state file
//! runwatch groups.yaml --group 2 --state /shared/state.json
//!
//! # Pause and resume through a custom control socket
//! runwatch groups.yaml --control /tmp/runwatch.sock
//! ```

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::{ColoredString, Colorize};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use runwatch::config::RunnerConfig;
use runwatch::execution::{
    load_groups, Engine, ExecutionState, RunSummary, Session, StepStatus, CODE_INPUT_ERROR,
    CODE_INTERNAL,
};
use runwatch::obfuscator::Obfuscator;
use runwatch::process::{Supervisor, SysinfoProcessTable};
use runwatch::{APP_NAME, VERSION};

/// Command-line options parsed from arguments.
#[derive(Debug, Default)]
struct Options {
    groups_path: Option<PathBuf>,
    group: usize,
    config_path: Option<PathBuf>,
    state_path: Option<PathBuf>,
    control_socket: Option<PathBuf>,
    no_control: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Stderr)
        .format(|buf, record| match record.level() {
            log::Level::Warn | log::Level::Error => {
                writeln!(buf, "[{}] {}", record.level(), record.args())
            }
            _ => writeln!(buf, "{}", record.args()),
        })
        .init();
}

/// Prints usage information.
fn print_usage() {
    eprintln!("Usage: runwatch [OPTIONS] <GROUPS_FILE>");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <GROUPS_FILE>       YAML or JSON file with the action groups");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --group N           Index of the group to run (default: 0)");
    eprintln!("  --config PATH       Runner config file");
    eprintln!("  --state PATH        Execution state file");
    eprintln!("  --control PATH      Control socket path");
    eprintln!("  --no-control        Do not serve the control socket");
    eprintln!("  --verbose           Enable debug logging");
    eprintln!("  --help              Show this help message");
    eprintln!("  --version           Show version information");
}

/// Parses command-line arguments into Options.
fn parse_arguments(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut i = 1; // Skip program name

    let value = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires a value", flag))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => options.verbose = true,
            "--no-control" => options.no_control = true,
            "--group" => {
                i += 1;
                let raw = value(i, "--group")?;
                options.group = raw
                    .parse()
                    .map_err(|_| format!("Invalid group index: {}", raw))?;
            }
            "--config" => {
                i += 1;
                options.config_path = Some(PathBuf::from(value(i, "--config")?));
            }
            "--state" => {
                i += 1;
                options.state_path = Some(PathBuf::from(value(i, "--state")?));
            }
            "--control" => {
                i += 1;
                options.control_socket = Some(PathBuf::from(value(i, "--control")?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if options.groups_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                options.groups_path = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    if options.groups_path.is_none() {
        return Err("Missing groups file".to_string());
    }
    Ok(options)
}

fn colorize(status: StepStatus) -> ColoredString {
    let label = status.as_str().to_uppercase();
    match status {
        StepStatus::Passed => label.green().bold(),
        StepStatus::Failed | StepStatus::Timeout => label.red().bold(),
        StepStatus::Aborted => label.magenta().bold(),
        StepStatus::Skipped => label.yellow(),
        StepStatus::Running | StepStatus::NotStarted => label.dimmed(),
    }
}

/// Prints per-step statuses and resource usage.
fn print_summary(summary: &RunSummary, state: &ExecutionState) {
    eprintln!();
    eprintln!("{}", "Execution Summary".bold());
    for (reference, status) in &summary.steps {
        eprintln!("  {:<32} {}", reference, colorize(*status));
        if let Some(usage) = state.usage.get(reference) {
            eprintln!(
                "  {:<32} cpu avg {:.1}% peak {:.1}%, memory peak {} MB",
                "", usage.average_cpu, usage.peak_cpu, usage.peak_memory_mb
            );
        }
    }
    eprintln!();
    eprintln!("  Duration: {:.2}s", summary.duration.as_secs_f64());
    eprintln!("  Status:   {}", colorize(summary.status()));
}

/// Serves pause/resume requests for the running session.
#[cfg(unix)]
fn spawn_control_server(path: &std::path::Path, session: Arc<Session>, cancel: CancellationToken) {
    use runwatch::control::server::ControlServer;

    let server = match ControlServer::bind(path) {
        Ok(server) => server,
        Err(e) => {
            warn!("Control socket unavailable at {}: {}", path.display(), e);
            return;
        }
    };
    info!("Control socket: {}", server.path().display());
    tokio::spawn(async move {
        if let Err(e) = server.serve(session, cancel).await {
            warn!("Control server stopped: {}", e);
        }
    });
}

#[cfg(not(unix))]
fn spawn_control_server(path: &std::path::Path, _session: Arc<Session>, _cancel: CancellationToken) {
    warn!("Control socket {} not supported on this platform", path.display());
}

/// Runs the selected group and returns the process exit code.
async fn run(options: Options) -> Result<i32, Box<dyn std::error::Error>> {
    let mut config = RunnerConfig::resolve(options.config_path.as_deref())?;
    if let Some(path) = options.state_path {
        config.state_path = path;
    }
    if let Some(path) = options.control_socket {
        config.control_socket = path;
    }

    let Some(groups_path) = options.groups_path else {
        return Ok(CODE_INPUT_ERROR);
    };
    let groups = match load_groups(&groups_path) {
        Ok(groups) => groups,
        Err(e) => {
            error!("Could not load action groups: {}", e);
            return Ok(CODE_INPUT_ERROR);
        }
    };
    let Some(group) = groups.get(options.group) else {
        error!(
            "Group {} does not exist ({} groups in '{}')",
            options.group,
            groups.len(),
            groups_path.display()
        );
        return Ok(CODE_INPUT_ERROR);
    };
    info!(
        "Running group {} of '{}' ({} actions)",
        options.group,
        groups_path.display(),
        group.len()
    );

    let state = ExecutionState::load_or_new(&config.state_path)?;
    let output: Box<dyn Write + Send> = Box::new(io::stdout());
    let obfuscator = Obfuscator::new(output, &config.secrets).with_replacer(config.replacer());
    let supervisor =
        Supervisor::new(Arc::new(SysinfoProcessTable::new())).with_scope(config.pause_scope);
    let session = Arc::new(Session::new(state, supervisor, obfuscator));

    let cancel = CancellationToken::new();
    let control_cancel = CancellationToken::new();
    if !options.no_control {
        spawn_control_server(&config.control_socket, session.clone(), control_cancel.clone());
    }

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting running steps");
            interrupt.cancel();
        }
    });

    let mut engine = Engine::new(session.clone())
        .with_cancellation(cancel)
        .with_binary_dir(config.binary_dir.clone())
        .with_intervals(config.check_interval(), config.monitor_interval());
    let outcome = engine.run(group).await;
    control_cancel.cancel();

    match outcome {
        Ok(summary) => {
            print_summary(&summary, &session.snapshot());
            Ok(summary.exit_code())
        }
        Err(e) => {
            error!("{}", e);
            Ok(e.exit_code())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let options = match parse_arguments(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::from(CODE_INPUT_ERROR as u8);
        }
    };

    setup_logging(options.verbose);
    info!("{} v{}", APP_NAME, VERSION);

    match run(options).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::from(CODE_INTERNAL as u8)
        }
    }
}
