//! FabRunner CLI Entry Point
//!
//! Runs a process flow file against the simulated process engines.
//!
//! # Usage
//!
//! ```bash
//! # Run a flow
//! fabrunner flows/nmos_front_end.yaml
//!
//! # Override the mode and worker count
//! fabrunner flows/nmos_front_end.yaml --mode parallel --workers 8
//!
//! # Checkpoint every 10 seconds, then resume later
//! fabrunner flows/nmos_front_end.yaml --checkpoint run.ckpt --checkpoint-interval 10
//! fabrunner --resume run.ckpt
//!
//! # Pipeline the flow over five wafers
//! fabrunner flows/nmos_front_end.yaml --mode pipeline --units 5
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use colored::Colorize;
use log::{error, info};

use fabrunner::flow::{load_flow, Flow};
use fabrunner::sim::{self, Wafer, WaferRestore};
use fabrunner::{
    ExecutionMode, Orchestrator, OrchestratorConfig, RunOutcome, RunReport, StepStatus,
    WorkpieceHandle, APP_NAME, VERSION,
};

/// Checkpoint interval used when `--checkpoint` is given alone.
const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

/// How often progress is logged while a flow runs.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// How often the progress reporter checks for shutdown.
const REPORTER_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    flow_path: Option<String>,
    mode: Option<ExecutionMode>,
    workers: Option<usize>,
    timeout_secs: Option<u64>,
    retries: Option<u32>,
    continue_on_error: bool,
    checkpoint: Option<PathBuf>,
    checkpoint_interval: Option<Duration>,
    resume: Option<PathBuf>,
    units: Option<usize>,
    monitor: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Process Flow Orchestrator");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: fabrunner [OPTIONS] <FLOW_FILE>");
    println!("       fabrunner [OPTIONS] --resume <CHECKPOINT>");
    println!();
    println!("Arguments:");
    println!("  <FLOW_FILE>                  Path to flow YAML file");
    println!();
    println!("Options:");
    println!("  --mode MODE                  sequential, parallel, pipeline or batch");
    println!("  --workers N                  Maximum concurrent steps");
    println!("  --timeout SECS               Per-step timeout (0 disables)");
    println!("  --retries N                  Extra attempts after a failure");
    println!("  --continue-on-error          Skip only the failed subtree");
    println!("  --checkpoint PATH            Write checkpoints to PATH");
    println!(
        "  --checkpoint-interval SECS   Checkpoint interval (default: {})",
        DEFAULT_CHECKPOINT_INTERVAL.as_secs()
    );
    println!("  --resume PATH                Continue from a checkpoint");
    println!("  --units N                    Replicate the flow over N wafers");
    println!("  --monitor                    Sample CPU and memory usage");
    println!("  --verbose                    Enable debug logging");
    println!("  --help                       Show this help message");
    println!("  --version                    Show version information");
    println!();
    println!("Examples:");
    println!("  fabrunner flows/nmos_front_end.yaml");
    println!("  fabrunner flows/nmos_front_end.yaml --mode pipeline --units 4");
    println!("  fabrunner --resume run.ckpt --retries 2");
}

/// Returns the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", name))
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", name, value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = args[i].as_str();

        match arg {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => config.verbose = true,
            "--continue-on-error" => config.continue_on_error = true,
            "--monitor" => config.monitor = true,
            "--mode" => {
                let value = option_value(args, &mut i, arg)?;
                config.mode = Some(value.parse()?);
            }
            "--workers" => {
                config.workers = Some(parse_number(option_value(args, &mut i, arg)?, arg)?);
            }
            "--timeout" => {
                config.timeout_secs = Some(parse_number(option_value(args, &mut i, arg)?, arg)?);
            }
            "--retries" => {
                config.retries = Some(parse_number(option_value(args, &mut i, arg)?, arg)?);
            }
            "--checkpoint" => {
                config.checkpoint = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--checkpoint-interval" => {
                let secs: u64 = parse_number(option_value(args, &mut i, arg)?, arg)?;
                config.checkpoint_interval = Some(Duration::from_secs(secs.max(1)));
            }
            "--resume" => {
                config.resume = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--units" => {
                let units: usize = parse_number(option_value(args, &mut i, arg)?, arg)?;
                if units == 0 {
                    return Err("--units must be at least 1".to_string());
                }
                config.units = Some(units);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.flow_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.flow_path = Some(arg.to_string());
            }
        }
        i += 1;
    }

    if config.flow_path.is_none() && config.resume.is_none() {
        return Err("a flow file or --resume is required".to_string());
    }
    if config.resume.is_some() && config.units.is_some() {
        return Err("--units cannot be combined with --resume".to_string());
    }

    Ok(config)
}

/// Builds the orchestrator settings: defaults, then the flow file's
/// `settings:` block, then command-line overrides.
fn orchestrator_config(cli: &Config, file_settings: Option<&fabrunner::FlowSettings>) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    if let Some(settings) = file_settings {
        config.apply(settings);
    }
    if let Some(workers) = cli.workers {
        config.set_worker_limit(workers);
    }
    if let Some(secs) = cli.timeout_secs {
        config.set_step_timeout((secs > 0).then(|| Duration::from_secs(secs)));
    }
    if let Some(retries) = cli.retries {
        config.set_max_retries(retries);
    }
    if cli.continue_on_error {
        config.set_continue_on_error(true);
    }
    if let Some(path) = &cli.checkpoint {
        let interval = cli.checkpoint_interval.unwrap_or(DEFAULT_CHECKPOINT_INTERVAL);
        config.set_auto_checkpoint(interval, path.clone());
    }
    config.set_monitor_resources(cli.monitor);
    config
}

/// Logs aggregate progress while a run is active, until `done` is set.
fn spawn_progress_reporter(
    orchestrator: Arc<Orchestrator>,
    done: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last = Instant::now();
        while !done.load(Ordering::Relaxed) {
            thread::sleep(REPORTER_CHECK_INTERVAL);
            if last.elapsed() < PROGRESS_INTERVAL || !orchestrator.is_running() {
                continue;
            }
            last = Instant::now();

            let progress = orchestrator.get_status();
            let eta = progress
                .estimated_remaining_time
                .map(|d| format!(", ~{:.1?} remaining", d))
                .unwrap_or_default();
            info!(
                "Progress: {:.0}% ({} of {} steps finished, {} running){}",
                progress.percent_complete(),
                progress.terminal_steps(),
                progress.total_steps,
                progress.running_steps,
                eta
            );
        }
    })
}

fn colored_status(status: StepStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        StepStatus::Completed => text.green(),
        StepStatus::Failed => text.red(),
        StepStatus::Skipped | StepStatus::Cancelled => text.yellow(),
        _ => text.normal(),
    }
}

/// Prints per-step results, the timeline and resource usage.
fn print_report(report: &RunReport) {
    println!();
    let headline = format!("Flow {}", report.outcome);
    match report.outcome {
        RunOutcome::Completed => println!("{}", headline.green().bold()),
        RunOutcome::CompletedWithFailures => println!("{}", headline.yellow().bold()),
        RunOutcome::Halted | RunOutcome::Cancelled => println!("{}", headline.red().bold()),
    }
    println!("Total execution time: {:.2?}", report.progress.elapsed_time);
    println!();

    let mut steps: Vec<_> = report.statuses.iter().collect();
    steps.sort_by(|a, b| a.0.cmp(b.0));
    for (label, status) in steps {
        println!("  {:<30} {}", label, colored_status(*status));
    }

    let failures: Vec<_> = report.records.iter().filter(|r| !r.success).collect();
    if !failures.is_empty() {
        println!();
        println!("Failures:");
        for record in failures {
            println!(
                "  {} (attempt {}): {}",
                record.step_id.red(),
                record.attempt,
                record.error_detail.as_deref().unwrap_or_default()
            );
        }
    }

    let timeline = report.timeline();
    if !timeline.is_empty() {
        println!();
        println!("{}", timeline.gantt_chart());
    }
    if let Some(resources) = &report.resources {
        println!();
        println!("{}", resources.render());
    }
}

/// Loads the flow (or the checkpoint to resume) and runs it.
fn execute(cli: &Config) -> Result<RunReport, Box<dyn std::error::Error>> {
    let (mut flow, workpiece, config): (Flow, WorkpieceHandle, OrchestratorConfig) =
        match (&cli.resume, &cli.flow_path) {
            (Some(path), _) => {
                info!("Resuming from checkpoint: {}", path.display());
                let config = orchestrator_config(cli, None);
                let probe = Orchestrator::new(sim::registry(), config.clone());
                let checkpoint = probe.load_checkpoint(path)?;
                let (flow, wafer) = probe.resume_from(&checkpoint, &WaferRestore)?;
                (flow, wafer, config)
            }
            (None, Some(path)) => {
                info!("Loading flow: {}", path);
                let file = load_flow(path).map_err(|e| {
                    error!("Failed to load flow: {}", e);
                    format!("Could not load flow from '{}': {}", path, e)
                })?;
                let config = orchestrator_config(cli, Some(&file.settings));
                (file.flow, Wafer::handle("W01"), config)
            }
            (None, None) => return Err("nothing to run".into()),
        };

    if let Some(mode) = cli.mode {
        if mode != flow.execution_mode() {
            flow = Flow::build(flow.name().to_string(), mode, flow.steps().to_vec())?;
        }
    }

    info!(
        "Flow '{}' loaded: {} steps, {} mode, {} worker(s)",
        flow.name(),
        flow.len(),
        flow.execution_mode(),
        config.worker_limit
    );

    let orchestrator = Arc::new(Orchestrator::new(sim::registry(), config));
    let done = Arc::new(AtomicBool::new(false));
    let reporter = spawn_progress_reporter(Arc::clone(&orchestrator), Arc::clone(&done));

    let result = match cli.units {
        Some(units) => {
            let wafers = (1..=units)
                .map(|n| Wafer::handle(format!("W{:02}", n)))
                .collect();
            orchestrator.run_pipeline(&flow, wafers)
        }
        None => orchestrator.run(&mut flow, workpiece),
    };

    done.store(true, Ordering::Relaxed);
    let _ = reporter.join();
    Ok(result?)
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let report = execute(&config)?;
    print_report(&report);

    if let Some(path) = &config.checkpoint {
        println!();
        println!("Checkpoint: {}", path.display());
    }

    Ok(report.is_success())
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e.to_string().red());
            ExitCode::FAILURE
        }
    }
}
