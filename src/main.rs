use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nandfix::calibration::CalibrationReader;
use nandfix::config::RecoveryConfig;
use nandfix::device::{DeviceCatalog, SysfsEnumerator};
use nandfix::ui::{format_duration, human_bytes, ConsoleSink, TerminalConfirmer};
use nandfix::workflow::{run_on_worker, Collaborators, RecoveryWorkflow, RunOutcome, RunReport};
use nandfix::{CalibrationOrigin, Procedure, ProgressSink};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const LOG_FILE_NAME: &str = "nandfix.log";

#[derive(Parser)]
#[command(name = "nandfix")]
#[command(about = "Nintendo Switch eMMC recovery: rebuilds SYSTEM, boot packages and data partitions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to nandfix.toml in the user config directory)
    #[arg(long, global = true, env = "NANDFIX_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

/// Command-line overrides for the `[paths]` configuration section
#[derive(Args, Clone, Debug, Default)]
struct PathOverrides {
    /// prod.keys file
    #[arg(long)]
    keyset: Option<PathBuf>,

    /// Firmware folder for the boot file generator
    #[arg(long)]
    firmware: Option<PathBuf>,

    /// Folder holding the donor partition archives
    #[arg(long)]
    partitions: Option<PathBuf>,

    /// Folder holding donor32.7z / donor64.7z
    #[arg(long)]
    skeletons: Option<PathBuf>,

    /// Decrypted donor PRODINFO
    #[arg(long)]
    prodinfo: Option<PathBuf>,

    /// Where BOOT0 and BOOT1 are saved
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Scratch directory for the per-run work directory
    #[arg(long)]
    scratch: Option<PathBuf>,
}

impl PathOverrides {
    fn apply(&self, config: &mut RecoveryConfig) {
        let paths = &mut config.paths;
        let pairs = [
            (&self.keyset, &mut paths.keyset),
            (&self.firmware, &mut paths.firmware),
            (&self.partitions, &mut paths.partitions_dir),
            (&self.skeletons, &mut paths.skeleton_dir),
            (&self.prodinfo, &mut paths.donor_calibration),
            (&self.output, &mut paths.output_dir),
            (&self.scratch, &mut paths.scratch_dir),
        ];
        for (cli, slot) in pairs {
            if let Some(value) = cli {
                *slot = Some(value.clone());
            }
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    paths: PathOverrides,

    /// Answer the confirmation prompt with yes
    #[arg(short, long)]
    yes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List drives matching the Switch eMMC size signature
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the hardware revision recorded in a decrypted PRODINFO
    Inspect {
        /// PRODINFO file
        file: PathBuf,
    },

    /// Check inputs and external tools for a procedure
    Check {
        /// 1, 2, 3 or user
        #[arg(short, long, default_value = "1", value_parser = parse_procedure)]
        level: Procedure,

        #[command(flatten)]
        paths: PathOverrides,
    },

    /// Level 1 System Restore (keeps user data)
    Level1(RunArgs),

    /// Level 2 Full Rebuild (erases user data)
    Level2(RunArgs),

    /// Level 3 Complete Recovery from a donor NAND skeleton
    Level3(RunArgs),

    /// Replace only the USER partition
    FixUser(RunArgs),
}

impl Commands {
    fn path_overrides(&self) -> Option<&PathOverrides> {
        match self {
            Commands::Check { paths, .. } => Some(paths),
            Commands::Level1(args)
            | Commands::Level2(args)
            | Commands::Level3(args)
            | Commands::FixUser(args) => Some(&args.paths),
            Commands::List { .. } | Commands::Inspect { .. } => None,
        }
    }
}

fn parse_procedure(value: &str) -> std::result::Result<Procedure, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "level1" => Ok(Procedure::Level1),
        "2" | "level2" => Ok(Procedure::Level2),
        "3" | "level3" => Ok(Procedure::Level3),
        "user" | "fix-user" => Ok(Procedure::UserPartitionFix),
        other => Err(format!("unknown level '{}' (expected 1, 2, 3 or user)", other)),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config =
        RecoveryConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(overrides) = cli.command.path_overrides() {
        overrides.apply(&mut config);
    }

    let log_dir = config.log_dir();
    let _log_guard = init_logging(&log_dir, cli.debug);
    nandfix::crash::install_panic_hook(log_dir);
    setup_signal_handlers()?;

    match cli.command {
        Commands::List { json } => list_devices(json),
        Commands::Inspect { file } => inspect_calibration(&file),
        Commands::Check { level, .. } => check_inputs(&config, level),
        Commands::Level1(args) => run_procedure(config, Procedure::Level1, args.yes).await,
        Commands::Level2(args) => run_procedure(config, Procedure::Level2, args.yes).await,
        Commands::Level3(args) => run_procedure(config, Procedure::Level3, args.yes).await,
        Commands::FixUser(args) => {
            run_procedure(config, Procedure::UserPartitionFix, args.yes).await
        }
    }
}

/// Console logging to stderr plus a transcript in `log_dir`. Tool output
/// reaches the console through the progress sink, so the console layer skips it.
fn init_logging(log_dir: &Path, debug: bool) -> Option<WorkerGuard> {
    let level = if debug { "debug" } else { "warn" };
    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() != "nandfix::tool"
        }));

    let file_setup = std::fs::create_dir_all(log_dir)
        .map(|_| tracing_appender::rolling::never(log_dir, LOG_FILE_NAME));

    match file_setup {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_level = if debug { "debug" } else { "info" };
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(EnvFilter::new(file_level));

            tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(e) => {
            eprintln!("nandfix: failed to initialize file logging: {e:#}");
            tracing_subscriber::registry().with(console_layer).init();
            None
        }
    }
}

fn list_devices(json: bool) -> Result<ExitCode> {
    let catalog = DeviceCatalog::new(Box::new(SysfsEnumerator::new()));
    let devices = catalog
        .list_candidate_devices()
        .context("Failed to enumerate drives")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(ExitCode::SUCCESS);
    }

    if devices.is_empty() {
        println!("No drives matching the Switch eMMC size signature were found.");
        println!("Connect the Switch in Hekate's eMMC RAW GPP mode (Read-Only OFF).");
        return Ok(ExitCode::SUCCESS);
    }

    println!("\n{:<16} {:>10} {:>8}  MODEL", "DEVICE", "SIZE", "CLASS");
    println!("{}", "-".repeat(60));
    for device in &devices {
        println!(
            "{:<16} {:>10} {:>8}  {}",
            device.path,
            human_bytes(device.size_bytes as f64),
            device.band.label(),
            device.model
        );
    }
    if devices.len() > 1 {
        println!("\nMore than one candidate: disconnect other 32GB or 64GB USB drives before a recovery run.");
    }
    Ok(ExitCode::SUCCESS)
}

fn inspect_calibration(file: &Path) -> Result<ExitCode> {
    let header = CalibrationReader::read_header(file, CalibrationOrigin::DonorFile)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    println!("File:           {}", file.display());
    println!("Model code:     {}", header.revision_code);
    println!("Model:          {}", header.revision);
    println!(
        "Generator flag: {}",
        header.revision.family().generator_flag()
    );
    Ok(ExitCode::SUCCESS)
}

fn check_inputs(config: &RecoveryConfig, procedure: Procedure) -> Result<ExitCode> {
    println!("Checking inputs for {}...", procedure);
    match config.validate_for(procedure) {
        Ok(()) => {
            for (name, program) in config.required_tools(procedure) {
                let resolved = RecoveryConfig::resolve_tool(name, program)?;
                println!("  {:<20} {}", name, resolved.display());
            }
            println!("All inputs and tools for {} are available.", procedure);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            eprintln!("{}", e.remediation(procedure));
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_procedure(config: RecoveryConfig, procedure: Procedure, yes: bool) -> Result<ExitCode> {
    if !is_root() {
        tracing::warn!("Not running as root; writing to the eMMC will likely be denied");
    }

    println!("\n=== {} ===", procedure.title());
    let sink: Arc<dyn ProgressSink> = Arc::new(ConsoleSink::for_stdout());
    let collaborators = Collaborators::system(&config, Box::new(TerminalConfirmer::new(yes)));
    let workflow = Arc::new(RecoveryWorkflow::new(config, collaborators, sink));

    match run_on_worker(workflow, procedure).await {
        Ok(report) => {
            print_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            eprintln!("\nERROR: {}", failure);
            eprintln!("{}", failure.remediation());
            if failure.destructive_started {
                eprintln!("The eMMC was already being written when the failure happened.");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn print_report(report: &RunReport) {
    match report.outcome {
        RunOutcome::Cancelled => {
            println!("\n{} cancelled. Nothing was written to the eMMC.", report.procedure);
        }
        RunOutcome::Completed => {
            println!(
                "\n--- {} FINISHED in {} ---",
                report.procedure.title().to_uppercase(),
                format_duration(report.elapsed.as_secs())
            );
            if let Some(revision) = report.revision {
                println!("Model: {}", revision);
            }
            if report.donor_calibration_used {
                println!("PRODINFO: donor file");
            }
            if report.procedure == Procedure::UserPartitionFix {
                println!("The USER partition was replaced. All previous user data has been erased.");
            } else {
                println!("IMPORTANT: Flash BOOT0 and BOOT1 manually using Hekate.");
            }
        }
    }
    tracing::info!(run_id = %report.run_id, steps = report.steps_completed, "Run report");
}

// Signal handler: stop between steps until the eMMC is being written
fn setup_signal_handlers() -> Result<()> {
    use signal_hook::{consts::SIGINT, iterator::Signals};

    let mut signals = Signals::new([SIGINT])?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            if sig == SIGINT {
                eprintln!("\nInterrupt received. The run stops before its next step unless the eMMC is already being written.");
                nandfix::set_interrupted();
            }
        }
    });

    Ok(())
}
