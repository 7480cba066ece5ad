//! devguard - device-identity guardian
//!
//! The main entry point for the `devguard` binary, handling:
//! - Starting, stopping, and inspecting a standalone guardian
//! - Running an in-process guardian in the foreground
//! - The hidden `worker` entry point a standalone guardian runs as
//! - Stable identity generation

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use dg_common::{
    Error, FeatureFlags, GuardianConfig, GuardianMode, IdeVariant, OutputFormat, TargetIdentity,
    CONFIG_SCHEMA_VERSION,
};
use dg_core::enforce::LoopState;
use dg_core::exit_codes::ExitCode;
use dg_core::log_event;
use dg_core::logging::{event_names, init_logging, LogConfig, LogContext, LogFormat, LogLevel, Stage};
use dg_core::settings::{GuardianSettings, SettingsOverrides};
use dg_core::stable_id::{derive_target_identity, StableIdGenerator};
use dg_core::supervisor::StopOutcome;
use dg_core::worker::{install_stop_handlers, run_worker, stop_requested};
use dg_core::GuardianService;

/// devguard - keep an IDE's device identity pinned to a chosen target
#[derive(Parser)]
#[command(name = "devguard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (-q, -qq)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    quiet: u8,

    /// Log format on stderr
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    /// Channel directory shared with the standalone guardian [env: DG_CHANNEL_DIR]
    #[arg(long, global = true)]
    channel_dir: Option<PathBuf>,

    /// Activation cache consulted by the license gate [env: DG_ACTIVATION_FILE]
    #[arg(long, global = true)]
    activation_file: Option<PathBuf>,

    /// Home directory the IDE layout is resolved from [env: DG_IDE_HOME]
    #[arg(long, global = true)]
    ide_home: Option<PathBuf>,

    /// Enforcement poll interval in milliseconds [env: DG_POLL_INTERVAL_MS]
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    /// Attempts per store write before deferring [env: DG_RETRY_ATTEMPTS]
    #[arg(long, global = true)]
    retry_attempts: Option<u32>,

    /// How long `stop` waits for the guardian to exit [env: DG_STOP_TIMEOUT_MS]
    #[arg(long, global = true)]
    stop_timeout_ms: Option<u64>,

    /// Poll only; do not watch monitored directories for changes [env: DG_NO_WATCH]
    #[arg(long, global = true)]
    no_watch: bool,
}

impl GlobalOpts {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            poll_interval_ms: self.poll_interval_ms,
            retry_attempts: self.retry_attempts,
            stop_timeout_ms: self.stop_timeout_ms,
            channel_dir: self.channel_dir.clone(),
            activation_file: self.activation_file.clone(),
            ide_home: self.ide_home.clone(),
            no_watch: self.no_watch,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start a standalone guardian that outlives this command
    Start(StartArgs),

    /// Stop the running guardian and clean the channel
    Stop,

    /// Report whether a guardian is enforcing (exit 1 guarding, 2 not guarding)
    Status,

    /// Restart the running guardian with its current configuration
    Restart,

    /// Pin a new target identity on the running guardian
    Update(UpdateArgs),

    /// Run an in-process guardian in the foreground until SIGINT/SIGTERM
    Run(RunArgs),

    /// Standalone guardian entry point (spawned by `start`)
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Print or regenerate this host's stable identity
    Identity(IdentityArgs),

    /// Print the JSON Schema of the guardian config file
    Schema,

    /// Print version information
    Version,
}

/// How the target configuration is specified.
#[derive(Args, Debug)]
struct TargetArgs {
    /// Read a complete guardian config file instead of building one
    #[arg(long, conflicts_with_all = ["ide", "identity", "from_stable_id"])]
    config: Option<PathBuf>,

    /// IDE whose identity stores are guarded
    #[arg(long, value_enum, required_unless_present = "config")]
    ide: Option<IdeVariant>,

    /// Target identity field (repeatable), e.g. telemetry.devDeviceId=<uuid>
    #[arg(long = "identity", value_name = "FIELD=VALUE")]
    identity: Vec<String>,

    /// Derive the target identity from this host's stable identity
    #[arg(long)]
    from_stable_id: bool,

    /// Do not remove backup copies of the identity stores
    #[arg(long)]
    no_backup_monitoring: bool,

    /// Do not guard the embedded key/value database
    #[arg(long)]
    no_database_monitoring: bool,

    /// Do not mark corrected stores read-only
    #[arg(long)]
    no_enhanced_protection: bool,

    /// Temp-file suffix of the IDE's atomic replace (repeatable)
    #[arg(long = "in-flight-suffix", value_name = "SUFFIX")]
    in_flight_suffixes: Vec<String>,
}

#[derive(Args, Debug)]
struct StartArgs {
    #[command(flatten)]
    target: TargetArgs,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    target: TargetArgs,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    /// Target identity field (repeatable)
    #[arg(long = "identity", value_name = "FIELD=VALUE")]
    identity: Vec<String>,

    /// Derive the target identity from this host's stable identity
    #[arg(long)]
    from_stable_id: bool,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Channel config file to enforce
    #[arg(long)]
    config: PathBuf,
}

#[derive(Args, Debug)]
struct IdentityArgs {
    /// Discard the cached seed and mint a new one
    #[arg(long)]
    force_new: bool,

    /// Seed cache directory (default ~/.devguard)
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let log_level = LogLevel::from_verbosity(cli.global.verbose, cli.global.quiet);
    let log_config = LogConfig::from_env(log_level, cli.global.log_format);
    init_logging(&log_config);

    let exit_code = match cli.command {
        None | Some(Commands::Status) => run_status(&cli.global),
        Some(Commands::Start(args)) => run_start(&cli.global, &args),
        Some(Commands::Stop) => run_stop(&cli.global),
        Some(Commands::Restart) => run_restart(&cli.global),
        Some(Commands::Update(args)) => run_update(&cli.global, &args),
        Some(Commands::Run(args)) => run_foreground(&cli.global, &args),
        Some(Commands::Worker(args)) => run_worker_command(&cli.global, &args),
        Some(Commands::Identity(args)) => run_identity(&cli.global, &args),
        Some(Commands::Schema) => run_schema(),
        Some(Commands::Version) => {
            print_version(&cli.global);
            ExitCode::Clean
        }
    };

    std::process::exit(exit_code.as_i32());
}

// ============================================================================
// Command implementations
// ============================================================================

fn resolve_settings(global: &GlobalOpts) -> Result<GuardianSettings, Error> {
    GuardianSettings::resolve(&global.overrides())
}

fn open_service(global: &GlobalOpts) -> Result<GuardianService, Error> {
    let settings = resolve_settings(global)?;
    GuardianService::new(&settings)
}

fn run_start(global: &GlobalOpts, args: &StartArgs) -> ExitCode {
    let result = build_config(&args.target).and_then(|config| {
        let mut service = open_service(global)?;
        service.start(config, GuardianMode::Standalone)
    });
    match result {
        Ok(report) => {
            emit(global, &report, || {
                println!("# devguard start");
                println!();
                println!("Standalone guardian running (pid {})", report.pid);
                for (field, value) in &report.target_identity_summary {
                    println!("  {} = {}", field, value);
                }
            });
            ExitCode::Clean
        }
        Err(e) => output_error(global, "start", &e),
    }
}

fn run_stop(global: &GlobalOpts) -> ExitCode {
    let result = open_service(global).and_then(|mut service| service.stop());
    match result {
        Ok(report) => {
            emit(global, &report, || {
                println!("# devguard stop");
                println!();
                match report.standalone {
                    StopOutcome::NotRunning => println!("No standalone guardian was running"),
                    StopOutcome::Stopped { pid } => println!("Stopped guardian (pid {})", pid),
                    StopOutcome::StaleCleared { pid } => {
                        println!("Cleared stale PID file (pid {} was not a guardian)", pid)
                    }
                    StopOutcome::TimedOut { pid } => {
                        println!("Guardian (pid {}) did not exit in time", pid)
                    }
                }
            });
            if report.success {
                ExitCode::Clean
            } else {
                ExitCode::TimeoutError
            }
        }
        Err(e) => output_error(global, "stop", &e),
    }
}

fn run_status(global: &GlobalOpts) -> ExitCode {
    let mut service = match open_service(global) {
        Ok(service) => service,
        Err(e) => return output_error(global, "status", &e),
    };
    let status = service.status();
    emit(global, &status, || {
        println!("# devguard status");
        println!();
        match (status.mode, status.standalone.pid) {
            (Some(mode), Some(pid)) => println!("Guarding ({}, pid {})", mode, pid),
            (Some(mode), None) => println!("Guarding ({})", mode),
            _ => println!("Not guarding"),
        }
        if let Some(ide) = status.selected_ide {
            println!("IDE: {}", ide);
        }
        if let Some(identity) = &status.target_identity_summary {
            for (field, value) in identity {
                println!("  {} = {}", field, value);
            }
        }
        println!("Config: {}", status.paths.config_path.display());
        println!("Log:    {}", status.paths.log_path.display());
        if !status.recent_log.is_empty() {
            println!();
            for line in &status.recent_log {
                println!("{}", line);
            }
        }
    });
    if status.is_guarding {
        ExitCode::Guarding
    } else {
        ExitCode::NotGuarding
    }
}

fn run_restart(global: &GlobalOpts) -> ExitCode {
    let result = open_service(global).and_then(|mut service| service.restart());
    match result {
        Ok(report) => {
            emit(global, &report, || {
                println!("Guardian restarted (pid {})", report.pid);
            });
            ExitCode::Clean
        }
        Err(e) => output_error(global, "restart", &e),
    }
}

fn run_update(global: &GlobalOpts, args: &UpdateArgs) -> ExitCode {
    let result = target_identity(&args.identity, args.from_stable_id).and_then(|identity| {
        let mut service = open_service(global)?;
        service.update_target(identity)
    });
    match result {
        Ok(updated) => {
            let payload = serde_json::json!({ "success": true, "updated": updated });
            emit(global, &payload, || {
                if updated {
                    println!("Target identity updated; applied at the next tick");
                } else {
                    println!("No guardian is running; nothing updated");
                }
            });
            if updated {
                ExitCode::Clean
            } else {
                ExitCode::NotGuarding
            }
        }
        Err(e) => output_error(global, "update", &e),
    }
}

/// In-process guardian on a background thread, held until a stop signal
/// arrives or the guardian stops on its own.
fn run_foreground(global: &GlobalOpts, args: &RunArgs) -> ExitCode {
    if let Err(e) = install_stop_handlers() {
        return output_error(global, "run", &e);
    }
    let started = build_config(&args.target).and_then(|config| {
        let mut service = open_service(global)?;
        let report = service.start(config, GuardianMode::InProcess)?;
        Ok((service, report))
    });
    let (mut service, report) = match started {
        Ok(started) => started,
        Err(e) => return output_error(global, "run", &e),
    };

    let ctx = LogContext::for_new_run().with_mode(GuardianMode::InProcess);
    log_event!(
        ctx,
        INFO,
        event_names::GUARDIAN_STARTED,
        Stage::Init,
        "foreground guardian running; send SIGINT or SIGTERM to stop",
        pid = report.pid.0
    );

    while !stop_requested() {
        std::thread::sleep(Duration::from_millis(200));
        let state = service.status().in_process.loop_state;
        if matches!(state, None | Some(LoopState::Stopped | LoopState::LicenseInvalid)) {
            break;
        }
    }

    let stats = service.status().stats;
    let license_stop = !stop_requested();
    let stopped = service.stop();
    let payload = serde_json::json!({
        "success": stopped.is_ok(),
        "reason": if license_stop { "license_invalid" } else { "signal" },
        "stats": stats,
    });
    emit(global, &payload, || {
        println!("Guardian stopped ({})", if license_stop { "license invalid" } else { "signal" });
        if let Some(stats) = &stats {
            println!(
                "ticks={} corrections={} deferrals={} failures={} backups_removed={}",
                stats.ticks, stats.corrections, stats.deferrals, stats.failures, stats.backups_removed
            );
        }
    });
    match stopped {
        Ok(_) => ExitCode::Clean,
        Err(e) => output_error(global, "run", &e),
    }
}

fn run_worker_command(global: &GlobalOpts, args: &WorkerArgs) -> ExitCode {
    let result = resolve_settings(global).and_then(|settings| {
        install_stop_handlers()?;
        let loop_settings = settings.loop_settings()?;
        let gate = Arc::new(settings.activation_gate()?);
        run_worker(&args.config, loop_settings, gate, stop_requested)
    });
    match result {
        Ok(_) => ExitCode::Clean,
        Err(e) => {
            let ctx = LogContext::for_new_run().with_mode(GuardianMode::Standalone);
            log_event!(
                ctx,
                ERROR,
                event_names::INTERNAL_ERROR,
                Stage::Init,
                "standalone guardian failed",
                error = e.to_string().as_str()
            );
            ExitCode::from(&e)
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityReport {
    seed: String,
    source: dg_core::stable_id::SeedSource,
    target_identity: TargetIdentity,
}

fn run_identity(global: &GlobalOpts, args: &IdentityArgs) -> ExitCode {
    let generator = match stable_id_generator(args.cache_dir.clone()) {
        Ok(generator) => generator,
        Err(e) => return output_error(global, "identity", &e),
    };
    let stable = if args.force_new {
        generator.force_new()
    } else {
        generator.get_or_create()
    };
    let report = IdentityReport {
        target_identity: derive_target_identity(&stable.seed),
        seed: stable.seed,
        source: stable.source,
    };
    emit(global, &report, || {
        println!("# devguard identity");
        println!();
        println!("Seed: {}", report.seed);
        for (field, value) in report.target_identity.iter() {
            println!("  {} = {}", field, value);
        }
    });
    ExitCode::Clean
}

fn run_schema() -> ExitCode {
    let schema = schemars::schema_for!(GuardianConfig);
    print_json(&schema);
    ExitCode::Clean
}

fn print_version(global: &GlobalOpts) {
    let version_info = serde_json::json!({
        "config_schema_version": CONFIG_SCHEMA_VERSION,
        "devguard_version": env!("CARGO_PKG_VERSION"),
        "rust_version": env!("CARGO_PKG_RUST_VERSION"),
    });

    match global.format {
        OutputFormat::Json => print_json(&version_info),
        OutputFormat::Exitcode => {}
        _ => {
            println!("devguard {}", env!("CARGO_PKG_VERSION"));
            println!("config schema version: {}", CONFIG_SCHEMA_VERSION);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn stable_id_generator(cache_dir: Option<PathBuf>) -> Result<StableIdGenerator, Error> {
    cache_dir
        .or_else(StableIdGenerator::default_cache_dir)
        .map(StableIdGenerator::new)
        .ok_or_else(|| Error::Config("cannot locate home directory; pass --cache-dir".to_string()))
}

/// Parse `FIELD=VALUE` pairs, optionally over a stable-id derived identity.
fn target_identity(pairs: &[String], from_stable_id: bool) -> Result<TargetIdentity, Error> {
    let mut identity = if from_stable_id {
        derive_target_identity(&stable_id_generator(None)?.get_or_create().seed)
    } else {
        TargetIdentity::new()
    };
    for pair in pairs {
        let (field, value) = pair.split_once('=').ok_or_else(|| {
            Error::InvalidIdentity(format!("expected FIELD=VALUE, got '{}'", pair))
        })?;
        identity = identity.with_field(field.trim(), value.trim());
    }
    identity.validate()?;
    Ok(identity)
}

fn build_config(args: &TargetArgs) -> Result<GuardianConfig, Error> {
    if let Some(path) = &args.config {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ConfigMissing { path: path.clone() },
            _ => Error::Io(e),
        })?;
        return GuardianConfig::from_json_str(&content);
    }
    let ide = args
        .ide
        .ok_or_else(|| Error::Config("--ide is required without --config".to_string()))?;
    let identity = target_identity(&args.identity, args.from_stable_id)?;
    let mut config = GuardianConfig::new(identity, ide).with_feature_flags(FeatureFlags {
        enable_backup_monitoring: !args.no_backup_monitoring,
        enable_database_monitoring: !args.no_database_monitoring,
        enable_enhanced_protection: !args.no_enhanced_protection,
    });
    if !args.in_flight_suffixes.is_empty() {
        config = config.with_in_flight_suffixes(args.in_flight_suffixes.clone());
    }
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("failed to serialize output: {}", e),
    }
}

/// Print a command payload in the selected format.
fn emit<T: Serialize>(global: &GlobalOpts, payload: &T, human: impl FnOnce()) {
    match global.format {
        OutputFormat::Json => print_json(payload),
        OutputFormat::Summary => match serde_json::to_string(payload) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("failed to serialize output: {}", e),
        },
        OutputFormat::Exitcode => {}
        OutputFormat::Human => human(),
    }
}

/// Output an error in the appropriate format.
fn output_error(global: &GlobalOpts, command: &str, error: &Error) -> ExitCode {
    let exit_code = ExitCode::from(error);
    let response = serde_json::json!({
        "command": command,
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "status": "error",
        "exit_code": exit_code.code_name(),
        "error": error.to_json(),
    });

    match global.format {
        OutputFormat::Json => match serde_json::to_string_pretty(&response) {
            Ok(text) => eprintln!("{}", text),
            Err(_) => eprintln!("{} error: {}", command, error),
        },
        OutputFormat::Summary => {
            eprintln!("[{}] {} error: {}", exit_code.code_name(), command, error);
        }
        OutputFormat::Exitcode => {}
        OutputFormat::Human => {
            eprintln!("# devguard {} failed", command);
            eprintln!();
            eprintln!("Error: {}", error);
            eprintln!("Hint:  {}", error.remediation());
        }
    }

    exit_code
}
