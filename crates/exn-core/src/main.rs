//! exynex - Android dynamic traffic analysis
//!
//! The main entry point, handling:
//! - `analyze`: install an APK, isolate and capture its traffic, tear down
//! - `check`: validate configuration and the external toolchain

use clap::{Args, Parser, Subcommand};
use exn_common::error::format_error_human;
use exn_common::{Error, OutputFormat, RunId};
use exn_core::cancel::{install_signal_handler, CancelToken};
use exn_core::config::{load_config, ConfigOptions, ResolvedConfig, RunConfig};
use exn_core::exec::ToolRunnerBuilder;
use exn_core::exit_codes::ExitCode;
use exn_core::logging::{get_host_id, init_logging, LogConfig, LogFormat};
use exn_core::network::{HostPlatform, HostPrivilege};
use exn_core::observe::SystemClock;
use exn_core::pipeline::{analyze, AnalysisRequest, Collaborators, RunContext, RunOutcome};
use exn_core::proxy::MitmdumpLauncher;
use std::io::IsTerminal;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// exynex - capture what an Android app talks to
#[derive(Parser)]
#[command(name = "exynex")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file (overrides EXYNEX_CONFIG and the XDG location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format for the run outcome on stdout
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log line format on stderr
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    /// Disable colored error output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install an APK, capture its traffic for a while, and clean up
    Analyze(AnalyzeArgs),

    /// Validate configuration and the external toolchain
    Check,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// APK to analyze
    apk: PathBuf,

    /// Address of the device on the host network
    device_ip: String,

    /// Host sudo password (read from stdin by sudo, never logged)
    #[arg(env = "EXYNEX_SU_PASS", hide_env_values = true)]
    su_pass: Option<String>,

    /// Write the run outcome document to this file
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Seconds to observe the app after launch
    #[arg(long)]
    activity_time: Option<u64>,

    /// Keep capture, proxy log and decompiled sources here instead of a temp dir
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Grant all runtime permissions at install time
    #[arg(long)]
    allow_permissions: bool,

    /// Skip jadx decompilation
    #[arg(long)]
    no_decompile: bool,

    /// Proxy listen port (overrides config)
    #[arg(long)]
    proxy_port: Option<u16>,
}

fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env(
        LogConfig::level_from_verbosity(cli.global.verbose, cli.global.quiet),
        cli.global.log_format,
    );
    init_logging(&log_config);

    let exit_code = match &cli.command {
        Commands::Analyze(args) => run_analyze(&cli.global, args),
        Commands::Check => run_check(&cli.global),
    };

    std::process::exit(exit_code.as_i32());
}

// ============================================================================
// analyze
// ============================================================================

fn run_analyze(global: &GlobalOpts, args: &AnalyzeArgs) -> ExitCode {
    let resolved = match load_resolved(global) {
        Ok(resolved) => resolved,
        Err(e) => return report_error(global, &e),
    };
    let config = match apply_overrides(resolved.config, args) {
        Ok(config) => config,
        Err(e) => return report_error(global, &e),
    };

    if let Err(e) = preflight(args) {
        eprintln!("exynex analyze: {}", e);
        return ExitCode::ArgsError;
    }

    let workdir = match prepare_workdir(args.workdir.as_deref()) {
        Ok(workdir) => workdir,
        Err(e) => return report_error(global, &Error::Io(e)),
    };

    let cancel = CancelToken::new();
    if let Err(e) = install_signal_handler(&cancel) {
        warn!(error = %e, "signal handler not installed; interrupts will not tear down");
    }

    let activity_time = args
        .activity_time
        .map(Duration::from_secs)
        .unwrap_or(config.activity_time);
    let request = AnalysisRequest {
        apk: args.apk.clone(),
        device_ip: args.device_ip.clone(),
        activity_time,
    };

    let runner = ToolRunnerBuilder::new()
        .timeout(config.command_timeout)
        .build();
    let launcher = MitmdumpLauncher;
    let clock = SystemClock;
    let deps = Collaborators {
        runner: &runner,
        launcher: &launcher,
        clock: &clock,
        platform: HostPlatform::current(),
    };

    let ctx = RunContext::new(
        RunId::new(),
        config,
        get_host_id(),
        cancel,
        HostPrivilege::detect(args.su_pass.clone()),
        workdir.path().to_path_buf(),
    );
    info!(
        run_id = %ctx.run_id,
        apk = %args.apk.display(),
        device_ip = %args.device_ip,
        workdir = %workdir.path().display(),
        config = ?resolved.source,
        "starting analysis"
    );

    let outcome = analyze(ctx, &request, deps);

    if let Some(path) = &args.output {
        if let Err(e) = write_outcome(&outcome, path) {
            eprintln!("exynex analyze: cannot write {}: {}", path.display(), e);
        }
    }
    print_outcome(global, &outcome);
    if let Some(err) = &outcome.failure {
        eprintln!("{}", format_error_human(err, use_color(global)));
    }

    outcome.exit_code()
}

fn load_resolved(global: &GlobalOpts) -> Result<ResolvedConfig, Error> {
    let options = ConfigOptions {
        config_path: global.config.clone(),
    };
    Ok(load_config(&options)?)
}

fn apply_overrides(mut config: RunConfig, args: &AnalyzeArgs) -> Result<RunConfig, Error> {
    if args.allow_permissions {
        config.grant_permissions = true;
    }
    if args.no_decompile {
        config.decompile = false;
    }
    if let Some(port) = args.proxy_port {
        config.proxy_port = port;
    }
    config.validate()?;
    Ok(config)
}

/// Reject arguments that would only fail after the device was touched.
fn preflight(args: &AnalyzeArgs) -> Result<(), String> {
    if !args.apk.is_file() {
        return Err(format!("{} is not a file", args.apk.display()));
    }
    if args.device_ip.parse::<IpAddr>().is_err() {
        return Err(format!("{} is not an IP address", args.device_ip));
    }
    if let Some(output) = &args.output {
        let parent = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if !parent.is_dir() {
            return Err(format!("output directory {} does not exist", parent.display()));
        }
    }
    Ok(())
}

/// A named directory is kept after the run; otherwise a temp dir is used.
enum Workdir {
    Kept(PathBuf),
    Temp(tempfile::TempDir),
}

impl Workdir {
    fn path(&self) -> &Path {
        match self {
            Workdir::Kept(path) => path,
            Workdir::Temp(dir) => dir.path(),
        }
    }
}

fn prepare_workdir(requested: Option<&Path>) -> std::io::Result<Workdir> {
    match requested {
        Some(path) => {
            std::fs::create_dir_all(path)?;
            Ok(Workdir::Kept(path.to_path_buf()))
        }
        None => Ok(Workdir::Temp(
            tempfile::Builder::new().prefix("exynex-").tempdir()?,
        )),
    }
}

fn write_outcome(outcome: &RunOutcome, path: &Path) -> Result<(), Error> {
    let json = outcome.to_json_pretty()?;
    std::fs::write(path, json)?;
    Ok(())
}

fn print_outcome(global: &GlobalOpts, outcome: &RunOutcome) {
    match global.format {
        OutputFormat::Json => match outcome.to_json_pretty() {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("exynex: cannot serialize outcome: {}", e),
        },
        OutputFormat::Summary => println!("{}", outcome.summary_line()),
        OutputFormat::Exitcode => {}
    }
}

fn use_color(global: &GlobalOpts) -> bool {
    !global.no_color && std::io::stderr().is_terminal()
}

fn report_error(global: &GlobalOpts, err: &Error) -> ExitCode {
    eprintln!("{}", format_error_human(err, use_color(global)));
    ExitCode::for_error(err)
}

// ============================================================================
// check
// ============================================================================

fn run_check(global: &GlobalOpts) -> ExitCode {
    let resolved = match load_resolved(global) {
        Ok(resolved) => resolved,
        Err(e) => {
            if global.format == OutputFormat::Json {
                let output = serde_json::json!({
                    "status": "error",
                    "checks": [{
                        "check": "config",
                        "status": "error",
                        "error": e.to_string(),
                    }],
                });
                println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
            }
            return report_error(global, &e);
        }
    };
    let config = &resolved.config;

    let mut results: Vec<serde_json::Value> = vec![serde_json::json!({
        "check": "config",
        "status": "ok",
        "source": resolved.source.as_ref().map(|p| p.display().to_string()),
        "using_defaults": resolved.source.is_none(),
    })];
    let mut all_ok = true;

    let tools = &config.tools;
    let required = [
        ("adb", tools.adb.as_str()),
        ("aapt", tools.aapt.as_str()),
        ("mitmdump", tools.mitmdump.as_str()),
        ("iptables", tools.iptables.as_str()),
        ("sysctl", tools.sysctl.as_str()),
    ];
    let optional = [("jadx", tools.jadx.as_str()), ("sudo", tools.sudo.as_str())];
    for (name, program, needed) in required
        .iter()
        .map(|(n, p)| (*n, *p, true))
        .chain(optional.iter().map(|(n, p)| (*n, *p, false)))
    {
        let needed = needed || (name == "jadx" && config.decompile);
        let found = resolve_program(program);
        if found.is_none() && needed {
            all_ok = false;
        }
        results.push(serde_json::json!({
            "check": name,
            "status": match (&found, needed) {
                (Some(_), _) => "ok",
                (None, true) => "error",
                (None, false) => "warn",
            },
            "path": found.map(|p| p.display().to_string()),
        }));
    }

    let script_ok = config.tools.proxy_script.is_file();
    all_ok &= script_ok;
    results.push(serde_json::json!({
        "check": "proxy_script",
        "status": if script_ok { "ok" } else { "error" },
        "path": config.tools.proxy_script.display().to_string(),
    }));

    let state_dir = config.resolved_state_dir();
    let state_ok = std::fs::create_dir_all(&state_dir).is_ok();
    all_ok &= state_ok;
    results.push(serde_json::json!({
        "check": "state_dir",
        "status": if state_ok { "ok" } else { "error" },
        "path": state_dir.display().to_string(),
    }));

    match global.format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "generated_at": chrono::Utc::now().to_rfc3339(),
                "status": if all_ok { "ok" } else { "error" },
                "checks": results,
            });
            println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
        }
        OutputFormat::Summary => {
            for r in &results {
                println!(
                    "{:<14} {}",
                    r["check"].as_str().unwrap_or("?"),
                    r["status"].as_str().unwrap_or("?")
                );
            }
        }
        OutputFormat::Exitcode => {}
    }

    if all_ok {
        ExitCode::Clean
    } else {
        ExitCode::CapabilityError
    }
}

/// Locate `program` the way the shell would.
fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
