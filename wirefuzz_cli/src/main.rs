use wirefuzz_core::config::{FuzzerConfig, GeneratorEngine, Protocol};
use wirefuzz_core::corpus::TestcaseStore;
use wirefuzz_core::executor::{Delivery, SocketTransport, Transport};
use wirefuzz_core::input::Input;
use wirefuzz_core::orchestrator::Orchestrator;
use wirefuzz_core::state::{RunState, RunStats, StopReason};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "wirefuzz.toml";
const STATS_FILE: &str = "wirefuzz_stats.json";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Coverage-guided network protocol fuzzer", long_about = None)]
struct Cli {
    /// Configuration file. Defaults to ./wirefuzz.toml when present.
    #[clap(short, long, value_parser, global = true)]
    config: Option<PathBuf>,
    /// Log filter used when RUST_LOG is unset.
    #[clap(long, default_value = "info", global = true)]
    log_level: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fuzz the configured target until a crash, timeout or interrupt.
    Fuzz(FuzzArgs),
    /// Send a single testcase file to the target.
    Replay {
        file: PathBuf,
        #[clap(flatten)]
        target: TargetArgs,
    },
    /// Print the effective configuration as TOML.
    Config(FuzzArgs),
}

#[derive(Args, Debug, Default)]
struct TargetArgs {
    #[clap(long)]
    host: Option<String>,
    #[clap(short, long)]
    port: Option<u16>,
    /// tcp, udp or unix.
    #[clap(long, value_parser = ["tcp", "udp", "unix"])]
    protocol: Option<String>,
    #[clap(long)]
    tls: bool,
    /// Comma-separated ALPN protocols offered during the TLS handshake.
    #[clap(long)]
    alpn: Option<String>,
    /// Reset TCP connections instead of closing them gracefully.
    #[clap(long)]
    destroy: bool,
}

#[derive(Args, Debug, Default)]
struct FuzzArgs {
    #[clap(flatten)]
    target: TargetArgs,
    /// radamsa or blab.
    #[clap(long, value_parser = ["radamsa", "blab"])]
    engine: Option<String>,
    #[clap(long)]
    grammar: Option<String>,
    #[clap(long)]
    seeds: Option<PathBuf>,
    #[clap(long)]
    no_deterministic: bool,
    #[clap(short, long)]
    threads: Option<usize>,
    /// Stop after this many seconds.
    #[clap(long)]
    timeout: Option<u64>,
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// Shared memory id of the target's coverage bitmap.
    #[clap(long)]
    trace_shm_id: Option<i32>,
    #[clap(long)]
    pid: Option<u32>,
    #[clap(long)]
    check_script: Option<PathBuf>,
    #[clap(long)]
    log_file: Option<PathBuf>,
    #[clap(long)]
    log_regex: Option<String>,
}

impl TargetArgs {
    fn apply(&self, config: &mut FuzzerConfig) {
        let target = &mut config.target;
        if let Some(host) = &self.host {
            target.host = host.clone();
        }
        if self.port.is_some() {
            target.port = self.port;
        }
        match self.protocol.as_deref() {
            Some("tcp") => target.protocol = Protocol::Tcp,
            Some("udp") => target.protocol = Protocol::Udp,
            Some("unix") => target.protocol = Protocol::Unix,
            _ => {}
        }
        target.tls |= self.tls;
        target.destroy |= self.destroy;
        if self.alpn.is_some() {
            target.alpn = self.alpn.clone();
        }
    }
}

impl FuzzArgs {
    fn apply(&self, config: &mut FuzzerConfig) {
        self.target.apply(config);

        let generator = &mut config.generator;
        match self.engine.as_deref() {
            Some("radamsa") => generator.engine = Some(GeneratorEngine::Radamsa),
            Some("blab") => generator.engine = Some(GeneratorEngine::Blab),
            _ => {}
        }
        if self.grammar.is_some() {
            generator.grammar = self.grammar.clone();
        }
        if self.seeds.is_some() {
            generator.seed_dir = self.seeds.clone();
        }
        if self.no_deterministic {
            generator.deterministic = false;
        }

        let fuzzer = &mut config.fuzzer;
        if let Some(threads) = self.threads {
            fuzzer.threads = threads;
        }
        if self.timeout.is_some() {
            fuzzer.timeout_secs = self.timeout;
        }
        if self.output.is_some() {
            fuzzer.output_dir = self.output.clone();
        }
        if self.trace_shm_id.is_some() {
            fuzzer.trace_shm_id = self.trace_shm_id;
        }

        let monitor = &mut config.monitor;
        if self.pid.is_some() {
            monitor.pid = self.pid;
        }
        if self.check_script.is_some() {
            monitor.check_script = self.check_script.clone();
        }
        if self.log_file.is_some() {
            monitor.log_file = self.log_file.clone();
        }
        if self.log_regex.is_some() {
            monitor.log_regex = self.log_regex.clone();
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<FuzzerConfig, anyhow::Error> {
    match path {
        Some(path) => {
            info!(?path, "loading configuration");
            FuzzerConfig::load_from_file(path)
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG);
            if default_path.exists() {
                info!(path = ?default_path, "loading default configuration");
                FuzzerConfig::load_from_file(&default_path)
            } else {
                info!("no configuration file found, using built-in defaults");
                Ok(FuzzerConfig::default())
            }
        }
    }
}

fn init_logging(level: &str) -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level {level:?}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

fn print_progress(stats: RunStats, state: &RunState) {
    let elapsed = state.elapsed();
    let frame = SPINNER[(elapsed.as_millis() / 250) as usize % SPINNER.len()];
    print!(
        "\r{} [{:>6}s] sent: {}  paths: {}  jettisoned: {}   ",
        frame,
        elapsed.as_secs(),
        stats.sent,
        stats.paths,
        stats.jettisoned
    );
    // Progress output is best effort.
    let _ = std::io::stdout().flush();
}

fn fuzz(config: FuzzerConfig) -> Result<(), anyhow::Error> {
    let state = Arc::new(RunState::new());
    {
        let state = Arc::clone(&state);
        ctrlc::set_handler(move || {
            state.request_stop(StopReason::Interrupted);
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    let orchestrator =
        Orchestrator::from_config(&config, Arc::clone(&state)).context("Failed to set up fuzzing run")?;
    let output_dir = config
        .fuzzer
        .output_dir
        .clone()
        .context("An output directory is required")?;

    info!(
        host = %config.target.host,
        port = ?config.target.port,
        protocol = ?config.target.protocol,
        threads = config.fuzzer.threads,
        "starting fuzzer"
    );
    let summary = orchestrator
        .run(|stats| print_progress(stats, &state))
        .context("Fuzzing run failed")?;
    println!();

    match &summary.stop_reason {
        Some(StopReason::TargetCrashed(detail)) => {
            warn!(%detail, output = ?output_dir, "target crashed, evidence saved")
        }
        Some(StopReason::LogMatch(line)) => {
            warn!(%line, output = ?output_dir, "log monitor matched, evidence saved")
        }
        reason => info!(?reason, "run stopped"),
    }

    let stats_path = output_dir.join(STATS_FILE);
    summary.write_json(&stats_path)?;
    info!(path = ?stats_path, "wrote run statistics");
    Ok(())
}

fn replay(config: &FuzzerConfig, file: &Path) -> Result<(), anyhow::Error> {
    config.validate_target().context("Invalid target configuration")?;
    let testcase = TestcaseStore::load_file(file)?;
    let transport = SocketTransport::from_config(&config.target)?;
    match transport.deliver(&testcase)? {
        Delivery::Sent => info!(bytes = testcase.len(), digest = %testcase.digest(), "testcase delivered"),
        Delivery::Reset => warn!(digest = %testcase.digest(), "connection reset by target"),
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), anyhow::Error> {
    init_logging(&cli.log_level)?;

    let mut config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Fuzz(args) => {
            args.apply(&mut config);
            fuzz(config)
        }
        Command::Replay { file, target } => {
            target.apply(&mut config);
            replay(&config, &file)
        }
        Command::Config(args) => {
            args.apply(&mut config);
            if let Err(e) = config.validate() {
                warn!(error = %e, "configuration is not runnable as is");
            }
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
