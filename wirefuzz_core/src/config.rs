use crate::executor::encode_alpn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors reported by [`FuzzerConfig::validate`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("A target host is required")]
    MissingHost,
    #[error("A target port is required for {0:?} targets")]
    MissingPort(Protocol),
    #[error("A generation engine (radamsa or blab) is required")]
    MissingEngine,
    #[error("blab requires a grammar")]
    MissingGrammar,
    #[error("radamsa requires a seed directory")]
    MissingSeedDir,
    #[error("A grammar cannot be used with radamsa")]
    GrammarWithRadamsa,
    #[error("blab only takes a seed directory when coverage tracing is enabled")]
    SeedDirWithoutTracing,
    #[error("Coverage tracing requires exactly one worker thread, got {0}")]
    TracingNeedsSingleWorker(usize),
    #[error("Coverage tracing with blab requires a seed directory to store new paths")]
    TracingNeedsSeedDir,
    #[error("An output directory is required")]
    MissingOutputDir,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("Check script {0:?} does not exist")]
    MissingCheckScript(PathBuf),
    #[error("TLS cannot be used with UNIX domain sockets")]
    TlsOverUnix,
    #[error("TLS support was not compiled in, rebuild with the `tls` feature")]
    TlsUnavailable,
    #[error("ALPN is only meaningful together with TLS")]
    AlpnWithoutTls,
    #[error("Invalid ALPN protocol list: {0}")]
    InvalidAlpn(String),
    #[error("Invalid log regex {pattern:?}: {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("A log regex requires a log file to watch")]
    RegexWithoutLogFile,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Unix,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Host name or address; the socket path for `unix` targets.
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
    /// TLS over TCP, or DTLS over UDP.
    #[serde(default)]
    pub tls: bool,
    /// Comma separated ALPN protocol list, e.g. `h2,http/1.1`.
    #[serde(default)]
    pub alpn: Option<String>,
    /// Abort TCP connections with a RST instead of a graceful close.
    #[serde(default)]
    pub destroy: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_send_timeout_ms() -> u64 {
    5000
}

impl TargetConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: None,
            protocol: Protocol::default(),
            tls: false,
            alpn: None,
            destroy: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GeneratorEngine {
    /// Mutation-based generation from a seed directory.
    Radamsa,
    /// Grammar-based generation.
    Blab,
}

impl GeneratorEngine {
    pub fn default_program(&self) -> &'static str {
        match self {
            GeneratorEngine::Radamsa => "radamsa",
            GeneratorEngine::Blab => "blab",
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub engine: Option<GeneratorEngine>,
    #[serde(default)]
    pub grammar: Option<String>,
    #[serde(default)]
    pub seed_dir: Option<PathBuf>,
    /// Scratch directory the external generator writes batches into.
    #[serde(default = "default_case_dir")]
    pub case_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub deterministic_batch_size: usize,
    /// Run the bit-flip sweep over every seed before random mutation.
    #[serde(default = "default_deterministic")]
    pub deterministic: bool,
    /// Overrides the generator binary looked up on `PATH`.
    #[serde(default)]
    pub program: Option<PathBuf>,
    #[serde(default = "default_generator_timeout_ms")]
    pub timeout_ms: u64,
}

pub fn default_case_dir() -> PathBuf {
    PathBuf::from("/dev/shm/wirefuzz")
}

pub fn default_batch_size() -> usize {
    100
}

fn default_deterministic() -> bool {
    true
}

fn default_generator_timeout_ms() -> u64 {
    60_000
}

impl GeneratorConfig {
    pub fn program(&self) -> Option<PathBuf> {
        self.program
            .clone()
            .or_else(|| self.engine.map(|e| PathBuf::from(e.default_program())))
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            engine: None,
            grammar: None,
            seed_dir: None,
            case_dir: default_case_dir(),
            batch_size: default_batch_size(),
            deterministic_batch_size: default_batch_size(),
            deterministic: default_deterministic(),
            program: None,
            timeout_ms: default_generator_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Stop after this many seconds. Runs until a crash or interrupt when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Where crash evidence and run statistics are written.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// System V shared memory id of the target's coverage bitmap.
    #[serde(default)]
    pub trace_shm_id: Option<i32>,
}

pub fn default_threads() -> usize {
    1
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            timeout_secs: None,
            output_dir: None,
            trace_shm_id: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Target process id; its disappearance counts as a crash.
    #[serde(default)]
    pub pid: Option<u32>,
    /// Script printing `1` while the target is healthy.
    #[serde(default)]
    pub check_script: Option<PathBuf>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub log_regex: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl FuzzerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FuzzerConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, anyhow::Error> {
        toml::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize configuration: {}", e))
    }

    pub fn tracing_enabled(&self) -> bool {
        self.fuzzer.trace_shm_id.is_some()
    }

    /// Checks the settings needed to deliver testcases to the target.
    pub fn validate_target(&self) -> Result<(), ConfigError> {
        let target = &self.target;
        if target.host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if target.port.is_none() && target.protocol != Protocol::Unix {
            return Err(ConfigError::MissingPort(target.protocol));
        }
        if target.tls {
            if target.protocol == Protocol::Unix {
                return Err(ConfigError::TlsOverUnix);
            }
            if !cfg!(feature = "tls") {
                return Err(ConfigError::TlsUnavailable);
            }
        }
        if let Some(alpn) = &target.alpn {
            if !target.tls {
                return Err(ConfigError::AlpnWithoutTls);
            }
            encode_alpn(alpn).map_err(|e| ConfigError::InvalidAlpn(e.to_string()))?;
        }
        if target.connect_timeout_ms == 0 {
            return Err(ConfigError::Zero("connect-timeout-ms"));
        }
        if target.send_timeout_ms == 0 {
            return Err(ConfigError::Zero("send-timeout-ms"));
        }
        Ok(())
    }

    /// Checks every setting needed for a fuzzing run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_target()?;

        let generator = &self.generator;
        let tracing = self.tracing_enabled();
        match generator.engine {
            None => return Err(ConfigError::MissingEngine),
            Some(GeneratorEngine::Blab) => {
                if generator.grammar.is_none() {
                    return Err(ConfigError::MissingGrammar);
                }
                if generator.seed_dir.is_some() && !tracing {
                    return Err(ConfigError::SeedDirWithoutTracing);
                }
                if generator.seed_dir.is_none() && tracing {
                    return Err(ConfigError::TracingNeedsSeedDir);
                }
            }
            Some(GeneratorEngine::Radamsa) => {
                if generator.grammar.is_some() {
                    return Err(ConfigError::GrammarWithRadamsa);
                }
                if generator.seed_dir.is_none() {
                    return Err(ConfigError::MissingSeedDir);
                }
            }
        }
        if generator.batch_size == 0 {
            return Err(ConfigError::Zero("batch-size"));
        }
        if generator.deterministic_batch_size == 0 {
            return Err(ConfigError::Zero("deterministic-batch-size"));
        }
        if generator.timeout_ms == 0 {
            return Err(ConfigError::Zero("generator timeout-ms"));
        }

        if self.fuzzer.threads == 0 {
            return Err(ConfigError::Zero("threads"));
        }
        if tracing && self.fuzzer.threads > 1 {
            return Err(ConfigError::TracingNeedsSingleWorker(self.fuzzer.threads));
        }
        if self.fuzzer.output_dir.is_none() {
            return Err(ConfigError::MissingOutputDir);
        }

        let monitor = &self.monitor;
        if let Some(script) = &monitor.check_script {
            if !script.is_file() {
                return Err(ConfigError::MissingCheckScript(script.clone()));
            }
        }
        match (&monitor.log_file, &monitor.log_regex) {
            (Some(_), Some(pattern)) => {
                regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidRegex {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
            }
            (Some(file), None) => {
                warn!(log_file = ?file, "no log regex given, falling back to crash-detect mode");
            }
            (None, Some(_)) => return Err(ConfigError::RegexWithoutLogFile),
            (None, None) => {}
        }
        Ok(())
    }
}
