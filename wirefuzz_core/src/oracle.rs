use crate::state::{RunState, StopReason};
use regex::Regex;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// A finding reported by an [`Oracle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugReport {
    /// Name of the oracle that fired.
    pub oracle: &'static str,
    /// A human-readable description of what was observed.
    pub description: String,
}

#[derive(Error, Debug)]
pub enum OracleError {
    /// The check script could not be executed at all.
    #[error("Could not run check script {script:?}: {source}")]
    CheckScript { script: PathBuf, source: io::Error },

    #[error("Invalid log regex {pattern:?}: {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },
}

/// An `Oracle` inspects the target after a batch to decide whether it crashed.
///
/// Oracles are consulted under the run mutex after every batch; any report
/// stops the run and persists the batch as evidence.
pub trait Oracle: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `Some(BugReport)` if the target looks crashed.
    ///
    /// An `Err` means the oracle itself could not do its job, which is fatal.
    fn examine(&self) -> Result<Option<BugReport>, OracleError>;
}

/// Reports a crash once the monitored process no longer exists.
#[derive(Debug, Clone)]
pub struct PidOracle {
    pid: u32,
}

impl PidOracle {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl Oracle for PidOracle {
    fn name(&self) -> &'static str {
        "PidOracle"
    }

    fn examine(&self) -> Result<Option<BugReport>, OracleError> {
        if Path::new("/proc").join(self.pid.to_string()).exists() {
            return Ok(None);
        }
        Ok(Some(BugReport {
            oracle: self.name(),
            description: format!("process {} is gone", self.pid),
        }))
    }
}

/// Runs a user script whose first byte of output must be `1` while the target
/// is healthy.
#[derive(Debug, Clone)]
pub struct CheckScriptOracle {
    script: PathBuf,
}

impl CheckScriptOracle {
    pub fn new(script: PathBuf) -> Self {
        Self { script }
    }
}

impl Oracle for CheckScriptOracle {
    fn name(&self) -> &'static str {
        "CheckScriptOracle"
    }

    fn examine(&self) -> Result<Option<BugReport>, OracleError> {
        let output = Command::new(&self.script)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|source| OracleError::CheckScript {
                script: self.script.clone(),
                source,
            })?;

        match output.stdout.first() {
            Some(b'1') => Ok(None),
            first => {
                let printed = first.map_or_else(|| "nothing".to_string(), |b| format!("{:?}", *b as char));
                warn!(script = ?self.script, %printed, "check script reported unhealthy target");
                Ok(Some(BugReport {
                    oracle: self.name(),
                    description: format!("check script {:?} printed {}", self.script, printed),
                }))
            }
        }
    }
}

/// Watches a log file for lines matching a regex.
///
/// Only lines appended after the watch starts are considered. The first match
/// stops the run with [`StopReason::LogMatch`].
#[derive(Debug, Clone)]
pub struct LogMonitor {
    path: PathBuf,
    regex: Regex,
    poll_interval: Duration,
}

impl LogMonitor {
    pub fn new(path: PathBuf, pattern: &str) -> Result<Self, OracleError> {
        let regex = Regex::new(pattern).map_err(|source| OracleError::Regex {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            path,
            regex,
            poll_interval: Duration::from_millis(100),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Tails the log until a line matches or the run stops for another reason.
    ///
    /// A log that cannot be opened only disables this monitor; crash detection
    /// through the other oracles keeps working.
    ///
    /// # Returns
    /// The matching line, without its trailing newline, if one was found.
    pub fn watch(&self, state: &RunState) -> Option<String> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "could not open log file, falling back to crash detection only");
                return None;
            }
        };
        if let Err(e) = file.seek(SeekFrom::End(0)) {
            warn!(path = ?self.path, error = %e, "could not seek to end of log file");
            return None;
        }
        info!(path = ?self.path, "monitoring log file");

        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        loop {
            if state.is_stopped() {
                return None;
            }
            match reader.read_until(b'\n', &mut line) {
                Ok(_) if line.last() == Some(&b'\n') => {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end_matches(['\r', '\n']);
                    if self.regex.is_match(text) {
                        error!(path = ?self.path, line = text, "log regex matched");
                        state.request_stop(StopReason::LogMatch(text.to_string()));
                        return Some(text.to_string());
                    }
                    line.clear();
                }
                // End of file, possibly mid-line: keep what was read and wait for more.
                Ok(_) => std::thread::sleep(self.poll_interval),
                Err(e) => {
                    debug!(error = %e, "error reading log file");
                    std::thread::sleep(self.poll_interval);
                }
            }
        }
    }
}
