use crate::config::{ConfigError, GeneratorConfig, GeneratorEngine};
use crate::corpus::{CorpusError, TestcaseStore};
use crate::input::Testcase;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Error, Debug)]
pub enum GeneratorError {
    /// The generator binary does not exist or is not executable.
    #[error("Generator program {program:?} is not available: {source}")]
    Missing { program: PathBuf, source: io::Error },
    #[error("Failed to spawn generator {program:?}: {source}")]
    Spawn { program: PathBuf, source: io::Error },
    #[error("Error waiting for generator {program:?}: {source}")]
    Wait { program: PathBuf, source: io::Error },
    #[error("Generator {program:?} timed out after {timeout:?}")]
    Timeout { program: PathBuf, timeout: Duration },
    #[error("Could not collect generated testcases: {0}")]
    Collect(#[from] CorpusError),
}

/// Whether generated testcases descend from seeds or from a grammar.
///
/// Only mutation-based output has a natural seed to feed back into the
/// deterministic bit-flip phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    Grammar,
    Mutation,
}

/// A source of testcase batches.
pub trait CaseGenerator: Send + Sync {
    fn kind(&self) -> GenerationKind;

    /// Directory holding the seed corpus, which also receives newly discovered paths.
    fn seed_dir(&self) -> Option<&Path>;

    /// Produces up to `count` testcases in generation order. `prefix` keeps the
    /// scratch files of concurrent workers apart.
    fn generate(&self, count: usize, prefix: &str) -> Result<Vec<Testcase>, GeneratorError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Engine {
    Radamsa { seed_dir: PathBuf },
    Blab {
        grammar: String,
        seed_dir: Option<PathBuf>,
    },
}

/// Runs radamsa or blab as a child process per batch.
///
/// The tool writes numbered files into the scratch directory; they are read
/// back in order and removed.
#[derive(Debug, Clone)]
pub struct ExternalGenerator {
    engine: Engine,
    program: PathBuf,
    case_dir: PathBuf,
    timeout: Duration,
}

impl ExternalGenerator {
    pub fn new(engine: Engine, program: PathBuf, case_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            engine,
            program,
            case_dir,
            timeout,
        }
    }

    pub fn from_config(config: &GeneratorConfig) -> Result<Self, ConfigError> {
        let engine = match config.engine {
            None => return Err(ConfigError::MissingEngine),
            Some(GeneratorEngine::Radamsa) => Engine::Radamsa {
                seed_dir: config.seed_dir.clone().ok_or(ConfigError::MissingSeedDir)?,
            },
            Some(GeneratorEngine::Blab) => Engine::Blab {
                grammar: config.grammar.clone().ok_or(ConfigError::MissingGrammar)?,
                seed_dir: config.seed_dir.clone(),
            },
        };
        let program = config.program().ok_or(ConfigError::MissingEngine)?;
        Ok(Self::new(
            engine,
            program,
            config.case_dir.clone(),
            Duration::from_millis(config.timeout_ms),
        ))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Fails with `GeneratorError::Missing` unless the program can be found.
    ///
    /// Bare names are looked up on `PATH`, anything containing a `/` is taken as a path.
    pub fn ensure_available(&self) -> Result<(), GeneratorError> {
        let found = if self.program.components().count() > 1 {
            self.program.is_file()
        } else {
            std::env::var_os("PATH")
                .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(&self.program).is_file()))
                .unwrap_or(false)
        };
        if found {
            Ok(())
        } else {
            Err(GeneratorError::Missing {
                program: self.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "program not found"),
            })
        }
    }

    fn command(&self, count: usize, output_template: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        match &self.engine {
            Engine::Radamsa { seed_dir } => {
                cmd.arg("-n")
                    .arg(count.to_string())
                    .arg("-r")
                    .arg("-o")
                    .arg(output_template)
                    .arg(seed_dir);
            }
            Engine::Blab { grammar, .. } => {
                cmd.arg(grammar)
                    .arg("-n")
                    .arg(count.to_string())
                    .arg("-o")
                    .arg(output_template);
            }
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    fn run_and_wait_with_timeout(&self, mut child: Child) -> Result<ExitStatus, GeneratorError> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > self.timeout {
                        warn!(program = ?self.program, "generator timed out, killing");
                        if let Err(e) = child.kill() {
                            warn!(error = %e, "failed to kill generator");
                        }
                        let _ = child.wait();
                        return Err(GeneratorError::Timeout {
                            program: self.program.clone(),
                            timeout: self.timeout,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(source) => {
                    return Err(GeneratorError::Wait {
                        program: self.program.clone(),
                        source,
                    });
                }
            }
        }
    }
}

impl CaseGenerator for ExternalGenerator {
    fn kind(&self) -> GenerationKind {
        match self.engine {
            Engine::Radamsa { .. } => GenerationKind::Mutation,
            Engine::Blab { .. } => GenerationKind::Grammar,
        }
    }

    fn seed_dir(&self) -> Option<&Path> {
        match &self.engine {
            Engine::Radamsa { seed_dir } => Some(seed_dir),
            Engine::Blab { seed_dir, .. } => seed_dir.as_deref(),
        }
    }

    fn generate(&self, count: usize, prefix: &str) -> Result<Vec<Testcase>, GeneratorError> {
        let file_prefix = format!("{prefix}-");
        let template = self.case_dir.join(format!("{file_prefix}%n"));

        let child = self.command(count, &template).spawn().map_err(|source| {
            if matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ) {
                GeneratorError::Missing {
                    program: self.program.clone(),
                    source,
                }
            } else {
                GeneratorError::Spawn {
                    program: self.program.clone(),
                    source,
                }
            }
        })?;
        let status = self.run_and_wait_with_timeout(child)?;
        if !status.success() {
            debug!(program = ?self.program, %status, "generator exited unsuccessfully");
        }

        let cases = TestcaseStore::load(&self.case_dir, &file_prefix)?;
        remove_generated(&self.case_dir, &file_prefix);
        trace!(count = cases.len(), "generated batch");
        Ok(cases)
    }
}

fn remove_generated(dir: &Path, file_prefix: &str) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let is_ours = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(file_prefix));
        if is_ours {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                debug!(path = ?entry.path(), error = %e, "could not remove generated file");
            }
        }
    }
}
