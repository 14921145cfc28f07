use crate::input::{Input, Testcase};
use crate::observer::CoverageHash;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Defines errors that can arise while reading or persisting testcases.
///
/// Every variant carries the path involved so that a fatal setup error can be
/// reported with the exact location that failed.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// A directory that must exist (seed corpus, generator scratch dir) could not be listed.
    #[error("Could not open directory {path:?}: {source}")]
    OpenDir { path: PathBuf, source: io::Error },

    /// A testcase file could not be read back into memory.
    #[error("Could not read testcase {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    /// A testcase could not be written to disk.
    #[error("Could not write testcase {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Loads and persists testcases.
///
/// Batches themselves are plain `Vec<Testcase>` values that move between the
/// generator, the worker and the store; the store only adds the on-disk naming
/// policies. Sequential numbering is shared by every worker of a run, so one
/// store can be used from several threads without two saves picking the same
/// file name.
#[derive(Debug)]
pub struct TestcaseStore {
    run_prefix: String,
    next_seq: AtomicU64,
}

impl TestcaseStore {
    /// Creates a store whose sequential files are named `<run_prefix>-<n>`, starting at 1.
    pub fn new(run_prefix: impl Into<String>) -> Self {
        Self {
            run_prefix: run_prefix.into(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Creates a store prefixed with the current process id.
    pub fn for_current_process() -> Self {
        Self::new(std::process::id().to_string())
    }

    pub fn run_prefix(&self) -> &str {
        &self.run_prefix
    }

    /// Loads every regular file in `dir` whose name starts with `name_prefix`.
    ///
    /// Zero-length files are skipped. Files are returned in natural name order,
    /// so `case-2` comes before `case-10` and generator output keeps its
    /// generation order.
    ///
    /// # Arguments
    /// * `dir`: Directory to scan. It is not traversed recursively.
    /// * `name_prefix`: Only names starting with this string are considered. An
    ///   empty prefix matches every file.
    ///
    /// # Returns
    /// The loaded testcases, or `CorpusError::OpenDir` if the directory cannot be
    /// listed. Corpus directories are required inputs, so this is fatal to callers.
    pub fn load(dir: &Path, name_prefix: &str) -> Result<Vec<Testcase>, CorpusError> {
        let entries = fs::read_dir(dir).map_err(|source| CorpusError::OpenDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CorpusError::OpenDir {
                path: dir.to_path_buf(),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(name_prefix) {
                continue;
            }
            match entry.file_type() {
                Ok(file_type) if file_type.is_file() => paths.push(entry.path()),
                _ => continue,
            }
        }
        paths.sort_by_cached_key(|path| natural_key(path));

        let mut cases = Vec::with_capacity(paths.len());
        for path in paths {
            let case = Self::load_file(&path)?;
            if case.is_empty() {
                trace!(?path, "skipping empty testcase");
                continue;
            }
            cases.push(case);
        }
        debug!(dir = ?dir, prefix = name_prefix, count = cases.len(), "loaded testcases");
        Ok(cases)
    }

    /// Reads a single file into a testcase.
    pub fn load_file(path: &Path) -> Result<Testcase, CorpusError> {
        fs::read(path)
            .map(Testcase::new)
            .map_err(|source| CorpusError::Read {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Writes `data` to `dir/<hash>` unless that file already exists.
    ///
    /// The coverage hash names the file, so an existing file means an equivalent
    /// testcase is already stored and the write is skipped.
    ///
    /// # Returns
    /// `Ok(true)` if a new file was written, `Ok(false)` if it already existed.
    pub fn save_by_hash(data: &[u8], hash: CoverageHash, dir: &Path) -> Result<bool, CorpusError> {
        let path = dir.join(hash.to_string());
        match write_new(&path, data) {
            Ok(()) => {
                info!(?path, "saved new corpus entry");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(?path, "corpus entry already exists, ignoring");
                Ok(false)
            }
            Err(source) => Err(CorpusError::Write { path, source }),
        }
    }

    /// Persists a whole batch as `<run_prefix>-<n>` files in `dir`.
    ///
    /// Numbers keep increasing for the lifetime of the store, and names already
    /// present on disk are skipped rather than overwritten.
    ///
    /// # Returns
    /// The paths written, in batch order.
    pub fn save_batch(&self, batch: &[Testcase], dir: &Path) -> Result<Vec<PathBuf>, CorpusError> {
        let mut written = Vec::with_capacity(batch.len());
        for case in batch {
            loop {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let path = dir.join(format!("{}-{}", self.run_prefix, seq));
                match write_new(&path, case.as_bytes()) {
                    Ok(()) => {
                        written.push(path);
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                    Err(source) => return Err(CorpusError::Write { path, source }),
                }
            }
        }
        if !written.is_empty() {
            info!(dir = ?dir, count = written.len(), "persisted testcases");
        }
        Ok(written)
    }

    /// Drops every testcase of a processed batch, returning how many there were.
    pub fn release(batch: Vec<Testcase>) -> usize {
        let count = batch.len();
        drop(batch);
        trace!(count, "released batch");
        count
    }
}

fn write_new(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(data)?;
    file.flush()
}

/// Sort key splitting a file name into its non-numeric stem and trailing number.
fn natural_key(path: &Path) -> (String, u64, String) {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    let number = name[stem.len()..].parse::<u64>().unwrap_or(0);
    (stem.to_string(), number, name)
}
