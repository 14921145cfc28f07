//! Stub collaborators shared by the unit tests.

use crate::executor::{Delivery, Transport, TransportError};
use crate::generator::{CaseGenerator, GenerationKind, GeneratorError};
use crate::input::{Input, Testcase};
use crate::observer::{InMemoryBitmap, MAP_SIZE, PollSettings};
use crate::oracle::{BugReport, Oracle, OracleError};
use crate::state::{RunState, StopReason};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn fast_poll() -> PollSettings {
    PollSettings {
        empty_interval: Duration::from_millis(1),
        settle_interval: Duration::from_millis(2),
        max_empty_polls: 20,
        max_unsettled_polls: 50,
    }
}

/// How a stub target writes coverage on each delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Coverage {
    /// Writes nothing.
    Silent,
    /// The same cells for every input.
    Constant,
    /// A pure function of the input bytes.
    PerInput,
    /// Depends on the wall clock, so no two deliveries agree.
    Clock,
}

/// A target stand-in that records what it received and optionally writes
/// coverage, fails, or stops the run at a given delivery.
pub(crate) struct StubTransport {
    coverage: Coverage,
    bitmap: Option<InMemoryBitmap>,
    delivered: Mutex<Vec<Vec<u8>>>,
    count: AtomicUsize,
    fail_from: Option<usize>,
    stop_at: Option<(usize, Arc<RunState>, StopReason)>,
}

impl StubTransport {
    pub(crate) fn new(coverage: Coverage) -> Self {
        Self {
            coverage,
            bitmap: None,
            delivered: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
            fail_from: None,
            stop_at: None,
        }
    }

    pub(crate) fn with_bitmap(mut self, bitmap: InMemoryBitmap) -> Self {
        self.bitmap = Some(bitmap);
        self
    }

    /// Delivery number `n` (counting from 1) and every later one fail.
    pub(crate) fn failing_from(mut self, n: usize) -> Self {
        self.fail_from = Some(n);
        self
    }

    /// Delivery number `n` requests a stop after it has been received, or
    /// just before it fails when it is also a failing delivery.
    pub(crate) fn stopping_at(mut self, n: usize, state: Arc<RunState>, reason: StopReason) -> Self {
        self.stop_at = Some((n, state, reason));
        self
    }

    pub(crate) fn deliveries(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) fn delivered(&self) -> Vec<Vec<u8>> {
        self.delivered.lock().unwrap().clone()
    }

    fn write_coverage(&self, data: &[u8]) {
        let Some(bitmap) = &self.bitmap else {
            return;
        };
        match self.coverage {
            Coverage::Silent => {}
            Coverage::Constant => bitmap.update(|cells| {
                cells[1] = 1;
                cells[513] = 2;
            }),
            Coverage::PerInput => bitmap.update(|cells| {
                for (i, &b) in data.iter().enumerate() {
                    let idx = ((i << 8) | b as usize) % MAP_SIZE;
                    cells[idx] = cells[idx].saturating_add(1);
                }
            }),
            Coverage::Clock => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap()
                    .as_nanos();
                bitmap.update(|cells| {
                    cells[0] = 1;
                    cells[1 + (nanos % (MAP_SIZE as u128 - 1)) as usize] = 1;
                });
                std::thread::sleep(Duration::from_micros(50));
            }
        }
    }
}

impl Transport for StubTransport {
    fn deliver(&self, testcase: &Testcase) -> Result<Delivery, TransportError> {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self.fail_from.is_some_and(|from| n >= from);
        if !failing {
            self.delivered
                .lock()
                .unwrap()
                .push(testcase.as_bytes().to_vec());
            self.write_coverage(testcase.as_bytes());
        }
        if let Some((at, state, reason)) = &self.stop_at {
            if n == *at {
                state.request_stop(reason.clone());
            }
        }
        if failing {
            return Err(TransportError::Connect {
                target: "stub".to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }
        Ok(Delivery::Sent)
    }
}

/// What a [`StubGenerator`] does once its scripted batches run out.
pub(crate) enum Exhausted {
    /// Keep returning empty batches.
    Empty,
    /// Request a stop, then return empty batches.
    Stop(Arc<RunState>, StopReason),
    /// Fail the next request.
    Fail,
}

pub(crate) struct StubGenerator {
    kind: GenerationKind,
    seed_dir: Option<PathBuf>,
    batches: Mutex<VecDeque<Vec<Testcase>>>,
    exhausted: Exhausted,
}

impl StubGenerator {
    pub(crate) fn new(kind: GenerationKind, batches: Vec<Vec<&[u8]>>, exhausted: Exhausted) -> Self {
        let batches = batches
            .into_iter()
            .map(|batch| batch.into_iter().map(Testcase::from).collect())
            .collect();
        Self {
            kind,
            seed_dir: None,
            batches: Mutex::new(batches),
            exhausted,
        }
    }

    pub(crate) fn with_seed_dir(mut self, dir: &Path) -> Self {
        self.seed_dir = Some(dir.to_path_buf());
        self
    }
}

impl CaseGenerator for StubGenerator {
    fn kind(&self) -> GenerationKind {
        self.kind
    }

    fn seed_dir(&self) -> Option<&Path> {
        self.seed_dir.as_deref()
    }

    fn generate(&self, _count: usize, _prefix: &str) -> Result<Vec<Testcase>, GeneratorError> {
        if let Some(batch) = self.batches.lock().unwrap().pop_front() {
            return Ok(batch);
        }
        match &self.exhausted {
            Exhausted::Empty => std::thread::sleep(Duration::from_millis(1)),
            Exhausted::Stop(state, reason) => {
                state.request_stop(reason.clone());
            }
            Exhausted::Fail => {
                return Err(GeneratorError::Timeout {
                    program: PathBuf::from("stub-generator"),
                    timeout: Duration::from_secs(0),
                });
            }
        }
        Ok(Vec::new())
    }
}

/// Reports a crash from its `fire_on`-th examination onwards.
pub(crate) struct StubOracle {
    fire_on: usize,
    calls: AtomicUsize,
}

impl StubOracle {
    pub(crate) fn firing_on(fire_on: usize) -> Self {
        Self {
            fire_on,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Oracle for StubOracle {
    fn name(&self) -> &'static str {
        "StubOracle"
    }

    fn examine(&self) -> Result<Option<BugReport>, OracleError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.fire_on {
            return Ok(Some(BugReport {
                oracle: self.name(),
                description: "target stopped answering".to_string(),
            }));
        }
        Ok(None)
    }
}
