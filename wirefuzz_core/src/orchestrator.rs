use crate::calibrator::{Calibration, Calibrator};
use crate::config::{ConfigError, FuzzerConfig};
use crate::corpus::{CorpusError, TestcaseStore};
use crate::executor::{SocketTransport, Transport, TransportError};
use crate::feedback::Novelty;
use crate::generator::{CaseGenerator, ExternalGenerator, GenerationKind, GeneratorError};
use crate::input::{Input, Testcase};
use crate::observer::{CoverageTracer, PollSettings, SettleOutcome, TraceError};
use crate::oracle::{BugReport, CheckScriptOracle, LogMonitor, Oracle, OracleError, PidOracle};
use crate::scheduler::{DeterministicSchedule, SchedulerError};
use crate::state::{RunState, RunStats, RunSummary, StopReason};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

const WATCHDOG_TICK: Duration = Duration::from_millis(100);

/// Errors that prevent a run from starting.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("Could not create directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("Seed directory {0:?} does not exist")]
    MissingSeedDir(PathBuf),
}

/// Errors that end a worker, and with it the run.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("Delivering seed {digest} failed during calibration: {reason}")]
    SeedDelivery { digest: String, reason: String },
    #[error("Coverage tracing requires a single worker, {0} were configured")]
    TracingNeedsSingleWorker(usize),
    #[error("Worker {0} panicked")]
    Panicked(usize),
}

/// What a worker is doing at the moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Generating,
    Sending,
    TracingFeedback,
    Exited,
}

/// Run-wide knobs handed to every worker.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub threads: usize,
    pub batch_size: usize,
    pub deterministic_batch_size: usize,
    /// Worker 1 sweeps every bit of every seed before random generation.
    pub deterministic: bool,
    pub timeout: Option<Duration>,
    /// Destination of crash evidence.
    pub output_dir: PathBuf,
    pub progress_interval: Duration,
}

impl RunSettings {
    pub fn from_config(config: &FuzzerConfig) -> Result<Self, ConfigError> {
        let output_dir = config
            .fuzzer
            .output_dir
            .clone()
            .ok_or(ConfigError::MissingOutputDir)?;
        Ok(Self {
            threads: config.fuzzer.threads,
            batch_size: config.generator.batch_size,
            deterministic_batch_size: config.generator.deterministic_batch_size,
            deterministic: config.generator.deterministic,
            timeout: config.fuzzer.timeout_secs.map(Duration::from_secs),
            output_dir,
            progress_interval: Duration::from_millis(250),
        })
    }
}

/// Owns the collaborators of a run and drives the worker pool.
pub struct Orchestrator {
    settings: RunSettings,
    state: Arc<RunState>,
    transport: Arc<dyn Transport>,
    generator: Arc<dyn CaseGenerator>,
    oracles: Vec<Box<dyn Oracle>>,
    log_monitor: Option<LogMonitor>,
    tracer: Option<CoverageTracer>,
    store: TestcaseStore,
}

impl Orchestrator {
    pub fn new(
        settings: RunSettings,
        state: Arc<RunState>,
        transport: Arc<dyn Transport>,
        generator: Arc<dyn CaseGenerator>,
    ) -> Self {
        Self {
            settings,
            state,
            transport,
            generator,
            oracles: Vec::new(),
            log_monitor: None,
            tracer: None,
            store: TestcaseStore::for_current_process(),
        }
    }

    /// Validates `config` and wires up sockets, the generator, tracing and
    /// every configured crash oracle.
    pub fn from_config(config: &FuzzerConfig, state: Arc<RunState>) -> Result<Self, SetupError> {
        config.validate()?;
        let settings = RunSettings::from_config(config)?;

        create_dir(&config.generator.case_dir)?;
        create_dir(&settings.output_dir)?;
        if let Some(seed_dir) = &config.generator.seed_dir {
            if !seed_dir.is_dir() {
                return Err(SetupError::MissingSeedDir(seed_dir.clone()));
            }
        }

        let generator = ExternalGenerator::from_config(&config.generator)?;
        generator.ensure_available()?;
        let transport = SocketTransport::from_config(&config.target)?;

        let mut orchestrator = Self::new(settings, state, Arc::new(transport), Arc::new(generator));
        if let Some(shm_id) = config.fuzzer.trace_shm_id {
            let tracer = CoverageTracer::acquire(shm_id, PollSettings::default())?;
            info!(shm_id, "attached coverage bitmap");
            orchestrator = orchestrator.with_tracer(tracer);
        }
        if let Some(pid) = config.monitor.pid {
            orchestrator = orchestrator.with_oracle(Box::new(PidOracle::new(pid)));
        }
        if let Some(script) = &config.monitor.check_script {
            orchestrator = orchestrator.with_oracle(Box::new(CheckScriptOracle::new(script.clone())));
        }
        if let (Some(log_file), Some(pattern)) = (&config.monitor.log_file, &config.monitor.log_regex) {
            orchestrator = orchestrator.with_log_monitor(LogMonitor::new(log_file.clone(), pattern)?);
        }
        Ok(orchestrator)
    }

    pub fn with_tracer(mut self, tracer: CoverageTracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_oracle(mut self, oracle: Box<dyn Oracle>) -> Self {
        self.oracles.push(oracle);
        self
    }

    pub fn with_log_monitor(mut self, monitor: LogMonitor) -> Self {
        self.log_monitor = Some(monitor);
        self
    }

    pub fn with_store(mut self, store: TestcaseStore) -> Self {
        self.store = store;
        self
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    /// Runs the workers until something stops the run.
    ///
    /// A watchdog enforces the timeout and the log monitor, if any, tails its file
    /// on a thread of its own. `progress` is called from the calling thread at
    /// every `progress_interval` with a snapshot of the counters. Threads are
    /// joined watchdog first, then the monitor, then the workers.
    ///
    /// # Returns
    /// The final summary, or the first error reported by a worker.
    pub fn run<F>(mut self, mut progress: F) -> Result<RunSummary, WorkerError>
    where
        F: FnMut(RunStats),
    {
        let threads = self.settings.threads;
        if self.tracer.is_some() && threads > 1 {
            return Err(WorkerError::TracingNeedsSingleWorker(threads));
        }
        let mut tracer = self.tracer.take();
        let shared = Shared {
            settings: &self.settings,
            state: self.state.as_ref(),
            transport: self.transport.as_ref(),
            generator: self.generator.as_ref(),
            oracles: &self.oracles,
            store: &self.store,
            calibrator: Calibrator::new(),
        };
        let log_monitor = self.log_monitor.as_ref();
        info!(threads, tracing = tracer.is_some(), "starting workers");

        let first_error = thread::scope(|scope| {
            let shared = &shared;
            let watchdog = shared
                .settings
                .timeout
                .map(|timeout| scope.spawn(move || watchdog(shared.state, timeout)));
            let monitor = log_monitor.map(|monitor| scope.spawn(move || monitor.watch(shared.state)));
            let workers: Vec<_> = (1..=threads)
                .map(|id| {
                    let worker = Worker::new(id, shared, if id == 1 { tracer.take() } else { None });
                    scope.spawn(move || worker.run())
                })
                .collect();

            while !shared.state.is_stopped() && !workers.iter().all(|w| w.is_finished()) {
                progress(shared.state.stats());
                thread::sleep(shared.settings.progress_interval);
            }
            // Workers that vanished without stopping the run must not leave
            // the watchdog and monitor spinning.
            shared
                .state
                .request_stop(StopReason::WorkerFailed("all workers exited".to_string()));
            progress(shared.state.stats());

            if let Some(handle) = watchdog {
                if handle.join().is_err() {
                    error!("watchdog panicked");
                }
            }
            if let Some(handle) = monitor {
                if handle.join().is_err() {
                    error!("log monitor panicked");
                }
            }
            let mut first_error = None;
            for (idx, handle) in workers.into_iter().enumerate() {
                let result = handle.join().unwrap_or(Err(WorkerError::Panicked(idx + 1)));
                if let Err(e) = result {
                    first_error.get_or_insert(e);
                }
            }
            first_error
        });

        let summary = self.state.summary();
        info!(
            sent = summary.stats.sent,
            paths = summary.stats.paths,
            jettisoned = summary.stats.jettisoned,
            reason = ?summary.stop_reason,
            "run finished"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

fn create_dir(path: &Path) -> Result<(), SetupError> {
    std::fs::create_dir_all(path).map_err(|source| SetupError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn watchdog(state: &RunState, timeout: Duration) {
    loop {
        if state.is_stopped() {
            return;
        }
        let elapsed = state.elapsed();
        if elapsed >= timeout {
            if state.request_stop(StopReason::Timeout) {
                warn!(?timeout, "reached timeout");
            }
            return;
        }
        thread::sleep((timeout - elapsed).min(WATCHDOG_TICK));
    }
}

/// Borrowed view of the orchestrator shared by every worker thread.
struct Shared<'a> {
    settings: &'a RunSettings,
    state: &'a RunState,
    transport: &'a dyn Transport,
    generator: &'a dyn CaseGenerator,
    oracles: &'a [Box<dyn Oracle>],
    store: &'a TestcaseStore,
    calibrator: Calibrator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum Sent {
    Delivered,
    /// The transport failed; the target is presumed down.
    Failed(String),
}

struct Worker<'a> {
    id: usize,
    shared: &'a Shared<'a>,
    tracer: Option<CoverageTracer>,
    phase: WorkerPhase,
    pending_seeds: VecDeque<Vec<u8>>,
    prefix: String,
}

impl<'a> Worker<'a> {
    fn new(id: usize, shared: &'a Shared<'a>, tracer: Option<CoverageTracer>) -> Self {
        Self {
            id,
            shared,
            tracer,
            phase: WorkerPhase::Idle,
            pending_seeds: VecDeque::new(),
            prefix: format!("{}-w{}", shared.store.run_prefix(), id),
        }
    }

    fn set_phase(&mut self, phase: WorkerPhase) {
        if self.phase != phase {
            trace!(worker = self.id, from = ?self.phase, to = ?phase, "phase change");
            self.phase = phase;
        }
    }

    fn run(mut self) -> Result<(), WorkerError> {
        info!(worker = self.id, tracing = self.tracer.is_some(), "worker started");
        let result = self.fuzz();
        self.set_phase(WorkerPhase::Exited);
        match &result {
            Ok(()) => info!(worker = self.id, "worker exiting"),
            Err(e) => {
                error!(worker = self.id, error = %e, "worker failed");
                self.shared
                    .state
                    .request_stop(StopReason::WorkerFailed(e.to_string()));
            }
        }
        result
    }

    fn fuzz(&mut self) -> Result<(), WorkerError> {
        let shared = self.shared;
        let mutation = shared.generator.kind() == GenerationKind::Mutation;
        if self.tracer.is_some() && mutation {
            self.calibrate_seeds()?;
        }
        if self.id == 1 && shared.settings.deterministic && mutation && self.deterministic_pass()? == Flow::Stop {
            return Ok(());
        }

        loop {
            if shared.state.is_stopped() {
                return Ok(());
            }
            self.set_phase(WorkerPhase::Generating);
            let batch = shared
                .generator
                .generate(shared.settings.batch_size, &self.prefix)?;
            if self.process_batch(batch)? == Flow::Stop {
                return Ok(());
            }
            if self.drain_pending_seeds()? == Flow::Stop {
                return Ok(());
            }
        }
    }

    /// Sends every seed once so the virgin map starts from the corpus' coverage.
    fn calibrate_seeds(&mut self) -> Result<(), WorkerError> {
        let shared = self.shared;
        let Some(dir) = shared.generator.seed_dir() else {
            return Ok(());
        };
        let Some(tracer) = self.tracer.as_mut() else {
            return Ok(());
        };
        let seeds = TestcaseStore::load(dir, "")?;
        info!(worker = self.id, seeds = seeds.len(), "calibrating seed corpus");

        for seed in &seeds {
            if shared.state.is_stopped() {
                break;
            }
            tracer.clear();
            shared
                .transport
                .deliver(seed)
                .map_err(|e| WorkerError::SeedDelivery {
                    digest: seed.digest(),
                    reason: e.to_string(),
                })?;
            shared.state.record_sent();

            let SettleOutcome::Settled(_) = tracer.await_stable_hash() else {
                continue;
            };
            if tracer.classify() != Novelty::NewEdge {
                continue;
            }
            match shared.calibrator.calibrate(tracer, shared.transport, seed) {
                Calibration::Deterministic(_) => shared.state.record_path(),
                Calibration::Flaky => shared.state.record_jettisoned(),
                Calibration::DeliveryFailed(reason) => {
                    return Err(WorkerError::SeedDelivery {
                        digest: seed.digest(),
                        reason,
                    });
                }
            }
        }

        let stats = shared.state.stats();
        info!(
            worker = self.id,
            paths = stats.paths,
            jettisoned = stats.jettisoned,
            "seed calibration finished"
        );
        Ok(())
    }

    fn deterministic_pass(&mut self) -> Result<Flow, WorkerError> {
        let shared = self.shared;
        let Some(dir) = shared.generator.seed_dir() else {
            return Ok(Flow::Continue);
        };
        let seeds = TestcaseStore::load(dir, "")?;
        info!(worker = self.id, seeds = seeds.len(), "starting deterministic bit flips");

        for seed in seeds {
            if self.sweep(seed.into_bytes())? == Flow::Stop {
                return Ok(Flow::Stop);
            }
            if self.drain_pending_seeds()? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }

        let stats = shared.state.stats();
        info!(
            worker = self.id,
            sent = stats.sent,
            paths = stats.paths,
            "deterministic bit flips completed"
        );
        Ok(Flow::Continue)
    }

    /// Flips every bit of testcases that opened new paths, oldest first.
    fn drain_pending_seeds(&mut self) -> Result<Flow, WorkerError> {
        while let Some(seed) = self.pending_seeds.pop_front() {
            if self.sweep(seed)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn sweep(&mut self, seed: Vec<u8>) -> Result<Flow, WorkerError> {
        let schedule = DeterministicSchedule::new(seed, self.shared.settings.deterministic_batch_size)?;
        debug!(worker = self.id, bits = schedule.total_bits(), "sweeping seed");
        for batch in schedule {
            self.set_phase(WorkerPhase::Generating);
            if self.process_batch(batch.cases)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Sends a batch, then decides under the run mutex whether the run goes on.
    fn process_batch(&mut self, batch: Vec<Testcase>) -> Result<Flow, WorkerError> {
        self.set_phase(WorkerPhase::Sending);
        let state = self.shared.state;
        let mut unsent_from = batch.len();
        let mut failure = None;

        for (idx, case) in batch.iter().enumerate() {
            if state.is_stopped() {
                unsent_from = idx;
                break;
            }
            if case.is_empty() {
                continue;
            }
            match self.send_one(case)? {
                Sent::Delivered => state.record_sent(),
                Sent::Failed(reason) => {
                    unsent_from = idx;
                    failure = Some(reason);
                    break;
                }
            }
        }

        let flow = self.check_stop(&batch, unsent_from, failure);
        self.set_phase(WorkerPhase::Idle);
        TestcaseStore::release(batch);
        flow
    }

    fn send_one(&mut self, case: &Testcase) -> Result<Sent, WorkerError> {
        if self.tracer.is_none() {
            return Ok(deliver(self.shared.transport, case));
        }
        self.set_phase(WorkerPhase::TracingFeedback);
        let sent = self.trace_one(case);
        self.set_phase(WorkerPhase::Sending);
        sent
    }

    /// Delivers `case` with coverage tracing, keeping it when it opens a new
    /// edge that reproduces across calibration rounds.
    fn trace_one(&mut self, case: &Testcase) -> Result<Sent, WorkerError> {
        let shared = self.shared;
        let Some(tracer) = self.tracer.as_mut() else {
            return Ok(deliver(shared.transport, case));
        };

        tracer.clear();
        if let Sent::Failed(reason) = deliver(shared.transport, case) {
            return Ok(Sent::Failed(reason));
        }
        let SettleOutcome::Settled(_) = tracer.await_stable_hash() else {
            return Ok(Sent::Delivered);
        };
        if tracer.classify() != Novelty::NewEdge {
            return Ok(Sent::Delivered);
        }

        match shared.calibrator.calibrate(tracer, shared.transport, case) {
            Calibration::Deterministic(hash) => {
                shared.state.record_path();
                info!(worker = self.id, hash, digest = %case.digest(), "new path found");
                if let Some(dir) = shared.generator.seed_dir() {
                    TestcaseStore::save_by_hash(case.as_bytes(), hash, dir)?;
                }
                if shared.generator.kind() == GenerationKind::Mutation {
                    self.pending_seeds.push_back(case.as_bytes().to_vec());
                }
            }
            Calibration::Flaky => {
                shared.state.record_jettisoned();
                debug!(worker = self.id, digest = %case.digest(), "jettisoned non-deterministic testcase");
            }
            Calibration::DeliveryFailed(reason) => return Ok(Sent::Failed(reason)),
        }
        Ok(Sent::Delivered)
    }

    /// Persists evidence if the run is stopping, otherwise consults the oracles.
    ///
    /// When another thread already stopped the run only the unsent remainder
    /// `batch[unsent_from..]` is written. A crash detected here writes the whole
    /// batch, since any of its testcases may be the culprit.
    fn check_stop(&self, batch: &[Testcase], unsent_from: usize, failure: Option<String>) -> Result<Flow, WorkerError> {
        let shared = self.shared;
        let mut control = shared.state.lock();

        if let Some(reason) = control.reason() {
            if reason.persists_evidence() {
                let remainder = &batch[unsent_from..];
                debug!(worker = self.id, count = remainder.len(), "saving unsent testcases");
                shared.store.save_batch(remainder, &shared.settings.output_dir)?;
            }
            return Ok(Flow::Stop);
        }

        let report = match failure {
            Some(description) => Some(BugReport {
                oracle: "Transport",
                description,
            }),
            None => self.examine_oracles()?,
        };
        let Some(report) = report else {
            return Ok(Flow::Continue);
        };

        error!(
            worker = self.id,
            oracle = report.oracle,
            description = %report.description,
            "target crashed, saving batch"
        );
        control.request(StopReason::TargetCrashed(format!(
            "{}: {}",
            report.oracle, report.description
        )));
        shared.store.save_batch(batch, &shared.settings.output_dir)?;
        Ok(Flow::Stop)
    }

    fn examine_oracles(&self) -> Result<Option<BugReport>, OracleError> {
        for oracle in self.shared.oracles {
            if let Some(report) = oracle.examine()? {
                return Ok(Some(report));
            }
        }
        Ok(None)
    }
}

fn deliver(transport: &dyn Transport, case: &Testcase) -> Sent {
    match transport.deliver(case) {
        Ok(_) => Sent::Delivered,
        Err(e) => {
            warn!(error = %e, digest = %case.digest(), "delivery failed, presuming target down");
            Sent::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrator::CALIBRATION_ROUNDS;
    use crate::observer::{HASH_CONST, InMemoryBitmap, MAP_SIZE, hash32};
    use crate::test_utils::{Coverage, Exhausted, StubGenerator, StubOracle, StubTransport, fast_poll};
    use std::fs;
    use tempfile::tempdir;

    fn settings(output_dir: &Path) -> RunSettings {
        RunSettings {
            threads: 1,
            batch_size: 4,
            deterministic_batch_size: 5,
            deterministic: false,
            timeout: Some(Duration::from_secs(20)),
            output_dir: output_dir.to_path_buf(),
            progress_interval: Duration::from_millis(5),
        }
    }

    fn saved(dir: &Path, prefix: &str) -> Vec<Vec<u8>> {
        TestcaseStore::load(dir, prefix)
            .unwrap()
            .into_iter()
            .map(Testcase::into_bytes)
            .collect()
    }

    fn file_count(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn stable_new_path_is_persisted_once_under_its_hash() {
        let seeds = tempdir().unwrap();
        let out = tempdir().unwrap();
        let state = Arc::new(RunState::new());
        let bitmap = InMemoryBitmap::new();
        let transport = Arc::new(StubTransport::new(Coverage::Constant).with_bitmap(bitmap.clone()));
        let generator = StubGenerator::new(
            GenerationKind::Mutation,
            vec![vec![&b"hello"[..], &b"world"[..]], vec![&b"hello"[..]]],
            Exhausted::Stop(Arc::clone(&state), StopReason::Timeout),
        )
        .with_seed_dir(seeds.path());

        let summary = Orchestrator::new(settings(out.path()), Arc::clone(&state), transport, Arc::new(generator))
            .with_tracer(CoverageTracer::new(Box::new(bitmap), fast_poll()))
            .run(|_| {})
            .unwrap();

        let mut expected_map = vec![0u8; MAP_SIZE];
        expected_map[1] = 1;
        expected_map[513] = 2;
        let hash = hash32(&expected_map, HASH_CONST);

        assert_eq!(file_count(seeds.path()), 1);
        assert_eq!(fs::read(seeds.path().join(hash.to_string())).unwrap(), b"hello");
        assert_eq!(summary.stats.paths, 1);
        assert_eq!(summary.stats.jettisoned, 0);
        // Two generated, forty bit flips of "hello", then "hello" again.
        assert_eq!(summary.stats.sent, 43);
        assert_eq!(summary.stop_reason, Some(StopReason::Timeout));
        assert_eq!(file_count(out.path()), 0);
    }

    #[test]
    fn external_stop_mid_batch_persists_exactly_the_unsent_remainder() {
        let out = tempdir().unwrap();
        let state = Arc::new(RunState::new());
        let transport = Arc::new(StubTransport::new(Coverage::Silent).stopping_at(
            3,
            Arc::clone(&state),
            StopReason::LogMatch("ERROR: heap overflow".into()),
        ));
        let batch = vec![&b"c0"[..], &b"c1"[..], &b"c2"[..], &b"c3"[..], &b"c4"[..], &b"c5"[..]];
        let generator = StubGenerator::new(GenerationKind::Mutation, vec![batch], Exhausted::Empty);

        let summary = Orchestrator::new(
            settings(out.path()),
            Arc::clone(&state),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(generator),
        )
        .with_store(TestcaseStore::new("run"))
        .run(|_| {})
        .unwrap();

        assert_eq!(summary.stats.sent, 3);
        assert_eq!(transport.deliveries(), 3);
        assert_eq!(
            saved(out.path(), "run-"),
            vec![b"c3".to_vec(), b"c4".to_vec(), b"c5".to_vec()]
        );
        assert!(matches!(summary.stop_reason, Some(StopReason::LogMatch(_))));
    }

    #[test]
    fn failed_delivery_after_external_stop_persists_the_remainder() {
        let out = tempdir().unwrap();
        let state = Arc::new(RunState::new());
        let transport = Arc::new(
            StubTransport::new(Coverage::Silent)
                .stopping_at(3, Arc::clone(&state), StopReason::LogMatch("ASAN: SEGV".into()))
                .failing_from(3),
        );
        let batch = vec![&b"c0"[..], &b"c1"[..], &b"c2"[..], &b"c3"[..], &b"c4"[..]];
        let generator = StubGenerator::new(GenerationKind::Grammar, vec![batch], Exhausted::Empty);

        let summary = Orchestrator::new(
            settings(out.path()),
            Arc::clone(&state),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(generator),
        )
        .with_store(TestcaseStore::new("run"))
        .run(|_| {})
        .unwrap();

        assert_eq!(summary.stats.sent, 2);
        assert_eq!(transport.deliveries(), 3);
        assert_eq!(
            saved(out.path(), "run-"),
            vec![b"c2".to_vec(), b"c3".to_vec(), b"c4".to_vec()]
        );
        assert!(matches!(summary.stop_reason, Some(StopReason::LogMatch(_))));
    }

    #[test]
    fn failed_calibration_after_external_stop_persists_the_remainder() {
        let out = tempdir().unwrap();
        let state = Arc::new(RunState::new());
        let bitmap = InMemoryBitmap::new();
        // "c0" takes deliveries 1 to 6 and becomes a path. "c1" is new as well,
        // and its second calibration round is delivery 9.
        let transport = Arc::new(
            StubTransport::new(Coverage::PerInput)
                .with_bitmap(bitmap.clone())
                .stopping_at(9, Arc::clone(&state), StopReason::LogMatch("ASAN: SEGV".into()))
                .failing_from(9),
        );
        let batch = vec![&b"c0"[..], &b"c1"[..], &b"c2"[..], &b"c3"[..]];
        let generator = StubGenerator::new(GenerationKind::Grammar, vec![batch], Exhausted::Empty);

        let summary = Orchestrator::new(
            settings(out.path()),
            Arc::clone(&state),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(generator),
        )
        .with_tracer(CoverageTracer::new(Box::new(bitmap), fast_poll()))
        .with_store(TestcaseStore::new("run"))
        .run(|_| {})
        .unwrap();

        assert_eq!(transport.deliveries(), 9);
        assert_eq!(summary.stats.sent, 1);
        assert_eq!(summary.stats.paths, 1);
        assert_eq!(
            saved(out.path(), "run-"),
            vec![b"c1".to_vec(), b"c2".to_vec(), b"c3".to_vec()]
        );
        assert!(matches!(summary.stop_reason, Some(StopReason::LogMatch(_))));
    }

    #[test]
    fn oracle_report_persists_the_whole_batch() {
        let out = tempdir().unwrap();
        let state = Arc::new(RunState::new());
        let generator = StubGenerator::new(
            GenerationKind::Grammar,
            vec![vec![&b"a"[..], &b"b"[..]], vec![&b"c"[..], &b"d"[..], &b"e"[..]]],
            Exhausted::Empty,
        );

        let summary = Orchestrator::new(
            settings(out.path()),
            Arc::clone(&state),
            Arc::new(StubTransport::new(Coverage::Silent)),
            Arc::new(generator),
        )
        .with_oracle(Box::new(StubOracle::firing_on(2)))
        .with_store(TestcaseStore::new("crash"))
        .run(|_| {})
        .unwrap();

        assert_eq!(summary.stats.sent, 5);
        assert_eq!(
            saved(out.path(), "crash-"),
            vec![b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]
        );
        assert_eq!(
            summary.stop_reason,
            Some(StopReason::TargetCrashed("StubOracle: target stopped answering".into()))
        );
    }

    #[test]
    fn delivery_failure_counts_as_crash() {
        let out = tempdir().unwrap();
        let state = Arc::new(RunState::new());
        let generator = StubGenerator::new(
            GenerationKind::Grammar,
            vec![vec![&b"one"[..], &b"two"[..], &b"three"[..]]],
            Exhausted::Empty,
        );

        let summary = Orchestrator::new(
            settings(out.path()),
            Arc::clone(&state),
            Arc::new(StubTransport::new(Coverage::Silent).failing_from(2)),
            Arc::new(generator),
        )
        .with_store(TestcaseStore::new("down"))
        .run(|_| {})
        .unwrap();

        assert_eq!(summary.stats.sent, 1);
        assert_eq!(
            saved(out.path(), "down-"),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        assert!(matches!(
            summary.stop_reason,
            Some(StopReason::TargetCrashed(ref detail)) if detail.contains("refused")
        ));
    }

    #[test]
    fn timeout_stops_the_run_without_evidence() {
        let out = tempdir().unwrap();
        let state = Arc::new(RunState::new());
        let generator = StubGenerator::new(GenerationKind::Grammar, vec![vec![&b"x"[..]]], Exhausted::Empty);
        let mut run_settings = settings(out.path());
        run_settings.timeout = Some(Duration::from_millis(50));
        let mut ticks = 0;

        let summary = Orchestrator::new(
            run_settings,
            Arc::clone(&state),
            Arc::new(StubTransport::new(Coverage::Silent)),
            Arc::new(generator),
        )
        .run(|_| ticks += 1)
        .unwrap();

        assert_eq!(summary.stop_reason, Some(StopReason::Timeout));
        assert!(state.stopped_by_timeout());
        assert_eq!(summary.stats.sent, 1);
        assert!(ticks > 0);
        assert_eq!(file_count(out.path()), 0);
    }

    #[test]
    fn first_worker_alone_runs_the_deterministic_pass() {
        let seeds = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::write(seeds.path().join("seed"), b"AB").unwrap();
        let state = Arc::new(RunState::new());
        let transport = Arc::new(StubTransport::new(Coverage::Silent));
        let generator =
            StubGenerator::new(GenerationKind::Mutation, Vec::new(), Exhausted::Empty).with_seed_dir(seeds.path());
        let mut run_settings = settings(out.path());
        run_settings.threads = 3;
        run_settings.deterministic = true;
        run_settings.timeout = Some(Duration::from_millis(200));

        let summary = Orchestrator::new(
            run_settings,
            Arc::clone(&state),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(generator),
        )
        .run(|_| {})
        .unwrap();

        let delivered = transport.delivered();
        assert_eq!(summary.stats.sent, 16);
        assert_eq!(delivered.len(), 16);
        assert_eq!(delivered[0], vec![0xC1, b'B']);
        assert_eq!(delivered[15], vec![b'A', 0x43]);
        assert_eq!(summary.stop_reason, Some(StopReason::Timeout));
    }

    #[test]
    fn tracing_with_several_workers_is_refused() {
        let out = tempdir().unwrap();
        let mut run_settings = settings(out.path());
        run_settings.threads = 2;
        let generator = StubGenerator::new(GenerationKind::Grammar, Vec::new(), Exhausted::Empty);

        let result = Orchestrator::new(
            run_settings,
            Arc::new(RunState::new()),
            Arc::new(StubTransport::new(Coverage::Silent)),
            Arc::new(generator),
        )
        .with_tracer(CoverageTracer::new(Box::new(InMemoryBitmap::new()), fast_poll()))
        .run(|_| {});

        assert!(matches!(result, Err(WorkerError::TracingNeedsSingleWorker(2))));
    }

    #[test]
    fn generator_failure_stops_the_run() {
        let out = tempdir().unwrap();
        let state = Arc::new(RunState::new());
        let generator = StubGenerator::new(GenerationKind::Grammar, Vec::new(), Exhausted::Fail);

        let result = Orchestrator::new(
            settings(out.path()),
            Arc::clone(&state),
            Arc::new(StubTransport::new(Coverage::Silent)),
            Arc::new(generator),
        )
        .run(|_| {});

        assert!(matches!(result, Err(WorkerError::Generator(GeneratorError::Timeout { .. }))));
        assert!(matches!(state.stop_reason(), Some(StopReason::WorkerFailed(_))));
    }

    #[test]
    fn flaky_new_coverage_is_jettisoned() {
        let seeds = tempdir().unwrap();
        let out = tempdir().unwrap();
        let state = Arc::new(RunState::new());
        let bitmap = InMemoryBitmap::new();
        let transport = Arc::new(StubTransport::new(Coverage::Clock).with_bitmap(bitmap.clone()));
        let generator = StubGenerator::new(
            GenerationKind::Mutation,
            vec![vec![&b"tick"[..]]],
            Exhausted::Stop(Arc::clone(&state), StopReason::Timeout),
        )
        .with_seed_dir(seeds.path());

        let summary = Orchestrator::new(settings(out.path()), Arc::clone(&state), transport, Arc::new(generator))
            .with_tracer(CoverageTracer::new(Box::new(bitmap), fast_poll()))
            .run(|_| {})
            .unwrap();

        assert_eq!(summary.stats.paths, 0);
        assert_eq!(summary.stats.jettisoned, 1);
        assert_eq!(file_count(seeds.path()), 0);
    }

    #[test]
    fn seed_corpus_coverage_is_counted_before_fuzzing() {
        let seeds = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::write(seeds.path().join("seed-1"), b"GET").unwrap();
        fs::write(seeds.path().join("seed-2"), b"PUT").unwrap();
        fs::write(seeds.path().join("seed-3"), b"GET").unwrap();
        let state = Arc::new(RunState::new());
        let bitmap = InMemoryBitmap::new();
        let transport = Arc::new(StubTransport::new(Coverage::PerInput).with_bitmap(bitmap.clone()));
        let generator = StubGenerator::new(
            GenerationKind::Mutation,
            Vec::new(),
            Exhausted::Stop(Arc::clone(&state), StopReason::Timeout),
        )
        .with_seed_dir(seeds.path());

        let summary = Orchestrator::new(
            settings(out.path()),
            Arc::clone(&state),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(generator),
        )
        .with_tracer(CoverageTracer::new(Box::new(bitmap), fast_poll()))
        .run(|_| {})
        .unwrap();

        // The repeated "GET" adds nothing and is not calibrated.
        assert_eq!(summary.stats.sent, 3);
        assert_eq!(summary.stats.paths, 2);
        assert_eq!(summary.stats.jettisoned, 0);
        assert_eq!(transport.deliveries(), 3 + 2 * CALIBRATION_ROUNDS);
        assert_eq!(file_count(seeds.path()), 3);
        assert_eq!(summary.stop_reason, Some(StopReason::Timeout));
    }

    #[test]
    fn seed_calibration_failure_stops_the_run() {
        let seeds = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::write(seeds.path().join("seed"), b"HELO").unwrap();
        let state = Arc::new(RunState::new());
        let bitmap = InMemoryBitmap::new();
        let transport = Arc::new(
            StubTransport::new(Coverage::Constant)
                .with_bitmap(bitmap.clone())
                .failing_from(2),
        );
        let generator =
            StubGenerator::new(GenerationKind::Mutation, Vec::new(), Exhausted::Empty).with_seed_dir(seeds.path());

        let result = Orchestrator::new(settings(out.path()), Arc::clone(&state), transport, Arc::new(generator))
            .with_tracer(CoverageTracer::new(Box::new(bitmap), fast_poll()))
            .run(|_| {});

        assert!(matches!(
            result,
            Err(WorkerError::SeedDelivery { ref reason, .. }) if reason.contains("refused")
        ));
        assert!(matches!(state.stop_reason(), Some(StopReason::WorkerFailed(_))));
        assert_eq!(file_count(out.path()), 0);
    }

    #[test]
    fn failed_calibration_resend_counts_as_crash() {
        let out = tempdir().unwrap();
        let state = Arc::new(RunState::new());
        let bitmap = InMemoryBitmap::new();
        let transport = Arc::new(
            StubTransport::new(Coverage::Constant)
                .with_bitmap(bitmap.clone())
                .failing_from(3),
        );
        let generator = StubGenerator::new(
            GenerationKind::Grammar,
            vec![vec![&b"x"[..], &b"y"[..]]],
            Exhausted::Empty,
        );

        let summary = Orchestrator::new(settings(out.path()), Arc::clone(&state), transport, Arc::new(generator))
            .with_tracer(CoverageTracer::new(Box::new(bitmap), fast_poll()))
            .with_store(TestcaseStore::new("trace"))
            .run(|_| {})
            .unwrap();

        assert_eq!(summary.stats.sent, 0);
        assert_eq!(summary.stats.paths, 0);
        assert_eq!(saved(out.path(), "trace-"), vec![b"x".to_vec(), b"y".to_vec()]);
        assert!(matches!(
            summary.stop_reason,
            Some(StopReason::TargetCrashed(ref detail)) if detail.starts_with("Transport") && detail.contains("refused")
        ));
    }
}
