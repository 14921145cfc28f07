pub mod calibrator;
pub mod config;
pub mod corpus;
pub mod executor;
pub mod feedback;
pub mod generator;
pub mod input;
pub mod mutator;
pub mod observer;
pub mod oracle;
pub mod orchestrator;
pub mod scheduler;
pub mod state;

#[cfg(test)]
pub(crate) mod test_utils;

pub use calibrator::{CALIBRATION_ROUNDS, Calibration, Calibrator};
pub use config::{ConfigError, FuzzerConfig};
pub use corpus::{CorpusError, TestcaseStore};
pub use executor::{Delivery, SendHook, SocketTransport, Transport, TransportError};
pub use feedback::{Novelty, VirginMap, classify_novelty};
pub use generator::{CaseGenerator, ExternalGenerator, GenerationKind, GeneratorError};
pub use input::{Input, Testcase};
pub use mutator::{flip_bit, flip_bits};
pub use observer::{CoverageHash, CoverageTracer, HASH_CONST, MAP_SIZE, NULL_HASH, SettleOutcome, hash32};
pub use oracle::{BugReport, CheckScriptOracle, LogMonitor, Oracle, OracleError, PidOracle};
pub use orchestrator::{Orchestrator, RunSettings, SetupError, WorkerError, WorkerPhase};
pub use scheduler::{DeterministicBatch, DeterministicSchedule, SchedulerError};
pub use state::{RunState, RunStats, RunSummary, StopReason};
