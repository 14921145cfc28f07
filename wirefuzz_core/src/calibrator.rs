use crate::executor::Transport;
use crate::input::Testcase;
use crate::observer::{CoverageHash, CoverageTracer, SettleOutcome};
use tracing::debug;

/// Deliveries made of every candidate, including the first.
pub const CALIBRATION_ROUNDS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Calibration {
    /// Every round settled on this hash.
    Deterministic(CoverageHash),
    /// Coverage was empty, never settled, or differed between rounds.
    Flaky,
    /// A delivery failed outright; treated as a crash signal upstream.
    DeliveryFailed(String),
}

/// Confirms that a testcase produces the same coverage every time it is sent.
#[derive(Debug, Clone, Copy)]
pub struct Calibrator {
    rounds: usize,
}

impl Calibrator {
    pub fn new() -> Self {
        Self {
            rounds: CALIBRATION_ROUNDS,
        }
    }

    /// Sends `testcase` once to obtain a reference hash, then resends it for the
    /// remaining rounds, clearing the bitmap before each delivery.
    ///
    /// An empty or unsettled first hash is `Flaky` without further rounds, as is
    /// the first later round whose hash differs.
    pub fn calibrate(
        &self,
        tracer: &mut CoverageTracer,
        transport: &dyn Transport,
        testcase: &Testcase,
    ) -> Calibration {
        let reference = match Self::round(tracer, transport, testcase) {
            Ok(SettleOutcome::Settled(hash)) => hash,
            Ok(outcome) => {
                debug!(?outcome, digest = %testcase.digest(), "no usable reference hash");
                return Calibration::Flaky;
            }
            Err(reason) => return Calibration::DeliveryFailed(reason),
        };

        for round in 1..self.rounds {
            match Self::round(tracer, transport, testcase) {
                Ok(SettleOutcome::Settled(hash)) if hash == reference => {}
                Ok(outcome) => {
                    debug!(round, reference, observed = outcome.raw(), "coverage differs between rounds");
                    return Calibration::Flaky;
                }
                Err(reason) => return Calibration::DeliveryFailed(reason),
            }
        }
        Calibration::Deterministic(reference)
    }

    fn round(
        tracer: &mut CoverageTracer,
        transport: &dyn Transport,
        testcase: &Testcase,
    ) -> Result<SettleOutcome, String> {
        tracer.clear();
        transport.deliver(testcase).map_err(|e| e.to_string())?;
        Ok(tracer.await_stable_hash())
    }
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::new()
    }
}
