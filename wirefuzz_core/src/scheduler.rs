use crate::input::Testcase;
use crate::mutator::flip_bits;
use thiserror::Error;

/// Errors that can occur while setting up a deterministic schedule.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    /// A batch must hold at least one testcase.
    #[error("Deterministic batch size must be greater than zero")]
    ZeroBatchSize,
    /// The requested resume offset lies beyond the seed's bit space.
    #[error("Resume offset {offset} exceeds the {total_bits}-bit search space")]
    OffsetOutOfRange { offset: usize, total_bits: usize },
}

/// One batch of deterministic mutations, starting at bit `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterministicBatch {
    pub offset: usize,
    pub cases: Vec<Testcase>,
}

/// Exhaustive single-bit-flip sweep over a seed, streamed in fixed-size batches.
///
/// The search space is `seed.len() * 8` bits. Each call to `next` materializes
/// only one batch, so the caller can deliver and feed it back before asking
/// for the next. The last batch holds the exact remainder when the space is not
/// a multiple of the batch size.
#[derive(Debug, Clone)]
pub struct DeterministicSchedule {
    seed: Vec<u8>,
    batch_size: usize,
    offset: usize,
}

impl DeterministicSchedule {
    /// Starts a sweep at bit 0.
    pub fn new(seed: Vec<u8>, batch_size: usize) -> Result<Self, SchedulerError> {
        Self::resume(seed, batch_size, 0)
    }

    /// Starts a sweep at bit `offset`, as if every earlier batch had already
    /// been delivered.
    pub fn resume(seed: Vec<u8>, batch_size: usize, offset: usize) -> Result<Self, SchedulerError> {
        if batch_size == 0 {
            return Err(SchedulerError::ZeroBatchSize);
        }
        let total_bits = seed.len() * 8;
        if offset > total_bits {
            return Err(SchedulerError::OffsetOutOfRange { offset, total_bits });
        }
        Ok(Self {
            seed,
            batch_size,
            offset,
        })
    }

    pub fn total_bits(&self) -> usize {
        self.seed.len() * 8
    }

    /// Bit position the next batch starts at.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.total_bits() - self.offset
    }

    pub fn seed(&self) -> &[u8] {
        &self.seed
    }
}

impl Iterator for DeterministicSchedule {
    type Item = DeterministicBatch;

    fn next(&mut self) -> Option<Self::Item> {
        let count = self.remaining().min(self.batch_size);
        if count == 0 {
            return None;
        }
        let batch = DeterministicBatch {
            offset: self.offset,
            cases: flip_bits(&self.seed, self.offset, count),
        };
        self.offset += count;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let batches = self.remaining().div_ceil(self.batch_size);
        (batches, Some(batches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Input;
    use crate::mutator::flip_bit;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    #[test]
    fn two_byte_seed_with_batch_of_five_yields_remainder_batch() {
        let schedule = DeterministicSchedule::new(b"AB".to_vec(), 5).unwrap();
        assert_eq!(schedule.size_hint(), (4, Some(4)));

        let batches: Vec<DeterministicBatch> = schedule.collect();
        let sizes: Vec<usize> = batches.iter().map(|b| b.cases.len()).collect();
        assert_eq!(sizes, vec![5, 5, 5, 1]);
        assert_eq!(
            batches.iter().map(|b| b.offset).collect::<Vec<_>>(),
            vec![0, 5, 10, 15]
        );
        assert_eq!(batches[0].cases[0].as_bytes(), &[0xC1, 0x42]);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert_eq!(
            DeterministicSchedule::new(b"AB".to_vec(), 0).unwrap_err(),
            SchedulerError::ZeroBatchSize
        );
    }

    #[test]
    fn resume_continues_where_a_sweep_left_off() {
        let mut full = DeterministicSchedule::new(b"xyz".to_vec(), 4).unwrap();
        full.next();
        full.next();
        let rest_from_full: Vec<DeterministicBatch> = full.collect();

        let resumed = DeterministicSchedule::resume(b"xyz".to_vec(), 4, 8).unwrap();
        assert_eq!(resumed.remaining(), 16);
        assert_eq!(resumed.collect::<Vec<_>>(), rest_from_full);
    }

    #[test]
    fn resume_past_end_is_rejected_and_resume_at_end_is_empty() {
        assert_eq!(
            DeterministicSchedule::resume(b"A".to_vec(), 4, 9).unwrap_err(),
            SchedulerError::OffsetOutOfRange {
                offset: 9,
                total_bits: 8
            }
        );
        let mut at_end = DeterministicSchedule::resume(b"A".to_vec(), 4, 8).unwrap();
        assert!(at_end.next().is_none());
    }

    #[test]
    fn empty_seed_has_no_batches() {
        let mut schedule = DeterministicSchedule::new(Vec::new(), 3).unwrap();
        assert!(schedule.next().is_none());
    }

    #[test]
    fn concatenated_batches_cover_every_bit_exactly_once() {
        let mut rng = ChaCha8Rng::from_seed([42u8; 32]);

        for _ in 0..40 {
            let len = rng.random_range(1..24);
            let seed: Vec<u8> = (0..len).map(|_| rng.random::<u8>()).collect();
            let batch_size = rng.random_range(1..40);

            let schedule = DeterministicSchedule::new(seed.clone(), batch_size).unwrap();
            let outputs: Vec<Testcase> = schedule.flat_map(|b| b.cases).collect();
            assert_eq!(outputs.len(), len * 8, "batch size {batch_size}, len {len}");

            let mut seen = HashSet::new();
            for (bit, case) in outputs.iter().enumerate() {
                let diff: u32 = case
                    .as_bytes()
                    .iter()
                    .zip(&seed)
                    .map(|(a, b)| (a ^ b).count_ones())
                    .sum();
                assert_eq!(diff, 1, "output {bit} should differ in exactly one bit");

                let mut restored = case.as_bytes().to_vec();
                flip_bit(&mut restored, bit);
                assert_eq!(restored, seed, "re-flipping bit {bit} should restore the seed");
                assert!(seen.insert(case.as_bytes().to_vec()), "duplicate output at bit {bit}");
            }
        }
    }
}
