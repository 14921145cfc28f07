use crate::feedback::{Novelty, VirginMap, classify_novelty};
use std::io;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Size in bytes of the shared coverage bitmap written by instrumented targets.
pub const MAP_SIZE: usize = 1 << 16;

/// Seed for [`hash32`].
pub const HASH_CONST: u32 = 0xa5b3_5705;

/// Hash of an all-zero bitmap, i.e. a delivery that produced no coverage at all.
pub const NULL_HASH: CoverageHash = 2_982_225_436;

pub type CoverageHash = u32;

/// Errors raised while establishing coverage tracing.
#[derive(Error, Debug)]
pub enum TraceError {
    /// The shared memory segment could not be attached to this process.
    #[error("Failed to attach shared memory segment {shm_id}: {source}")]
    Attach { shm_id: i32, source: io::Error },

    /// `shmat` reported success but handed back a null mapping.
    #[error("Shared memory segment {0} mapped to a null address")]
    NullMapping(i32),
}

/// Read access to a coverage bitmap of [`MAP_SIZE`] bytes.
///
/// The bitmap is written by the target; the harness only ever clears it before a
/// delivery and copies it out afterwards.
pub trait CoverageMap: Send {
    /// Zeroes the whole bitmap.
    fn clear(&mut self);

    /// Copies the current bitmap contents into `dst`.
    ///
    /// Copies `min(dst.len(), MAP_SIZE)` bytes.
    fn snapshot(&self, dst: &mut [u8]);
}

/// A coverage bitmap living in a System V shared memory segment created by the
/// party launching the instrumented target.
#[derive(Debug)]
pub struct ShmBitmap {
    ptr: NonNull<u8>,
    shm_id: i32,
}

// The mapping is process-wide and owned by exactly one `ShmBitmap`.
unsafe impl Send for ShmBitmap {}

impl ShmBitmap {
    pub fn attach(shm_id: i32) -> Result<Self, TraceError> {
        // SAFETY: shmat either maps the segment or returns (void*)-1.
        let raw = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
        if raw as isize == -1 {
            return Err(TraceError::Attach {
                shm_id,
                source: io::Error::last_os_error(),
            });
        }
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or(TraceError::NullMapping(shm_id))?;
        debug!(shm_id, "attached coverage bitmap");
        Ok(Self { ptr, shm_id })
    }

    pub fn shm_id(&self) -> i32 {
        self.shm_id
    }
}

impl CoverageMap for ShmBitmap {
    fn clear(&mut self) {
        // SAFETY: the segment is at least MAP_SIZE bytes and stays mapped until drop.
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), 0, MAP_SIZE) };
    }

    fn snapshot(&self, dst: &mut [u8]) {
        let len = dst.len().min(MAP_SIZE);
        // SAFETY: see `clear`; `dst` is a distinct local buffer.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), dst.as_mut_ptr(), len) };
    }
}

impl Drop for ShmBitmap {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from a successful shmat and is detached exactly once.
        let rc = unsafe { libc::shmdt(self.ptr.as_ptr().cast::<libc::c_void>()) };
        if rc != 0 {
            debug!(
                shm_id = self.shm_id,
                error = %io::Error::last_os_error(),
                "failed to detach coverage bitmap"
            );
        }
    }
}

/// A heap-backed bitmap that can be shared with a thread playing the target.
///
/// Clones refer to the same cells, so a stub transport can write coverage that
/// the tracer then observes.
#[derive(Debug, Clone)]
pub struct InMemoryBitmap {
    cells: Arc<Mutex<Vec<u8>>>,
}

impl InMemoryBitmap {
    pub fn new() -> Self {
        Self {
            cells: Arc::new(Mutex::new(vec![0u8; MAP_SIZE])),
        }
    }

    /// Runs `f` with exclusive access to the bitmap cells.
    pub fn update<F: FnOnce(&mut [u8])>(&self, f: F) {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut cells);
    }
}

impl Default for InMemoryBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl CoverageMap for InMemoryBitmap {
    fn clear(&mut self) {
        self.update(|cells| cells.fill(0));
    }

    fn snapshot(&self, dst: &mut [u8]) {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        let len = dst.len().min(cells.len());
        dst[..len].copy_from_slice(&cells[..len]);
    }
}

/// 32-bit hash of a bitmap, mixing it 64 bits at a time (MurmurHash3 x64 body
/// and finalizer, truncated). `map.len()` must be a multiple of 8.
pub fn hash32(map: &[u8], seed: u32) -> u32 {
    let mut h1 = (seed ^ map.len() as u32) as u64;

    for word in map.chunks_exact(8) {
        let mut k1 = u64::from_le_bytes([
            word[0], word[1], word[2], word[3], word[4], word[5], word[6], word[7],
        ]);
        k1 = k1.wrapping_mul(0x87c3_7b91_1142_53d5);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(0x4cf5_ad43_2745_937f);

        h1 ^= k1;
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);
    }

    h1 ^= h1 >> 33;
    h1 = h1.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h1 ^= h1 >> 33;
    h1 = h1.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h1 ^= h1 >> 33;

    h1 as u32
}

/// Timing of the bitmap settle loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Sleep between polls while the bitmap is still empty.
    pub empty_interval: Duration,
    /// Sleep between polls while the hash is still changing.
    pub settle_interval: Duration,
    /// Empty polls after which the delivery is declared coverage-less.
    pub max_empty_polls: u32,
    /// Changing polls after which the bitmap is declared unstable.
    pub max_unsettled_polls: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            empty_interval: Duration::from_millis(10),
            settle_interval: Duration::from_millis(50),
            max_empty_polls: 200,
            max_unsettled_polls: 200,
        }
    }
}

/// Result of waiting for the target to finish writing coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Two consecutive polls produced the same non-empty hash.
    Settled(CoverageHash),
    /// The bitmap stayed empty for the whole empty-poll budget.
    Empty,
    /// The hash kept changing for the whole settle budget.
    Unsettled,
}

impl SettleOutcome {
    /// The raw hash value: [`NULL_HASH`] for `Empty`, `0` for `Unsettled`.
    pub fn raw(self) -> CoverageHash {
        match self {
            SettleOutcome::Settled(hash) => hash,
            SettleOutcome::Empty => NULL_HASH,
            SettleOutcome::Unsettled => 0,
        }
    }
}

/// Owns the coverage bitmap and the cumulative virgin map of a run.
///
/// Only one worker may hold the tracer; it is moved into that worker's thread.
pub struct CoverageTracer {
    map: Box<dyn CoverageMap>,
    virgin: VirginMap,
    scratch: Vec<u8>,
    poll: PollSettings,
}

impl CoverageTracer {
    /// Attaches the shared memory segment `shm_id` and starts with a pristine virgin map.
    pub fn acquire(shm_id: i32, poll: PollSettings) -> Result<Self, TraceError> {
        let map = ShmBitmap::attach(shm_id)?;
        Ok(Self::new(Box::new(map), poll))
    }

    pub fn new(map: Box<dyn CoverageMap>, poll: PollSettings) -> Self {
        Self {
            map,
            virgin: VirginMap::new(),
            scratch: vec![0u8; MAP_SIZE],
            poll,
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn virgin(&self) -> &VirginMap {
        &self.virgin
    }

    /// Polls the bitmap until its hash stops changing.
    ///
    /// Empty polls sleep `empty_interval` and count towards `max_empty_polls` for
    /// the whole call; changing polls sleep `settle_interval` and count towards
    /// `max_unsettled_polls`.
    pub fn await_stable_hash(&mut self) -> SettleOutcome {
        let mut previous: Option<CoverageHash> = None;
        let mut empty_polls = 0u32;
        let mut unsettled_polls = 0u32;

        loop {
            self.map.snapshot(&mut self.scratch);
            let hash = hash32(&self.scratch, HASH_CONST);

            if hash == NULL_HASH {
                empty_polls += 1;
                if empty_polls >= self.poll.max_empty_polls {
                    trace!(empty_polls, "bitmap stayed empty");
                    return SettleOutcome::Empty;
                }
                std::thread::sleep(self.poll.empty_interval);
                continue;
            }

            if previous == Some(hash) {
                return SettleOutcome::Settled(hash);
            }

            previous = Some(hash);
            unsettled_polls += 1;
            if unsettled_polls >= self.poll.max_unsettled_polls {
                debug!(unsettled_polls, "bitmap hash never settled");
                return SettleOutcome::Unsettled;
            }
            std::thread::sleep(self.poll.settle_interval);
        }
    }

    /// Classifies the current bitmap against the virgin map, absorbing it.
    pub fn classify(&mut self) -> Novelty {
        self.map.snapshot(&mut self.scratch);
        classify_novelty(&mut self.virgin, &self.scratch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    fn fast_poll() -> PollSettings {
        PollSettings {
            empty_interval: Duration::from_millis(1),
            settle_interval: Duration::from_millis(20),
            max_empty_polls: 200,
            max_unsettled_polls: 200,
        }
    }

    /// A bitmap whose contents follow a fixed script, one state per snapshot.
    struct ScriptedMap {
        states: Vec<Vec<u8>>,
        polls: Arc<Mutex<usize>>,
    }

    impl CoverageMap for ScriptedMap {
        fn clear(&mut self) {}

        fn snapshot(&self, dst: &mut [u8]) {
            let mut polls = self.polls.lock().unwrap();
            let state = &self.states[(*polls).min(self.states.len() - 1)];
            dst.copy_from_slice(state);
            *polls += 1;
        }
    }

    fn map_with(cells: &[(usize, u8)]) -> Vec<u8> {
        let mut map = vec![0u8; MAP_SIZE];
        for &(idx, val) in cells {
            map[idx] = val;
        }
        map
    }

    #[test]
    fn hash32_matches_known_values() {
        assert_eq!(hash32(&vec![0u8; MAP_SIZE], HASH_CONST), NULL_HASH);
        assert_eq!(hash32(&map_with(&[(0, 1)]), HASH_CONST), 3_581_344_931);
        assert_eq!(
            hash32(&map_with(&[(7, 1), (100, 3)]), HASH_CONST),
            402_168_412
        );
    }

    #[test]
    fn hash32_is_sensitive_to_hit_counts() {
        let once = hash32(&map_with(&[(42, 1)]), HASH_CONST);
        let twice = hash32(&map_with(&[(42, 2)]), HASH_CONST);
        assert_ne!(once, twice);
        assert_ne!(once, NULL_HASH);
    }

    #[test]
    fn in_memory_bitmap_clones_share_cells() {
        let writer = InMemoryBitmap::new();
        let mut reader = writer.clone();
        writer.update(|cells| cells[5] = 9);

        let mut dst = vec![0u8; MAP_SIZE];
        reader.snapshot(&mut dst);
        assert_eq!(dst[5], 9);

        reader.clear();
        writer.snapshot(&mut dst);
        assert!(dst.iter().all(|&b| b == 0), "clear should zero every cell");
    }

    #[test]
    fn empty_bitmap_returns_null_sentinel_within_poll_bound() {
        let polls = Arc::new(Mutex::new(0));
        let map = ScriptedMap {
            states: vec![vec![0u8; MAP_SIZE]],
            polls: Arc::clone(&polls),
        };
        let mut tracer = CoverageTracer::new(Box::new(map), fast_poll());

        let outcome = tracer.await_stable_hash();
        assert_eq!(outcome, SettleOutcome::Empty);
        assert_eq!(outcome.raw(), NULL_HASH);
        assert_eq!(*polls.lock().unwrap(), 200, "should stop after exactly 200 polls");
    }

    #[test]
    fn shared_empty_bitmap_returns_null_sentinel() {
        let mut tracer = CoverageTracer::new(Box::new(InMemoryBitmap::new()), fast_poll());
        let start = Instant::now();
        assert_eq!(tracer.await_stable_hash(), SettleOutcome::Empty);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn changing_bitmap_settles_once_two_polls_agree() {
        let polls = Arc::new(Mutex::new(0));
        let states = vec![
            map_with(&[(1, 1)]),
            map_with(&[(1, 2)]),
            map_with(&[(1, 3)]),
            map_with(&[(1, 3), (9, 1)]),
        ];
        let expected = hash32(&states[3], HASH_CONST);
        let map = ScriptedMap {
            states,
            polls: Arc::clone(&polls),
        };
        let mut tracer = CoverageTracer::new(Box::new(map), fast_poll());

        assert_eq!(tracer.await_stable_hash(), SettleOutcome::Settled(expected));
        assert_eq!(*polls.lock().unwrap(), 5);
    }

    #[test]
    fn never_settling_bitmap_returns_zero_sentinel() {
        let states: Vec<Vec<u8>> = (1..=5u8).map(|n| map_with(&[(3, n)])).collect();
        let map = ScriptedMap {
            states,
            polls: Arc::new(Mutex::new(0)),
        };
        let poll = PollSettings {
            max_unsettled_polls: 3,
            settle_interval: Duration::from_millis(1),
            ..fast_poll()
        };
        let mut tracer = CoverageTracer::new(Box::new(map), poll);

        let outcome = tracer.await_stable_hash();
        assert_eq!(outcome, SettleOutcome::Unsettled);
        assert_eq!(outcome.raw(), 0);
    }

    #[test]
    fn settles_shortly_after_concurrent_writer_stops() {
        let bitmap = InMemoryBitmap::new();
        let writer = bitmap.clone();
        let done = Arc::new(AtomicBool::new(false));
        let done_writer = Arc::clone(&done);
        let poll = fast_poll();

        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let mut counter: u8 = 0;
            while start.elapsed() < Duration::from_millis(150) {
                counter = counter.wrapping_add(1).max(1);
                writer.update(|cells| {
                    cells[10] = counter;
                    cells[11] = cells[11].wrapping_add(1);
                });
                std::thread::sleep(Duration::from_millis(1));
            }
            done_writer.store(true, Ordering::SeqCst);
            Instant::now()
        });

        // Wait until the writer has produced coverage so the loop starts on a
        // changing map rather than an empty one.
        while hash_of(&bitmap) == NULL_HASH {
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut tracer = CoverageTracer::new(Box::new(bitmap.clone()), poll);
        let outcome = tracer.await_stable_hash();
        let returned_at = Instant::now();
        let stopped_at = handle.join().unwrap();

        assert!(done.load(Ordering::SeqCst));
        assert_eq!(outcome, SettleOutcome::Settled(hash_of(&bitmap)));
        assert!(
            returned_at.duration_since(stopped_at) <= poll.settle_interval * 2 + Duration::from_millis(20),
            "settled hash should follow the last write within two intervals"
        );
    }

    fn hash_of(bitmap: &InMemoryBitmap) -> CoverageHash {
        let mut dst = vec![0u8; MAP_SIZE];
        bitmap.snapshot(&mut dst);
        hash32(&dst, HASH_CONST)
    }

    #[test]
    fn tracer_classify_absorbs_current_bitmap() {
        let bitmap = InMemoryBitmap::new();
        let mut tracer = CoverageTracer::new(Box::new(bitmap.clone()), fast_poll());
        bitmap.update(|cells| cells[77] = 1);

        assert_eq!(tracer.classify(), Novelty::NewEdge);
        assert_eq!(tracer.classify(), Novelty::NoChange);

        tracer.clear();
        let mut dst = vec![0u8; MAP_SIZE];
        bitmap.snapshot(&mut dst);
        assert_eq!(dst[77], 0);
    }
}
