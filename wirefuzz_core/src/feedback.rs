use crate::observer::MAP_SIZE;

/// How much new coverage a bitmap contributed relative to everything seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Novelty {
    NoChange,
    /// Only hit-count buckets of already known edges changed.
    HitCountOnly,
    /// At least one edge was hit for the first time.
    NewEdge,
}

/// Cumulative record of coverage bits never observed during this run.
///
/// Starts as all ones. Observed bits are cleared and never set again, so a
/// cleared bit means the corresponding edge/hit-count bucket has been seen.
#[derive(Debug, Clone)]
pub struct VirginMap {
    bits: Vec<u8>,
}

impl VirginMap {
    pub fn new() -> Self {
        Self {
            bits: vec![0xFF; MAP_SIZE],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of map bytes that have seen at least one hit.
    pub fn touched_bytes(&self) -> usize {
        self.bits.iter().filter(|&&b| b != 0xFF).count()
    }
}

impl Default for VirginMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Compares `trace` against `virgin`, returning the strongest novelty found and
/// clearing every observed bit from `virgin`.
///
/// Works a 64-bit word at a time; words with nothing new are skipped cheaply.
pub fn classify_novelty(virgin: &mut VirginMap, trace: &[u8]) -> Novelty {
    let mut novelty = Novelty::NoChange;

    for (vir_word, cur_word) in virgin.bits.chunks_exact_mut(8).zip(trace.chunks_exact(8)) {
        let cur = u64::from_ne_bytes(word(cur_word));
        let vir = u64::from_ne_bytes(word(vir_word));

        if cur & vir == 0 {
            continue;
        }

        if novelty < Novelty::NewEdge {
            let fresh_edge = cur_word
                .iter()
                .zip(vir_word.iter())
                .any(|(&c, &v)| c != 0 && v == 0xFF);
            novelty = novelty.max(if fresh_edge {
                Novelty::NewEdge
            } else {
                Novelty::HitCountOnly
            });
        }

        vir_word.copy_from_slice(&(vir & !cur).to_ne_bytes());
    }

    novelty
}

fn word(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}
