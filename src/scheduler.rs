use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::constants::METADATA_BYTES;
use crate::slot;

/// The view of a slot schedule that control strategies and the round coordinator need.
pub trait Scheduler {
    /// Number of slots in the round.
    fn slot_count(&self) -> usize;

    /// Whether nothing is assigned to slot `index`.
    fn is_empty(&self, index: usize) -> bool;

    /// Payload length assigned to slot `index`, 0 when empty.
    fn length(&self, index: usize) -> usize;

    /// Copies the content of slot `index` into `buffer` and stamps its header. Leaves an empty
    /// slot untouched, which is the zero-length, zero-checksum marker for a zeroed buffer.
    fn write_slot(&self, index: usize, buffer: &mut [u8]);
}

/// Bloom filter sizing for an expected element count and false positive rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloomParameters {
    /// Number of slots, `m`.
    pub slots: usize,
    /// Number of hash functions, `k`.
    pub hashes: usize,
}

impl BloomParameters {
    /// `m = ceil(-n ln p / ln(2)^2)` and `k = round((m / n) ln 2)`, with both at least 1.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dcnet::scheduler::BloomParameters;
    ///
    /// let params = BloomParameters::estimate(32, 0.05);
    /// assert_eq!(params.slots, 200);
    /// assert_eq!(params.hashes, 4);
    /// ```
    pub fn estimate(elements: usize, fpr: f64) -> Self {
        let n = elements.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * fpr.ln() / (ln2 * ln2)).ceil().max(1.0);
        let k = ((m / n) * ln2).round().max(1.0);
        BloomParameters {
            slots: m as usize,
            hashes: k as usize,
        }
    }

    /// The distinct candidate slots for `element`, in hash order.
    ///
    /// Uses double hashing over the SHA-256 digest of the element: candidate `i` is
    /// `(h1 + i * h2) mod m`.
    pub fn candidates(&self, element: &[u8]) -> Vec<usize> {
        if self.slots == 0 {
            return Vec::new();
        }

        let digest = Sha256::digest(element);
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        let h1 = u64::from_be_bytes(word);
        word.copy_from_slice(&digest[8..16]);
        let h2 = u64::from_be_bytes(word);

        let m = self.slots as u64;
        let mut indices = Vec::with_capacity(self.hashes);
        for i in 0..self.hashes as u64 {
            let index = (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize;
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        indices
    }
}

/// Assigns a client's elements to slots by Bloom filter hashing.
///
/// Elements are queued with [`ElementScheduler::add`] and placed by
/// [`ElementScheduler::finalize`]. When two elements land in the same slot the later one
/// silently wins; the clash between clients is only ever discovered by the slot checksum.
pub struct ElementScheduler {
    params: BloomParameters,
    payload_capacity: usize,
    elements: Vec<Vec<u8>>,
    slots: Vec<Option<usize>>,
    failures: Vec<usize>,
    filled: usize,
    rng: StdRng,
}

impl ElementScheduler {
    /// A scheduler sized for `elements` expected elements at false positive rate `fpr`, for
    /// slots of `slot_length` bytes (header included).
    pub fn new(elements: usize, fpr: f64, slot_length: usize) -> Self {
        Self::with_rng(elements, fpr, slot_length, StdRng::from_entropy())
    }

    /// Like [`ElementScheduler::new`], drawing the placement sample from `rng`.
    ///
    /// # Arguments
    ///
    /// * `elements` - Expected number of elements per round, `n`.
    /// * `fpr` - Target false positive rate, `p`.
    /// * `slot_length` - Slot length in bytes, header included. Elements longer than the
    ///   payload capacity are refused by [`ElementScheduler::add`].
    /// * `rng` - Source of the partial shuffle in [`ElementScheduler::finalize`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dcnet::scheduler::{ElementScheduler, Scheduler};
    /// use rand::rngs::StdRng;
    /// use rand::SeedableRng;
    ///
    /// let mut scheduler = ElementScheduler::with_rng(32, 0.05, 512, StdRng::seed_from_u64(1));
    /// assert!(scheduler.add(b"hello"));
    /// assert!(!scheduler.finalize(Some(2)));
    /// assert!((1..=2).contains(&scheduler.filled_count()));
    /// assert_eq!(scheduler.slot_count(), 200);
    /// ```
    pub fn with_rng(elements: usize, fpr: f64, slot_length: usize, rng: StdRng) -> Self {
        let params = BloomParameters::estimate(elements, fpr);
        ElementScheduler {
            params,
            payload_capacity: slot::payload_capacity(slot_length),
            elements: Vec::new(),
            slots: vec![None; params.slots],
            failures: Vec::new(),
            filled: 0,
            rng,
        }
    }

    pub fn parameters(&self) -> BloomParameters {
        self.params
    }

    /// Queues an element for this round. Returns false, and keeps nothing, for an empty
    /// element or one that does not fit a slot payload.
    pub fn add(&mut self, element: &[u8]) -> bool {
        if element.is_empty() || element.len() > self.payload_capacity {
            return false;
        }
        self.elements.push(element.to_vec());
        true
    }

    /// Places every queued element, returning true if any element could not be placed.
    ///
    /// Each element goes to at most `slots_per_element` of its candidate slots, picked
    /// uniformly at random. `None` or `Some(0)` means no limit.
    pub fn finalize(&mut self, slots_per_element: Option<usize>) -> bool {
        let limit = match slots_per_element {
            Some(0) | None => usize::MAX,
            Some(limit) => limit,
        };

        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.failures.clear();
        self.filled = 0;

        for (element_index, element) in self.elements.iter().enumerate() {
            let mut candidates = self.params.candidates(element);
            if candidates.is_empty() {
                debug!("element {} has no candidate slot", element_index);
                self.failures.push(element_index);
                continue;
            }

            // Partial Fisher-Yates: the first `take` entries become a uniform sample.
            let take = limit.min(candidates.len());
            for i in 0..take {
                let j = self.rng.gen_range(i..candidates.len());
                candidates.swap(i, j);
            }

            for &index in &candidates[..take] {
                self.slots[index] = Some(element_index);
                self.filled += 1;
            }
        }

        !self.failures.is_empty()
    }

    /// Indices (in insertion order) of the elements the last `finalize` could not place.
    pub fn failures(&self) -> &[usize] {
        &self.failures
    }

    /// Number of slot assignments made, overwrites included.
    pub fn filled_count(&self) -> usize {
        self.filled
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// The element assigned to slot `index`, if any.
    pub fn element(&self, index: usize) -> Option<&[u8]> {
        self.slots
            .get(index)
            .copied()
            .flatten()
            .map(|element| self.elements[element].as_slice())
    }
}

impl Scheduler for ElementScheduler {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn is_empty(&self, index: usize) -> bool {
        self.element(index).is_none()
    }

    fn length(&self, index: usize) -> usize {
        self.element(index).map_or(0, |element| element.len())
    }

    fn write_slot(&self, index: usize, buffer: &mut [u8]) {
        if let Some(element) = self.element(index) {
            buffer[METADATA_BYTES..METADATA_BYTES + element.len()].copy_from_slice(element);
            slot::encode(buffer, element.len());
        }
    }
}

/// The schedule of a server, which owns no content: every slot is empty.
pub struct ServerScheduler {
    slot_count: usize,
}

impl ServerScheduler {
    pub fn new(slot_count: usize) -> Self {
        ServerScheduler { slot_count }
    }

    /// A server schedule sized the same way clients size theirs.
    pub fn for_round(elements: usize, fpr: f64) -> Self {
        Self::new(BloomParameters::estimate(elements, fpr).slots)
    }
}

impl Scheduler for ServerScheduler {
    fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn is_empty(&self, _index: usize) -> bool {
        true
    }

    fn length(&self, _index: usize) -> usize {
        0
    }

    fn write_slot(&self, _index: usize, _buffer: &mut [u8]) {}
}


#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(elements: usize, seed: u64) -> ElementScheduler {
        ElementScheduler::with_rng(elements, 0.05, 512, StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_bloom_parameters() {
        let params = BloomParameters::estimate(32, 0.05);
        let ln2 = std::f64::consts::LN_2;
        let minimum = (-32.0 * 0.05f64.ln() / (ln2 * ln2)).ceil() as usize;
        assert!(params.slots >= minimum);
        assert_eq!(
            params.hashes,
            ((params.slots as f64 / 32.0) * ln2).round() as usize
        );
        assert!(params.hashes >= 1);
    }

    #[test]
    fn test_candidates_are_distinct_and_deterministic() {
        let params = BloomParameters::estimate(32, 0.05);
        let a = params.candidates(b"element");
        let b = params.candidates(b"element");
        assert_eq!(a, b);
        assert!(!a.is_empty() && a.len() <= params.hashes);
        assert!(a.iter().all(|&i| i < params.slots));
        let mut sorted = a.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), a.len());
    }

    #[test]
    fn test_add_rejects_malformed() {
        let mut scheduler = seeded(4, 1);
        assert!(!scheduler.add(b""));
        assert!(!scheduler.add(&[1u8; 501]));
        assert!(scheduler.add(&[1u8; 500]));
        assert_eq!(scheduler.element_count(), 1);
    }

    #[test]
    fn test_finalize_places_every_element() {
        let mut scheduler = seeded(32, 7);
        for i in 0..10 {
            assert!(scheduler.add(format!("{}", i).as_bytes()));
        }
        assert!(!scheduler.finalize(None));
        assert!(scheduler.failures().is_empty());

        let occupied = (0..scheduler.slot_count())
            .filter(|&i| !scheduler.is_empty(i))
            .count();
        assert!(occupied > 0);
        assert!(occupied <= scheduler.filled_count());
    }

    #[test]
    fn test_slots_per_element_limit() {
        let mut scheduler = seeded(32, 9);
        scheduler.add(b"only");
        scheduler.finalize(Some(1));

        let occupied: Vec<usize> = (0..scheduler.slot_count())
            .filter(|&i| !scheduler.is_empty(i))
            .collect();
        assert_eq!(occupied.len(), 1);
        assert!(scheduler
            .parameters()
            .candidates(b"only")
            .contains(&occupied[0]));
    }

    #[test]
    fn test_last_write_wins() {
        let mut scheduler = seeded(32, 3);
        let params = scheduler.parameters();

        // Find two elements sharing a candidate slot.
        let first = b"a".to_vec();
        let first_slots = params.candidates(&first);
        let second = (0..10_000)
            .map(|i| format!("b{}", i).into_bytes())
            .find(|e| params.candidates(e).iter().any(|i| first_slots.contains(i)))
            .unwrap();
        let shared = *params
            .candidates(&second)
            .iter()
            .find(|i| first_slots.contains(i))
            .unwrap();

        scheduler.add(&first);
        scheduler.add(&second);
        scheduler.finalize(None);
        assert_eq!(scheduler.element(shared), Some(second.as_slice()));
    }

    #[test]
    fn test_write_slot() {
        let mut scheduler = seeded(32, 5);
        scheduler.add(b"payload");
        scheduler.finalize(None);
        let index = (0..scheduler.slot_count())
            .find(|&i| !scheduler.is_empty(i))
            .unwrap();

        let mut buffer = vec![0u8; 512];
        scheduler.write_slot(index, &mut buffer);
        let meta = slot::decode(&buffer);
        assert_eq!(meta.length, 7);
        assert!(meta.valid);
        assert_eq!(slot::to_bytes(&buffer), b"payload");
        assert_eq!(scheduler.length(index), 7);

        let empty = (0..scheduler.slot_count())
            .find(|&i| scheduler.is_empty(i))
            .unwrap();
        let mut buffer = vec![0u8; 512];
        scheduler.write_slot(empty, &mut buffer);
        assert!(slot::is_zeroed(&buffer));
        assert_eq!(scheduler.length(empty), 0);
    }

    #[test]
    fn test_server_scheduler_is_empty() {
        let scheduler = ServerScheduler::for_round(32, 0.05);
        assert_eq!(scheduler.slot_count(), 200);
        assert!((0..200).all(|i| scheduler.is_empty(i) && scheduler.length(i) == 0));
    }
}
