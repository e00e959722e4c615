//! Hashed hit counters for guard failures.
//!
//! Counters are addressed by a 32-bit hash; the top `bits` bits select the
//! slot. Distinct keys may share a slot. That only shifts when a trace is
//! started and never affects correctness.

/// Table of failure counters shared by every guard of a context.
#[derive(Debug, Clone)]
pub struct JitCounter {
    shift: u32,
    counters: Vec<u32>,
    next_hash: u32,
}

impl JitCounter {
    /// Create a table with `1 << bits` slots.
    pub fn new(bits: u32) -> Self {
        let bits = bits.clamp(1, 24);
        JitCounter {
            shift: 32 - bits,
            counters: vec![0; 1 << bits],
            next_hash: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.counters.len()
    }

    /// Hash for a new guard, giving each fresh guard its own slot until the
    /// table wraps around.
    pub fn fetch_next_hash(&mut self) -> u32 {
        let hash = self.next_hash;
        self.next_hash = self.next_hash.wrapping_add(1 << self.shift);
        hash
    }

    pub fn get_index(&self, hash: u32) -> usize {
        (hash >> self.shift) as usize
    }

    /// Count one hit for `hash`; returns `true` (and resets the slot) once
    /// `threshold` hits have accumulated.
    pub fn tick(&mut self, hash: u32, threshold: u32) -> bool {
        let index = self.get_index(hash);
        let count = self.counters[index].saturating_add(1);
        if count >= threshold.max(1) {
            self.counters[index] = 0;
            true
        } else {
            self.counters[index] = count;
            false
        }
    }

    pub fn count(&self, hash: u32) -> u32 {
        self.counters[self.get_index(hash)]
    }

    pub fn reset(&mut self, hash: u32) {
        let index = self.get_index(hash);
        self.counters[index] = 0;
    }
}

impl Default for JitCounter {
    fn default() -> Self {
        JitCounter::new(12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_reaches_threshold() {
        let mut counter = JitCounter::new(8);
        let h = counter.fetch_next_hash();
        assert!(!counter.tick(h, 3));
        assert!(!counter.tick(h, 3));
        assert!(counter.tick(h, 3));
        assert_eq!(counter.count(h), 0);
    }

    #[test]
    fn test_fresh_hashes_use_distinct_slots() {
        let mut counter = JitCounter::new(4);
        let hashes: Vec<u32> = (0..16).map(|_| counter.fetch_next_hash()).collect();
        let mut indexes: Vec<usize> = hashes.iter().map(|h| counter.get_index(*h)).collect();
        indexes.sort_unstable();
        indexes.dedup();
        assert_eq!(indexes.len(), 16);
        // 17th guard wraps around to the first slot
        let wrapped = counter.fetch_next_hash();
        assert_eq!(counter.get_index(wrapped), 0);
    }

    #[test]
    fn test_threshold_zero_fires_immediately() {
        let mut counter = JitCounter::new(4);
        assert!(counter.tick(0, 0));
    }

    #[test]
    fn test_reset() {
        let mut counter = JitCounter::new(4);
        counter.tick(7, 10);
        assert_eq!(counter.count(7), 1);
        counter.reset(7);
        assert_eq!(counter.count(7), 0);
    }
}
