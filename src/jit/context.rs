//! Per-process JIT state shared by every driver of one context.

use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::JitConfig;
use crate::jit::backend::Backend;
use crate::jit::counter::JitCounter;
use crate::jit::force::Preemption;
use crate::jit::memmgr::{MemoryManager, QuasiImmutRegistry};
use crate::jit::optimizer::Optimizer;
use crate::jit::stats::JitStats;
use crate::jit::token::UnitRegistry;

/// Source of loop numbers. Share one between contexts that must not hand
/// out the same number twice.
#[derive(Debug, Default)]
pub struct LoopNumbering {
    next: AtomicU64,
}

impl LoopNumbering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

pub struct JitContext {
    pub registry: UnitRegistry,
    pub memmgr: MemoryManager,
    pub counter: JitCounter,
    pub backend: Box<dyn Backend>,
    pub optimizer: Box<dyn Optimizer>,
    pub stats: JitStats,
    pub quasi_immut: QuasiImmutRegistry,
    pub preemption: Rc<Preemption>,
    pub numbering: Arc<LoopNumbering>,
}

impl JitContext {
    pub fn new(config: &JitConfig, backend: Box<dyn Backend>, optimizer: Box<dyn Optimizer>) -> Self {
        JitContext {
            registry: UnitRegistry::new(),
            memmgr: MemoryManager::new(config.loop_longevity),
            counter: JitCounter::new(config.counter_bits),
            backend,
            optimizer,
            stats: JitStats::new(),
            quasi_immut: QuasiImmutRegistry::new(),
            preemption: Rc::new(Preemption::new()),
            numbering: Arc::new(LoopNumbering::new()),
        }
    }

    /// Use `numbering` instead of this context's own loop counter.
    pub fn with_numbering(mut self, numbering: Arc<LoopNumbering>) -> Self {
        self.numbering = numbering;
        self
    }

    /// Advance the memory manager by one generation, freeing old loops.
    pub fn next_generation(&mut self) -> usize {
        let freed = self.memmgr.next_generation(&mut self.registry, self.backend.as_mut());
        self.stats.freed_loops += freed.len() as u64;
        freed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_numbering_does_not_collide() {
        let shared = Arc::new(LoopNumbering::new());
        let a = Arc::clone(&shared);
        let b = Arc::clone(&shared);
        assert_eq!(a.next(), 0);
        assert_eq!(b.next(), 1);
        assert_eq!(shared.peek(), 2);
    }

    #[test]
    fn test_threads_get_unique_numbers() {
        let shared = Arc::new(LoopNumbering::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let n = Arc::clone(&shared);
                std::thread::spawn(move || (0..100).map(|_| n.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
    }
}
