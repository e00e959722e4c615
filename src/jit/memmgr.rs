//! Liveness of compiled units, and quasi-immutable field dependencies.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use crate::ir::QuasiImmutId;
use crate::jit::backend::Backend;
use crate::jit::token::{UnitHandle, UnitRegistry};

/// Keeps compiled units alive for `max_age` generations after their last use.
///
/// A unit that aged out is still kept while a younger unit can jump to it.
#[derive(Debug)]
pub struct MemoryManager {
    max_age: u64,
    current_generation: u64,
    alive: BTreeSet<UnitHandle>,
}

impl MemoryManager {
    pub fn new(max_age: u64) -> Self {
        MemoryManager {
            max_age: max_age.max(1),
            current_generation: 1,
            alive: BTreeSet::new(),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.current_generation
    }

    pub fn is_kept_alive(&self, handle: UnitHandle) -> bool {
        self.alive.contains(&handle)
    }

    /// Stamp `handle` with the current generation.
    pub fn keep_loop_alive(&mut self, registry: &mut UnitRegistry, handle: UnitHandle) {
        let Some(token) = registry.get_mut(handle) else {
            return;
        };
        if token.generation != self.current_generation {
            token.generation = self.current_generation;
            self.alive.insert(handle);
        }
    }

    /// Advance one generation and free the units nobody needs any more.
    ///
    /// Returns the handles that were released.
    pub fn next_generation(&mut self, registry: &mut UnitRegistry, backend: &mut dyn Backend) -> Vec<UnitHandle> {
        self.current_generation += 1;
        let oldest_kept = (self.current_generation + 1).saturating_sub(self.max_age);
        self.alive.retain(|h| match registry.get(*h) {
            Some(token) => token.generation >= oldest_kept && !token.invalidated,
            None => false,
        });

        let mut reachable: BTreeSet<UnitHandle> = self.alive.clone();
        let mut stack: Vec<UnitHandle> = reachable.iter().copied().collect();
        while let Some(h) = stack.pop() {
            if let Some(token) = registry.get(h) {
                for next in &token.jumps_to {
                    if reachable.insert(*next) {
                        stack.push(*next);
                    }
                }
            }
        }

        let mut freed = Vec::new();
        for handle in registry.live_handles() {
            let registered = registry.get(handle).is_some_and(|t| t.generation > 0);
            if registered && !reachable.contains(&handle) {
                backend.free_loop_and_bridges(handle);
                registry.release(handle);
                freed.push(handle);
            }
        }
        if !freed.is_empty() {
            info!(target: "jit-memmgr", generation = self.current_generation, freed = freed.len(), "freed old loops");
        }
        freed
    }
}

/// Units that assumed a quasi-immutable field never changes.
#[derive(Debug, Default)]
pub struct QuasiImmutRegistry {
    deps: HashMap<QuasiImmutId, Vec<UnitHandle>>,
}

impl QuasiImmutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_loop_token(&mut self, field: QuasiImmutId, handle: UnitHandle) {
        let units = self.deps.entry(field).or_default();
        if !units.contains(&handle) {
            units.push(handle);
        }
    }

    pub fn dependents(&self, field: QuasiImmutId) -> &[UnitHandle] {
        self.deps.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The field was written: mark every live dependent unit invalidated.
    ///
    /// Returns how many units were invalidated.
    pub fn invalidate(&mut self, field: QuasiImmutId, registry: &mut UnitRegistry) -> usize {
        let Some(units) = self.deps.remove(&field) else {
            return 0;
        };
        let mut count = 0;
        for handle in units {
            if let Some(token) = registry.get_mut(handle) {
                token.invalidated = true;
                count += 1;
            }
        }
        debug!(target: "jit-memmgr", field = field.0, count, "quasi-immutable field written");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::backend::RecordingBackend;
    use crate::jit::driver::DriverId;

    #[test]
    fn test_keep_loop_alive_stamps_generation() {
        let mut registry = UnitRegistry::new();
        let mut mm = MemoryManager::new(2);
        let h = registry.make_unit(DriverId(0));
        assert_eq!(registry.get(h).unwrap().generation, 0);
        mm.keep_loop_alive(&mut registry, h);
        assert_eq!(registry.get(h).unwrap().generation, 1);
        assert!(mm.is_kept_alive(h));
    }

    #[test]
    fn test_old_loops_are_freed() {
        let mut registry = UnitRegistry::new();
        let mut backend = RecordingBackend::new();
        let log = backend.log();
        let mut mm = MemoryManager::new(2);
        let h = registry.make_unit(DriverId(0));
        mm.keep_loop_alive(&mut registry, h);

        assert!(mm.next_generation(&mut registry, &mut backend).is_empty());
        let freed = mm.next_generation(&mut registry, &mut backend);
        assert_eq!(freed, vec![h]);
        assert!(!registry.is_alive(h));
        assert_eq!(log.borrow().freed, vec![h]);
    }

    #[test]
    fn test_loop_reachable_from_young_loop_survives() {
        let mut registry = UnitRegistry::new();
        let mut backend = RecordingBackend::new();
        let mut mm = MemoryManager::new(2);
        let target = registry.make_unit(DriverId(0));
        let young = registry.make_unit(DriverId(0));
        registry.record_jump_target(young, target);
        mm.keep_loop_alive(&mut registry, target);
        mm.keep_loop_alive(&mut registry, young);

        mm.next_generation(&mut registry, &mut backend);
        mm.keep_loop_alive(&mut registry, young);
        let freed = mm.next_generation(&mut registry, &mut backend);
        assert!(freed.is_empty());
        assert!(!mm.is_kept_alive(target));
        assert!(registry.is_alive(target));

        // once `young` ages out too, both go
        let freed = mm.next_generation(&mut registry, &mut backend);
        assert_eq!(freed.len(), 2);
    }

    #[test]
    fn test_unregistered_units_are_not_freed() {
        let mut registry = UnitRegistry::new();
        let mut backend = RecordingBackend::new();
        let mut mm = MemoryManager::new(1);
        let h = registry.make_unit(DriverId(0));
        mm.next_generation(&mut registry, &mut backend);
        assert!(registry.is_alive(h));
    }

    #[test]
    fn test_invalidate_marks_dependents() {
        let mut registry = UnitRegistry::new();
        let mut quasi = QuasiImmutRegistry::new();
        let a = registry.make_unit(DriverId(0));
        let b = registry.make_unit(DriverId(0));
        quasi.register_loop_token(QuasiImmutId(1), a);
        quasi.register_loop_token(QuasiImmutId(1), a);
        quasi.register_loop_token(QuasiImmutId(1), b);
        assert_eq!(quasi.dependents(QuasiImmutId(1)).len(), 2);
        registry.release(b);

        assert_eq!(quasi.invalidate(QuasiImmutId(1), &mut registry), 1);
        assert!(registry.get(a).unwrap().invalidated);
        assert_eq!(quasi.invalidate(QuasiImmutId(1), &mut registry), 0);
    }
}
