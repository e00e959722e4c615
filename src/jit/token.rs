//! Compiled-unit tokens, their entry points, and the registry that owns them.
//!
//! Guard descriptors and other units refer to a unit through a [`UnitHandle`]
//! rather than owning it. A handle stays valid until the unit is released;
//! after that the slot's generation moves on and [`UnitRegistry::is_alive`]
//! reports the handle as dead.

use std::cell::Cell;
use std::rc::Rc;

use crate::ir::Type;
use crate::jit::driver::DriverId;

/// Generation-checked reference to a [`JitCellToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitHandle {
    index: u32,
    generation: u32,
}

impl UnitHandle {
    /// A handle that never refers to a live unit.
    pub fn dangling() -> Self {
        UnitHandle {
            index: u32::MAX,
            generation: 0,
        }
    }

    pub fn index(self) -> u32 {
        self.index
    }
}

/// Backend-side representation of a compiled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledLoopToken {
    pub code_addr: u64,
    pub code_size: usize,
}

/// One entry point into a compiled unit.
#[derive(Debug)]
pub struct TargetToken {
    /// Unit whose code contains the label for this entry.
    pub owner: UnitHandle,
    /// Unit the enclosing trace was attached to; filled in just before
    /// submission and used to record cross-unit jumps.
    pub original: Cell<Option<UnitHandle>>,
    pub arg_types: Vec<Type>,
}

impl TargetToken {
    pub fn new(owner: UnitHandle, arg_types: Vec<Type>) -> Rc<Self> {
        Rc::new(TargetToken {
            owner,
            original: Cell::new(None),
            arg_types,
        })
    }

    pub fn with_original(owner: UnitHandle, arg_types: Vec<Type>) -> Rc<Self> {
        let token = TargetToken::new(owner, arg_types);
        token.original.set(Some(owner));
        token
    }
}

/// Identity of one compiled loop.
#[derive(Debug)]
pub struct JitCellToken {
    /// Loop number, assigned when the unit is submitted to the backend.
    pub number: Option<u64>,
    /// Memory-manager generation of the last use; 0 until registered.
    pub generation: u64,
    pub outermost_driver: DriverId,
    pub target_tokens: Vec<Rc<TargetToken>>,
    pub jumps_to: Vec<UnitHandle>,
    pub compiled: Option<CompiledLoopToken>,
    /// Set when a quasi-immutable field this unit depends on was written.
    pub invalidated: bool,
}

impl JitCellToken {
    fn new(driver: DriverId) -> Self {
        JitCellToken {
            number: None,
            generation: 0,
            outermost_driver: driver,
            target_tokens: Vec::new(),
            jumps_to: Vec::new(),
            compiled: None,
            invalidated: false,
        }
    }

    /// Remember that this unit's code may jump to `target`.
    ///
    /// Returns `false` if the jump was already known.
    pub fn record_jump_to(&mut self, target: UnitHandle) -> bool {
        if self.jumps_to.contains(&target) {
            return false;
        }
        self.jumps_to.push(target);
        true
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    token: Option<JitCellToken>,
}

/// Owner of every compiled-unit token of a context.
#[derive(Debug, Default)]
pub struct UnitRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh token scoped to `driver`.
    pub fn make_unit(&mut self, driver: DriverId) -> UnitHandle {
        let token = JitCellToken::new(driver);
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.token = Some(token);
            return UnitHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            token: Some(token),
        });
        UnitHandle { index, generation: 1 }
    }

    pub fn is_alive(&self, handle: UnitHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: UnitHandle) -> Option<&JitCellToken> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.token.as_ref())
    }

    pub fn get_mut(&mut self, handle: UnitHandle) -> Option<&mut JitCellToken> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.token.as_mut())
    }

    /// Drop the unit behind `handle`. Every outstanding copy of the handle
    /// becomes dead.
    pub fn release(&mut self, handle: UnitHandle) -> Option<JitCellToken> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let token = slot.token.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(handle.index);
        Some(token)
    }

    /// Append `to` to `from`'s known jump targets, once.
    ///
    /// Returns `true` if the jump was new. A dead `from` records nothing.
    pub fn record_jump_target(&mut self, from: UnitHandle, to: UnitHandle) -> bool {
        match self.get_mut(from) {
            Some(token) => token.record_jump_to(to),
            None => false,
        }
    }

    /// Handles of every live unit, in slot order.
    pub fn live_handles(&self) -> Vec<UnitHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.token.is_some())
            .map(|(i, slot)| UnitHandle {
                index: i as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.token.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
