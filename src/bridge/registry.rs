//! Generational arena mapping [`EngineHandle`]s to per-handle state.

use crate::bridge::handle::EngineHandle;
use crate::errors::BridgeError;
use parking_lot::RwLock;
use std::num::NonZeroU32;
use std::sync::Arc;

enum SlotState<T> {
    Vacant,
    /// Handle issued, entry still being built
    Reserved,
    Occupied(Arc<T>),
}

struct ArenaSlot<T> {
    generation: NonZeroU32,
    state: SlotState<T>,
}

struct Arena<T> {
    slots: Vec<ArenaSlot<T>>,
    free: Vec<u32>,
    /// Reserved plus occupied slots
    used: usize,
}

impl<T> Arena<T> {
    fn slot_mut(&mut self, handle: EngineHandle) -> Option<&mut ArenaSlot<T>> {
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|s| s.generation.get() == handle.generation())
    }

    fn vacate(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.state = SlotState::Vacant;
            slot.generation = NonZeroU32::new(slot.generation.get().wrapping_add(1)).unwrap_or(NonZeroU32::MIN);
            self.free.push(index);
            self.used -= 1;
        }
    }
}

pub(crate) struct HandleRegistry<T> {
    arena: RwLock<Arena<T>>,
    max_handles: usize,
}

impl<T> HandleRegistry<T> {
    pub(crate) fn new(max_handles: usize) -> Self {
        Self {
            arena: RwLock::new(Arena { slots: Vec::new(), free: Vec::new(), used: 0 }),
            max_handles,
        }
    }

    /// Issues a handle whose entry is not yet visible to lookups.
    pub(crate) fn reserve(&self) -> Result<EngineHandle, BridgeError> {
        let mut arena = self.arena.write();
        if arena.used >= self.max_handles {
            return Err(BridgeError::AllocationFailure(format!(
                "handle limit of {} reached",
                self.max_handles
            )));
        }

        let index = match arena.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(arena.slots.len())
                    .map_err(|_| BridgeError::AllocationFailure("handle arena exhausted".into()))?;
                arena.slots.push(ArenaSlot { generation: NonZeroU32::MIN, state: SlotState::Vacant });
                index
            }
        };

        let slot = &mut arena.slots[index as usize];
        slot.state = SlotState::Reserved;
        let handle = EngineHandle::new(index, slot.generation);
        arena.used += 1;
        Ok(handle)
    }

    /// Makes a reserved handle visible.
    pub(crate) fn commit(&self, handle: EngineHandle, entry: Arc<T>) {
        let mut arena = self.arena.write();
        if let Some(slot) = arena.slot_mut(handle) {
            if matches!(slot.state, SlotState::Reserved) {
                slot.state = SlotState::Occupied(entry);
            }
        }
    }

    /// Gives back a reservation whose entry could not be built.
    pub(crate) fn abandon(&self, handle: EngineHandle) {
        let mut arena = self.arena.write();
        let reserved = arena.slot_mut(handle).is_some_and(|s| matches!(s.state, SlotState::Reserved));
        if reserved {
            arena.vacate(handle.index());
        }
    }

    pub(crate) fn get(&self, handle: EngineHandle) -> Result<Arc<T>, BridgeError> {
        let arena = self.arena.read();
        match arena.slots.get(handle.index() as usize) {
            Some(ArenaSlot { generation, state: SlotState::Occupied(entry) })
                if generation.get() == handle.generation() =>
            {
                Ok(entry.clone())
            }
            _ => Err(BridgeError::InvalidHandle),
        }
    }

    /// Takes the entry out. Of several concurrent removals only one succeeds.
    pub(crate) fn remove(&self, handle: EngineHandle) -> Result<Arc<T>, BridgeError> {
        let mut arena = self.arena.write();
        let slot = arena.slot_mut(handle).ok_or(BridgeError::InvalidHandle)?;
        let entry = match std::mem::replace(&mut slot.state, SlotState::Vacant) {
            SlotState::Occupied(entry) => entry,
            other => {
                slot.state = other;
                return Err(BridgeError::InvalidHandle);
            }
        };
        arena.vacate(handle.index());
        Ok(entry)
    }

    pub(crate) fn handles(&self) -> Vec<EngineHandle> {
        let arena = self.arena.read();
        arena
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.state, SlotState::Occupied(_)))
            .map(|(i, s)| EngineHandle::new(i as u32, s.generation))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.arena.read().used
    }
}
