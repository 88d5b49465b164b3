//! Fixed-capacity slot arena with generation-checked handles.

use serde::Serialize;

use super::DeviceKind;

/// Handle to an open virtual device.
///
/// Handles are invalidated when the device is closed; a stale handle never
/// aliases a device opened later in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceHandle {
    kind: DeviceKind,
    index: usize,
    generation: u32,
}

impl DeviceHandle {
    pub const fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub const fn index(&self) -> usize {
        self.index
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub(crate) struct SlotArena<T> {
    kind: DeviceKind,
    slots: Vec<Slot<T>>,
}

impl<T> SlotArena<T> {
    pub(crate) fn new(kind: DeviceKind, capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();
        Self { kind, slots }
    }

    pub(crate) fn has_free(&self) -> bool {
        self.slots.iter().any(|s| s.value.is_none())
    }

    /// Place `value` in the lowest free slot. Gives the value back when full.
    pub(crate) fn insert(&mut self, value: T) -> Result<DeviceHandle, T> {
        let Some((index, slot)) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.value.is_none())
        else {
            return Err(value);
        };
        slot.value = Some(value);
        Ok(DeviceHandle {
            kind: self.kind,
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, handle: DeviceHandle) -> Option<&Slot<T>> {
        if handle.kind != self.kind {
            return None;
        }
        self.slots
            .get(handle.index)
            .filter(|s| s.generation == handle.generation)
    }

    pub(crate) fn get(&self, handle: DeviceHandle) -> Option<&T> {
        self.slot(handle).and_then(|s| s.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, handle: DeviceHandle) -> Option<&mut T> {
        if handle.kind != self.kind {
            return None;
        }
        self.slots
            .get_mut(handle.index)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    /// Free the slot, invalidating every copy of `handle`.
    pub(crate) fn remove(&mut self, handle: DeviceHandle) -> Option<T> {
        self.slot(handle)?;
        let slot = &mut self.slots[handle.index];
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|s| s.value.as_mut())
    }
}
