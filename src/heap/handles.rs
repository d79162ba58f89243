//! Handle table that bridges `'static` Rust handles to arena pointers.
use super::object::{ObjectId, ObjectPtr, ObjectWeak};
use gc_arena::Collect;

/// Index into the handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Collect)]
#[collect(require_static)]
pub struct HandleId(usize);

/// Type of handle, determines how the collector treats the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    /// Keeps the object alive.
    Strong,
    /// Observes the object without keeping it alive.
    Weak,
}

#[derive(Clone, Copy, Collect)]
#[collect(no_drop)]
pub enum HandleEntry<'gc> {
    Strong(ObjectPtr<'gc>),
    /// Weak slots remember their target's id so a dead target can still be
    /// identified during the finalize check.
    Weak(ObjectWeak<'gc>, ObjectId),
}

impl HandleEntry<'_> {
    pub fn handle_type(&self) -> HandleType {
        match self {
            HandleEntry::Strong(_) => HandleType::Strong,
            HandleEntry::Weak(..) => HandleType::Weak,
        }
    }
}

#[derive(Default, Collect)]
#[collect(no_drop)]
pub struct HandleTable<'gc> {
    slots: Vec<Option<HandleEntry<'gc>>>,
    free: Vec<usize>,
}

impl<'gc> HandleTable<'gc> {
    pub fn insert(&mut self, entry: HandleEntry<'gc>) -> HandleId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(entry);
                HandleId(index)
            }
            None => {
                self.slots.push(Some(entry));
                HandleId(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, id: HandleId) -> Option<HandleEntry<'gc>> {
        self.slots.get(id.0).copied().flatten()
    }

    pub fn strong(&self, id: HandleId) -> Option<ObjectPtr<'gc>> {
        match self.get(id)? {
            HandleEntry::Strong(ptr) => Some(ptr),
            HandleEntry::Weak(..) => None,
        }
    }

    pub fn weak(&self, id: HandleId) -> Option<ObjectWeak<'gc>> {
        match self.get(id)? {
            HandleEntry::Weak(weak, _) => Some(weak),
            HandleEntry::Strong(_) => None,
        }
    }

    /// Every weakly observed target, with its id.
    pub fn weak_targets(&self) -> impl Iterator<Item = (ObjectWeak<'gc>, ObjectId)> + '_ {
        self.slots.iter().flatten().filter_map(|entry| match *entry {
            HandleEntry::Weak(weak, id) => Some((weak, id)),
            HandleEntry::Strong(_) => None,
        })
    }

    pub fn release(&mut self, id: HandleId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            if slot.take().is_some() {
                self.free.push(id.0);
            }
        }
    }

    pub fn count(&self, handle_type: HandleType) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|entry| entry.handle_type() == handle_type)
            .count()
    }
}
