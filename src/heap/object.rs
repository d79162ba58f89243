use super::{
    handles::{HandleEntry, HandleId},
    HeapInner,
};
use crate::error::{Error, Result};
use gc_arena::{lock::RefLock, Collect, Gc, GcWeak};
use std::{fmt, rc::Rc};

pub type ObjectPtr<'gc> = Gc<'gc, RefLock<HeapObject<'gc>>>;
pub type ObjectWeak<'gc> = GcWeak<'gc, RefLock<HeapObject<'gc>>>;

/// Stable identity of a managed object, unique within its heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Collect)]
#[collect(require_static)]
pub struct ObjectId(pub(crate) u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Collect)]
#[collect(no_drop)]
pub struct HeapObject<'gc> {
    pub id: ObjectId,
    /// Outgoing managed edges.
    pub refs: Vec<ObjectPtr<'gc>>,
}

/// A strong, rooted handle to a managed object.
///
/// Every live `Object` occupies one slot in the heap's handle table. Dropping it
/// releases the slot; once no handle and no reachable object refers to the
/// target, the next collection may reclaim it.
pub struct Object {
    pub(super) id: ObjectId,
    pub(super) handle: HandleId,
    pub(super) heap: Rc<HeapInner>,
}

impl Object {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Records a managed edge `self -> other`, keeping `other` alive as long as
    /// `self` is reachable.
    pub fn link(&self, other: &Object) -> Result<()> {
        if !Rc::ptr_eq(&self.heap, &other.heap) {
            return Err(Error::ForeignObject);
        }
        self.heap.with_root(|mc, root| {
            let handles = root.handles.borrow();
            let from = handles.strong(self.handle);
            let to = handles.strong(other.handle);
            if let (Some(from), Some(to)) = (from, to) {
                from.borrow_mut(mc).refs.push(to);
            }
        });
        Ok(())
    }

    /// Removes every edge `self -> other`. Returns whether any edge existed.
    pub fn unlink(&self, other: &Object) -> bool {
        if !Rc::ptr_eq(&self.heap, &other.heap) {
            return false;
        }
        self.heap.with_root(|mc, root| {
            let handles = root.handles.borrow();
            let (Some(from), Some(to)) = (handles.strong(self.handle), handles.strong(other.handle))
            else {
                return false;
            };
            let mut from = from.borrow_mut(mc);
            let before = from.refs.len();
            from.refs.retain(|edge| !Gc::ptr_eq(*edge, to));
            from.refs.len() != before
        })
    }

    pub(crate) fn belongs_to(&self, heap: &Rc<HeapInner>) -> bool {
        Rc::ptr_eq(&self.heap, heap)
    }
}

impl Clone for Object {
    fn clone(&self) -> Self {
        let handle = self.heap.with_root(|_, root| {
            let mut handles = root.handles.borrow_mut();
            let ptr = handles.strong(self.handle);
            ptr.map(|ptr| handles.insert(HandleEntry::Strong(ptr)))
        });
        Self {
            id: self.id,
            // The source handle is live for as long as `self` is.
            handle: handle.unwrap_or(self.handle),
            heap: self.heap.clone(),
        }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        self.heap.release(self.handle);
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Object").field(&self.id).finish()
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Rc::ptr_eq(&self.heap, &other.heap)
    }
}

impl Eq for Object {}

/// A reference that observes an object without keeping it reachable.
pub struct WeakRef {
    pub(super) id: ObjectId,
    pub(super) handle: HandleId,
    pub(super) heap: Rc<HeapInner>,
}

impl WeakRef {
    /// Id of the object this reference was created for.
    pub fn target_id(&self) -> ObjectId {
        self.id
    }

    /// Returns a new strong handle to the target, or `None` once it has been
    /// reclaimed.
    pub fn deref(&self) -> Option<Object> {
        let handle = self.heap.with_root(|mc, root| {
            let mut handles = root.handles.borrow_mut();
            let ptr = handles.weak(self.handle)?.upgrade(mc)?;
            Some(handles.insert(HandleEntry::Strong(ptr)))
        })?;
        Some(Object {
            id: self.id,
            handle,
            heap: self.heap.clone(),
        })
    }

    /// Whether the target has not been reclaimed yet. Does not create a root.
    pub fn is_live(&self) -> bool {
        self.heap.with_root(|_, root| {
            root.handles
                .borrow()
                .weak(self.handle)
                .is_some_and(|weak| !weak.is_dropped())
        })
    }
}

impl Drop for WeakRef {
    fn drop(&mut self) {
        self.heap.release(self.handle);
    }
}

impl fmt::Debug for WeakRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakRef").field(&self.id).finish()
    }
}
