//! Managed heap observed by the harness.
//!
//! The heap wraps a single `gc_arena` arena. Rust code never holds arena pointers
//! directly; it holds [`Object`] and [`WeakRef`] handles, which are indices into a
//! handle table stored in the arena root. Strong slots are traced, weak slots are
//! traced weakly.
//!
//! A collection always runs to completion:
//!
//! 1. Apply handle releases queued by dropped handles
//! 2. Mark everything reachable from the root
//! 3. Finalize check: registered or weakly observed targets that are dead but
//!    have not yet been seen dead `survivor_passes` times are resurrected for
//!    another cycle
//! 4. Sweep
//! 5. Prune registrations whose targets were dropped and hand their tokens to the
//!    owning finalization sinks, then notify collection listeners
//!
//! Because marking never interleaves with mutation, root tables are plain
//! `RefCell`s without write barriers.
use crate::{
    config::HostConfig,
    error::{Error, Result},
};
use gc_arena::{lock::RefLock, Arena, Collect, Collection, Finalization, Gc, Mutation, Rootable};
use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    mem,
    rc::{self, Rc},
};
use tracing::{debug, trace};

pub mod handles;
pub mod object;

use handles::{HandleEntry, HandleId, HandleTable, HandleType};
pub use object::{Object, ObjectId, WeakRef};
use object::{HeapObject, ObjectWeak};

/// Identifies a finalization registry attached to a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Collect)]
#[collect(require_static)]
pub struct RegistryId(u64);

/// Identifies one registration within a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Collect)]
#[collect(require_static)]
pub struct RegistrationToken(u64);

/// Receives the tokens of registrations whose targets were reclaimed.
pub(crate) trait FinalizationSink {
    fn finalized(&self, tokens: Vec<RegistrationToken>);
}

/// Notified after every completed collection.
pub trait CollectionListener {
    fn collected(&self, heap: &Heap);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: u64,
    /// Registrations whose targets were reclaimed.
    pub finalized: u64,
    /// Dead registered targets kept alive for another cycle.
    pub resurrections: u64,
}

#[derive(Clone, Copy, Collect)]
#[collect(no_drop)]
struct Registration<'gc> {
    target: ObjectWeak<'gc>,
    object: ObjectId,
    registry: RegistryId,
    token: RegistrationToken,
    unregister: Option<ObjectId>,
}

#[derive(Default)]
pub struct HeapRoot<'gc> {
    handles: RefCell<HandleTable<'gc>>,
    registrations: RefCell<Vec<Registration<'gc>>>,
    /// Consecutive collections in which a registered object was found dead.
    survivors: RefCell<HashMap<ObjectId, u32>>,
}

unsafe impl<'gc> Collect for HeapRoot<'gc> {
    fn trace(&self, cc: &Collection) {
        self.handles.borrow().trace(cc);
        // Registration targets are weak and never keep an object alive.
        self.registrations.borrow().trace(cc);
    }
}

impl<'gc> HeapRoot<'gc> {
    fn release_handles(&self, released: &[HandleId]) {
        let mut handles = self.handles.borrow_mut();
        for &id in released {
            handles.release(id);
        }
    }

    /// Resurrects dead targets that are registered for finalization or observed
    /// through a weak reference until they have been seen dead `survivor_passes`
    /// times.
    fn finalize_check(&self, fc: &Finalization<'gc>, survivor_passes: u32) -> u64 {
        let registrations = self.registrations.borrow();
        let handles = self.handles.borrow();
        let mut survivors = self.survivors.borrow_mut();
        let mut dead = HashSet::new();
        let mut resurrected = 0;

        let observed = registrations
            .iter()
            .map(|reg| (reg.target, reg.object))
            .chain(handles.weak_targets());
        for (target, object) in observed {
            if !target.is_dead(fc) || !dead.insert(object) {
                continue;
            }
            let passes = {
                let passes = survivors.entry(object).or_insert(0);
                *passes += 1;
                *passes
            };
            if passes < survivor_passes && target.resurrect(fc).is_some() {
                trace!(%object, passes, "resurrected observed object");
                resurrected += 1;
            }
        }

        // Objects that are reachable again start counting from scratch.
        survivors.retain(|id, passes| dead.contains(id) && *passes < survivor_passes);
        resurrected
    }

    fn prune_dropped(&self) -> Vec<(RegistryId, RegistrationToken)> {
        let mut reclaimed = Vec::new();
        self.registrations.borrow_mut().retain(|reg| {
            if reg.target.is_dropped() {
                reclaimed.push((reg.registry, reg.token));
                false
            } else {
                true
            }
        });
        reclaimed
    }
}

type HeapArena = Arena<Rootable![HeapRoot<'_>]>;

pub(crate) struct HeapInner {
    arena: RefCell<HeapArena>,
    /// Handles dropped since the last arena access.
    released: RefCell<Vec<HandleId>>,
    next_object: Cell<u64>,
    next_registry: Cell<u64>,
    next_token: Cell<u64>,
    sinks: RefCell<BTreeMap<RegistryId, rc::Weak<dyn FinalizationSink>>>,
    listeners: RefCell<Vec<rc::Weak<dyn CollectionListener>>>,
    stats: Cell<GcStats>,
    config: HostConfig,
}

impl HeapInner {
    pub(crate) fn release(&self, handle: HandleId) {
        self.released.borrow_mut().push(handle);
    }

    pub(crate) fn with_root<T>(
        &self,
        f: impl for<'gc> FnOnce(&'gc Mutation<'gc>, &'gc HeapRoot<'gc>) -> T,
    ) -> T {
        let released = mem::take(&mut *self.released.borrow_mut());
        self.arena.borrow_mut().mutate(|mc, root| {
            root.release_handles(&released);
            f(mc, root)
        })
    }
}

/// A single-threaded managed heap. Cloning yields another handle to the same heap.
#[derive(Clone)]
pub struct Heap {
    inner: Rc<HeapInner>,
}

impl Heap {
    pub fn new(config: HostConfig) -> Self {
        Self {
            inner: Rc::new(HeapInner {
                arena: RefCell::new(HeapArena::new(|_| HeapRoot::default())),
                released: RefCell::new(Vec::new()),
                next_object: Cell::new(0),
                next_registry: Cell::new(0),
                next_token: Cell::new(0),
                sinks: RefCell::new(BTreeMap::new()),
                listeners: RefCell::new(Vec::new()),
                stats: Cell::new(GcStats::default()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn alloc(&self) -> Object {
        let id = ObjectId(self.inner.next_object.get());
        self.inner.next_object.set(id.0 + 1);

        let handle = self.inner.with_root(|mc, root| {
            let ptr = Gc::new(mc, RefLock::new(HeapObject { id, refs: Vec::new() }));
            root.handles.borrow_mut().insert(HandleEntry::Strong(ptr))
        });
        trace!(object = %id, "allocated");

        Object {
            id,
            handle,
            heap: self.inner.clone(),
        }
    }

    pub fn weak_ref(&self, target: &Object) -> Result<WeakRef> {
        if !target.belongs_to(&self.inner) {
            return Err(Error::ForeignObject);
        }
        let handle = self.inner.with_root(|_, root| {
            let mut handles = root.handles.borrow_mut();
            let ptr = handles.strong(target.handle)?;
            Some(handles.insert(HandleEntry::Weak(Gc::downgrade(ptr), target.id)))
        });
        // A live `Object` always has a strong slot.
        let handle = handle.ok_or(Error::ForeignObject)?;

        Ok(WeakRef {
            id: target.id,
            handle,
            heap: self.inner.clone(),
        })
    }

    /// Returns the manual GC trigger, if the host configuration exposes one.
    pub fn gc_trigger(&self) -> Option<crate::harness::ManualGc> {
        self.inner
            .config
            .expose_gc
            .then(|| crate::harness::ManualGc::from_heap(self))
    }

    /// Runs one full collection cycle.
    pub fn collect(&self) {
        let survivor_passes = self.inner.config.survivor_passes;
        let (resurrected, reclaimed) = {
            let released = mem::take(&mut *self.inner.released.borrow_mut());
            let mut arena = self.inner.arena.borrow_mut();
            arena.mutate(|_, root| root.release_handles(&released));

            let resurrected = match arena.mark_all() {
                Some(marked) => {
                    marked.finalize(|fc, root| root.finalize_check(fc, survivor_passes))
                }
                None => 0,
            };
            arena.collect_all();

            let reclaimed = arena.mutate(|_, root| root.prune_dropped());
            (resurrected, reclaimed)
        };

        let mut stats = self.inner.stats.get();
        stats.collections += 1;
        stats.resurrections += resurrected;
        stats.finalized += reclaimed.len() as u64;
        self.inner.stats.set(stats);
        debug!(
            collection = stats.collections,
            finalized = reclaimed.len(),
            resurrected,
            "collection finished"
        );

        self.dispatch(reclaimed);
        self.notify_listeners();
    }

    fn dispatch(&self, reclaimed: Vec<(RegistryId, RegistrationToken)>) {
        if reclaimed.is_empty() {
            return;
        }
        let mut by_registry: BTreeMap<RegistryId, Vec<RegistrationToken>> = BTreeMap::new();
        for (registry, token) in reclaimed {
            by_registry.entry(registry).or_default().push(token);
        }

        // Sinks may register or drop registries, so nothing stays borrowed while
        // they run.
        let batches: Vec<_> = {
            let sinks = self.inner.sinks.borrow();
            by_registry
                .into_iter()
                .filter_map(|(registry, tokens)| {
                    let sink = sinks.get(&registry)?.upgrade()?;
                    Some((sink, tokens))
                })
                .collect()
        };
        for (sink, tokens) in batches {
            sink.finalized(tokens);
        }
    }

    fn notify_listeners(&self) {
        let listeners: Vec<_> = {
            let mut listeners = self.inner.listeners.borrow_mut();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(rc::Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.collected(self);
        }
    }

    pub fn add_collection_listener(&self, listener: rc::Weak<dyn CollectionListener>) {
        self.inner.listeners.borrow_mut().push(listener);
    }

    pub fn stats(&self) -> GcStats {
        self.inner.stats.get()
    }

    pub fn handle_count(&self, handle_type: HandleType) -> usize {
        self.inner
            .with_root(|_, root| root.handles.borrow().count(handle_type))
    }

    pub fn registration_count(&self) -> usize {
        self.inner
            .with_root(|_, root| root.registrations.borrow().len())
    }

    pub fn owns(&self, object: &Object) -> bool {
        object.belongs_to(&self.inner)
    }

    pub(crate) fn new_registry(&self, sink: rc::Weak<dyn FinalizationSink>) -> RegistryId {
        let id = RegistryId(self.inner.next_registry.get());
        self.inner.next_registry.set(id.0 + 1);
        self.inner.sinks.borrow_mut().insert(id, sink);
        id
    }

    /// Detaches a registry and discards its outstanding registrations.
    pub(crate) fn forget_registry(&self, registry: RegistryId) {
        self.inner.sinks.borrow_mut().remove(&registry);
        self.inner.with_root(|_, root| {
            root.registrations
                .borrow_mut()
                .retain(|reg| reg.registry != registry);
        });
    }

    pub(crate) fn register_finalizer(
        &self,
        registry: RegistryId,
        target: &Object,
        unregister: Option<&Object>,
    ) -> Result<RegistrationToken> {
        if !self.owns(target) || unregister.is_some_and(|o| !self.owns(o)) {
            return Err(Error::ForeignObject);
        }
        let token = RegistrationToken(self.inner.next_token.get());
        self.inner.next_token.set(token.0 + 1);

        let registered = self.inner.with_root(|_, root| {
            let ptr = root.handles.borrow().strong(target.handle)?;
            root.registrations.borrow_mut().push(Registration {
                target: Gc::downgrade(ptr),
                object: target.id,
                registry,
                token,
                unregister: unregister.map(Object::id),
            });
            Some(())
        });
        registered.ok_or(Error::ForeignObject)?;

        trace!(object = %target.id, ?registry, ?token, "registered for finalization");
        Ok(token)
    }

    /// Removes the registrations of `registry` made with `unregister` as token.
    pub(crate) fn unregister_finalizers(
        &self,
        registry: RegistryId,
        unregister: ObjectId,
    ) -> Vec<RegistrationToken> {
        self.inner.with_root(|_, root| {
            let mut removed = Vec::new();
            root.registrations.borrow_mut().retain(|reg| {
                if reg.registry == registry && reg.unregister == Some(unregister) {
                    removed.push(reg.token);
                    false
                } else {
                    true
                }
            });
            removed
        })
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.inner.config)
            .field("stats", &self.inner.stats.get())
            .finish_non_exhaustive()
    }
}
