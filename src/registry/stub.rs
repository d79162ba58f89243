use super::{
    require_runtime, Cleanup, FinalizationRegistry, Implementation, Reclaimed, WatchList,
};
use crate::{
    error::Result,
    heap::{CollectionListener, Heap, Object},
};
use std::{
    cell::{Cell, RefCell},
    mem,
    rc::{self, Rc},
};
use tracing::trace;

/// Registry fed by the heap's collection notifications.
///
/// After each collection the stub checks its weak references and queues the
/// holdings of dead targets; they are handed to the cleanup callback from a
/// local task on the next turn.
///
/// # Panics
///
/// Collecting while this registry holds dead targets panics unless the
/// collection runs inside a `tokio::task::LocalSet`.
pub struct StubRegistry<H: 'static> {
    inner: Rc<StubInner<H>>,
}

struct StubInner<H: 'static> {
    heap: Heap,
    this: rc::Weak<StubInner<H>>,
    watches: WatchList<H>,
    ready: RefCell<Vec<Reclaimed<H>>>,
    scheduled: Cell<bool>,
    cleanup: Cleanup<H>,
}

impl<H: 'static> StubRegistry<H> {
    pub fn new(heap: &Heap, cleanup: impl FnMut(Vec<H>) + 'static) -> Self {
        let inner = Rc::new_cyclic(|this: &rc::Weak<StubInner<H>>| StubInner {
            heap: heap.clone(),
            this: this.clone(),
            watches: WatchList::new(),
            ready: RefCell::new(Vec::new()),
            scheduled: Cell::new(false),
            cleanup: Cleanup::new(Implementation::Stub, cleanup),
        });
        let listener: rc::Weak<dyn CollectionListener> = Rc::downgrade(&inner);
        heap.add_collection_listener(listener);
        Self { inner }
    }
}

impl<H: 'static> StubInner<H> {
    fn poll(&self) -> bool {
        let reclaimed = self.watches.take_reclaimed();
        if reclaimed.is_empty() {
            return false;
        }
        trace!(count = reclaimed.len(), "stub queued reclaimed targets");
        self.ready.borrow_mut().extend(reclaimed);
        true
    }

    fn schedule(&self) {
        if self.scheduled.replace(true) {
            return;
        }
        let this = self.this.clone();
        tokio::task::spawn_local(async move {
            if let Some(inner) = this.upgrade() {
                inner.flush();
            }
        });
    }

    fn flush(&self) {
        self.scheduled.set(false);
        let batch = mem::take(&mut *self.ready.borrow_mut())
            .into_iter()
            .map(|r| r.holding)
            .collect();
        self.cleanup.deliver(batch);
    }
}

impl<H: 'static> CollectionListener for StubInner<H> {
    fn collected(&self, _heap: &Heap) {
        if self.poll() {
            self.schedule();
        }
    }
}

impl<H: 'static> FinalizationRegistry<H> for StubRegistry<H> {
    fn register(
        &self,
        target: &Object,
        holding: H,
        unregister_token: Option<&Object>,
    ) -> Result<()> {
        require_runtime(Implementation::Stub)?;
        self.inner
            .watches
            .watch(&self.inner.heap, target, holding, unregister_token)
    }

    fn unregister(&self, unregister_token: &Object) -> bool {
        let token = unregister_token.id();
        let watched = self.inner.watches.unregister(token);

        let mut ready = self.inner.ready.borrow_mut();
        let before = ready.len();
        ready.retain(|r| r.unregister != Some(token));
        watched || ready.len() != before
    }

    fn cleanup_some(&self) {
        self.inner.poll();
        self.inner.flush();
    }

    fn implementation(&self) -> Implementation {
        Implementation::Stub
    }
}
