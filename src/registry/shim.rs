use super::{require_runtime, Cleanup, FinalizationRegistry, Implementation, WatchList};
use crate::{
    error::Result,
    harness::task_turn,
    heap::{Heap, Object},
};
use std::{
    cell::Cell,
    rc::{self, Rc},
};
use tracing::trace;

/// Portable registry that only relies on weak references.
///
/// A local sweeper task polls the watched references once per task turn while
/// there is anything to watch, and exits once the list is empty or the registry
/// has been dropped.
///
/// # Panics
///
/// Registering from inside a tokio runtime but outside a `tokio::task::LocalSet`
/// panics when the sweeper is spawned.
pub struct ShimRegistry<H: 'static> {
    inner: Rc<ShimInner<H>>,
}

struct ShimInner<H: 'static> {
    heap: Heap,
    watches: WatchList<H>,
    sweeping: Cell<bool>,
    cleanup: Cleanup<H>,
}

impl<H: 'static> ShimRegistry<H> {
    pub fn new(heap: &Heap, cleanup: impl FnMut(Vec<H>) + 'static) -> Self {
        Self {
            inner: Rc::new(ShimInner {
                heap: heap.clone(),
                watches: WatchList::new(),
                sweeping: Cell::new(false),
                cleanup: Cleanup::new(Implementation::Shim, cleanup),
            }),
        }
    }

    fn start_sweeper(&self) {
        if self.inner.sweeping.replace(true) {
            return;
        }
        trace!("shim sweeper started");
        tokio::task::spawn_local(sweep_loop(Rc::downgrade(&self.inner)));
    }
}

async fn sweep_loop<H: 'static>(this: rc::Weak<ShimInner<H>>) {
    loop {
        task_turn().await;
        let Some(inner) = this.upgrade() else {
            return;
        };
        inner.sweep();
        if inner.watches.is_empty() {
            inner.sweeping.set(false);
            trace!("shim sweeper idle");
            return;
        }
    }
}

impl<H: 'static> ShimInner<H> {
    fn sweep(&self) {
        let batch = self
            .watches
            .take_reclaimed()
            .into_iter()
            .map(|r| r.holding)
            .collect();
        self.cleanup.deliver(batch);
    }
}

impl<H: 'static> FinalizationRegistry<H> for ShimRegistry<H> {
    fn register(
        &self,
        target: &Object,
        holding: H,
        unregister_token: Option<&Object>,
    ) -> Result<()> {
        require_runtime(Implementation::Shim)?;
        self.inner
            .watches
            .watch(&self.inner.heap, target, holding, unregister_token)?;
        self.start_sweeper();
        Ok(())
    }

    fn unregister(&self, unregister_token: &Object) -> bool {
        self.inner.watches.unregister(unregister_token.id())
    }

    fn cleanup_some(&self) {
        self.inner.sweep();
    }

    fn implementation(&self) -> Implementation {
        Implementation::Shim
    }
}
