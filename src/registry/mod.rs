//! Finalization registries.
//!
//! Three implementations are provided, each learning about dead targets in a
//! different way:
//!
//! - [`NativeRegistry`]: registrations live in the heap root and are resolved by
//!   the heap's own finalize check; holdings are delivered before `collect`
//!   returns.
//! - [`StubRegistry`]: watches targets through weak references and is told about
//!   every finished collection; holdings are delivered on the next task turn.
//! - [`ShimRegistry`]: only uses the public weak reference API, polling once per
//!   task turn while it has registrations.
//!
//! The stub and the shim spawn local tasks, so they must be used from within a
//! `tokio::task::LocalSet`. Registering with either outside a tokio runtime fails
//! with [`Error::Runtime`].
use crate::{
    error::{Error, Result},
    heap::{Heap, Object, ObjectId, WeakRef},
};
use std::{
    cell::RefCell,
    fmt::{self, Display},
    mem,
    str::FromStr,
};
use tracing::debug;

pub mod native;
pub mod shim;
pub mod stub;

pub use native::NativeRegistry;
pub use shim::ShimRegistry;
pub use stub::StubRegistry;

/// The finalization implementations a host may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum Implementation {
    Native,
    Stub,
    Shim,
}

impl Implementation {
    pub const ALL: [Implementation; 3] = [
        Implementation::Native,
        Implementation::Stub,
        Implementation::Shim,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Implementation::Native => "native",
            Implementation::Stub => "stub",
            Implementation::Shim => "shim",
        }
    }

    /// Whether support for this implementation was compiled in.
    pub fn compiled_in(self) -> bool {
        match self {
            Implementation::Native => cfg!(feature = "native"),
            Implementation::Stub => cfg!(feature = "stub"),
            Implementation::Shim => cfg!(feature = "shim"),
        }
    }
}

impl Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Implementation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Implementation::ALL
            .into_iter()
            .find(|i| i.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidConfig(format!("unknown implementation {s:?}")))
    }
}

pub trait FinalizationRegistry<H> {
    /// Registers `target` so that `holding` is delivered to the cleanup callback
    /// after the target is reclaimed. The registry never keeps `target` alive.
    fn register(&self, target: &Object, holding: H, unregister_token: Option<&Object>)
        -> Result<()>;

    /// Removes every outstanding registration made with `unregister_token`.
    fn unregister(&self, unregister_token: &Object) -> bool;

    /// Synchronously delivers holdings of targets already known to be reclaimed.
    fn cleanup_some(&self);

    fn implementation(&self) -> Implementation;
}

/// Builds finalization registries; the Rust counterpart of a registry constructor.
pub trait RegistryFactory {
    fn create<H: 'static>(
        &self,
        heap: &Heap,
        cleanup: impl FnMut(Vec<H>) + 'static,
    ) -> Box<dyn FinalizationRegistry<H>>;
}

impl RegistryFactory for Implementation {
    fn create<H: 'static>(
        &self,
        heap: &Heap,
        cleanup: impl FnMut(Vec<H>) + 'static,
    ) -> Box<dyn FinalizationRegistry<H>> {
        match self {
            Implementation::Native => Box::new(NativeRegistry::new(heap, cleanup)),
            Implementation::Stub => Box::new(StubRegistry::new(heap, cleanup)),
            Implementation::Shim => Box::new(ShimRegistry::new(heap, cleanup)),
        }
    }
}

/// Fails unless a tokio runtime is driving the current thread.
pub(crate) fn require_runtime(implementation: Implementation) -> Result<()> {
    tokio::runtime::Handle::try_current()
        .map(drop)
        .map_err(|e| Error::Runtime(format!("{implementation} registry: {e}")))
}

/// Cleanup callback plus the holdings waiting to be handed to it.
///
/// Deliveries that arrive while the callback is running (for example because the
/// callback forced another collection) are queued and handed over by the outer
/// call once the callback returns.
pub(crate) struct Cleanup<H> {
    implementation: Implementation,
    callback: RefCell<Box<dyn FnMut(Vec<H>)>>,
    pending: RefCell<Vec<H>>,
}

impl<H> Cleanup<H> {
    pub(crate) fn new(
        implementation: Implementation,
        callback: impl FnMut(Vec<H>) + 'static,
    ) -> Self {
        Self {
            implementation,
            callback: RefCell::new(Box::new(callback)),
            pending: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn deliver(&self, holdings: Vec<H>) {
        if holdings.is_empty() {
            return;
        }
        self.pending.borrow_mut().extend(holdings);

        let Ok(mut callback) = self.callback.try_borrow_mut() else {
            return;
        };
        loop {
            let batch = mem::take(&mut *self.pending.borrow_mut());
            if batch.is_empty() {
                break;
            }
            debug!(
                implementation = %self.implementation,
                holdings = batch.len(),
                "running cleanup callback"
            );
            (*callback)(batch);
        }
    }
}

/// A holding whose target is gone, detached from its weak reference.
pub(crate) struct Reclaimed<H> {
    pub holding: H,
    pub unregister: Option<ObjectId>,
}

struct Watch<H> {
    weak: WeakRef,
    holding: H,
    unregister: Option<ObjectId>,
}

/// Registrations tracked through weak references.
pub(crate) struct WatchList<H> {
    watches: RefCell<Vec<Watch<H>>>,
}

impl<H> WatchList<H> {
    pub(crate) fn new() -> Self {
        Self {
            watches: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn watch(
        &self,
        heap: &Heap,
        target: &Object,
        holding: H,
        unregister_token: Option<&Object>,
    ) -> Result<()> {
        if unregister_token.is_some_and(|token| !heap.owns(token)) {
            return Err(Error::ForeignObject);
        }
        let weak = heap.weak_ref(target)?;
        self.watches.borrow_mut().push(Watch {
            weak,
            holding,
            unregister: unregister_token.map(Object::id),
        });
        Ok(())
    }

    /// Removes and returns every registration whose target has been reclaimed.
    pub(crate) fn take_reclaimed(&self) -> Vec<Reclaimed<H>> {
        let watches = mem::take(&mut *self.watches.borrow_mut());
        let (dead, live): (Vec<_>, Vec<_>) = watches.into_iter().partition(|w| !w.weak.is_live());
        // Registrations made while polling land after the survivors.
        let mut watches = self.watches.borrow_mut();
        let added = mem::replace(&mut *watches, live);
        watches.extend(added);

        dead.into_iter()
            .map(|w| Reclaimed {
                holding: w.holding,
                unregister: w.unregister,
            })
            .collect()
    }

    pub(crate) fn unregister(&self, token: ObjectId) -> bool {
        let mut watches = self.watches.borrow_mut();
        let before = watches.len();
        watches.retain(|w| w.unregister != Some(token));
        watches.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.watches.borrow().is_empty()
    }
}
