//! GC-observation harness.
//!
//! An observer registers a target with its finalization registry, drops every
//! strong reference it has to the target, forces collection and reports whether
//! the registry's cleanup callback fired for that target before cancellation.
//!
//! The target is taken by value and dropped before the first suspension point;
//! nothing in the harness keeps a handle to it afterwards.
use crate::{
    error::{Error, Result},
    heap::{Heap, Object},
    probe::Capabilities,
    registry::{FinalizationRegistry, Implementation, RegistryFactory},
};
use std::{fmt, future::pending, pin::pin, rc::Rc};
use tracing::{debug, trace, warn};

mod canceller;
mod observation;

pub use canceller::{timeout_canceller, Canceller};
pub use observation::{Holding, Observation};

/// Suspends until the next turn of the local task queue.
pub async fn task_turn() {
    tokio::task::yield_now().await;
}

/// A manual garbage collection trigger.
#[derive(Clone)]
pub struct ManualGc(Rc<dyn Fn()>);

impl ManualGc {
    pub fn new(trigger: impl Fn() + 'static) -> Self {
        Self(Rc::new(trigger))
    }

    pub fn from_heap(heap: &Heap) -> Self {
        let heap = heap.clone();
        Self::new(move || heap.collect())
    }

    pub fn trigger(&self) {
        (self.0)();
    }
}

impl fmt::Debug for ManualGc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ManualGc(..)")
    }
}

/// Waits one task turn, then collects if a trigger is available.
pub async fn gc_task(gc: Option<&ManualGc>) {
    task_turn().await;
    if let Some(gc) = gc {
        gc.trigger();
    }
}

async fn cancelled(cancel: Option<Canceller>) -> bool {
    match cancel {
        Some(cancel) => cancel.await,
        None => pending().await,
    }
}

/// State shared by both observer flavours: one registry for the observer's
/// lifetime, whose cleanup callback resolves holdings.
struct Core {
    heap: Heap,
    gc: ManualGc,
    registry: Box<dyn FinalizationRegistry<Holding>>,
}

impl Core {
    fn new(gc: ManualGc, factory: &impl RegistryFactory, heap: &Heap) -> Self {
        let registry = factory.create(heap, |holdings: Vec<Holding>| {
            for holding in holdings {
                holding.resolve();
            }
        });
        Self {
            heap: heap.clone(),
            gc,
            registry,
        }
    }

    /// Registers the target and drops the harness's handle to it.
    fn arm(&self, target: Option<Object>) -> Result<Observation> {
        let (observation, holding) = Observation::new();
        let target = target.unwrap_or_else(|| self.heap.alloc());
        trace!(
            object = %target.id(),
            implementation = %self.registry.implementation(),
            "observing"
        );
        self.registry.register(&target, holding, None)?;
        drop(target);
        Ok(observation)
    }
}

/// Observer that forces a single collection per observation.
pub struct GcOf {
    core: Core,
}

impl GcOf {
    /// Resolves to `true` if the target was collected and its cleanup ran before
    /// `cancel` fired, `false` otherwise. Without a canceller this waits for as
    /// long as it takes.
    pub async fn observe(&self, target: Option<Object>, cancel: Option<Canceller>) -> Result<bool> {
        let observation = self.core.arm(target)?;

        // The trigger is often honoured once per turn, and the caller may still
        // be releasing its own references.
        task_turn().await;
        self.core.gc.trigger();

        let collected = tokio::select! {
            biased;
            collected = observation => collected,
            verdict = cancelled(cancel) => verdict,
        };

        // Let the registry finish its own dispatch.
        task_turn().await;

        debug!(collected, "observation finished");
        Ok(collected)
    }

    pub fn implementation(&self) -> Implementation {
        self.core.registry.implementation()
    }
}

/// Observer that keeps collecting, once per task turn, until the target is
/// collected or the observation is cancelled.
pub struct AggressiveGcOf {
    core: Core,
    max_passes: Option<u32>,
}

impl AggressiveGcOf {
    /// Caps the number of collections per observation. Once the cap is reached
    /// the observation resolves to `false`.
    pub fn with_max_passes(mut self, max_passes: u32) -> Self {
        self.max_passes = Some(max_passes);
        self
    }

    pub async fn observe(&self, target: Option<Object>, cancel: Option<Canceller>) -> Result<bool> {
        let mut observation = self.core.arm(target)?;
        let mut cancel = pin!(cancelled(cancel));
        let mut passes = 0u32;

        // The race result is checked before collecting again, and the next race
        // only starts after the collection.
        let collected = loop {
            let settled = tokio::select! {
                biased;
                collected = &mut observation => Some(collected),
                verdict = &mut cancel => Some(verdict),
                () = task_turn() => None,
            };
            if let Some(settled) = settled {
                break settled;
            }
            if self.max_passes.is_some_and(|max| passes >= max) {
                warn!(passes, "giving up on observation after max passes");
                break false;
            }
            self.core.gc.trigger();
            passes += 1;
        };

        task_turn().await;

        debug!(collected, passes, "aggressive observation finished");
        Ok(collected)
    }

    pub fn implementation(&self) -> Implementation {
        self.core.registry.implementation()
    }
}

/// Either observer flavour.
pub enum Observer {
    SinglePass(GcOf),
    Aggressive(AggressiveGcOf),
}

impl Observer {
    pub async fn observe(&self, target: Option<Object>, cancel: Option<Canceller>) -> Result<bool> {
        match self {
            Observer::SinglePass(gc_of) => gc_of.observe(target, cancel).await,
            Observer::Aggressive(gc_of) => gc_of.observe(target, cancel).await,
        }
    }

    pub fn implementation(&self) -> Implementation {
        match self {
            Observer::SinglePass(gc_of) => gc_of.implementation(),
            Observer::Aggressive(gc_of) => gc_of.implementation(),
        }
    }
}

/// Observers over the stub or the shim must be polled inside a
/// `tokio::task::LocalSet`; outside any runtime `observe` fails with
/// [`Error::Runtime`].
pub fn make_gc_of(gc: ManualGc, factory: &impl RegistryFactory, heap: &Heap) -> GcOf {
    GcOf {
        core: Core::new(gc, factory, heap),
    }
}

/// Same runtime requirements as [`make_gc_of`].
pub fn make_aggressive_gc_of(
    gc: ManualGc,
    factory: &impl RegistryFactory,
    heap: &Heap,
) -> AggressiveGcOf {
    AggressiveGcOf {
        core: Core::new(gc, factory, heap),
        max_passes: None,
    }
}

fn trigger_for(heap: &Heap, caps: &Capabilities) -> Option<ManualGc> {
    (caps.gc_available && caps.weakrefs_available()).then(|| ManualGc::from_heap(heap))
}

/// Observer over whichever implementation the library would pick by default.
///
/// `Ok(None)` when the host exposes no GC trigger or no implementation.
pub fn gc_of(heap: &Heap, caps: &Capabilities) -> Result<Option<GcOf>> {
    let Some(gc) = trigger_for(heap, caps) else {
        return Ok(None);
    };
    let implementation = caps.select_any()?;
    Ok(Some(make_gc_of(gc, &implementation, heap)))
}

/// Observer over the platform primitives: native, else stub, else shim.
pub fn gc_of_raw(heap: &Heap, caps: &Capabilities) -> Result<Option<GcOf>> {
    let Some(gc) = trigger_for(heap, caps) else {
        return Ok(None);
    };
    let implementation = caps.select()?;
    Ok(Some(make_gc_of(gc, &implementation, heap)))
}

/// Builds an observer for one explicitly requested implementation.
pub fn observer_for(
    heap: &Heap,
    caps: &Capabilities,
    implementation: Implementation,
    aggressive: bool,
) -> Result<Observer> {
    if !caps.gc_available {
        return Err(Error::GcUnavailable);
    }
    let implementation = caps.require(implementation)?;
    let gc = ManualGc::from_heap(heap);
    Ok(if aggressive {
        Observer::Aggressive(make_aggressive_gc_of(gc, &implementation, heap))
    } else {
        Observer::SinglePass(make_gc_of(gc, &implementation, heap))
    })
}
