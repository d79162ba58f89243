//! Conformance checks run against one finalization implementation.
use crate::{
    error::Result,
    harness::{
        make_aggressive_gc_of, make_gc_of, task_turn, timeout_canceller, ManualGc, Observer,
    },
    heap::Heap,
    registry::{Implementation, RegistryFactory},
};
use std::{cell::Cell, rc::Rc};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteOptions {
    pub timeout_ms: u64,
    pub aggressive: bool,
    pub max_passes: Option<u32>,
}

impl Default for SuiteOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 50,
            aggressive: false,
            max_passes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub implementation: Implementation,
    pub name: &'static str,
    pub passed: bool,
}

pub fn observer(
    heap: &Heap,
    gc: ManualGc,
    implementation: Implementation,
    options: &SuiteOptions,
) -> Observer {
    if options.aggressive {
        let gc_of = make_aggressive_gc_of(gc, &implementation, heap);
        Observer::Aggressive(match options.max_passes {
            Some(max) => gc_of.with_max_passes(max),
            None => gc_of,
        })
    } else {
        Observer::SinglePass(make_gc_of(gc, &implementation, heap))
    }
}

/// Runs every check against `implementation`. Must be called from within a
/// `tokio::task::LocalSet`.
pub async fn run_suite(
    heap: &Heap,
    gc: ManualGc,
    implementation: Implementation,
    options: &SuiteOptions,
) -> Result<Vec<CheckOutcome>> {
    let observer = observer(heap, gc.clone(), implementation, options);
    let timeout = || Some(timeout_canceller(options.timeout_ms));
    let mut outcomes = Vec::new();
    let mut record = |name: &'static str, passed: bool| {
        info!(%implementation, check = name, passed, "check finished");
        outcomes.push(CheckOutcome {
            implementation,
            name,
            passed,
        });
    };

    let collected = observer.observe(None, timeout()).await?;
    record("collects an unreachable target", collected);

    let kept = heap.alloc();
    let collected = observer.observe(Some(kept.clone()), timeout()).await?;
    record("keeps a directly reachable target", !collected);

    let child = heap.alloc();
    kept.link(&child)?;
    let collected = observer.observe(Some(child), timeout()).await?;
    record("keeps a target reachable through a link", !collected);

    let shared = timeout();
    let (kept_result, dropped_result) = tokio::join!(
        observer.observe(Some(kept.clone()), shared.clone()),
        observer.observe(None, shared),
    );
    record(
        "resolves observations independently",
        !kept_result? && dropped_result?,
    );
    drop(kept);

    let target = heap.alloc();
    let weak = heap.weak_ref(&target)?;
    let collected = observer.observe(Some(target), timeout()).await?;
    record(
        "clears weak references to collected targets",
        collected && weak.deref().is_none(),
    );

    let cycle_head = heap.alloc();
    let cycle_tail = heap.alloc();
    cycle_head.link(&cycle_tail)?;
    cycle_tail.link(&cycle_head)?;
    drop(cycle_tail);
    let collected = observer.observe(Some(cycle_head), timeout()).await?;
    record("collects unreachable cycles", collected);

    let passed = unregister_suppresses_cleanup(heap, &gc, implementation).await?;
    record("unregister suppresses the cleanup callback", passed);

    Ok(outcomes)
}

async fn unregister_suppresses_cleanup(
    heap: &Heap,
    gc: &ManualGc,
    implementation: Implementation,
) -> Result<bool> {
    let calls = Rc::new(Cell::new(0usize));
    let registry = {
        let calls = calls.clone();
        implementation.create(heap, move |holdings: Vec<()>| {
            calls.set(calls.get() + holdings.len())
        })
    };
    let token = heap.alloc();
    registry.register(&heap.alloc(), (), Some(&token))?;
    let unregistered = registry.unregister(&token);

    for _ in 0..3 {
        gc.trigger();
        task_turn().await;
    }
    registry.cleanup_some();

    Ok(unregistered && calls.get() == 0)
}
