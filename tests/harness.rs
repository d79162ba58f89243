use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::Rc,
    time::Duration,
};
use tokio::{task::LocalSet, time::Instant};
use weakrefs_conformance::{
    config::HostConfig,
    harness::{
        gc_task, make_aggressive_gc_of, make_gc_of, task_turn, timeout_canceller, Canceller,
        ManualGc,
    },
    heap::Heap,
    registry::Implementation,
    Error,
};

async fn local<F: Future>(f: F) -> F::Output {
    LocalSet::new().run_until(f).await
}

/// A trigger that counts how often it was invoked.
fn counting_gc(heap: &Heap) -> (ManualGc, Rc<Cell<u32>>) {
    let count = Rc::new(Cell::new(0));
    let gc = {
        let heap = heap.clone();
        let count = count.clone();
        ManualGc::new(move || {
            count.set(count.get() + 1);
            heap.collect();
        })
    };
    (gc, count)
}

#[tokio::test]
async fn unreachable_target_is_observed_for_every_implementation() {
    local(async {
        for implementation in Implementation::ALL {
            let heap = Heap::default();
            let gc_of = make_gc_of(ManualGc::from_heap(&heap), &implementation, &heap);
            let start = Instant::now();

            let collected = gc_of.observe(None, Some(timeout_canceller(50))).await.unwrap();

            assert!(collected, "{implementation} did not observe collection");
            assert!(start.elapsed() < Duration::from_millis(50));
        }
    })
    .await;
}

#[tokio::test]
async fn observation_without_canceller_completes() {
    local(async {
        let heap = Heap::default();
        let gc_of = make_gc_of(ManualGc::from_heap(&heap), &Implementation::Stub, &heap);
        assert!(gc_of.observe(Some(heap.alloc()), None).await.unwrap());
    })
    .await;
}

#[tokio::test]
async fn reachable_target_times_out() {
    local(async {
        for implementation in Implementation::ALL {
            let heap = Heap::default();
            let gc_of = make_gc_of(ManualGc::from_heap(&heap), &implementation, &heap);
            let kept = heap.alloc();
            let start = Instant::now();

            let collected = gc_of
                .observe(Some(kept.clone()), Some(timeout_canceller(50)))
                .await
                .unwrap();

            assert!(!collected, "{implementation} collected a reachable target");
            assert!(start.elapsed() >= Duration::from_millis(50));
            drop(kept);
        }
    })
    .await;
}

#[tokio::test]
async fn target_reachable_through_link_is_kept() {
    local(async {
        let heap = Heap::default();
        let gc = ManualGc::from_heap(&heap);
        let gc_of = make_aggressive_gc_of(gc, &Implementation::Native, &heap);
        let parent = heap.alloc();
        let child = heap.alloc();
        parent.link(&child).unwrap();

        let collected = gc_of
            .observe(Some(child), Some(timeout_canceller(30)))
            .await
            .unwrap();
        assert!(!collected);
    })
    .await;
}

#[tokio::test]
async fn observations_are_independent() {
    local(async {
        let heap = Heap::default();
        let gc_of = make_gc_of(ManualGc::from_heap(&heap), &Implementation::Native, &heap);
        let kept = heap.alloc();
        let cancel = timeout_canceller(50);

        let (kept_result, dropped_result) = tokio::join!(
            gc_of.observe(Some(kept.clone()), Some(cancel.clone())),
            gc_of.observe(None, Some(cancel)),
        );

        assert!(!kept_result.unwrap());
        assert!(dropped_result.unwrap());
    })
    .await;
}

#[tokio::test]
async fn aggressive_variant_stops_collecting_after_success() {
    local(async {
        for implementation in Implementation::ALL {
            let heap = Heap::new(HostConfig::default().with_survivor_passes(3));
            let (gc, count) = counting_gc(&heap);
            let gc_of = make_aggressive_gc_of(gc, &implementation, &heap);

            let collected = gc_of.observe(None, Some(timeout_canceller(500))).await.unwrap();

            assert!(collected);
            assert_eq!(count.get(), 3, "{implementation} needed more passes");
            for _ in 0..5 {
                task_turn().await;
            }
            assert_eq!(count.get(), 3);
        }
    })
    .await;
}

#[tokio::test]
async fn single_pass_is_not_enough_for_generational_host() {
    local(async {
        let heap = Heap::new(HostConfig::default().with_survivor_passes(3));
        let (gc, count) = counting_gc(&heap);
        let gc_of = make_gc_of(gc, &Implementation::Native, &heap);

        let collected = gc_of.observe(None, Some(timeout_canceller(30))).await.unwrap();

        assert!(!collected);
        assert_eq!(count.get(), 1);
    })
    .await;
}

#[tokio::test]
async fn aggressive_variant_respects_max_passes() {
    local(async {
        let heap = Heap::new(HostConfig::default().with_survivor_passes(10));
        let (gc, count) = counting_gc(&heap);
        let gc_of = make_aggressive_gc_of(gc, &Implementation::Native, &heap).with_max_passes(4);

        let collected = gc_of.observe(None, None).await.unwrap();

        assert!(!collected);
        assert_eq!(count.get(), 4);
    })
    .await;
}

#[tokio::test]
async fn custom_cancellation_signal() {
    local(async {
        let heap = Heap::default();
        let gc = ManualGc::from_heap(&heap);
        let gc_of = make_aggressive_gc_of(gc, &Implementation::Shim, &heap);
        let kept = heap.alloc();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let cancel = Canceller::from_future(async move {
            let _ = rx.await;
        });

        let observing = gc_of.observe(Some(kept.clone()), Some(cancel));
        let cancelling = async move {
            for _ in 0..10 {
                task_turn().await;
            }
            tx.send(()).unwrap();
        };
        let (collected, ()) = tokio::join!(observing, cancelling);

        assert!(!collected.unwrap());
    })
    .await;
}

#[tokio::test]
async fn collection_wins_over_fired_canceller() {
    local(async {
        let heap = Heap::default();
        let gc_of = make_gc_of(ManualGc::from_heap(&heap), &Implementation::Native, &heap);
        let fired = Canceller::from_future(async {});

        assert!(gc_of.observe(None, Some(fired)).await.unwrap());
    })
    .await;
}

#[tokio::test]
async fn aggressive_collection_wins_over_canceller_fired_by_the_same_pass() {
    local(async {
        let heap = Heap::new(HostConfig::default().with_survivor_passes(2));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let passes = Rc::new(Cell::new(0));
        let gc = {
            let heap = heap.clone();
            let passes = passes.clone();
            let tx = RefCell::new(Some(tx));
            ManualGc::new(move || {
                heap.collect();
                passes.set(passes.get() + 1);
                // Fire the canceller on the pass that also reclaims the target.
                if passes.get() == 2 {
                    if let Some(tx) = tx.borrow_mut().take() {
                        let _ = tx.send(());
                    }
                }
            })
        };
        let gc_of = make_aggressive_gc_of(gc, &Implementation::Native, &heap);
        let cancel = Canceller::from_future(async move {
            let _ = rx.await;
        });

        assert!(gc_of.observe(None, Some(cancel)).await.unwrap());
        assert_eq!(passes.get(), 2);
    })
    .await;
}

#[tokio::test]
async fn foreign_target_is_rejected() {
    local(async {
        let heap = Heap::default();
        let other = Heap::default();
        let gc_of = make_gc_of(ManualGc::from_heap(&heap), &Implementation::Native, &heap);

        let result = gc_of.observe(Some(other.alloc()), Some(timeout_canceller(10))).await;
        assert_eq!(result, Err(Error::ForeignObject));
    })
    .await;
}

#[tokio::test]
async fn gc_task_collects_after_a_turn() {
    let heap = Heap::default();
    let (gc, count) = counting_gc(&heap);

    gc_task(Some(&gc)).await;
    gc_task(None).await;

    assert_eq!(count.get(), 1);
    assert_eq!(heap.stats().collections, 1);
}
