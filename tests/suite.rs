use tokio::task::LocalSet;
use weakrefs_conformance::{
    config::HostConfig,
    harness::{gc_of, gc_of_raw, observer_for, timeout_canceller},
    heap::Heap,
    probe::Capabilities,
    registry::Implementation,
    suite::{run_suite, SuiteOptions},
    Error,
};

fn caps_with(native: bool, stub: bool, shim: bool) -> Capabilities {
    Capabilities {
        gc_available: true,
        native_available: native,
        stub_available: stub,
        shim_available: shim,
    }
}

#[tokio::test]
async fn every_implementation_passes_the_suite() {
    LocalSet::new()
        .run_until(async {
            for implementation in Implementation::ALL {
                let heap = Heap::default();
                let gc = heap.gc_trigger().unwrap();
                let outcomes = run_suite(&heap, gc, implementation, &SuiteOptions::default())
                    .await
                    .unwrap();

                assert_eq!(outcomes.len(), 7);
                for outcome in outcomes {
                    assert!(outcome.passed, "{implementation}: {}", outcome.name);
                }
            }
        })
        .await;
}

#[tokio::test]
async fn aggressive_suite_passes_on_generational_host() {
    LocalSet::new()
        .run_until(async {
            let heap = Heap::new(HostConfig::default().with_survivor_passes(3));
            let gc = heap.gc_trigger().unwrap();
            let options = SuiteOptions {
                timeout_ms: 200,
                aggressive: true,
                max_passes: None,
            };

            let outcomes = run_suite(&heap, gc, Implementation::Native, &options)
                .await
                .unwrap();
            assert!(outcomes.iter().all(|o| o.passed), "{outcomes:?}");
        })
        .await;
}

#[tokio::test]
async fn factories_pick_implementations_in_order() {
    LocalSet::new()
        .run_until(async {
            let heap = Heap::default();

            let raw = gc_of_raw(&heap, &caps_with(false, true, true)).unwrap().unwrap();
            assert_eq!(raw.implementation(), Implementation::Stub);

            let any = gc_of(&heap, &caps_with(false, true, true)).unwrap().unwrap();
            assert_eq!(any.implementation(), Implementation::Shim);

            assert!(any.observe(None, Some(timeout_canceller(50))).await.unwrap());
        })
        .await;
}

#[test]
fn factories_skip_hosts_without_gc_or_weakrefs() {
    let heap = Heap::default();
    let no_gc = Capabilities {
        gc_available: false,
        ..caps_with(true, true, true)
    };

    assert!(gc_of(&heap, &no_gc).unwrap().is_none());
    assert!(gc_of_raw(&heap, &no_gc).unwrap().is_none());
    assert!(gc_of_raw(&heap, &caps_with(false, false, false)).unwrap().is_none());
}

#[test]
fn explicit_selection_reports_unavailable_implementations() {
    let heap = Heap::default();
    let caps = caps_with(false, true, true);

    assert!(matches!(
        observer_for(&heap, &caps, Implementation::Native, false),
        Err(Error::ImplementationDisabled(Implementation::Native))
    ));
    assert!(matches!(
        observer_for(
            &heap,
            &Capabilities {
                gc_available: false,
                ..caps
            },
            Implementation::Stub,
            false
        ),
        Err(Error::GcUnavailable)
    ));
    assert_eq!(
        caps_with(false, false, false).select(),
        Err(Error::ImplementationNotAvailable)
    );
}

#[test]
fn hidden_gc_trigger_is_not_handed_out() {
    let config = HostConfig {
        expose_gc: false,
        ..HostConfig::default()
    };
    let caps = Capabilities::probe(&config);
    let heap = Heap::new(config);

    assert!(heap.gc_trigger().is_none());
    assert!(!caps.gc_available);
}
