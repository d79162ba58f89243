use super::{Cleanup, FinalizationRegistry, Implementation};
use crate::{
    error::Result,
    heap::{FinalizationSink, Heap, Object, RegistrationToken, RegistryId},
};
use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{self, Rc},
};

/// Registry backed by the heap's finalize check.
pub struct NativeRegistry<H: 'static> {
    inner: Rc<NativeInner<H>>,
}

struct NativeInner<H: 'static> {
    heap: Heap,
    id: RegistryId,
    holdings: RefCell<HashMap<RegistrationToken, H>>,
    cleanup: Cleanup<H>,
}

impl<H: 'static> NativeRegistry<H> {
    pub fn new(heap: &Heap, cleanup: impl FnMut(Vec<H>) + 'static) -> Self {
        let inner = Rc::new_cyclic(|this: &rc::Weak<NativeInner<H>>| {
            let sink: rc::Weak<dyn FinalizationSink> = this.clone();
            NativeInner {
                heap: heap.clone(),
                id: heap.new_registry(sink),
                holdings: RefCell::new(HashMap::new()),
                cleanup: Cleanup::new(Implementation::Native, cleanup),
            }
        });
        Self { inner }
    }
}

impl<H: 'static> FinalizationRegistry<H> for NativeRegistry<H> {
    fn register(
        &self,
        target: &Object,
        holding: H,
        unregister_token: Option<&Object>,
    ) -> Result<()> {
        let token = self
            .inner
            .heap
            .register_finalizer(self.inner.id, target, unregister_token)?;
        self.inner.holdings.borrow_mut().insert(token, holding);
        Ok(())
    }

    fn unregister(&self, unregister_token: &Object) -> bool {
        let removed = self
            .inner
            .heap
            .unregister_finalizers(self.inner.id, unregister_token.id());
        let mut holdings = self.inner.holdings.borrow_mut();
        for token in &removed {
            holdings.remove(token);
        }
        !removed.is_empty()
    }

    fn cleanup_some(&self) {
        // Holdings are handed over as part of every collection.
    }

    fn implementation(&self) -> Implementation {
        Implementation::Native
    }
}

impl<H: 'static> FinalizationSink for NativeInner<H> {
    fn finalized(&self, tokens: Vec<RegistrationToken>) {
        let batch: Vec<H> = {
            let mut holdings = self.holdings.borrow_mut();
            tokens.iter().filter_map(|token| holdings.remove(token)).collect()
        };
        self.cleanup.deliver(batch);
    }
}

impl<H: 'static> Drop for NativeInner<H> {
    fn drop(&mut self) {
        self.heap.forget_registry(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;

    fn collecting(heap: &Heap) -> (NativeRegistry<&'static str>, Rc<RefCell<Vec<&'static str>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let registry = NativeRegistry::new(heap, move |batch| sink.borrow_mut().extend(batch));
        (registry, seen)
    }

    #[test]
    fn test_delivers_holdings_during_collect() {
        let heap = Heap::default();
        let (registry, seen) = collecting(&heap);
        let kept = heap.alloc();
        registry.register(&kept, "kept", None).unwrap();
        registry.register(&heap.alloc(), "a", None).unwrap();
        registry.register(&heap.alloc(), "b", None).unwrap();

        heap.collect();

        let mut seen = seen.borrow().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_unregister_suppresses_callback() {
        let heap = Heap::default();
        let (registry, seen) = collecting(&heap);
        let token = heap.alloc();
        registry.register(&heap.alloc(), "gone", Some(&token)).unwrap();

        assert!(registry.unregister(&token));
        assert!(!registry.unregister(&token));
        heap.collect();

        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_same_target_registered_twice() {
        let heap = Heap::new(HostConfig::default().with_survivor_passes(2));
        let (registry, seen) = collecting(&heap);
        let target = heap.alloc();
        registry.register(&target, "first", None).unwrap();
        registry.register(&target, "second", None).unwrap();
        drop(target);

        heap.collect();
        assert!(seen.borrow().is_empty());
        heap.collect();

        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn test_dropping_registry_discards_registrations() {
        let heap = Heap::default();
        let (registry, seen) = collecting(&heap);
        registry.register(&heap.alloc(), "orphan", None).unwrap();
        assert_eq!(heap.registration_count(), 1);

        drop(registry);
        assert_eq!(heap.registration_count(), 0);
        heap.collect();
        assert!(seen.borrow().is_empty());
    }
}
