use super::PrimitiveImpl;
use anyhow::anyhow;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Process-wide LRU of selected implementations, shared by every network of
/// an engine.
pub struct ImplCache {
    entries: Mutex<LruCache<String, Arc<dyn PrimitiveImpl>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl ImplCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Mutex::new(LruCache::new(capacity)), hits: AtomicUsize::new(0), misses: AtomicUsize::new(0) }
    }

    /// Returns the cached prototype for `key` or builds and stores one. The
    /// lock is not held while `build` runs.
    pub fn get_or_try_insert_with<F>(&self, key: &str, build: F) -> anyhow::Result<(Option<Arc<dyn PrimitiveImpl>>, bool)>
    where
        F: FnOnce() -> anyhow::Result<Option<Arc<dyn PrimitiveImpl>>>,
    {
        if let Some(found) = self.entries.lock().map_err(|_| anyhow!("impl cache mutex poisoned"))?.get(key).cloned() {
            self.hits.fetch_add(1, Ordering::SeqCst);
            return Ok((Some(found), true));
        }
        self.misses.fetch_add(1, Ordering::SeqCst);

        let built = build()?;
        if let Some(imp) = &built {
            let mut entries = self.entries.lock().map_err(|_| anyhow!("impl cache mutex poisoned"))?;
            if let Some(existing) = entries.get(key).cloned() {
                return Ok((Some(existing), false));
            }
            entries.put(key.to_string(), imp.clone());
        }
        Ok((built, false))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Event;
    use crate::runtime::ExecuteContext;

    #[derive(Clone)]
    struct Nop;

    impl PrimitiveImpl for Nop {
        fn kernel_name(&self) -> &str {
            "nop"
        }
        fn execute(&mut self, _ctx: &mut ExecuteContext<'_>) -> anyhow::Result<Event> {
            Ok(Event::completed())
        }
        fn clone_box(&self) -> Box<dyn PrimitiveImpl> {
            Box::new(self.clone())
        }
    }

    #[test]
    fn builds_once_then_hits() {
        let cache = ImplCache::new(2);
        let mut builds = 0;
        for _ in 0..3 {
            let (imp, _) = cache
                .get_or_try_insert_with("a", || {
                    builds += 1;
                    Ok(Some(Arc::new(Nop) as Arc<dyn PrimitiveImpl>))
                })
                .unwrap();
            assert!(imp.is_some());
        }
        assert_eq!(builds, 1);
        assert_eq!((cache.hits(), cache.misses()), (2, 1));
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ImplCache::new(1);
        let make = || Ok(Some(Arc::new(Nop) as Arc<dyn PrimitiveImpl>));
        cache.get_or_try_insert_with("a", make).unwrap();
        cache.get_or_try_insert_with("b", make).unwrap();
        let (_, hit) = cache.get_or_try_insert_with("a", make).unwrap();
        assert!(!hit);
        assert_eq!(cache.len(), 1);
    }
}
