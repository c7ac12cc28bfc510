//! Object pools for per-record allocations.
//!
//! The hot loop decodes every record into a map and accumulates bytes into
//! scratch buffers; pooling those keeps allocation churn flat under load.
//! Returned objects are reset by the pool itself, so a stale key from one
//! record can never satisfy a field-present check for the next.

use std::sync::Mutex;

/// A simple thread-safe object pool.
///
/// `get` hands out a pooled object or builds a fresh one; `put` resets the
/// object and shelves it. Unbalanced get/put from concurrent users is fine:
/// an unreturned object is simply dropped, and an empty pool falls back to
/// the factory.
pub struct ObjectPool<T> {
    items: Mutex<Vec<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    reset: Box<dyn Fn(&mut T) + Send + Sync>,
}

impl<T> ObjectPool<T> {
    /// Create a pool with a factory for new objects and a reset applied on
    /// every return.
    pub fn new(
        factory: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            reset: Box::new(reset),
        }
    }

    /// Take an object from the pool, or build a fresh one if empty.
    pub fn get(&self) -> T {
        let pooled = self.items.lock().unwrap().pop();
        pooled.unwrap_or_else(|| (self.factory)())
    }

    /// Reset an object and return it to the pool.
    pub fn put(&self, mut item: T) {
        (self.reset)(&mut item);
        self.items.lock().unwrap().push(item);
    }

    /// Number of idle objects currently pooled.
    pub fn idle(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

/// Pool of record maps, cleared on return.
pub(crate) fn record_map_pool() -> ObjectPool<serde_json::Map<String, serde_json::Value>> {
    ObjectPool::new(serde_json::Map::new, |m| m.clear())
}
