//! Keyed serialization for workspace operations.
//!
//! At most one provisioning or lifecycle operation may run concurrently per
//! workspace id; operations on different workspaces proceed in parallel. The
//! registry hands out one `Mutex` per key and never frees them — the key
//! space is bounded by the port range, so the map stays small.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct LockMap {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for one workspace id. Callers hold the returned guard for
    /// the duration of the state-changing operation.
    pub fn lock(&self, key: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn same_key_returns_same_lock() {
        let map = LockMap::new();
        let a = map.lock(1);
        let b = map.lock(1);
        assert!(Arc::ptr_eq(&a, &b));

        let c = map.lock(2);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn serializes_threads_on_one_key() {
        let map = Arc::new(LockMap::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = Arc::clone(&map);
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            handles.push(std::thread::spawn(move || {
                let lock = map.lock(42);
                let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
