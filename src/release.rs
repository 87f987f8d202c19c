//! Background subtree reclamation.
//!
//! Dropping a large pruned subtree is pure deallocation work; doing it on
//! the thread that answers `receive_state_change` adds latency exactly where
//! it hurts. A single process-wide worker accepts type-erased owned handles
//! and drops them off the critical path.
//!
//! The promoted subtree needs no special handling during teardown: the
//! manager's strong handle keeps it (and everything below it) alive while
//! the old root's references unwind.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread;

use tracing::trace;

type Handle = Box<dyn Any + Send>;

struct WorkUnit {
    root: Handle,
    /// Kept alive until the unit is processed so the subtree it roots
    /// cannot be torn down mid-promotion.
    protected: Option<Handle>,
}

struct QueueInner {
    queue: VecDeque<WorkUnit>,
    /// A drained batch is being dropped outside the lock.
    busy: bool,
}

/// Process-wide release worker. Obtain through [`NodeReleaseService::global`].
pub struct NodeReleaseService {
    inner: Mutex<QueueInner>,
    condvar: Condvar,
    release_count: AtomicU64,
    max_queue_len: AtomicUsize,
}

static INSTANCE: OnceLock<&'static NodeReleaseService> = OnceLock::new();

impl NodeReleaseService {
    /// The process-wide instance; the worker thread starts on first use and
    /// lives for the remainder of the process.
    pub fn global() -> &'static NodeReleaseService {
        *INSTANCE.get_or_init(|| {
            let service: &'static NodeReleaseService = Box::leak(Box::new(NodeReleaseService {
                inner: Mutex::new(QueueInner {
                    queue: VecDeque::new(),
                    busy: false,
                }),
                condvar: Condvar::new(),
                release_count: AtomicU64::new(0),
                max_queue_len: AtomicUsize::new(0),
            }));
            thread::Builder::new()
                .name("node-release".into())
                .spawn(move || service.worker_loop())
                .expect("failed to spawn node release thread");
            service
        })
    }

    /// Enqueue `root` for destruction. `protected` (typically the promoted
    /// new root) is held until the unit is processed.
    pub fn release<T: Any + Send>(&self, root: T, protected: Option<T>) {
        let unit = WorkUnit {
            root: Box::new(root),
            protected: protected.map(|p| Box::new(p) as Handle),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(unit);
        self.max_queue_len
            .fetch_max(inner.queue.len(), Ordering::Relaxed);
        drop(inner);
        self.condvar.notify_one();
        self.release_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Subtrees handed over so far.
    pub fn release_count(&self) -> u64 {
        self.release_count.load(Ordering::Relaxed)
    }

    /// High-water mark of the work queue.
    pub fn max_queue_len(&self) -> usize {
        self.max_queue_len.load(Ordering::Relaxed)
    }

    /// Block until every unit enqueued so far has been dropped. Test hook.
    pub fn drain(&self) {
        let inner = self.inner.lock().unwrap();
        let _unused = self
            .condvar
            .wait_while(inner, |inner| !inner.queue.is_empty() || inner.busy)
            .unwrap();
    }

    fn worker_loop(&self) {
        loop {
            let batch: Vec<WorkUnit> = {
                let inner = self.inner.lock().unwrap();
                let mut inner = self
                    .condvar
                    .wait_while(inner, |inner| inner.queue.is_empty())
                    .unwrap();
                inner.busy = true;
                inner.queue.drain(..).collect()
            };

            let n = batch.len();
            drop(batch);
            trace!(units = n, "released subtree batch");

            let mut inner = self.inner.lock().unwrap();
            inner.busy = false;
            drop(inner);
            // Wake any drain() waiters.
            self.condvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn releases_are_counted_and_processed() {
        let service = NodeReleaseService::global();
        let before = service.release_count();

        let payload = Arc::new(vec![1u8, 2, 3]);
        let observer = Arc::downgrade(&payload);
        service.release(payload, None);
        service.drain();

        assert!(service.release_count() >= before + 1);
        assert!(observer.upgrade().is_none(), "payload should be dropped");
    }

    #[test]
    fn protected_handle_survives_via_external_reference() {
        let service = NodeReleaseService::global();

        let root = Arc::new(String::from("old root"));
        let kept = Arc::new(String::from("new root"));
        let kept_extern = Arc::clone(&kept);

        service.release(root, Some(kept));
        service.drain();

        // The worker dropped its handle, but the manager-side reference
        // keeps the protected value alive.
        assert_eq!(kept_extern.as_str(), "new root");
    }

    #[test]
    fn queue_high_water_mark_tracks() {
        let service = NodeReleaseService::global();
        for _ in 0..4 {
            service.release(Arc::new(0u32), None);
        }
        service.drain();
        assert!(service.max_queue_len() >= 1);
    }
}
