use crate::worker::pollable::WorkerId;
use crate::worker::{Semaphore, Worker, WorkerHandle};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// How many workers are currently inside their reactor loop. A plain count
// rather than part of the registry: the classifier cache derives its
// per-thread quota from it on hot paths.
static RUNNING_WORKERS: AtomicUsize = AtomicUsize::new(0);

pub fn running_workers() -> usize {
    RUNNING_WORKERS.load(Ordering::Relaxed)
}

pub(crate) fn worker_started() {
    RUNNING_WORKERS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn worker_finished() {
    RUNNING_WORKERS.fetch_sub(1, Ordering::Relaxed);
}

/// Process-wide set of worker handles. Passed around as an explicit
/// context object; only the running count above is global.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<BTreeMap<WorkerId, WorkerHandle>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        WorkerRegistry::default()
    }

    pub fn register(&self, handle: WorkerHandle) {
        self.workers.lock().insert(handle.id(), handle);
    }

    pub fn deregister(&self, id: WorkerId) {
        self.workers.lock().remove(&id);
    }

    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.workers.lock().values().cloned().collect()
    }

    pub fn get(&self, id: WorkerId) -> Option<WorkerHandle> {
        self.workers.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }

    /// Pick the handle with the fewest live descriptors is a later
    /// refinement; for now sessions are spread round-robin by id.
    pub fn pick(&self, seed: usize) -> Option<WorkerHandle> {
        let workers = self.workers.lock();
        if workers.is_empty() {
            return None;
        }
        workers.values().nth(seed % workers.len()).cloned()
    }

    /// Run `task` on every worker, one worker at a time. Serial execution
    /// keeps the peak memory of collectors at 1/N of a parallel gather.
    pub fn execute_serially(&self, task: Arc<dyn Fn(&mut Worker) + Send + Sync>) -> usize {
        let mut executed = 0;
        for handle in self.handles() {
            let task = Arc::clone(&task);
            if handle.call(move |worker| task(worker)) {
                executed += 1;
            }
        }
        executed
    }

    /// Post `task` to every worker and wait for all of them.
    pub fn execute_concurrently(&self, task: Arc<dyn Fn(&mut Worker) + Send + Sync>) -> usize {
        let sem = Arc::new(Semaphore::new());
        let mut posted = 0;
        for handle in self.handles() {
            let task = Arc::clone(&task);
            if handle.execute(
                move |worker| task(worker),
                Some(Arc::clone(&sem)),
                crate::worker::ExecuteMode::Queued,
            ) {
                posted += 1;
            }
        }
        sem.wait_n(posted);
        posted
    }

    /// Fire-and-forget on every worker.
    pub fn broadcast(&self, task: Arc<dyn Fn(&mut Worker) + Send + Sync>) -> usize {
        let mut posted = 0;
        for handle in self.handles() {
            let task = Arc::clone(&task);
            if handle.execute(
                move |worker| task(worker),
                None,
                crate::worker::ExecuteMode::Queued,
            ) {
                posted += 1;
            }
        }
        posted
    }

    pub fn shutdown_all(&self) {
        for handle in self.handles() {
            handle.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::DEFAULT_MAX_EVENTS;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn serial_execution_touches_every_worker() {
        let registry = WorkerRegistry::new();
        let mut threads = Vec::new();
        for _ in 0..3 {
            let worker = Worker::new(DEFAULT_MAX_EVENTS).unwrap();
            let wt = worker.start("registry-test").unwrap();
            registry.register(wt.handle().clone());
            threads.push(wt);
        }

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let executed = registry.execute_serially(Arc::new(move |_w| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(executed, 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);

        registry.shutdown_all();
        for wt in threads {
            wt.join();
        }
    }

    #[test]
    fn concurrent_execution_waits_for_all() {
        let registry = WorkerRegistry::new();
        let mut threads = Vec::new();
        for _ in 0..2 {
            let wt = Worker::new(DEFAULT_MAX_EVENTS)
                .unwrap()
                .start("registry-test")
                .unwrap();
            registry.register(wt.handle().clone());
            threads.push(wt);
        }
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let posted = registry.execute_concurrently(Arc::new(move |_w| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(posted, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        registry.shutdown_all();
        for wt in threads {
            wt.join();
        }
    }
}
