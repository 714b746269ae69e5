// src/pool.rs
//
// Fixed worker pool draining a FIFO task queue. A task names a connection
// slot (index + generation) and the readiness that caused it; the worker
// checks the connection out of the table, runs one processing step, parks
// it back and re-arms. Submission never blocks: backpressure is exerted
// upstream by the event loop's admission control, not here.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::conn::Readiness;

/// One unit of connection-processing work. Owned by the queue until a
/// worker claims it.
#[derive(Debug, Clone, Copy)]
pub struct Task {
    pub slot: u32,
    pub generation: u32,
    pub reason: Readiness,
}

struct QueueInner {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// Mutex-guarded FIFO with a "queue nonempty" condition variable. Each
/// submission wakes exactly one idle worker.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    nonempty: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                closed: false,
            }),
            nonempty: Condvar::new(),
        }
    }

    pub fn submit(&self, task: Task) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.tasks.push_back(task);
        self.nonempty.notify_one();
    }

    /// Block until a task is available. `None` means the queue is closed
    /// and drained; the worker exits.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(task) = inner.tasks.pop_front() {
                return Some(task);
            }
            if inner.closed {
                return None;
            }
            inner = self.nonempty.wait(inner).unwrap();
        }
    }

    /// Stop accepting work and wake every idle worker so the pool can
    /// drain and exit.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.nonempty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Seam between the pool and the engine that executes processing steps.
pub trait TaskHandler: Send + Sync + 'static {
    fn run_task(&self, task: Task);
}

/// Fixed set of long-lived worker threads, sized at startup and never
/// resized.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        queue: Arc<TaskQueue>,
        handler: Arc<dyn TaskHandler>,
    ) -> std::io::Result<Self> {
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles = Vec::with_capacity(count);

        for i in 0..count {
            let queue = queue.clone();
            let handler = handler.clone();
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };

            let handle = thread::Builder::new()
                .name(format!("ember-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, core = id.id, "worker pinned");
                        }
                    }
                    while let Some(task) = queue.pop() {
                        handler.run_task(task);
                    }
                    tracing::debug!(worker = i, "worker exiting");
                })?;
            handles.push(handle);
        }

        Ok(Self { handles })
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
