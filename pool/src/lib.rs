//! Fixed-size worker pool with a FIFO task queue.
//!
//! Tasks are dequeued in submission order by a fixed set of threads. The
//! pool can be paused (workers stop dequeuing, in-flight tasks finish),
//! waited on (blocks until the queue is empty and nothing is running), and
//! resized (drains, joins, respawns — preserving the pause state). A panic
//! inside a task is trapped at the task boundary and logged; it never takes
//! a worker down.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Task>,
    running: bool,
    paused: bool,
    /// Queued plus currently-executing tasks.
    total: usize,
}

struct Shared {
    queue: Mutex<Queue>,
    task_avail: Condvar,
    task_done: Condvar,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// `thread_count == 0` selects the hardware concurrency (minimum 1).
    pub fn new(thread_count: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                running: true,
                paused: false,
                total: 0,
            }),
            task_avail: Condvar::new(),
            task_done: Condvar::new(),
        });
        let mut pool = WorkerPool {
            shared,
            threads: Vec::new(),
        };
        pool.spawn_threads(effective_thread_count(thread_count));
        pool
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().unwrap().tasks.len()
    }

    /// Tasks currently executing on a worker.
    pub fn executing(&self) -> usize {
        let q = self.shared.queue.lock().unwrap();
        q.total - q.tasks.len()
    }

    /// Enqueue a task and wake one waiting worker.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let mut q = self.shared.queue.lock().unwrap();
        q.tasks.push_back(Box::new(task));
        q.total += 1;
        drop(q);
        self.shared.task_avail.notify_one();
    }

    /// Block until the queue is drained and no task is executing. While the
    /// pool is paused this waits only for the executing tasks.
    pub fn wait(&self) {
        let mut q = self.shared.queue.lock().unwrap();
        loop {
            let settled = if q.paused { q.tasks.len() } else { 0 };
            if q.total == settled {
                return;
            }
            q = self.shared.task_done.wait(q).unwrap();
        }
    }

    /// Stop dequeuing new tasks. Tasks already executing run to completion.
    pub fn pause(&self) {
        self.shared.queue.lock().unwrap().paused = true;
    }

    /// Resume dequeuing.
    pub fn resume(&self) {
        self.shared.queue.lock().unwrap().paused = false;
        self.shared.task_avail.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.queue.lock().unwrap().paused
    }

    /// Drain in-flight work, join every worker, and respawn with the new
    /// thread count. Queued tasks survive; the pause state is preserved.
    pub fn resize(&mut self, thread_count: usize) {
        let was_paused = self.is_paused();
        self.pause();
        self.wait();
        self.join_threads();
        self.shared.queue.lock().unwrap().running = true;
        self.spawn_threads(effective_thread_count(thread_count));
        if !was_paused {
            self.resume();
        }
    }

    /// Drain all tasks, then join the workers. The pool cannot be used
    /// afterwards; dropping the pool calls this implicitly.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.wait();
        self.join_threads();
    }

    fn spawn_threads(&mut self, count: usize) {
        for i in 0..count {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || worker(shared))
                .expect("failed to spawn worker thread");
            self.threads.push(handle);
        }
    }

    fn join_threads(&mut self) {
        self.shared.queue.lock().unwrap().running = false;
        self.shared.task_avail.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn effective_thread_count(requested: usize) -> usize {
    if requested > 0 {
        requested
    } else {
        num_cpus::get().max(1)
    }
}

fn worker(shared: Arc<Shared>) {
    let mut q = shared.queue.lock().unwrap();
    loop {
        while q.running && (q.paused || q.tasks.is_empty()) {
            q = shared.task_avail.wait(q).unwrap();
        }
        if !q.running {
            return;
        }
        let task = q.tasks.pop_front().expect("non-empty queue");
        drop(q);

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::warn!("task panicked; worker continues");
        }

        q = shared.queue.lock().unwrap();
        q.total -= 1;
        shared.task_done.notify_all();
    }
}
