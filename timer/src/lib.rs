//! Keyed, cancellable timer.
//!
//! Tasks are addressed by a caller-supplied key (unique while the task is
//! live) and ordered by next-run time in a [`KeyedHeap`]. A dedicated
//! scheduler thread sleeps until the earliest deadline, pops the task for
//! the duration of its callback, and re-inserts it afterwards. Because the
//! running task is *not* heap-resident, a concurrent `cancel` or `update`
//! targeting it is routed through a deferred slot and applied after the
//! callback returns — the task is never both running and schedulable.
//!
//! In steady mode the next run is computed as `previous + interval` so a
//! slow callback catches up; otherwise it drifts to `now + interval`.

mod heap;

pub use heap::KeyedHeap;

use std::cmp::Ordering as CmpOrdering;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A scheduled task. Mutators are public so [`Timer::update`] closures can
/// reshape a live task.
pub struct Task {
    callback: Box<dyn FnMut() + Send>,
    start_delay: Duration,
    /// Remaining runs; negative means infinite, zero means cancelled.
    times: i64,
    interval: Duration,
    next_run: Instant,
}

impl Task {
    fn new(
        callback: Box<dyn FnMut() + Send>,
        start_delay: Duration,
        times: i64,
        interval: Duration,
    ) -> Self {
        Task {
            callback,
            start_delay,
            times,
            interval,
            next_run: Instant::now() + start_delay,
        }
    }

    pub fn times(&self) -> i64 {
        self.times
    }

    pub fn set_times(&mut self, times: i64) {
        self.times = times;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Push the next run out to `delay` from now.
    pub fn reschedule(&mut self, delay: Duration) {
        self.next_run = Instant::now() + delay;
    }

    /// Mark the task cancelled; it is garbage-collected lazily.
    pub fn cancel(&mut self) {
        self.times = 0;
    }

    fn need_schedule(&self) -> bool {
        self.times != 0
    }

    fn consume_run(&mut self) {
        if self.times > 0 {
            self.times -= 1;
        }
    }
}

// Heap order is next-run time alone.
impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.next_run == other.next_run
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.next_run.cmp(&other.next_run)
    }
}

type UpdateFn = Box<dyn FnOnce(&mut Task) + Send>;

struct Executing<K> {
    key: K,
    /// Deferred cancel: drop the task once its callback returns.
    remove: bool,
    /// Deferred update: applied once its callback returns.
    update: Option<UpdateFn>,
}

struct State<K> {
    heap: KeyedHeap<K, Task>,
    executing: Option<Executing<K>>,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    cv: Condvar,
    running: AtomicBool,
    steady: AtomicBool,
}

/// Keyed timer with a dedicated scheduler thread.
pub struct Timer<K> {
    shared: Arc<Shared<K>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<K> Timer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Timer {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    heap: KeyedHeap::new(),
                    executing: None,
                }),
                cv: Condvar::new(),
                running: AtomicBool::new(false),
                steady: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Schedule a task. It will not run before [`Timer::start`]; adding to a
    /// running timer honors `start_delay` from now.
    ///
    /// Rejects a key that is still live (scheduled or executing) and
    /// `times == 0`. Negative `times` repeats forever.
    pub fn add(
        &self,
        key: K,
        callback: impl FnMut() + Send + 'static,
        start_delay: Duration,
        times: i64,
        interval: Duration,
    ) -> bool {
        if times == 0 {
            return false;
        }
        let mut state = self.shared.state.lock().unwrap();
        if state.executing.as_ref().is_some_and(|e| e.key == key) {
            return false;
        }
        let task = Task::new(Box::new(callback), start_delay, times, interval);
        if !state.heap.push(key, task) {
            return false;
        }
        drop(state);
        // Wake the scheduler so it can reconsider its current sleep.
        if self.shared.running.load(Ordering::Acquire) {
            self.shared.cv.notify_one();
        }
        true
    }

    /// Mutate a live task and restore scheduling order. When the task is
    /// currently executing the mutation is applied after its callback
    /// returns.
    pub fn update(&self, key: &K, mutate: impl FnOnce(&mut Task) + Send + 'static) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let found = if state.heap.contains(key) {
            state.heap.update(key, mutate)
        } else if let Some(executing) = state.executing.as_mut().filter(|e| e.key == *key) {
            executing.update = Some(Box::new(mutate));
            true
        } else {
            false
        };
        drop(state);
        if found && self.shared.running.load(Ordering::Acquire) {
            self.shared.cv.notify_one();
        }
        found
    }

    /// Cancel by key. A task in mid-callback finishes its current run and is
    /// then removed; no further runs happen.
    pub fn cancel(&self, key: &K) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.heap.remove(key).is_some() {
            return true;
        }
        if let Some(executing) = state.executing.as_mut()
            && executing.key == *key
        {
            executing.remove = true;
            return true;
        }
        false
    }

    /// Drop every task; one in mid-callback is removed when it returns.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.heap.clear();
        if let Some(executing) = state.executing.as_mut() {
            executing.remove = true;
        }
    }

    /// Number of scheduled (non-executing) tasks.
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Steady mode: next run = previous scheduled + interval (catches up).
    pub fn set_steady(&self, steady: bool) {
        self.shared.steady.store(steady, Ordering::Release);
    }

    /// Spawn the scheduler thread. Every task's next run is recomputed as
    /// now + start_delay. Returns false if already running.
    pub fn start(&self) -> bool {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            let now = Instant::now();
            state
                .heap
                .update_all(|task| task.next_run = now + task.start_delay);
        }
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || scheduler(shared))
            .expect("failed to spawn timer thread");
        *self.worker.lock().unwrap() = Some(handle);
        true
    }

    /// Join the scheduler thread. Tasks stay registered and may be
    /// rescheduled by a later [`Timer::start`]. Returns false if not running.
    pub fn stop(&self) -> bool {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.state.lock().unwrap().executing = None;
        true
    }
}

impl<K> Default for Timer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for Timer<K> {
    fn drop(&mut self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            self.shared.cv.notify_all();
            if let Some(handle) = self.worker.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}

fn scheduler<K>(shared: Arc<Shared<K>>)
where
    K: Eq + Hash + Clone + Send + 'static,
{
    let mut state = shared.state.lock().unwrap();
    while shared.running.load(Ordering::Acquire) {
        if state.heap.is_empty() {
            state = shared.cv.wait(state).unwrap();
            continue;
        }
        // Lazily collect tasks cancelled while heap-resident.
        if !state.heap.peek().expect("non-empty heap").1.need_schedule() {
            let _ = state.heap.pop();
            continue;
        }

        let now = Instant::now();
        let next_run = state.heap.peek().expect("non-empty heap").1.next_run;
        if next_run > now {
            let (guard, _timed_out) = shared
                .cv
                .wait_timeout(state, next_run - now)
                .unwrap();
            state = guard;
            continue;
        }

        // Due: pop the task so concurrent cancel/update route through the
        // deferred slot, then run the callback unlocked.
        let (key, mut task) = state.heap.pop().expect("non-empty heap");
        state.executing = Some(Executing {
            key: key.clone(),
            remove: false,
            update: None,
        });
        drop(state);

        if panic::catch_unwind(AssertUnwindSafe(|| (task.callback)())).is_err() {
            tracing::warn!("timer callback panicked");
        }

        state = shared.state.lock().unwrap();
        task.consume_run();
        if shared.steady.load(Ordering::Acquire) {
            task.next_run += task.interval;
        } else {
            task.next_run = now + task.interval;
        }

        let executing = state.executing.take().expect("executing slot");
        if !executing.remove {
            if let Some(update) = executing.update {
                update(&mut task);
            }
            if task.need_schedule() {
                state.heap.push(executing.key, task);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fires_after_start_delay() {
        let timer = Timer::new();
        let (count, bump) = counter();
        assert!(timer.add(1u32, bump, Duration::from_millis(60), 1, Duration::ZERO));
        timer.start();

        thread::sleep(Duration::from_millis(15));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        timer.stop();
    }

    #[test]
    fn repeats_exactly_times_runs() {
        let timer = Timer::new();
        let (count, bump) = counter();
        timer.add(
            1u32,
            bump,
            Duration::from_millis(10),
            3,
            Duration::from_millis(15),
        );
        timer.start();
        thread::sleep(Duration::from_millis(250));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(timer.is_empty());
        timer.stop();
    }

    #[test]
    fn infinite_task_runs_until_cancelled() {
        let timer = Timer::new();
        let (count, bump) = counter();
        timer.add(
            7u32,
            bump,
            Duration::from_millis(5),
            -1,
            Duration::from_millis(10),
        );
        timer.start();
        thread::sleep(Duration::from_millis(120));
        assert!(timer.cancel(&7));
        let after_cancel = count.load(Ordering::SeqCst);
        assert!(after_cancel >= 3, "ran {after_cancel} times");

        thread::sleep(Duration::from_millis(60));
        // One in-flight run may finish, but no further runs happen.
        assert!(count.load(Ordering::SeqCst) <= after_cancel + 1);
        timer.stop();
    }

    #[test]
    fn rejects_duplicate_key_and_zero_times() {
        let timer = Timer::<u32>::new();
        assert!(timer.add(1, || {}, Duration::ZERO, 1, Duration::ZERO));
        assert!(!timer.add(1, || {}, Duration::ZERO, 1, Duration::ZERO));
        assert!(!timer.add(2, || {}, Duration::ZERO, 0, Duration::ZERO));
    }

    #[test]
    fn cancel_of_unknown_key_is_false() {
        let timer = Timer::<u32>::new();
        assert!(!timer.cancel(&9));
    }

    #[test]
    fn cancel_during_execution_lets_callback_finish() {
        let timer = Timer::new();
        let entered = Arc::new(AtomicBool::new(false));
        let (count, _) = counter();
        {
            let entered = entered.clone();
            let count = count.clone();
            timer.add(
                1u32,
                move || {
                    entered.store(true, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(80));
                    count.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(5),
                -1,
                Duration::from_millis(5),
            );
        }
        timer.start();
        while !entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        assert!(timer.cancel(&1));
        thread::sleep(Duration::from_millis(200));
        // The in-flight run completed, nothing after it.
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(timer.is_empty());
        timer.stop();
    }

    #[test]
    fn update_defers_until_after_execution() {
        let timer = Timer::new();
        let entered = Arc::new(AtomicBool::new(false));
        let (count, _) = counter();
        {
            let entered = entered.clone();
            let count = count.clone();
            timer.add(
                1u32,
                move || {
                    entered.store(true, Ordering::SeqCst);
                    count.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(60));
                },
                Duration::from_millis(5),
                -1,
                Duration::from_millis(5),
            );
        }
        timer.start();
        while !entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        // Applied post-run: only the in-flight invocation survives.
        assert!(timer.update(&1, |task| task.cancel()));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        timer.stop();
    }

    #[test]
    fn steady_mode_catches_up_after_slow_callback() {
        let run = |steady: bool| -> Duration {
            let timer = Timer::new();
            timer.set_steady(steady);
            let instants = Arc::new(Mutex::new(Vec::new()));
            {
                let instants = instants.clone();
                timer.add(
                    1u32,
                    move || {
                        instants.lock().unwrap().push(Instant::now());
                        thread::sleep(Duration::from_millis(90));
                    },
                    Duration::from_millis(5),
                    3,
                    Duration::from_millis(40),
                );
            }
            timer.start();
            thread::sleep(Duration::from_millis(500));
            timer.stop();
            let instants = instants.lock().unwrap();
            assert_eq!(instants.len(), 3);
            *instants.last().unwrap() - instants[0]
        };

        // Callback takes ~90ms with a 40ms interval. Steady mode fires the
        // next run immediately (behind schedule); drift mode waits the full
        // interval after each run.
        let steady = run(true);
        let drifty = run(false);
        assert!(
            steady < Duration::from_millis(230),
            "steady spread was {steady:?}"
        );
        assert!(
            drifty > Duration::from_millis(240),
            "drift spread was {drifty:?}"
        );
    }

    #[test]
    fn clear_drops_pending_tasks() {
        let timer = Timer::new();
        let (count, bump) = counter();
        timer.add(1u32, bump, Duration::from_millis(50), 1, Duration::ZERO);
        timer.start();
        timer.clear();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        timer.stop();
    }

    #[test]
    fn stop_then_restart_honors_start_delay_again() {
        let timer = Timer::new();
        let (count, bump) = counter();
        timer.add(1u32, bump, Duration::from_millis(20), 1, Duration::ZERO);
        timer.start();
        timer.stop();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        timer.start();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        timer.stop();
    }
}
