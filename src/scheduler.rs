// src/scheduler.rs

//! Deferred callbacks for drum transitions.
//!
//! One min-heap of timers ordered by fire time, then by scheduling order.
//! Timers cannot be cancelled; callbacks guard themselves by comparing a
//! captured generation with the current one before acting.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Virtual clock for tests, only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos() as u64, AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(AtomicOrdering::SeqCst))
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Timer {
    due: Duration,
    seq: u64,
    callback: Callback,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct Queue {
    timers: BinaryHeap<Reverse<Timer>>,
    next_seq: u64,
    shutdown: bool,
}

struct Inner {
    clock: Arc<dyn Clock>,
    queue: Mutex<Queue>,
    wake: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Removes the earliest timer if it is due.
    fn pop_due(&self) -> Option<Timer> {
        let now = self.clock.now();
        let mut queue = self.lock();
        match queue.timers.peek() {
            Some(Reverse(timer)) if timer.due <= now => queue.timers.pop().map(|Reverse(t)| t),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// A scheduler without a thread; timers fire only from `run_due`.
    pub fn manual(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                queue: Mutex::new(Queue::default()),
                wake: Condvar::new(),
            }),
        }
    }

    /// A scheduler with one worker thread firing timers as they come due.
    pub fn spawn(clock: Arc<dyn Clock>) -> Self {
        let scheduler = Self::manual(clock);
        let inner = scheduler.inner.clone();
        if let Err(e) = thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || worker_loop(&inner))
        {
            log::error!("Failed to start scheduler thread: {}", e);
        }
        scheduler
    }

    pub fn schedule_after<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let due = self.inner.clock.now() + delay;
        let mut queue = self.inner.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.timers.push(Reverse(Timer {
            due,
            seq,
            callback: Box::new(callback),
        }));
        drop(queue);
        self.inner.wake.notify_all();
    }

    /// Fires every due timer on the calling thread and returns how many ran.
    pub fn run_due(&self) -> usize {
        let mut fired = 0;
        while let Some(timer) = self.inner.pop_due() {
            (timer.callback)();
            fired += 1;
        }
        fired
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Stops the worker thread. Pending timers are dropped.
    pub fn shutdown(&self) {
        let mut queue = self.inner.lock();
        queue.shutdown = true;
        queue.timers.clear();
        drop(queue);
        self.inner.wake.notify_all();
    }
}

fn worker_loop(inner: &Inner) {
    let mut queue = inner.lock();
    loop {
        if queue.shutdown {
            return;
        }
        let now = inner.clock.now();
        let wait = match queue.timers.peek() {
            Some(Reverse(timer)) if timer.due <= now => None,
            Some(Reverse(timer)) => Some(timer.due - now),
            None => Some(Duration::from_secs(3600)),
        };
        match wait {
            None => {
                if let Some(Reverse(timer)) = queue.timers.pop() {
                    drop(queue);
                    (timer.callback)();
                    queue = inner.lock();
                }
            }
            Some(wait) => {
                queue = inner
                    .wake
                    .wait_timeout(queue, wait)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn manual() -> (Arc<ManualClock>, Scheduler) {
        let clock = Arc::new(ManualClock::new());
        let scheduler = Scheduler::manual(clock.clone());
        (clock, scheduler)
    }

    #[test]
    fn timers_fire_only_when_due() {
        let (clock, scheduler) = manual();
        let (tx, rx) = mpsc::channel();
        scheduler.schedule_after(Duration::from_millis(100), move || tx.send(1).unwrap());

        assert_eq!(scheduler.run_due(), 0);
        clock.advance(Duration::from_millis(99));
        assert_eq!(scheduler.run_due(), 0);
        clock.advance(Duration::from_millis(1));
        assert_eq!(scheduler.run_due(), 1);
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn timers_fire_in_time_then_submission_order() {
        let (clock, scheduler) = manual();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, ms) in [("c", 30u64), ("a", 10), ("b1", 20), ("b2", 20)] {
            let order = order.clone();
            scheduler.schedule_after(Duration::from_millis(ms), move || {
                order.lock().unwrap().push(name)
            });
        }
        clock.advance(Duration::from_millis(50));
        assert_eq!(scheduler.run_due(), 4);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b1", "b2", "c"]);
    }

    #[test]
    fn callbacks_may_schedule_more_timers() {
        let (clock, scheduler) = manual();
        let (tx, rx) = mpsc::channel();
        let inner = scheduler.clone();
        scheduler.schedule_after(Duration::from_millis(5), move || {
            inner.schedule_after(Duration::from_millis(5), move || tx.send("second").unwrap());
        });
        clock.advance(Duration::from_millis(5));
        assert_eq!(scheduler.run_due(), 1);
        assert!(rx.try_recv().is_err());
        clock.advance(Duration::from_millis(5));
        assert_eq!(scheduler.run_due(), 1);
        assert_eq!(rx.try_recv(), Ok("second"));
    }

    #[test]
    fn spawned_scheduler_fires_on_its_own_thread() {
        let scheduler = Scheduler::spawn(Arc::new(SystemClock::new()));
        let (tx, rx) = mpsc::channel();
        scheduler.schedule_after(Duration::from_millis(20), move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap()
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("scheduler"));
        scheduler.shutdown();
    }
}
