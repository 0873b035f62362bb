//! Stack-wide timer queue.
//!
//! Connections and listeners register one deadline each, keyed by `K`.
//! Expiry does not run protocol code: [TimerQueue::pop_due] only hands a
//! due key to the caller, which delivers a timer event to the endpoint
//! under the endpoint's own lock. [TimerQueue::cancel_and_join] guarantees
//! that no firing for a key is in progress (on another thread) once it
//! returns.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Instant;

#[derive(Debug)]
struct Scheduled<K> {
    at: Instant,
    generation: u64,
    key: K,
}

impl<K> PartialEq for Scheduled<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.generation == other.generation
    }
}

impl<K> Eq for Scheduled<K> {}

impl<K> PartialOrd for Scheduled<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Scheduled<K> {
    // Reversed: the earliest deadline is the greatest element.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

#[derive(Debug)]
struct State<K> {
    heap: BinaryHeap<Scheduled<K>>,
    /// Live deadline of each key; heap entries with another generation are
    /// stale.
    armed: HashMap<K, (Instant, u64)>,
    /// Keys handed out by `pop_due` and not yet finished.
    firing: HashMap<K, ThreadId>,
    generation: u64,
    shutdown: bool,
}

/// Deadlines of every endpoint of a stack.
#[derive(Debug)]
pub struct TimerQueue<K> {
    state: Mutex<State<K>>,
    cond: Condvar,
}

impl<K: Copy + Eq + Hash> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash> TimerQueue<K> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                armed: HashMap::new(),
                firing: HashMap::new(),
                generation: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the deadline of `key`, replacing any previous one.
    pub fn schedule(&self, key: K, at: Instant) {
        let mut state = self.lock();

        if state.armed.get(&key).is_some_and(|(armed, _)| *armed == at) {
            return;
        }

        state.generation += 1;
        let generation = state.generation;

        state.armed.insert(key, (at, generation));
        state.heap.push(Scheduled {
            at,
            generation,
            key,
        });

        self.cond.notify_all();
    }

    /// Sets the deadline of `key`, or cancels it when `at` is `None`.
    pub fn reschedule(&self, key: K, at: Option<Instant>) {
        match at {
            Some(at) => self.schedule(key, at),
            None => self.cancel(key),
        }
    }

    /// Removes the deadline of `key`. A firing already handed out may still
    /// be in progress.
    pub fn cancel(&self, key: K) {
        self.lock().armed.remove(&key);
    }

    /// Removes the deadline of `key` and waits for a firing of it in
    /// progress on another thread to finish.
    pub fn cancel_and_join(&self, key: K) {
        let me = thread::current().id();
        let mut state = self.lock();

        state.armed.remove(&key);

        while state.firing.get(&key).is_some_and(|owner| *owner != me) {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Returns the deadline of `key`, if armed.
    pub fn deadline(&self, key: K) -> Option<Instant> {
        self.lock().armed.get(&key).map(|(at, _)| *at)
    }

    /// Returns the earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut state = self.lock();
        Self::prune(&mut state);
        state.heap.peek().map(|entry| entry.at)
    }

    /// Disarms and returns one key due at `now`. It must be passed to
    /// [TimerQueue::finish] once its event was delivered.
    pub fn pop_due(&self, now: Instant) -> Option<K> {
        let mut state = self.lock();
        Self::prune(&mut state);

        if state.heap.peek().is_none_or(|entry| entry.at > now) {
            return None;
        }

        let entry = state.heap.pop()?;
        state.armed.remove(&entry.key);
        state.firing.insert(entry.key, thread::current().id());

        Some(entry.key)
    }

    /// Marks the firing of `key` as complete.
    pub fn finish(&self, key: K) {
        self.lock().firing.remove(&key);
        self.cond.notify_all();
    }

    /// Blocks until `until` or the earliest armed deadline, whichever comes
    /// first, or until the deadlines change. Returns `false` once the queue
    /// was shut down.
    pub fn wait(&self, until: Option<Instant>) -> bool {
        let mut state = self.lock();

        if state.shutdown {
            return false;
        }

        Self::prune(&mut state);
        let earliest = state.heap.peek().map(|entry| entry.at);

        let until = match (until, earliest) {
            (Some(until), Some(earliest)) => Some(until.min(earliest)),
            (until, earliest) => until.or(earliest),
        };

        let state = match until {
            Some(until) => {
                let timeout = until.saturating_duration_since(Instant::now());
                if timeout.is_zero() {
                    return true;
                }

                self.cond
                    .wait_timeout(state, timeout)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
        };

        !state.shutdown
    }

    /// Wakes every waiter and makes [TimerQueue::wait] return `false`.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Drops stale entries from the top of the heap.
    fn prune(state: &mut State<K>) {
        while let Some(top) = state.heap.peek() {
            let live = state
                .armed
                .get(&top.key)
                .is_some_and(|(_, generation)| *generation == top.generation);

            if live {
                break;
            }

            state.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn fires_in_deadline_order() {
        let now = Instant::now();
        let queue = TimerQueue::new();

        queue.schedule(1u32, now + ms(30));
        queue.schedule(2, now + ms(10));
        queue.schedule(3, now + ms(20));

        assert_eq!(queue.next_deadline(), Some(now + ms(10)));
        assert_eq!(queue.pop_due(now + ms(25)), Some(2));
        assert_eq!(queue.pop_due(now + ms(25)), Some(3));
        assert_eq!(queue.pop_due(now + ms(25)), None);
        assert_eq!(queue.next_deadline(), Some(now + ms(30)));

        queue.finish(2);
        queue.finish(3);
    }

    #[test]
    fn rescheduling_supersedes() {
        let now = Instant::now();
        let queue = TimerQueue::new();

        queue.schedule(1u32, now + ms(10));
        queue.schedule(1, now + ms(50));

        assert_eq!(queue.pop_due(now + ms(20)), None);
        assert_eq!(queue.deadline(1), Some(now + ms(50)));

        queue.reschedule(1, None);
        assert_eq!(queue.next_deadline(), None);
        assert_eq!(queue.pop_due(now + ms(100)), None);
    }

    #[test]
    fn cancel_and_join_waits_for_firing() {
        let now = Instant::now();
        let queue = Arc::new(TimerQueue::new());
        let finished = Arc::new(AtomicBool::new(false));

        queue.schedule(7u32, now);
        assert_eq!(queue.pop_due(now), Some(7));

        let worker = {
            let queue = Arc::clone(&queue);
            let finished = Arc::clone(&finished);

            thread::spawn(move || {
                queue.cancel_and_join(7);
                finished.load(Ordering::SeqCst)
            })
        };

        thread::sleep(ms(50));
        finished.store(true, Ordering::SeqCst);
        queue.finish(7);

        assert!(worker.join().unwrap());
    }

    #[test]
    fn cancel_and_join_from_firing_thread_returns() {
        let now = Instant::now();
        let queue = TimerQueue::new();

        queue.schedule(1u32, now);
        assert_eq!(queue.pop_due(now), Some(1));

        queue.cancel_and_join(1);
        queue.finish(1);
    }

    #[test]
    fn shutdown_stops_waiters() {
        let queue = Arc::new(TimerQueue::<u32>::new());

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait(None))
        };

        thread::sleep(ms(20));
        queue.shutdown();

        assert!(!waiter.join().unwrap());
        assert!(!queue.wait(Some(Instant::now() + ms(10))));
    }

    #[test]
    fn wait_returns_for_due_deadline() {
        let queue = TimerQueue::new();

        queue.schedule(1u32, Instant::now());
        assert!(queue.wait(None));
    }
}
