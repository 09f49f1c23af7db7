//! Keyed delay queue with a single blocking consumer.
//!
//! Each key owns at most one pending entry. [`DelayQueue::requeue`] replaces
//! both deadline and payload, so a burst of notifications for the same path
//! collapses into one dispatch. The consumer waits on a condition variable
//! whose timeout is the earliest pending deadline and is woken whenever a
//! producer inserts an entry that becomes the new head.
//!
//! The queue itself never fails. What a failed callback means is decided by
//! the callback, which may requeue its own key.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

/// Upper bound applied to requested delays so `Instant` arithmetic cannot
/// overflow.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug)]
struct Pending<P> {
    deadline: Instant,
    seq: u64,
    payload: P,
}

#[derive(Debug)]
struct QueueState<K, P> {
    entries: HashMap<K, Pending<P>>,
    /// Deadline index; `seq` breaks ties in insertion order.
    order: BTreeMap<(Instant, u64), K>,
    next_seq: u64,
    stopped: bool,
    running: bool,
    dispatched: u64,
}

/// Holds the queue lock for the dispatch loop and marks the loop finished on
/// drop, including during unwinding.
struct LoopGuard<'a, K, P> {
    state: MutexGuard<'a, QueueState<K, P>>,
    done: &'a Condvar,
}

impl<K, P> Drop for LoopGuard<'_, K, P> {
    fn drop(&mut self) {
        self.state.running = false;
        self.done.notify_all();
    }
}

/// Thread-safe keyed delay queue.
#[derive(Debug)]
pub struct DelayQueue<K, P> {
    state: Mutex<QueueState<K, P>>,
    wakeup: Condvar,
    done: Condvar,
}

impl<K, P> Default for DelayQueue<K, P>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> DelayQueue<K, P>
where
    K: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                stopped: false,
                running: false,
                dispatched: 0,
            }),
            wakeup: Condvar::new(),
            done: Condvar::new(),
        }
    }

    /// Insert or replace the entry for `key`, due `delay` from now.
    ///
    /// A zero delay makes the entry ready immediately. Requeueing after
    /// [`stop`](Self::stop) still records the entry; it is simply never
    /// dispatched.
    pub fn requeue(&self, key: K, delay: Duration, payload: P) {
        let deadline = Instant::now() + delay.min(MAX_DELAY);
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq = state.next_seq.wrapping_add(1);

        let pending = Pending {
            deadline,
            seq,
            payload,
        };
        if let Some(prev) = state.entries.insert(key.clone(), pending) {
            state.order.remove(&(prev.deadline, prev.seq));
        }
        state.order.insert((deadline, seq), key);

        let became_head = state
            .order
            .keys()
            .next()
            .is_some_and(|&(_, head_seq)| head_seq == seq);
        let pending_len = state.entries.len();
        drop(state);

        trace!(
            target: "fsqlite.backup::queue",
            delay_ms = delay.as_millis() as u64,
            pending_len,
            became_head,
            "entry requeued"
        );
        if became_head {
            self.wakeup.notify_one();
        }
    }

    /// Drop the pending entry for `key`, returning its payload.
    pub fn remove<Q>(&self, key: &Q) -> Option<P>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut state = self.state.lock();
        let pending = state.entries.remove(key)?;
        state.order.remove(&(pending.deadline, pending.seq));
        Some(pending.payload)
    }

    /// Dispatch entries as their deadlines elapse until [`stop`](Self::stop).
    ///
    /// `callback` runs without the queue lock held, so it may call
    /// [`requeue`](Self::requeue). Its return value is informational: a
    /// `false` result is logged and the entry is not retried. Only one loop
    /// may run at a time; a concurrent second call returns immediately.
    pub fn run_loop<F>(&self, mut callback: F)
    where
        F: FnMut(&K, P) -> bool,
    {
        let mut state = self.state.lock();
        if state.running {
            warn!(
                target: "fsqlite.backup::queue",
                "dispatch loop already running; ignoring second consumer"
            );
            return;
        }
        state.running = true;
        debug!(target: "fsqlite.backup::queue", "dispatch loop started");

        // Clears `running` and wakes `wait_until_done` even if the callback
        // unwinds.
        let mut guard = LoopGuard {
            state,
            done: &self.done,
        };
        let state = &mut guard.state;

        while !state.stopped {
            let Some(deadline) = state.order.keys().next().map(|&(deadline, _)| deadline) else {
                self.wakeup.wait(state);
                continue;
            };
            if Instant::now() < deadline {
                let _timed_out = self.wakeup.wait_until(state, deadline);
                continue;
            }

            let Some((_, key)) = state.order.pop_first() else {
                continue;
            };
            let Some(pending) = state.entries.remove(&key) else {
                continue;
            };
            state.dispatched = state.dispatched.saturating_add(1);

            let ok = MutexGuard::unlocked(state, || callback(&key, pending.payload));
            if !ok {
                trace!(
                    target: "fsqlite.backup::queue",
                    "callback reported failure; entry consumed"
                );
            }
        }

        let leftover = state.entries.len();
        drop(guard);
        debug!(
            target: "fsqlite.backup::queue",
            leftover,
            "dispatch loop exited"
        );
    }

    /// Ask the loop to exit once the in-flight callback (if any) returns.
    /// Pending entries are left undispatched.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        drop(state);
        debug!(target: "fsqlite.backup::queue", "stop requested");
        self.wakeup.notify_all();
    }

    /// Block until the dispatch loop has exited, normally or by unwinding.
    ///
    /// Returns immediately when no loop is running. Must not be called from
    /// inside the callback, and only returns after [`stop`](Self::stop).
    pub fn wait_until_done(&self) {
        let mut state = self.state.lock();
        while state.running {
            self.done.wait(&mut state);
        }
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Total entries handed to the callback so far.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.state.lock().dispatched
    }

    /// Deadline of the pending entry for `key`.
    #[must_use]
    pub fn deadline_of<Q>(&self, key: &Q) -> Option<Instant>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state.lock().entries.get(key).map(|p| p.deadline)
    }

    /// Payload of the pending entry for `key`.
    #[must_use]
    pub fn payload_of<Q>(&self, key: &Q) -> Option<P>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        P: Clone,
    {
        self.state.lock().entries.get(key).map(|p| p.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;

    use super::*;

    const TICK: Duration = Duration::from_millis(20);
    const PATIENCE: Duration = Duration::from_secs(5);

    fn spawn_loop(
        queue: &Arc<DelayQueue<String, u32>>,
        ok: bool,
    ) -> (thread::JoinHandle<()>, mpsc::Receiver<(String, u32)>) {
        let (tx, rx) = mpsc::channel();
        let q = Arc::clone(queue);
        let handle = thread::spawn(move || {
            q.run_loop(|key, payload| {
                let _ = tx.send((key.clone(), payload));
                ok
            });
        });
        (handle, rx)
    }

    fn shutdown(queue: &DelayQueue<String, u32>, handle: thread::JoinHandle<()>) {
        queue.stop();
        queue.wait_until_done();
        handle.join().expect("loop thread should exit");
    }

    #[test]
    fn requeue_replaces_existing_entry() {
        let queue: DelayQueue<String, u32> = DelayQueue::new();
        queue.requeue("a".into(), Duration::from_secs(60), 1);
        let first = queue.deadline_of("a").expect("pending");
        queue.requeue("a".into(), Duration::from_secs(5), 2);
        let second = queue.deadline_of("a").expect("pending");

        assert_eq!(queue.len(), 1);
        assert!(second < first);
        assert_eq!(queue.payload_of("a"), Some(2));
    }

    #[test]
    fn remove_cancels_pending_entry() {
        let queue: DelayQueue<String, u32> = DelayQueue::new();
        queue.requeue("a".into(), Duration::from_secs(60), 1);
        queue.requeue("b".into(), Duration::from_secs(60), 2);
        assert_eq!(queue.remove("a"), Some(1));
        assert_eq!(queue.remove("a"), None);
        assert_eq!(queue.len(), 1);
        assert!(queue.deadline_of("a").is_none());
    }

    #[test]
    fn zero_delay_dispatches_immediately() {
        let queue = Arc::new(DelayQueue::new());
        let (handle, rx) = spawn_loop(&queue, true);
        queue.requeue("db".to_owned(), Duration::ZERO, 7);

        let got = rx.recv_timeout(PATIENCE).expect("dispatched");
        assert_eq!(got, ("db".to_owned(), 7));
        assert!(queue.is_empty());
        shutdown(&queue, handle);
    }

    #[test]
    fn earlier_deadline_preempts_longer_wait() {
        let queue = Arc::new(DelayQueue::new());
        let (handle, rx) = spawn_loop(&queue, true);
        queue.requeue("slow".to_owned(), Duration::from_secs(60), 1);
        thread::sleep(TICK);
        queue.requeue("fast".to_owned(), TICK, 2);

        let got = rx.recv_timeout(PATIENCE).expect("fast entry dispatched");
        assert_eq!(got.0, "fast");
        assert_eq!(queue.len(), 1);
        shutdown(&queue, handle);
    }

    #[test]
    fn dispatch_follows_deadline_order() {
        let queue = Arc::new(DelayQueue::new());
        queue.requeue("c".to_owned(), TICK * 3, 3);
        queue.requeue("a".to_owned(), TICK, 1);
        queue.requeue("b".to_owned(), TICK * 2, 2);
        let (handle, rx) = spawn_loop(&queue, true);

        let order: Vec<String> = (0..3)
            .map(|_| rx.recv_timeout(PATIENCE).expect("dispatched").0)
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
        shutdown(&queue, handle);
    }

    #[test]
    fn failed_callback_is_not_retried_by_queue() {
        let queue = Arc::new(DelayQueue::new());
        let (handle, rx) = spawn_loop(&queue, false);
        queue.requeue("db".to_owned(), Duration::ZERO, 1);

        rx.recv_timeout(PATIENCE).expect("dispatched once");
        assert!(rx.recv_timeout(TICK * 5).is_err());
        assert!(queue.is_empty());
        assert_eq!(queue.dispatched(), 1);
        shutdown(&queue, handle);
    }

    #[test]
    fn stop_leaves_pending_entries_undispatched() {
        let queue = Arc::new(DelayQueue::new());
        let (handle, rx) = spawn_loop(&queue, true);
        queue.requeue("later".to_owned(), Duration::from_secs(60), 1);
        shutdown(&queue, handle);

        assert!(rx.try_recv().is_err());
        assert_eq!(queue.len(), 1);
        assert!(queue.is_stopped());
        assert!(!queue.is_running());
    }

    #[test]
    fn loop_started_after_stop_exits_immediately() {
        let queue = Arc::new(DelayQueue::new());
        queue.requeue("db".to_owned(), Duration::ZERO, 1);
        queue.stop();
        let (handle, rx) = spawn_loop(&queue, true);
        handle.join().expect("loop thread should exit");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn wait_until_done_without_loop_returns() {
        let queue: DelayQueue<String, u32> = DelayQueue::new();
        queue.wait_until_done();
        queue.stop();
        queue.stop();
        queue.wait_until_done();
    }

    #[test]
    fn panicking_callback_still_releases_waiters() {
        let queue: Arc<DelayQueue<String, u32>> = Arc::new(DelayQueue::new());
        let q = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            q.run_loop(|_key, _payload| panic!("backup exploded"));
        });
        queue.requeue("db".to_owned(), Duration::ZERO, 1);
        assert!(handle.join().is_err(), "loop thread unwinds");

        let (tx, rx) = mpsc::channel();
        let q = Arc::clone(&queue);
        thread::spawn(move || {
            q.stop();
            q.wait_until_done();
            let _ = tx.send(());
        });
        rx.recv_timeout(PATIENCE)
            .expect("wait_until_done returns after the loop unwound");
        assert!(!queue.is_running());
        assert_eq!(queue.dispatched(), 1);
    }

    #[test]
    fn callback_may_requeue_its_own_key() {
        let queue = Arc::new(DelayQueue::new());
        let (tx, rx) = mpsc::channel();
        let q = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            let inner = Arc::clone(&q);
            q.run_loop(move |key: &String, payload: u32| {
                let _ = tx.send(payload);
                if payload < 3 {
                    inner.requeue(key.clone(), Duration::ZERO, payload + 1);
                }
                true
            });
        });
        queue.requeue("db".to_owned(), Duration::ZERO, 1);

        let seen: Vec<u32> = (0..3)
            .map(|_| rx.recv_timeout(PATIENCE).expect("dispatched"))
            .collect();
        assert_eq!(seen, [1, 2, 3]);
        shutdown(&queue, handle);
    }

    #[test]
    fn huge_delay_is_clamped() {
        let queue: DelayQueue<String, u32> = DelayQueue::new();
        queue.requeue("db".to_owned(), Duration::MAX, 1);
        let deadline = queue.deadline_of("db").expect("pending");
        assert!(deadline <= Instant::now() + MAX_DELAY);
    }
}
