//! Continuous timer.
//!
//! One dispatch thread owns a min-heap of pending events keyed by
//! absolute deadline. `queue_rel` captures the callback (and whatever
//! it owns) into the heap entry and wakes the thread; `cancel` only
//! marks the event dead, so it is safe to call while holding locks the
//! callback would take. Dead entries, and the references their
//! callbacks captured, are dropped at the thread's next scan.
//!
//! Callbacks run on the dispatch thread with no timer lock held.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Opaque handle naming a queued event. Cancellation is a lookup, not
/// a dereference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandle(u64);

type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    id: u64,
    callback: Callback,
}

// Min-heap order: earliest deadline first, insertion order tiebreak.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.id).cmp(&(self.deadline, self.id))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Entry>,
    pending: HashSet<u64>,
    cancelled: HashSet<u64>,
    next_id: u64,
    shutdown: bool,
}

struct Inner {
    queue: Mutex<Queue>,
    cond: Condvar,
}

pub struct ConTimer {
    inner: Arc<Inner>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ConTimer {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue::default()),
            cond: Condvar::new(),
        });
        let worker = inner.clone();
        let thread = thread::Builder::new()
            .name("contimer".into())
            .spawn(move || timer_loop(worker))
            .expect("spawn timer thread");
        Self {
            inner,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Queue `callback` to run `dt` from now on the dispatch thread.
    pub fn queue_rel(&self, dt: Duration, callback: impl FnOnce() + Send + 'static) -> EventHandle {
        let mut q = self.inner.queue.lock().unwrap();
        let id = q.next_id;
        q.next_id += 1;
        q.pending.insert(id);
        q.heap.push(Entry {
            deadline: Instant::now() + dt,
            id,
            callback: Box::new(callback),
        });
        self.inner.cond.notify_one();
        EventHandle(id)
    }

    /// Mark an event dead. Non-blocking with respect to the callback:
    /// the entry stays queued until the dispatch thread's next scan.
    /// Cancelling an event that already fired is a no-op.
    pub fn cancel(&self, ev: EventHandle) {
        let mut q = self.inner.queue.lock().unwrap();
        if q.pending.remove(&ev.0) {
            q.cancelled.insert(ev.0);
        }
    }
}

impl Drop for ConTimer {
    fn drop(&mut self) {
        {
            let mut q = self.inner.queue.lock().unwrap();
            q.shutdown = true;
            self.inner.cond.notify_one();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn timer_loop(inner: Arc<Inner>) {
    let mut q = inner.queue.lock().unwrap();
    loop {
        if q.shutdown {
            return;
        }
        // Scan dead entries off the top before sleeping on a stale
        // deadline.
        while matches!(q.heap.peek(), Some(e) if q.cancelled.contains(&e.id)) {
            let entry = q.heap.pop().unwrap();
            q.cancelled.remove(&entry.id);
        }
        match q.heap.peek() {
            None => {
                q = inner.cond.wait(q).unwrap();
            }
            Some(entry) => {
                let now = Instant::now();
                if entry.deadline <= now {
                    let entry = q.heap.pop().unwrap();
                    q.pending.remove(&entry.id);
                    drop(q);
                    (entry.callback)();
                    q = inner.queue.lock().unwrap();
                } else {
                    let dt = entry.deadline - now;
                    (q, _) = inner.cond.wait_timeout(q, dt).unwrap();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn fires_in_deadline_order() {
        let timer = ConTimer::new();
        let (tx, rx) = mpsc::channel();
        for (tag, ms) in [(2u32, 60u64), (1, 30), (3, 90)] {
            let tx = tx.clone();
            timer.queue_rel(Duration::from_millis(ms), move || {
                tx.send(tag).unwrap();
            });
        }
        let got: Vec<u32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn cancelled_event_never_fires() {
        let timer = ConTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let ev = timer.queue_rel(Duration::from_millis(40), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel(ev);
        // A later event proves the thread scanned past the dead one.
        let (tx, rx) = mpsc::channel();
        timer.queue_rel(Duration::from_millis(80), move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_releases_captured_state() {
        let timer = ConTimer::new();
        let payload = Arc::new(());
        let captured = payload.clone();
        let ev = timer.queue_rel(Duration::from_millis(20), move || {
            let _keep = captured;
        });
        timer.cancel(ev);
        // Let the dispatch thread scan the dead entry away.
        let (tx, rx) = mpsc::channel();
        timer.queue_rel(Duration::from_millis(40), move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let timer = ConTimer::new();
        let (tx, rx) = mpsc::channel();
        let ev = timer.queue_rel(Duration::from_millis(10), move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        timer.cancel(ev);
    }
}
