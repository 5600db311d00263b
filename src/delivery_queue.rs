use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::delayed_item::Delayed;

struct Entry<T> {
    eligible_at: Instant,
    // Breaks ties between items with the same eligibility instant: earlier pushes come out first.
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.eligible_at, self.seq).cmp(&(other.eligible_at, other.seq))
    }
}

struct Inner<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    next_seq: u64,
}

/// Unbounded, time-ordered hand-off between the reading thread and the relay thread.
///
/// Items come out in non-decreasing eligibility order, never before they are eligible. Items with equal eligibility
/// come out in the order they were pushed.
pub struct DeliveryQueue<T> where T: Delayed {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> Default for DeliveryQueue<T> where T: Delayed {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeliveryQueue<T> where T: Delayed {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Never blocks (beyond the short critical section) and never rejects.
    pub fn push(&self, item: T) {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Reverse(Entry {
            eligible_at: item.eligible_at(),
            seq,
            item,
        }));
        drop(inner);
        self.available.notify_one();
    }

    /// Blocks until the earliest item is eligible, then removes and returns it.
    pub fn pop_when_eligible(&self) -> T {
        let mut inner = self.lock();
        loop {
            let head_eligible_at = inner.heap.peek().map(|Reverse(entry)| entry.eligible_at);
            match head_eligible_at {
                None => {
                    inner = self.wait(inner);
                }
                Some(eligible_at) => {
                    let now = Instant::now();
                    if eligible_at <= now {
                        return Self::pop_head(&mut inner);
                    }
                    inner = self.wait_timeout(inner, eligible_at - now);
                }
            }
        }
    }

    /// Like `pop_when_eligible`, but gives up after `limit` has elapsed without an eligible item.
    pub fn pop_timeout(&self, limit: Duration) -> Option<T> {
        let deadline = Instant::now() + limit;
        let mut inner = self.lock();
        loop {
            let now = Instant::now();
            let head_eligible_at = inner.heap.peek().map(|Reverse(entry)| entry.eligible_at);
            if let Some(eligible_at) = head_eligible_at {
                if eligible_at <= now {
                    return Some(Self::pop_head(&mut inner));
                }
            }
            if now >= deadline {
                return None;
            }
            let wake_at = match head_eligible_at {
                Some(eligible_at) if eligible_at < deadline => eligible_at,
                _ => deadline,
            };
            inner = self.wait_timeout(inner, wake_at - now);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    fn pop_head(inner: &mut Inner<T>) -> T {
        match inner.heap.pop() {
            Some(Reverse(entry)) => entry.item,
            None => unreachable!("pop_head is only called after peeking a head entry"),
        }
    }

    // Every critical section leaves the heap consistent, so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<Inner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Inner<T>>) -> MutexGuard<'a, Inner<T>> {
        self.available.wait(guard).unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait_timeout<'a>(&self, guard: MutexGuard<'a, Inner<T>>, timeout: Duration) -> MutexGuard<'a, Inner<T>> {
        match self.available.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}
