/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! C1: Monotonic scheduler.
//!
//! A priority queue of callbacks keyed by nanosecond deadline, polled
//! cooperatively by [`crate::event_loop::EventLoop`]. Grounded on the
//! teacher's `db/src/sched.rs` `RoundRobin` — same idea (pull the next
//! piece of work, run it to completion, requeue what didn't finish) but
//! keyed by deadline instead of FIFO, and without the NIC-queue/work-
//! stealing machinery that only makes sense across NetBricks cores: this
//! core is single-threaded, so there is exactly one scheduler
//! and nothing to steal from.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use moldbus_core::clock::{Clock, Nanos};

pub type TaskId = u64;

/// Reserved for future task hints (e.g. priority class); no flags are
/// defined yet, so this is an opaque bitmask callers may
/// round-trip but the scheduler does not yet interpret.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFlags(pub u32);

impl TaskFlags {
    pub const NONE: TaskFlags = TaskFlags(0);
}

type Callback = Box<dyn FnMut()>;

struct Entry {
    id: TaskId,
    deadline: Nanos,
    seq: u64,
    period: Option<Nanos>,
    label: &'static str,
    callback: Callback,
}

/// Min-heap ordering: earliest deadline first, ties broken by insertion
/// order (lower `seq` first) to give FIFO semantics among same-deadline
/// tasks.
struct HeapKey {
    deadline: Nanos,
    seq: u64,
    id: TaskId,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for HeapKey {}
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest (deadline, seq)
        // pops first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    clock: Clock,
    heap: BinaryHeap<HeapKey>,
    entries: std::collections::HashMap<TaskId, Entry>,
    next_id: TaskId,
    next_seq: u64,
}

impl Inner {
    fn insert(&mut self, deadline: Nanos, period: Option<Nanos>, label: &'static str, callback: Callback) -> TaskId {
        self.next_id += 1;
        let id = self.next_id;
        self.next_seq += 1;
        let seq = self.next_seq;
        self.heap.push(HeapKey { deadline, seq, id });
        self.entries.insert(
            id,
            Entry {
                id,
                deadline,
                seq,
                period,
                label,
                callback,
            },
        );
        id
    }
}

/// A cheaply-clonable handle to the scheduler. All clones share the same
/// underlying queue (single-threaded `Rc<RefCell<..>>`; no user-level
/// synchronization primitives are required).
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<Inner>>,
}

impl Scheduler {
    pub fn new(clock: Clock) -> Scheduler {
        Scheduler {
            inner: Rc::new(RefCell::new(Inner {
                clock,
                heap: BinaryHeap::new(),
                entries: std::collections::HashMap::new(),
                next_id: 0,
                next_seq: 0,
            })),
        }
    }

    pub fn now(&self) -> Nanos {
        self.inner.borrow().clock.now()
    }

    /// Schedules `callback` to run once, `delay_ns` from now.
    pub fn schedule_in<F>(&self, delay_ns: Nanos, label: &'static str, _flags: TaskFlags, callback: F) -> TaskId
    where
        F: FnMut() + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let deadline = inner.clock.now() + delay_ns;
        inner.insert(deadline, None, label, Box::new(callback))
    }

    /// Schedules a recurring callback; after each firing the next deadline
    /// is `previous_deadline + period_ns` (not `now + period_ns`, so a slow
    /// fire() pass does not drift the cadence further than it already has).
    pub fn schedule_every<F>(&self, period_ns: Nanos, label: &'static str, _flags: TaskFlags, callback: F) -> TaskId
    where
        F: FnMut() + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let deadline = inner.clock.now() + period_ns;
        inner.insert(deadline, Some(period_ns), label, Box::new(callback))
    }

    /// Atomically cancels `existing_task_id` (if nonzero) and installs a
    /// fresh one-shot task, the `id = sched.reschedule_in(id, ...)` idiom
    /// used to rearm a single holder's timer without double-booking it.
    pub fn reschedule_in<F>(
        &self,
        existing_task_id: TaskId,
        delay_ns: Nanos,
        label: &'static str,
        flags: TaskFlags,
        callback: F,
    ) -> TaskId
    where
        F: FnMut() + 'static,
    {
        if existing_task_id != 0 {
            self.cancel(existing_task_id);
        }
        self.schedule_in(delay_ns, label, flags, callback)
    }

    /// Cancels a task. Always returns 0, so callers can write
    /// `self.timer_id = scheduler.cancel(self.timer_id);` to clear the
    /// holder in one line.
    pub fn cancel(&self, task_id: TaskId) -> TaskId {
        self.inner.borrow_mut().entries.remove(&task_id);
        0
    }

    /// Pops and runs every task whose deadline is `<= now`, in deadline
    /// order (ties by insertion order). Tasks scheduled *during* this call
    /// land strictly after the snapshot taken at entry and so never run in
    /// the same pass, even if their deadline has already passed.
    pub fn fire(&self) {
        let (now, due_seq_ceiling) = {
            let inner = self.inner.borrow();
            (inner.clock.now(), inner.next_seq)
        };

        loop {
            let candidate_id = {
                let mut inner = self.inner.borrow_mut();
                match inner.heap.peek() {
                    Some(top) if top.deadline <= now && top.seq <= due_seq_ceiling => {
                        let top = inner.heap.pop().unwrap();
                        Some(top.id)
                    }
                    _ => None,
                }
            };

            let Some(id) = candidate_id else {
                break;
            };

            // The entry may already have been cancelled (removed from
            // `entries`) while still sitting in the heap as a tombstone.
            let mut callback = match self.inner.borrow_mut().entries.remove(&id) {
                Some(entry) => entry,
                None => continue,
            };

            let result = panic::catch_unwind(AssertUnwindSafe(|| (callback.callback)()));
            if result.is_err() {
                log::error!("scheduler: task '{}' panicked, dropping it", callback.label);
                continue;
            }

            if let Some(period) = callback.period {
                let mut inner = self.inner.borrow_mut();
                let next_deadline = callback.deadline + period;
                inner.next_seq += 1;
                let seq = inner.next_seq;
                inner.heap.push(HeapKey {
                    deadline: next_deadline,
                    seq,
                    id: callback.id,
                });
                callback.deadline = next_deadline;
                callback.seq = seq;
                inner.entries.insert(id, callback);
            }
        }
    }

    /// Nanoseconds until the next deadline, or `None` if the queue is
    /// empty. Used by the event loop to size its readiness-poll timeout.
    pub fn next_deadline_in(&self) -> Option<Nanos> {
        let inner = self.inner.borrow();
        let top = inner.heap.peek()?;
        Some(top.deadline.saturating_sub(inner.clock.now()))
    }

    pub fn pending_count(&self) -> usize {
        self.inner.borrow().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn fires_in_deadline_order_with_fifo_ties() {
        let sched = Scheduler::new(Clock::new());
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        sched.schedule_in(0, "a", TaskFlags::NONE, move || o1.borrow_mut().push("a"));
        let o2 = order.clone();
        sched.schedule_in(0, "b", TaskFlags::NONE, move || o2.borrow_mut().push("b"));
        let o3 = order.clone();
        sched.schedule_in(0, "c", TaskFlags::NONE, move || o3.borrow_mut().push("c"));

        std::thread::sleep(std::time::Duration::from_millis(1));
        sched.fire();

        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn tasks_scheduled_during_fire_wait_for_next_pass() {
        let sched = Scheduler::new(Clock::new());
        let ran_immediate = Rc::new(Cell::new(false));
        let ran_nested = Rc::new(Cell::new(false));

        let sched_clone = sched.clone();
        let nested_flag = ran_nested.clone();
        let immediate_flag = ran_immediate.clone();
        sched.schedule_in(0, "outer", TaskFlags::NONE, move || {
            immediate_flag.set(true);
            let inner_flag = nested_flag.clone();
            sched_clone.schedule_in(0, "inner", TaskFlags::NONE, move || {
                inner_flag.set(true);
            });
        });

        std::thread::sleep(std::time::Duration::from_millis(1));
        sched.fire();
        assert!(ran_immediate.get());
        assert!(!ran_nested.get(), "nested task must not run in the same fire() pass");

        sched.fire();
        assert!(ran_nested.get(), "nested task should run on the next pass");
    }

    #[test]
    fn cancel_prevents_firing() {
        let sched = Scheduler::new(Clock::new());
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let id = sched.schedule_in(0, "cancel-me", TaskFlags::NONE, move || flag.set(true));
        let id = sched.cancel(id);
        assert_eq!(id, 0);

        std::thread::sleep(std::time::Duration::from_millis(1));
        sched.fire();
        assert!(!ran.get());
    }

    #[test]
    fn recurring_task_reschedules_from_previous_deadline() {
        let sched = Scheduler::new(Clock::new());
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        sched.schedule_every(1, "tick", TaskFlags::NONE, move || {
            c.set(c.get() + 1);
        });

        for _ in 0..3 {
            std::thread::sleep(std::time::Duration::from_millis(1));
            sched.fire();
        }
        assert!(count.get() >= 3);
    }

    #[test]
    fn panicking_callback_is_caught_and_recurring_task_continues() {
        let sched = Scheduler::new(Clock::new());
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        sched.schedule_every(1, "flaky", TaskFlags::NONE, move || {
            c.set(c.get() + 1);
            if c.get() == 1 {
                panic!("boom");
            }
        });

        std::thread::sleep(std::time::Duration::from_millis(1));
        sched.fire();
        std::thread::sleep(std::time::Duration::from_millis(1));
        sched.fire();
        assert_eq!(count.get(), 2);
    }
}
