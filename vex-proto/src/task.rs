//! Deadline-ordered task queue (spec §4.2), grounded on `task.h`'s
//! `fastd_task` tagged union, extended with the `HANDSHAKE` and
//! `MAINTENANCE` variants spec §3 calls for.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use vex_core::Buffer;

use crate::peer::PeerId;

pub type Millis = u64;

#[derive(Debug)]
pub enum TaskKind {
    Send { buffer: Buffer },
    HandleRecv { buffer: Buffer },
    Handshake,
    Maintenance,
}

#[derive(Debug)]
pub struct Task {
    pub peer: Option<PeerId>,
    pub kind: TaskKind,
    pub deadline: Millis,
}

/// Heap entry ordered by `(deadline, seq)` ascending; `seq` breaks ties
/// FIFO (earlier pushes run first) since a [`BinaryHeap`] is a max-heap
/// and we want the smallest deadline/seq out first.
struct Entry {
    deadline: Millis,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let deadline = task.deadline;
        self.heap.push(Entry { deadline, seq, task });
    }

    /// Pop the earliest task if its deadline has passed.
    pub fn pop_expired(&mut self, now: Millis) -> Option<Task> {
        if self.heap.peek()?.deadline <= now {
            return self.heap.pop().map(|e| e.task);
        }
        None
    }

    /// Milliseconds until the next deadline, `0` if already due, `None`
    /// if the queue is empty (caller should block forever).
    pub fn timeout_ms(&self, now: Millis) -> Option<Millis> {
        let head = self.heap.peek()?;
        Some(head.deadline.saturating_sub(now))
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Drop every queued task belonging to `peer` (spec §5: cancellation on
    /// delete/reset must remove all outstanding tasks bearing its reference
    /// before freeing it).
    pub fn cancel_peer(&mut self, peer: PeerId) {
        let remaining: Vec<Entry> = self
            .heap
            .drain()
            .filter(|e| e.task.peer != Some(peer))
            .collect();
        self.heap.extend(remaining);
    }
}
