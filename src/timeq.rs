/*
Time-queue between the request sequencers and the scratchpad controllers.

A sequencer that issues a protocol message does not deliver it immediately: the message is
enqueued with the hit latency that applies to its request kind (vertex hit latency, the
atomic opcode latency, or the ordinary data/instruction hit latency) and becomes visible to the
controller once the simulated clock reaches its ready cycle.

Messages that become ready on the same cycle are released in the order they were enqueued, so
two requests from one core to different addresses keep their issue order even though nothing
above this layer relies on it.
*/

use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub type Cycle = u64;

// Receipt for an enqueued message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    issued_at: Cycle,
    ready_at: Cycle,
    seq: u64,
}

impl Ticket {
    // Cycle at which the message entered the queue.
    pub fn issued_at(&self) -> Cycle {
        self.issued_at
    }

    // Cycle at which the message is handed to the consumer.
    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn latency(&self) -> Cycle {
        self.ready_at - self.issued_at
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        now >= self.ready_at
    }

    // Number of cycles until the ticket is ready.  Returns zero if already ready.
    pub fn remaining_cycles(&self, now: Cycle) -> Cycle {
        self.ready_at.saturating_sub(now)
    }
}

#[derive(Debug)]
struct Pending<T> {
    ticket: Ticket,
    payload: T,
}

impl<T> Pending<T> {
    fn key(&self) -> (Cycle, u64) {
        (self.ticket.ready_at, self.ticket.seq)
    }
}

impl<T> PartialEq for Pending<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for Pending<T> {}

impl<T> PartialOrd for Pending<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Pending<T> {
    // BinaryHeap is a max-heap; invert so the earliest (ready_at, seq) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Debug)]
pub struct LatencyQueue<T> {
    heap: BinaryHeap<Pending<T>>,
    next_seq: u64,
}

impl<T> Default for LatencyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LatencyQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn enqueue(&mut self, now: Cycle, latency: Cycle, payload: T) -> Ticket {
        let ticket = Ticket {
            issued_at: now,
            ready_at: now.saturating_add(latency),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.heap.push(Pending { ticket, payload });
        ticket
    }

    pub fn pop_ready(&mut self, now: Cycle) -> Option<(Ticket, T)> {
        if !self.heap.peek()?.ticket.is_ready(now) {
            return None;
        }
        self.heap
            .pop()
            .map(|pending| (pending.ticket, pending.payload))
    }

    // Drain every message that is ready by "now" and hand it to the callback.
    pub fn service_ready<F>(&mut self, now: Cycle, mut callback: F)
    where
        F: FnMut(Ticket, T),
    {
        while let Some((ticket, payload)) = self.pop_ready(now) {
            callback(ticket, payload);
        }
    }

    pub fn next_ready_at(&self) -> Option<Cycle> {
        self.heap.peek().map(|pending| pending.ticket.ready_at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
