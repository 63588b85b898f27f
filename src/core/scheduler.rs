//! Weighted round-robin over the configured queues.
//!
//! Every queue holds a credit that starts at its weight. Queues with credit
//! left are polled first, highest credit first; a lease from a queue spends
//! one credit. Once every credit is spent a new round starts. With all
//! queues busy, a 6/3/1 configuration is therefore served exactly 6, 3 and
//! 1 times per round of 10 leases, and no non-empty queue waits for more
//! than one round. Exhausted queues are still polled, after the others, so
//! an idle high-weight queue never blocks a busy low-weight one.

use crate::config::QueueSpec;

#[derive(Debug, Clone)]
struct QueueSlot {
    name: String,
    weight: i64,
    credit: i64,
}

/// Decides in which order the worker pool polls its queues.
#[derive(Debug, Clone)]
pub struct WeightedScheduler {
    slots: Vec<QueueSlot>,
}

impl WeightedScheduler {
    /// Create a scheduler for `queues`, in configuration order.
    pub fn new(queues: &[QueueSpec]) -> Self {
        Self {
            slots: queues
                .iter()
                .map(|q| QueueSlot {
                    name: q.name.clone(),
                    weight: i64::from(q.weight),
                    credit: i64::from(q.weight),
                })
                .collect(),
        }
    }

    /// Queue names in the order they should be polled.
    pub fn ordered_queues(&self) -> Vec<String> {
        let mut order: Vec<usize> = (0..self.slots.len()).collect();
        order.sort_by(|&a, &b| {
            let (sa, sb) = (&self.slots[a], &self.slots[b]);
            let live_a = sa.credit > 0;
            let live_b = sb.credit > 0;
            live_b
                .cmp(&live_a)
                .then_with(|| {
                    if live_a && live_b {
                        sb.credit.cmp(&sa.credit)
                    } else {
                        std::cmp::Ordering::Equal
                    }
                })
                .then_with(|| sb.weight.cmp(&sa.weight))
                .then_with(|| a.cmp(&b))
        });
        order
            .into_iter()
            .map(|i| self.slots[i].name.clone())
            .collect()
    }

    /// Charge one lease to `queue`.
    pub fn record_served(&mut self, queue: &str) {
        let Some(index) = self.slots.iter().position(|s| s.name == queue) else {
            return;
        };

        // Served while out of credit: the busier queues are empty, so the
        // current round is over.
        if self.slots[index].credit <= 0 {
            self.refill();
        }
        self.slots[index].credit -= 1;

        if self.slots.iter().all(|s| s.credit <= 0) {
            self.refill();
        }
    }

    /// Remaining credit per queue, in configuration order.
    pub fn credits(&self) -> Vec<(String, i64)> {
        self.slots
            .iter()
            .map(|s| (s.name.clone(), s.credit))
            .collect()
    }

    fn refill(&mut self) {
        for slot in &mut self.slots {
            slot.credit = slot.weight;
        }
    }
}
