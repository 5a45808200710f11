//! Outbound priority queue: one ordered bucket per priority level, batch
//! selection by round-robin across buckets.

use std::cmp::Ordering;
use std::collections::VecDeque;
use thiserror::Error;

use crate::message::{Message, Priority, Reliability};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("dispatcher is closed")]
    Closed,

    #[error("outbound queue is full ({capacity} messages)")]
    Full { capacity: usize },

    /// Accepting a GUARANTEED_DELIVERY message would promise persistence
    /// the client does not have. Failing fast here surfaces the
    /// integration bug instead of silently downgrading the guarantee.
    #[error("GUARANTEED_DELIVERY is not supported without persistence")]
    GuaranteedDeliveryUnsupported,
}

/// One queued outbound message plus its remaining retry budget.
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    pub message: Message,
    pub retries_left: u32,
    pub retries_used: u32,
}

impl QueueEntry {
    /// Batch ordering: priority descending, event time ascending,
    /// reliability descending, retries used ascending.
    fn order(&self, other: &Self) -> Ordering {
        other
            .message
            .priority()
            .cmp(&self.message.priority())
            .then_with(|| self.message.event_time().cmp(&other.message.event_time()))
            .then_with(|| other.message.reliability().cmp(&self.message.reliability()))
            .then_with(|| self.retries_used.cmp(&other.retries_used))
    }
}

pub(crate) struct OutboundQueue {
    buckets: [VecDeque<QueueEntry>; Priority::COUNT],
    len: usize,
    capacity: usize,
    max_retries: u32,
    closed: bool,
}

impl OutboundQueue {
    pub fn new(capacity: usize, max_retries: u32) -> Self {
        Self {
            buckets: Default::default(),
            len: 0,
            capacity,
            max_retries,
            closed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Appends a message to the bucket matching its priority, seeding the
    /// retry budget from its reliability class.
    pub fn enqueue(&mut self, message: Message) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::Closed);
        }
        let retries_left = match message.reliability() {
            Reliability::NoGuarantee => self.max_retries,
            Reliability::BestEffort => self.max_retries * 2,
            Reliability::GuaranteedDelivery => {
                return Err(QueueError::GuaranteedDeliveryUnsupported)
            }
        };
        if self.len >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }

        self.buckets[message.priority().index()].push_back(QueueEntry {
            message,
            retries_left,
            retries_used: 0,
        });
        self.len += 1;
        Ok(())
    }

    /// Puts a failed entry back for another attempt. Subject to the same
    /// capacity and close checks as a fresh enqueue.
    pub fn requeue(&mut self, entry: QueueEntry) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::Closed);
        }
        if self.len >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        self.buckets[entry.message.priority().index()].push_back(entry);
        self.len += 1;
        Ok(())
    }

    /// Selects up to `max` entries, taking one from each non-empty bucket
    /// per round, highest priority first. When a full batch is possible
    /// the buckets are sorted first so each one yields its most urgent
    /// entries.
    pub fn select_batch(&mut self, max: usize) -> Vec<QueueEntry> {
        if max == 0 || self.len == 0 {
            return Vec::new();
        }
        if self.len >= max {
            for bucket in &mut self.buckets {
                bucket.make_contiguous().sort_by(QueueEntry::order);
            }
        }

        let mut batch = Vec::with_capacity(max.min(self.len));
        'outer: loop {
            let mut took_any = false;
            for priority in Priority::all_descending() {
                if batch.len() == max {
                    break 'outer;
                }
                if let Some(entry) = self.buckets[priority.index()].pop_front() {
                    self.len -= 1;
                    batch.push(entry);
                    took_any = true;
                }
            }
            if !took_any {
                break;
            }
        }
        batch
    }

    /// Marks the queue closed and drains everything still pending.
    pub fn close(&mut self) -> Vec<QueueEntry> {
        self.closed = true;
        self.len = 0;
        let mut drained = Vec::new();
        for bucket in &mut self.buckets {
            drained.extend(bucket.drain(..));
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DataItem;
    use pretty_assertions::assert_eq;

    fn message(tag: &str, priority: Priority, event_time: i64) -> Message {
        Message::data()
            .client_id(tag)
            .source("device-1")
            .priority(priority)
            .event_time(event_time)
            .format("urn:test")
            .data_item(DataItem::new("k", 1.0).unwrap())
            .build()
            .unwrap()
    }

    fn tags(batch: &[QueueEntry]) -> Vec<&str> {
        batch.iter().map(|e| e.message.client_id()).collect()
    }

    #[test]
    fn retry_budget_is_seeded_from_reliability() {
        let mut queue = OutboundQueue::new(10, 5);
        queue
            .enqueue(
                Message::data()
                    .client_id("ng")
                    .source("d")
                    .reliability(Reliability::NoGuarantee)
                    .format("urn:test")
                    .data_item(DataItem::new("k", 1.0).unwrap())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        queue
            .enqueue(
                Message::data()
                    .client_id("be")
                    .source("d")
                    .reliability(Reliability::BestEffort)
                    .format("urn:test")
                    .data_item(DataItem::new("k", 1.0).unwrap())
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let batch = queue.select_batch(10);
        let budget: Vec<u32> = batch.iter().map(|e| e.retries_left).collect();
        assert_eq!(budget, vec![5, 10]);
    }

    #[test]
    fn guaranteed_delivery_is_rejected() {
        let mut queue = OutboundQueue::new(10, 5);
        let result = queue.enqueue(
            Message::data()
                .source("d")
                .reliability(Reliability::GuaranteedDelivery)
                .format("urn:test")
                .data_item(DataItem::new("k", 1.0).unwrap())
                .build()
                .unwrap(),
        );
        assert_eq!(result, Err(QueueError::GuaranteedDeliveryUnsupported));
    }

    #[test]
    fn full_and_closed_queues_reject_enqueue() {
        let mut queue = OutboundQueue::new(1, 5);
        queue.enqueue(message("a", Priority::Low, 1)).unwrap();
        assert_eq!(
            queue.enqueue(message("b", Priority::Low, 2)),
            Err(QueueError::Full { capacity: 1 })
        );

        queue.close();
        assert_eq!(
            queue.enqueue(message("c", Priority::Low, 3)),
            Err(QueueError::Closed)
        );
    }

    #[test]
    fn batch_selection_orders_mixed_messages() {
        let mut queue = OutboundQueue::new(10, 5);
        // insertion order deliberately scrambled
        queue.enqueue(message("low-1", Priority::Low, 10)).unwrap();
        queue.enqueue(message("high-2", Priority::High, 200)).unwrap();
        queue.enqueue(message("med-1", Priority::Medium, 50)).unwrap();
        queue.enqueue(message("high-1", Priority::High, 100)).unwrap();
        queue.enqueue(message("low-2", Priority::Low, 5)).unwrap();

        // full batch: buckets get sorted, then one per priority per round
        let batch = queue.select_batch(5);
        assert_eq!(
            tags(&batch),
            vec!["high-1", "med-1", "low-2", "high-2", "low-1"]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn within_a_bucket_reliability_breaks_event_time_ties() {
        let mut queue = OutboundQueue::new(10, 5);
        let no_guarantee = Message::data()
            .client_id("ng")
            .source("d")
            .priority(Priority::Low)
            .reliability(Reliability::NoGuarantee)
            .event_time(1)
            .format("urn:test")
            .data_item(DataItem::new("k", 1.0).unwrap())
            .build()
            .unwrap();
        let best_effort = Message::data()
            .client_id("be")
            .source("d")
            .priority(Priority::Low)
            .reliability(Reliability::BestEffort)
            .event_time(1)
            .format("urn:test")
            .data_item(DataItem::new("k", 1.0).unwrap())
            .build()
            .unwrap();

        queue.enqueue(no_guarantee).unwrap();
        queue.enqueue(best_effort).unwrap();

        let batch = queue.select_batch(2);
        assert_eq!(tags(&batch), vec!["be", "ng"]);
    }

    #[test]
    fn oversized_backlog_drains_in_two_batches() {
        let mut queue = OutboundQueue::new(1000, 5);
        for i in 0..150 {
            queue.enqueue(message(&format!("m-{i}"), Priority::Low, i)).unwrap();
        }

        let first = queue.select_batch(100);
        assert_eq!(first.len(), 100);
        assert_eq!(queue.len(), 50);

        let second = queue.select_batch(100);
        assert_eq!(second.len(), 50);
        assert!(queue.is_empty());
    }

    #[test]
    fn close_drains_pending_entries() {
        let mut queue = OutboundQueue::new(10, 5);
        queue.enqueue(message("a", Priority::Low, 1)).unwrap();
        queue.enqueue(message("b", Priority::High, 2)).unwrap();

        let drained = queue.close();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_closed());
        assert!(queue.is_empty());
    }
}
