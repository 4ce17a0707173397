//! Thread-safe FIFO used for inbound and outbound message queues.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Mutex-guarded FIFO queue.
///
/// Every operation takes the lock for its own duration only, so callers never
/// need external locking. There is no blocking pop: consumers poll
/// [`MessageQueue::is_empty`] or simply try [`MessageQueue::dequeue`].
#[derive(Debug)]
pub struct MessageQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends an item to the back of the queue.
    pub fn enqueue(&self, item: T) {
        self.lock().push_back(item);
    }

    /// Removes and returns the front item, or `None` when empty.
    pub fn dequeue(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panicking producer cannot leave a VecDeque half-updated.
        crate::lock(&self.items)
    }
}

impl<T: Clone> MessageQueue<T> {
    /// Returns a copy of the front item without removing it.
    pub fn front(&self) -> Option<T> {
        self.lock().front().cloned()
    }

    /// Returns a copy of the back item without removing it.
    pub fn back(&self) -> Option<T> {
        self.lock().back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn dequeues_in_enqueue_order() {
        let queue = MessageQueue::new();
        for value in 1..=5 {
            queue.enqueue(value);
        }
        assert_eq!(queue.size(), 5);

        for expected in 1..=5 {
            assert!(!queue.is_empty());
            assert_eq!(queue.dequeue(), Some(expected));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn front_and_back_do_not_remove() {
        let queue = MessageQueue::new();
        assert_eq!(queue.front(), None);

        queue.enqueue("a");
        queue.enqueue("b");
        assert_eq!(queue.front(), Some("a"));
        assert_eq!(queue.back(), Some("b"));
        assert_eq!(queue.size(), 2);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_producers_keep_per_producer_order() {
        let queue = Arc::new(MessageQueue::new());
        let producers: Vec<_> = (0..4u32)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for seq in 0..250u32 {
                        queue.enqueue((producer, seq));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(queue.size(), 1000);
        let mut next = [0u32; 4];
        while let Some((producer, seq)) = queue.dequeue() {
            assert_eq!(seq, next[producer as usize]);
            next[producer as usize] += 1;
        }
        assert_eq!(next, [250; 4]);
    }
}
