// Message Queue - Multi-producer, single-consumer FIFO feeding the coordinator
//
// Producers never block on capacity. The consumer parks on a condition
// variable while the queue is empty and is woken either by a push or by
// `terminate`, after which it receives nothing more.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

pub struct MessageQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    done: AtomicBool,
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
            available: Condvar::new(),
            done: AtomicBool::new(false),
        }
    }

    /// Append an item and wake the consumer
    pub fn push(&self, item: T) {
        self.lock().push_back(item);
        self.available.notify_one();
    }

    /// Block until an item is available; None once terminated
    pub fn next_wait(&self) -> Option<T> {
        let mut items = self.lock();
        loop {
            if self.done.load(Ordering::Acquire) {
                return None;
            }
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            items = self
                .available
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking pop, used by inline processing
    pub fn try_next(&self) -> Option<T> {
        if self.done.load(Ordering::Acquire) {
            return None;
        }
        self.lock().pop_front()
    }

    /// Stop delivering items and wake the consumer
    pub fn terminate(&self) {
        // Store under the lock so a consumer between its check and its wait
        // cannot miss the wakeup
        let _items = self.lock();
        self.done.store(true, Ordering::Release);
        self.available.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 5);
        let drained: Vec<_> = (0..5).filter_map(|_| queue.next_wait()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_consumer_wakes_on_push() {
        let queue = Arc::new(MessageQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.next_wait())
        };
        thread::sleep(Duration::from_millis(20));
        queue.push("block");
        assert_eq!(consumer.join().unwrap(), Some("block"));
    }

    #[test]
    fn test_terminate_wakes_consumer() {
        let queue: Arc<MessageQueue<u32>> = Arc::new(MessageQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.next_wait())
        };
        thread::sleep(Duration::from_millis(20));
        queue.terminate();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_terminated_queue_stops_delivering() {
        let queue = MessageQueue::new();
        queue.push(1);
        queue.terminate();
        assert!(queue.is_terminated());
        assert_eq!(queue.next_wait(), None);
        assert_eq!(queue.try_next(), None);
    }

    #[test]
    fn test_many_producers() {
        let queue = Arc::new(MessageQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..100 {
                        queue.push(p * 1000 + i);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(queue.len(), 400);

        // Per producer order is preserved
        let mut last = [None; 4];
        while let Some(item) = queue.try_next() {
            let p = (item / 1000) as usize;
            assert!(last[p].map_or(true, |prev| prev < item));
            last[p] = Some(item);
        }
    }
}
