//! Per-neighbour outbound queue
//!
//! Relay fan-out never waits on a slow bearer: frames go into a bounded
//! queue that drops its oldest frame on overflow, and one writer task per
//! bearer drains it with a write timeout.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub struct OutboundQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame. Returns `true` if the oldest queued frame had to be
    /// dropped to make room.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        if self.is_closed() {
            return false;
        }
        let overflowed = {
            let mut frames = self.frames.lock();
            let overflowed = frames.len() >= self.capacity;
            if overflowed {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            frames.push_back(frame);
            overflowed
        };
        self.notify.notify_one();
        overflowed
    }

    /// Wait for the next frame; `None` once the queue is closed and drained
    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            let next = self.frames.lock().pop_front();
            if let Some(frame) = next {
                return Some(frame);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.frames.lock().clear();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drain `queue` into a bearer's outbound channel until either side closes
pub async fn run_writer(queue: std::sync::Arc<OutboundQueue>, sink: mpsc::Sender<Vec<u8>>, write_timeout: Duration) {
    while let Some(frame) = queue.pop().await {
        match tokio::time::timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                log::debug!("Bearer sink closed, stopping writer");
                break;
            }
            Err(_) => {
                log::warn!("Bearer write timed out after {:?}, frame dropped", write_timeout);
            }
        }
    }
    queue.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = OutboundQueue::new(2);
        assert!(!queue.push(vec![1]));
        assert!(!queue.push(vec![2]));
        assert!(queue.push(vec![3]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);

        let frames: Vec<_> = queue.frames.lock().iter().cloned().collect();
        assert_eq!(frames, vec![vec![2], vec![3]]);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(OutboundQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(vec![42]);
        assert_eq!(consumer.await.unwrap(), Some(vec![42]));
    }

    #[tokio::test]
    async fn test_close_wakes_consumer() {
        let queue = Arc::new(OutboundQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
        assert!(!queue.push(vec![1]));
    }

    #[tokio::test]
    async fn test_writer_drains_into_sink() {
        let queue = Arc::new(OutboundQueue::new(8));
        let (tx, mut rx) = mpsc::channel(8);
        queue.push(vec![1]);
        queue.push(vec![2]);
        let writer = tokio::spawn(run_writer(queue.clone(), tx, Duration::from_secs(1)));

        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(rx.recv().await, Some(vec![2]));
        queue.close();
        writer.await.unwrap();
    }
}
