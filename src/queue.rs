//! FIFO queues injected into the unicast engine.

use std::collections::VecDeque;

/// A FIFO buffer. `offer` hands the value back when the queue is full.
pub trait Queue<T>: Send {
    fn offer(&mut self, value: T) -> Result<(), T>;

    fn poll(&mut self) -> Option<T>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of elements, `None` when unbounded.
    fn capacity(&self) -> Option<usize>;

    /// Removes and returns every element, oldest first.
    fn drain_all(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(value) = self.poll() {
            drained.push(value);
        }
        drained
    }
}

#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }
}

impl<T: Send> Queue<T> for BoundedQueue<T> {
    fn offer(&mut self, value: T) -> Result<(), T> {
        if self.items.len() >= self.capacity {
            return Err(value);
        }
        self.items.push_back(value);
        Ok(())
    }

    fn poll(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }

    fn drain_all(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }
}

#[derive(Debug)]
pub struct UnboundedQueue<T> {
    items: VecDeque<T>,
}

impl<T> UnboundedQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T> Default for UnboundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Queue<T> for UnboundedQueue<T> {
    fn offer(&mut self, value: T) -> Result<(), T> {
        self.items.push_back(value);
        Ok(())
    }

    fn poll(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn drain_all(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_rejects_when_full() {
        let mut q = BoundedQueue::new(2);
        assert!(q.offer(1).is_ok());
        assert!(q.offer(2).is_ok());
        assert_eq!(q.offer(3), Err(3));
        assert_eq!(q.poll(), Some(1));
        assert!(q.offer(3).is_ok());
        assert_eq!(q.drain_all(), vec![2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_unbounded_keeps_everything() {
        let mut q = UnboundedQueue::new();
        for i in 0..10_000 {
            assert!(q.offer(i).is_ok());
        }
        assert_eq!(q.len(), 10_000);
        assert_eq!(q.capacity(), None);
        assert_eq!(q.poll(), Some(0));
    }
}
