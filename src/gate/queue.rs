//! FIFO queue of callers waiting for admission.

use std::collections::VecDeque;

use tokio::{sync::oneshot, time::Instant};

/// Identifier of a queued admission request.
pub(crate) type WaiterId = u64;

/// Single queued admission request.
#[derive(Debug)]
pub(crate) struct Waiter {
    /// Queue-unique identifier.
    pub(crate) id: WaiterId,
    /// Resume channel. Sending on it hands a freed slot over to the waiter.
    pub(crate) resume: oneshot::Sender<()>,
    /// Point in time after which the waiter stops waiting.
    pub(crate) deadline: Instant,
}

impl Waiter {
    /// Hand a freed slot to this waiter.
    ///
    /// Returns `false` if the waiting side is already gone.
    pub(crate) fn resume(self) -> bool {
        self.resume.send(()).is_ok()
    }
}

/// Ordered collection of pending admission requests.
///
/// Not synchronized on its own, always used under the gate mutex.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    waiters: VecDeque<Waiter>,
    next_id: WaiterId,
}

impl WaitQueue {
    /// Append a new waiter to the tail of the queue.
    pub(crate) fn push(&mut self, deadline: Instant) -> (WaiterId, oneshot::Receiver<()>) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let (resume, rx) = oneshot::channel();
        self.waiters.push_back(Waiter {
            id,
            resume,
            deadline,
        });
        (id, rx)
    }

    /// Take the longest-waiting entry.
    pub(crate) fn pop_front(&mut self) -> Option<Waiter> {
        self.waiters.pop_front()
    }

    /// Remove a specific waiter, wherever it is in the queue.
    ///
    /// Returns `None` if the waiter was already popped.
    pub(crate) fn remove(&mut self, id: WaiterId) -> Option<Waiter> {
        let pos = self.waiters.iter().position(|w| w.id == id)?;
        self.waiters.remove(pos)
    }

    /// Number of queued waiters.
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Deadline of the head of the queue, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.waiters.front().map(|w| w.deadline)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn fifo_order() {
        let now = Instant::now();
        let mut queue = WaitQueue::default();
        let (a, _rx_a) = queue.push(now);
        let (b, _rx_b) = queue.push(now + Duration::from_millis(1));
        let (c, _rx_c) = queue.push(now + Duration::from_millis(2));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.next_deadline(), Some(now));
        assert_eq!(queue.pop_front().map(|w| w.id), Some(a));
        assert_eq!(queue.pop_front().map(|w| w.id), Some(b));
        assert_eq!(queue.pop_front().map(|w| w.id), Some(c));
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn remove_out_of_order() {
        let now = Instant::now();
        let mut queue = WaitQueue::default();
        let (a, _rx_a) = queue.push(now);
        let (b, _rx_b) = queue.push(now);
        let (c, _rx_c) = queue.push(now);
        assert_eq!(queue.remove(b).map(|w| w.id), Some(b));
        assert!(queue.remove(b).is_none());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().map(|w| w.id), Some(a));
        assert_eq!(queue.pop_front().map(|w| w.id), Some(c));
    }

    #[test]
    fn resume_signals_receiver() {
        let mut queue = WaitQueue::default();
        let (_, mut rx) = queue.push(Instant::now());
        let (_, dropped_rx) = queue.push(Instant::now());
        drop(dropped_rx);
        assert!(queue.pop_front().unwrap().resume());
        assert!(rx.try_recv().is_ok());
        assert!(!queue.pop_front().unwrap().resume());
    }
}
