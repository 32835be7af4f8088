//! Cancellation tokens for coordinated shutdown.
//!
//! A single root token is created at startup; the node derives a child for
//! itself, each connection derives a child from the node, and camera streams
//! derive from their connection. Cancelling any level wakes everything below
//! it: every token carries the atomic flags and wakeup channels of all its
//! ancestors, so a blocked `select` observes the closest cancelled ancestor
//! immediately.
//!
//! The wakeup mechanism is a zero-capacity channel whose sender is dropped on
//! cancel. A disconnected channel is permanently ready, which lets waiters
//! compose cancellation with data channels in a single
//! [`crossbeam_channel::Select`].

use crossbeam_channel::{bounded, Receiver, Select, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Create a root cancellation pair.
pub fn root() -> (Canceller, CancelToken) {
    CancelToken { links: Vec::new() }.child()
}

/// The cancelling half. Dropping it cancels, so a handler that derives a
/// child for its helpers tears them down on any exit path.
pub struct Canceller {
    flag: Arc<AtomicBool>,
    tx: Mutex<Option<Sender<()>>>,
}

impl Canceller {
    /// Cancel the associated token and all tokens derived from it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
        // Dropping the sender closes the channel and wakes all waiters.
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}

impl Drop for Canceller {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Clone)]
struct Link {
    flag: Arc<AtomicBool>,
    rx: Receiver<()>,
}

/// The observing half. Cheap to clone; clones observe the same cancellation.
#[derive(Clone)]
pub struct CancelToken {
    /// Ancestor links first, own link last.
    links: Vec<Link>,
}

impl CancelToken {
    /// Derive a child scope: cancelled when either the new [`Canceller`]
    /// fires or any ancestor is cancelled.
    pub fn child(&self) -> (Canceller, CancelToken) {
        let flag = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(0);
        let mut links = self.links.clone();
        links.push(Link {
            flag: Arc::clone(&flag),
            rx,
        });
        let canceller = Canceller {
            flag,
            tx: Mutex::new(Some(tx)),
        };
        (canceller, CancelToken { links })
    }

    pub fn is_cancelled(&self) -> bool {
        self.links.iter().any(|l| l.flag.load(Ordering::Relaxed))
    }

    /// Block until cancelled.
    pub fn wait(&self) {
        let mut sel = Select::new();
        for l in &self.links {
            sel.recv(&l.rx);
        }
        sel.ready();
    }

    /// Block for at most `timeout`. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let mut sel = Select::new();
        for l in &self.links {
            sel.recv(&l.rx);
        }
        sel.ready_timeout(timeout).is_ok()
    }

    /// Receive from `rx`, returning `None` when cancelled or when the sender
    /// side has gone away.
    pub fn recv_or_cancelled<T>(&self, rx: &Receiver<T>) -> Option<T> {
        self.recv_inner(rx, None)
    }

    /// Like [`recv_or_cancelled`](Self::recv_or_cancelled) with an absolute
    /// deadline; returns `None` once the deadline passes.
    pub fn recv_deadline_or_cancelled<T>(&self, rx: &Receiver<T>, deadline: Instant) -> Option<T> {
        self.recv_inner(rx, Some(deadline))
    }

    fn recv_inner<T>(&self, rx: &Receiver<T>, deadline: Option<Instant>) -> Option<T> {
        let mut sel = Select::new();
        let data = sel.recv(rx);
        for l in &self.links {
            sel.recv(&l.rx);
        }
        let op = match deadline {
            Some(d) => match sel.select_deadline(d) {
                Ok(op) => op,
                Err(_) => return None,
            },
            None => sel.select(),
        };
        if op.index() == data {
            op.recv(rx).ok()
        } else {
            // A cancel channel became ready; complete the operation on it.
            let link = &self.links[op.index() - 1];
            let _ = op.recv(&link.rx);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_sets_flag() {
        let (canceller, token) = root();
        assert!(!token.is_cancelled());
        canceller.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_observes_parent_cancel() {
        let (parent_canceller, parent) = root();
        let (_child_canceller, child) = parent.child();
        parent_canceller.cancel();
        assert!(child.is_cancelled());
        assert!(child.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_parent_unaffected_by_child_cancel() {
        let (_parent_canceller, parent) = root();
        let (child_canceller, child) = parent.child();
        child_canceller.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_drop_cancels() {
        let (canceller, token) = root();
        drop(canceller);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let (_canceller, token) = root();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_cancel_wakes_blocked_waiter() {
        let (canceller, token) = root();
        let waiter = thread::spawn(move || token.wait_timeout(Duration::from_secs(10)));
        canceller.cancel();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_recv_prefers_data() {
        let (_canceller, token) = root();
        let (tx, rx) = bounded(1);
        tx.send(42u32).unwrap();
        assert_eq!(token.recv_or_cancelled(&rx), Some(42));
    }

    #[test]
    fn test_recv_ends_on_cancel() {
        let (canceller, token) = root();
        let (_tx, rx) = bounded::<u32>(1);
        canceller.cancel();
        assert_eq!(token.recv_or_cancelled(&rx), None);
    }

    #[test]
    fn test_recv_ends_on_sender_drop() {
        let (_canceller, token) = root();
        let (tx, rx) = bounded::<u32>(1);
        drop(tx);
        assert_eq!(token.recv_or_cancelled(&rx), None);
    }

    #[test]
    fn test_recv_deadline_expires() {
        let (_canceller, token) = root();
        let (_tx, rx) = bounded::<u32>(1);
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(token.recv_deadline_or_cancelled(&rx, deadline), None);
    }
}
