//! Key debouncer.
//!
//! The first `push(k)` arms a deadline `now + window`. Pushes of the same
//! key before that deadline are absorbed; at the deadline the key is
//! emitted exactly once on the output channel. Because every key shares
//! one window, deadlines are armed in order and a FIFO queue is enough.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// Handle used to feed keys into a running debounce task.
#[derive(Debug)]
pub struct Debouncer<K> {
    tx: mpsc::UnboundedSender<K>,
}

impl<K> Clone for Debouncer<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    /// Spawn the debounce task on the current runtime.
    ///
    /// The task runs until every `Debouncer` handle is dropped, flushing
    /// whatever is still armed, or until the receiver is dropped.
    pub fn spawn(window: Duration) -> (Self, mpsc::UnboundedReceiver<K>) {
        let (tx, mut input) = mpsc::unbounded_channel::<K>();
        let (output, rx) = mpsc::unbounded_channel::<K>();

        tokio::spawn(async move {
            let mut armed: HashSet<K> = HashSet::new();
            let mut queue: VecDeque<(Instant, K)> = VecDeque::new();

            loop {
                let next = queue.front().map(|(deadline, _)| *deadline);
                tokio::select! {
                    received = input.recv() => {
                        match received {
                            Some(key) => {
                                if armed.insert(key.clone()) {
                                    queue.push_back((Instant::now() + window, key));
                                }
                            }
                            None => {
                                for (_, key) in queue.drain(..) {
                                    let _ = output.send(key);
                                }
                                break;
                            }
                        }
                    }
                    _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                        let now = Instant::now();
                        while queue.front().is_some_and(|(deadline, _)| *deadline <= now) {
                            let Some((_, key)) = queue.pop_front() else { break };
                            armed.remove(&key);
                            trace!(?key, "debounce window elapsed");
                            if output.send(key).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        (Self { tx }, rx)
    }

    /// Queue a key. Returns `false` once the task has stopped.
    pub fn push(&self, key: K) -> bool {
        self.tx.send(key).is_ok()
    }
}
