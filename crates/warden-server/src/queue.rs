use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tracing::debug;
use warden_proto::command::{Priority, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("command queue is full")]
    Full,
    #[error("command queue is closed")]
    Closed,
}

/// One received frame waiting for the dispatcher.
#[derive(Debug)]
pub struct Command {
    pub priority: Priority,
    pub payload: Bytes,
    /// Arrival order across all clients.
    pub seq: u64,
    pub client: u64,
    reply: Option<mpsc::Sender<Reply>>,
}

impl Command {
    pub fn new(priority: Priority, payload: Bytes, client: u64, reply: Option<mpsc::Sender<Reply>>) -> Self {
        Self { priority, payload, seq: 0, client, reply }
    }

    /// Hands the reply to the client's writer. A client that went away is not an error.
    pub async fn respond(mut self, reply: Reply) {
        if let Some(tx) = self.reply.take() {
            if tx.send(reply).await.is_err() {
                debug!(client = self.client, "client gone before reply to command {}", self.seq);
            }
        }
    }
}

struct Queued(Command);

impl Queued {
    fn key(&self) -> (Priority, u64) {
        (self.0.priority, self.0.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap pops the greatest, so the smallest (priority, seq) ranks highest
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

struct Inner {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    senders: usize,
    receiver_alive: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bounded priority queue with many producers and one consumer. Commands
/// leave in priority order, FIFO by arrival within a priority.
pub fn channel(capacity: usize) -> (CommandSender, CommandReceiver) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            heap: BinaryHeap::with_capacity(capacity),
            next_seq: 0,
            senders: 1,
            receiver_alive: true,
        }),
        notify: Notify::new(),
        capacity: capacity.max(1),
    });
    (CommandSender { shared: shared.clone() }, CommandReceiver { shared })
}

pub struct CommandSender {
    shared: Arc<Shared>,
}

impl CommandSender {
    /// Enqueues without waiting. Returns the arrival sequence number.
    pub fn push(&self, mut command: Command) -> Result<u64, QueueError> {
        let mut inner = self.shared.lock();
        if !inner.receiver_alive {
            return Err(QueueError::Closed);
        }
        if inner.heap.len() >= self.shared.capacity {
            return Err(QueueError::Full);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        command.seq = seq;
        inner.heap.push(Queued(command));
        drop(inner);
        self.shared.notify.notify_one();
        Ok(seq)
    }
}

impl Clone for CommandSender {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self { shared: self.shared.clone() }
    }
}

impl Drop for CommandSender {
    fn drop(&mut self) {
        let last = {
            let mut inner = self.shared.lock();
            inner.senders -= 1;
            inner.senders == 0
        };
        if last {
            self.shared.notify.notify_one();
        }
    }
}

pub struct CommandReceiver {
    shared: Arc<Shared>,
}

impl CommandReceiver {
    /// Next command by priority. `None` once every sender is gone and the
    /// queue is drained.
    pub async fn pop(&mut self) -> Option<Command> {
        loop {
            {
                let mut inner = self.shared.lock();
                if let Some(Queued(cmd)) = inner.heap.pop() {
                    return Some(cmd);
                }
                if inner.senders == 0 {
                    return None;
                }
            }
            // notify_one keeps a permit, so a push between unlock and here is not lost
            self.shared.notify.notified().await;
        }
    }

    pub fn try_pop(&mut self) -> Option<Command> {
        self.shared.lock().heap.pop().map(|Queued(cmd)| cmd)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CommandReceiver {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.receiver_alive = false;
        inner.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(priority: Priority, text: &str, client: u64) -> Command {
        Command::new(priority, Bytes::copy_from_slice(text.as_bytes()), client, None)
    }

    #[test]
    fn priority_then_arrival() {
        let (tx, mut rx) = channel(16);
        tx.push(cmd(Priority::Low, "STATUS", 1)).unwrap();
        tx.push(cmd(Priority::Normal, "ARM", 1)).unwrap();
        tx.push(cmd(Priority::Critical, "FT", 2)).unwrap();
        tx.push(cmd(Priority::Normal, "START_MISSION", 2)).unwrap();
        tx.push(cmd(Priority::High, "RTL", 1)).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| rx.try_pop()).map(|c| c.payload).collect();
        assert_eq!(order, ["FT", "RTL", "ARM", "START_MISSION", "STATUS"]);
    }

    #[test]
    fn bounded() {
        let (tx, mut rx) = channel(2);
        tx.push(cmd(Priority::Low, "a", 1)).unwrap();
        tx.push(cmd(Priority::Low, "b", 1)).unwrap();
        assert_eq!(tx.push(cmd(Priority::Critical, "c", 1)), Err(QueueError::Full));
        rx.try_pop().unwrap();
        assert!(tx.push(cmd(Priority::Critical, "c", 1)).is_ok());
    }

    #[test]
    fn push_after_receiver_dropped_is_closed() {
        let (tx, rx) = channel(2);
        drop(rx);
        assert_eq!(tx.push(cmd(Priority::Low, "a", 1)), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn pop_drains_then_ends_when_senders_gone() {
        let (tx, mut rx) = channel(4);
        let tx2 = tx.clone();
        tx.push(cmd(Priority::Normal, "ARM", 1)).unwrap();
        drop(tx);
        tx2.push(cmd(Priority::High, "LAND", 2)).unwrap();
        drop(tx2);

        assert_eq!(rx.pop().await.unwrap().payload, "LAND");
        assert_eq!(rx.pop().await.unwrap().payload, "ARM");
        assert!(rx.pop().await.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let (tx, mut rx) = channel(4);
        let waiter = tokio::spawn(async move { rx.pop().await.map(|c| c.payload) });
        tokio::task::yield_now().await;
        tx.push(cmd(Priority::Low, "STATUS", 1)).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "STATUS");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_keep_order() {
        const PRODUCERS: u64 = 4;
        const EACH: usize = 50;
        let (tx, mut rx) = channel(PRODUCERS as usize * EACH);
        let priorities = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

        let mut tasks = Vec::new();
        for client in 0..PRODUCERS {
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..EACH {
                    let p = priorities[(i + client as usize) % priorities.len()];
                    tx.push(cmd(p, &format!("{client}:{i}"), client)).unwrap();
                    if i % 7 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        drop(tx);

        let mut out = Vec::new();
        while let Some(c) = rx.pop().await {
            out.push(c);
        }
        assert_eq!(out.len(), PRODUCERS as usize * EACH);

        for pair in out.windows(2) {
            assert!((pair[0].priority, pair[0].seq) < (pair[1].priority, pair[1].seq));
        }
        // per producer, per priority, the push order survives
        for client in 0..PRODUCERS {
            for p in priorities {
                let idx: Vec<usize> = out
                    .iter()
                    .filter(|c| c.client == client && c.priority == p)
                    .map(|c| {
                        let text = std::str::from_utf8(&c.payload).unwrap();
                        text.split(':').nth(1).unwrap().parse().unwrap()
                    })
                    .collect();
                assert!(idx.windows(2).all(|w| w[0] < w[1]), "{client} {p:?}: {idx:?}");
            }
        }
    }
}
