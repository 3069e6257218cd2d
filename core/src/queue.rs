//! Serializes turns per conversation while unrelated conversations run
//! concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use tokio::sync::Mutex;

use crate::store::ConversationKey;

type Slot = Arc<Mutex<()>>;

/// FIFO turn queue keyed by conversation. Waiters on one key are served in
/// arrival order; a key's entry is dropped once nobody is running or
/// waiting on it.
#[derive(Debug)]
pub struct TurnQueue<K = ConversationKey> {
    slots: StdMutex<HashMap<K, Slot>>,
}

impl<K> Default for TurnQueue<K> {
    fn default() -> Self {
        Self {
            slots: StdMutex::new(HashMap::new()),
        }
    }
}

impl<K> TurnQueue<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for every earlier turn on `key`, then runs `task`.
    pub async fn run<F, T>(&self, key: &K, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let ticket = self.enter(key);
        let _turn = ticket.slot.lock().await;
        task.await
    }

    /// Number of keys with a turn running or waiting.
    pub fn active_keys(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn enter(&self, key: &K) -> Ticket<'_, K> {
        let slot = Arc::clone(
            self.slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key.clone())
                .or_default(),
        );
        Ticket {
            queue: self,
            key: key.clone(),
            slot,
        }
    }
}

/// Releases the key's entry when the last holder goes away, including
/// when the turn's future is dropped mid-flight.
struct Ticket<'a, K: Hash + Eq> {
    queue: &'a TurnQueue<K>,
    key: K,
    slot: Slot,
}

impl<K: Hash + Eq> Drop for Ticket<'_, K> {
    fn drop(&mut self) {
        let mut slots = self
            .queue
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn same_key_runs_in_arrival_order() {
        let queue = Arc::new(TurnQueue::<&'static str>::new());
        let order = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..5 {
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                queue
                    .run(&"chat", async {
                        order.lock().expect("lock").push(format!("start {n}"));
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        order.lock().expect("lock").push(format!("end {n}"));
                    })
                    .await;
            }));
            // Give each task time to queue up before the next one arrives.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let order = order.lock().expect("lock").clone();
        let expected: Vec<String> = (0..5)
            .flat_map(|n| [format!("start {n}"), format!("end {n}")])
            .collect();
        assert_eq!(order, expected);
        assert_eq!(queue.active_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn different_keys_run_concurrently() {
        let queue = Arc::new(TurnQueue::<&'static str>::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .run(&"a", async {
                        let _ = rx.await;
                    })
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Would deadlock if "b" waited on "a".
        let answer = tokio::time::timeout(Duration::from_secs(2), queue.run(&"b", async { 7 }))
            .await
            .expect("b is not blocked by a");
        assert_eq!(answer, 7);
        assert_eq!(queue.active_keys(), 1);

        let _ = tx.send(());
        blocked.await.expect("join");
        assert_eq!(queue.active_keys(), 0);
    }

    #[tokio::test]
    async fn dropped_turn_releases_its_key() {
        let queue = TurnQueue::<&'static str>::new();
        let pending = queue.run(&"chat", std::future::pending::<()>());
        let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;
        assert_eq!(queue.active_keys(), 0);
        assert_eq!(queue.run(&"chat", async { 1 }).await, 1);
    }
}
