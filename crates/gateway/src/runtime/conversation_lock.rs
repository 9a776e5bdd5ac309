//! Per-conversation concurrency control.
//!
//! Serializes all completion turns for a given conversation id so that
//! concurrent browser tabs never race on the same conversation's
//! snapshot-then-append sequence. Acquisition never fails — a second
//! turn arriving while one is in flight waits its turn, and waiters are
//! granted the lock in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type LockTable = Arc<Mutex<HashMap<String, Arc<Semaphore>>>>;

/// Manages per-conversation turn locks.
///
/// Each conversation id maps to a `Semaphore(1)`. The tokio semaphore
/// queues waiters fairly, which gives the FIFO grant order callers rely
/// on. Entries are removed once the last holder releases and nobody is
/// waiting, so the map never grows with dead conversations.
pub struct ConversationLockMap {
    locks: LockTable,
}

impl Default for ConversationLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationLockMap {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire the turn lock for a conversation, waiting behind any
    /// earlier callers. The returned guard releases on drop or via an
    /// explicit, idempotent [`ConversationLockGuard::release`].
    pub async fn acquire(&self, conversation_id: &str) -> ConversationLockGuard {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(conversation_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        // acquire_owned on a tokio semaphore queues fairly: waiters are
        // granted permits in the order they arrived. The semaphore is
        // never closed, so acquisition can only wait.
        let permit = sem
            .acquire_owned()
            .await
            .expect("conversation lock semaphore is never closed");

        ConversationLockGuard {
            conversation_id: conversation_id.to_owned(),
            locks: self.locks.clone(),
            permit: Some(permit),
        }
    }

    /// Number of conversations with a live lock entry (for tests and
    /// monitoring).
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Exclusive hold on one conversation's turn lock.
pub struct ConversationLockGuard {
    conversation_id: String,
    locks: LockTable,
    permit: Option<OwnedSemaphorePermit>,
}

impl ConversationLockGuard {
    /// Release the lock. Safe to call more than once; calls after the
    /// first are no-ops. When no other holder or waiter remains for
    /// this conversation, the map entry is removed.
    pub fn release(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        drop(permit);

        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get(&self.conversation_id) {
            // The map entry holds the only outstanding Arc: nobody holds
            // the permit and nobody is queued (waiters and held permits
            // each keep a clone of the semaphore Arc alive).
            if entry.available_permits() == 1 && Arc::strong_count(entry) == 1 {
                locks.remove(&self.conversation_id);
            }
        }
    }
}

impl Drop for ConversationLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sequential_acquire_release() {
        let map = ConversationLockMap::new();

        let guard1 = map.acquire("conversation1").await;
        drop(guard1);

        let guard2 = map.acquire("conversation1").await;
        drop(guard2);
    }

    #[tokio::test]
    async fn different_conversations_are_independent() {
        let map = ConversationLockMap::new();

        let g1 = map.acquire("conversation1").await;
        let g2 = map.acquire("conversation2").await;

        assert_eq!(map.lock_count(), 2);

        drop(g1);
        drop(g2);
        assert_eq!(map.lock_count(), 0);
    }

    #[tokio::test]
    async fn waiters_are_granted_in_arrival_order() {
        let map = Arc::new(ConversationLockMap::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = map.acquire("conversation1").await;

        let mut handles = Vec::new();
        for i in 0..3 {
            let map = map.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = map.acquire("conversation1").await;
                order.lock().push(i);
            }));
            // Let each waiter queue before spawning the next.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let map = ConversationLockMap::new();

        let mut guard = map.acquire("conversation1").await;
        guard.release();
        guard.release();

        // Lock is free again.
        let _reacquired = map.acquire("conversation1").await;
    }

    #[tokio::test]
    async fn entry_removed_when_last_guard_releases() {
        let map = ConversationLockMap::new();

        let mut guard = map.acquire("conversation1").await;
        assert_eq!(map.lock_count(), 1);
        guard.release();
        assert_eq!(map.lock_count(), 0);
    }

    #[tokio::test]
    async fn entry_survives_while_a_waiter_is_queued() {
        let map = Arc::new(ConversationLockMap::new());

        let guard = map.acquire("conversation1").await;

        let map2 = map.clone();
        let waiter = tokio::spawn(async move {
            let _guard = map2.acquire("conversation1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A waiter is queued: releasing must hand over, not remove.
        drop(guard);
        waiter.await.unwrap();

        assert_eq!(map.lock_count(), 0);
    }
}
