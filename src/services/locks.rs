//! Per-book locks with bounded acquisition
//!
//! Every transaction that reads and then rewrites a book's copy counters
//! holds that book's lock for the whole read-validate-commit sequence. A
//! transaction never holds more than one book lock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Dead entries are swept once the registry grows past this size
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Clone)]
pub struct BookLocks {
    locks: Arc<Mutex<HashMap<Uuid, Weak<AsyncMutex<()>>>>>,
    timeout: Duration,
}

/// Exclusive access to one book until dropped
pub struct BookGuard {
    book_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl BookGuard {
    pub fn book_id(&self) -> Uuid {
        self.book_id
    }
}

impl BookLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    fn handle(&self, book_id: Uuid) -> AppResult<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| AppError::Internal("Book lock registry poisoned".to_string()))?;

        if let Some(lock) = locks.get(&book_id).and_then(Weak::upgrade) {
            return Ok(lock);
        }

        if locks.len() >= PRUNE_THRESHOLD {
            locks.retain(|_, lock| lock.strong_count() > 0);
        }

        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(book_id, Arc::downgrade(&lock));
        Ok(lock)
    }

    /// Wait for exclusive access to a book, failing with `Busy` after the timeout
    pub async fn acquire(&self, book_id: Uuid) -> AppResult<BookGuard> {
        let lock = self.handle(book_id)?;

        match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(BookGuard {
                book_id,
                _guard: guard,
            }),
            Err(_) => {
                tracing::debug!(
                    %book_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Book lock timed out"
                );
                Err(AppError::Busy(format!(
                    "Book {} is locked by another transaction, retry later",
                    book_id
                )))
            }
        }
    }

    /// Number of registry entries whose lock is still referenced
    pub fn live_entries(&self) -> usize {
        self.locks
            .lock()
            .map(|locks| locks.values().filter(|l| l.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_times_out_as_busy() {
        let locks = BookLocks::new(Duration::from_millis(50));
        let book_id = Uuid::new_v4();

        let guard = locks.acquire(book_id).await.unwrap();
        assert_eq!(guard.book_id(), book_id);

        let err = locks.acquire(book_id).await.err().unwrap();
        assert!(err.is_retryable());

        drop(guard);
        assert!(locks.acquire(book_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_books_do_not_contend() {
        let locks = BookLocks::new(Duration::from_millis(50));
        let _first = locks.acquire(Uuid::new_v4()).await.unwrap();
        let _second = locks.acquire(Uuid::new_v4()).await.unwrap();
        assert_eq!(locks.live_entries(), 2);
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let locks = BookLocks::new(Duration::from_secs(1));
        let book_id = Uuid::new_v4();
        let guard = locks.acquire(book_id).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(book_id).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_released_entries_are_not_live() {
        let locks = BookLocks::new(Duration::from_millis(50));
        {
            let _guard = locks.acquire(Uuid::new_v4()).await.unwrap();
            assert_eq!(locks.live_entries(), 1);
        }
        assert_eq!(locks.live_entries(), 0);
    }
}
