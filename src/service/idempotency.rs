//! In-flight payment event tracking.
//!
//! The callback handler and the polling task can race to finalize the same
//! gateway transaction. This guard gives whoever acquires first exclusive
//! ownership of that transaction id until the permit drops.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Concurrent set of transaction ids currently being processed.
///
/// Acquisition is a single atomic insert-if-absent under one lock; there is
/// no separate check-then-insert window. Ids live only for the duration of
/// processing, so an id released after a failed attempt can be retried.
#[derive(Clone, Default)]
pub struct IdempotencyGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl IdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for processing. `None` means another caller already owns
    /// it and this event should be acknowledged without re-processing.
    pub fn try_acquire(&self, id: &str) -> Option<IdempotencyPermit> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if set.insert(id.to_string()) {
            Some(IdempotencyPermit {
                in_flight: Arc::clone(&self.in_flight),
                id: id.to_string(),
            })
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

/// Ownership of one in-flight transaction id. Releases on drop, so the id
/// is freed however processing ends.
pub struct IdempotencyPermit {
    in_flight: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for IdempotencyPermit {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let guard = IdempotencyGuard::new();
        let permit = guard.try_acquire("tx-1");
        assert!(permit.is_some());
        assert!(guard.try_acquire("tx-1").is_none());
        assert!(guard.try_acquire("tx-2").is_some());
    }

    #[test]
    fn test_release_on_drop() {
        let guard = IdempotencyGuard::new();
        {
            let _permit = guard.try_acquire("tx-1").unwrap();
            assert!(guard.is_held("tx-1"));
        }
        assert!(!guard.is_held("tx-1"));
        assert!(guard.try_acquire("tx-1").is_some());
    }

    #[test]
    fn test_release_even_when_processing_fails() {
        let guard = IdempotencyGuard::new();
        let attempt = || -> Result<(), &'static str> {
            let _permit = guard.try_acquire("tx-1").ok_or("busy")?;
            Err("processing blew up")
        };
        assert!(attempt().is_err());
        // The failed attempt must not wedge future retries.
        assert!(guard.try_acquire("tx-1").is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_acquire_is_exclusive() {
        let guard = IdempotencyGuard::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard.try_acquire("tx-race").map(std::mem::forget).is_some()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        // Permits were leaked on purpose, so exactly one acquisition can
        // have succeeded across all tasks.
        assert_eq!(winners, 1);
    }
}
