//! Bounded FIFO between the checker and the worker pool.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::lock::Lease;

/// Why a lease was not queued. The lease is handed back so the caller can
/// release it.
#[derive(Debug)]
pub enum OfferError {
    /// At capacity.
    Full(Lease),
    /// Shut down.
    Closed(Lease),
}

/// Producer half, owned by the checker.
#[derive(Clone)]
pub struct QueueTx {
    tx: mpsc::Sender<Lease>,
}

/// Consumer half, shared by every worker.
#[derive(Clone)]
pub struct QueueRx {
    rx: Arc<Mutex<mpsc::Receiver<Lease>>>,
}

/// Queue holding at most `capacity` leases.
pub fn bounded(capacity: usize) -> (QueueTx, QueueRx) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueTx { tx }, QueueRx { rx: Arc::new(Mutex::new(rx)) })
}

impl QueueTx {
    /// Non-blocking enqueue.
    pub fn offer(&self, lease: Lease) -> Result<(), OfferError> {
        self.tx.try_send(lease).map_err(|e| match e {
            mpsc::error::TrySendError::Full(l) => OfferError::Full(l),
            mpsc::error::TrySendError::Closed(l) => OfferError::Closed(l),
        })
    }

    /// Leases currently waiting.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// No lease waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueueRx {
    /// Wait for the next lease; `None` once closed and drained.
    pub async fn pop(&self) -> Option<Lease> {
        self.rx.lock().await.recv().await
    }

    /// Take a lease only if one is already waiting.
    pub async fn try_pop(&self) -> Option<Lease> {
        self.rx.lock().await.try_recv().ok()
    }

    /// Refuse further offers and hand back whatever is still queued.
    pub async fn close_and_drain(&self) -> Vec<Lease> {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut left = Vec::new();
        while let Ok(lease) = rx.try_recv() {
            left.push(lease);
        }
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use chrono::Utc;

    fn lease(n: u32) -> Lease {
        let job = NewJob::new("a", format!("k{n}"), 10, 1).into_job(format!("j{n}"), Utc::now());
        Lease { job, token: format!("t{n}"), reclaimed: false }
    }

    #[tokio::test]
    async fn fifo_with_backpressure() {
        let (tx, rx) = bounded(2);
        tx.offer(lease(1)).unwrap();
        tx.offer(lease(2)).unwrap();
        assert_eq!(tx.len(), 2);
        match tx.offer(lease(3)) {
            Err(OfferError::Full(l)) => assert_eq!(l.id(), "j3"),
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(rx.pop().await.unwrap().id(), "j1");
        assert_eq!(rx.pop().await.unwrap().id(), "j2");
        assert!(rx.try_pop().await.is_none());
        assert!(tx.is_empty());
    }

    #[tokio::test]
    async fn close_hands_back_leftovers_and_rejects_offers() {
        let (tx, rx) = bounded(4);
        tx.offer(lease(1)).unwrap();
        tx.offer(lease(2)).unwrap();
        let left = rx.close_and_drain().await;
        assert_eq!(left.len(), 2);
        assert!(matches!(tx.offer(lease(3)), Err(OfferError::Closed(_))));
        assert!(rx.pop().await.is_none());
    }
}
