//! In-flight tracking for draining runner clients
//!
//! Admission increments a counter published through a watch channel; closing
//! flips the gate and waits for the counter to reach zero.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// Admission gate counting in-flight operations
pub struct InFlightGate {
    closed: AtomicBool,
    count: watch::Sender<usize>,
}

impl Default for InFlightGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightGate {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            closed: AtomicBool::new(false),
            count,
        }
    }

    /// Admit one operation, or `None` once the gate is closed
    pub fn enter(&self) -> Option<InFlightGuard<'_>> {
        // Count first so a concurrent close either sees us or we see it
        self.count.send_modify(|n| *n += 1);
        if self.closed.load(Ordering::SeqCst) {
            self.count.send_modify(|n| *n -= 1);
            return None;
        }
        Some(InFlightGuard { gate: self })
    }

    /// Operations currently admitted
    pub fn in_flight(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop admitting and wait until every admitted operation finished
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Releases its admission slot on drop
pub struct InFlightGuard<'a> {
    gate: &'a InFlightGate,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gate.count.send_modify(|n| *n -= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_enter_and_release() {
        let gate = InFlightGate::new();
        let a = gate.enter().unwrap();
        let b = gate.enter().unwrap();
        assert_eq!(gate.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_closed_gate_rejects() {
        let gate = InFlightGate::new();
        gate.close().await;
        assert!(gate.is_closed());
        assert!(gate.enter().is_none());
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight() {
        let gate = Arc::new(InFlightGate::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let worker = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let _guard = gate.enter().unwrap();
                let _ = release_rx.await;
            })
        };

        while gate.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let closer = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.close().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closer.is_finished());

        release_tx.send(()).unwrap();
        worker.await.unwrap();
        closer.await.unwrap();
        assert_eq!(gate.in_flight(), 0);
    }
}
