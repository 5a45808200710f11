//! Delivery receipts: one per queued message, status driven solely by
//! the dispatch workers. Listener notifications go through a single-slot
//! channel so at most one callback is ever in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Queued,
    Sending,
    Success,
    Failure,
    Retrying,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "QUEUED",
            DeliveryStatus::Sending => "SENDING",
            DeliveryStatus::Success => "SUCCESS",
            DeliveryStatus::Failure => "FAILURE",
            DeliveryStatus::Retrying => "RETRYING",
        }
    }
}

/// Client-side handle for one outbound message.
#[derive(Debug)]
pub struct MessageReceipt {
    client_id: String,
    status: Mutex<DeliveryStatus>,
    abort: AtomicBool,
}

impl MessageReceipt {
    fn new(client_id: String) -> Self {
        Self {
            client_id,
            status: Mutex::new(DeliveryStatus::Queued),
            abort: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn status(&self) -> DeliveryStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Asks the dispatcher to drop this message instead of (re)sending
    /// it. Advisory: a message already on the wire is allowed to finish.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Applies a status transition. Terminal states are never left;
    /// returns whether the transition took effect.
    fn transition(&self, status: DeliveryStatus) -> bool {
        let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_terminal() || *current == status {
            return false;
        }
        *current = status;
        true
    }
}

/// Status-change callback. Invoked on a dedicated task, never inline
/// with the state mutation, so it may safely call back into the
/// dispatcher.
pub trait ReceiptListener: Send + 'static {
    fn on_status_change(&self, receipt: &MessageReceipt, status: DeliveryStatus);
}

impl<F> ReceiptListener for F
where
    F: Fn(&MessageReceipt, DeliveryStatus) + Send + 'static,
{
    fn on_status_change(&self, receipt: &MessageReceipt, status: DeliveryStatus) {
        self(receipt, status)
    }
}

type Event = (Arc<MessageReceipt>, DeliveryStatus);

/// clientId -> receipt table plus the optional notification channel.
/// The table only tracks in-flight messages: a receipt is evicted when
/// it reaches a terminal state, so the table is bounded by the queue
/// capacity. Callers keep observing the receipt through their own
/// [`Arc`].
pub(crate) struct ReceiptStore {
    receipts: Mutex<HashMap<String, Arc<MessageReceipt>>>,
    notifier: Mutex<Option<mpsc::Sender<Event>>>,
}

impl ReceiptStore {
    pub fn new() -> Self {
        Self {
            receipts: Mutex::new(HashMap::new()),
            notifier: Mutex::new(None),
        }
    }

    pub fn insert(&self, client_id: &str) -> Arc<MessageReceipt> {
        let receipt = Arc::new(MessageReceipt::new(client_id.to_string()));
        self.receipts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(client_id.to_string(), Arc::clone(&receipt));
        receipt
    }

    pub fn remove(&self, client_id: &str) {
        self.receipts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_id);
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<MessageReceipt>> {
        self.receipts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(client_id)
            .cloned()
    }

    /// Installs the listener, replacing any previous one. Deliveries are
    /// funneled through a one-slot channel: the next status change blocks
    /// until the previous callback has returned.
    pub fn set_listener(&self, listener: impl ReceiptListener) {
        let (tx, mut rx) = mpsc::channel::<Event>(1);
        *self.notifier.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        tokio::spawn(async move {
            while let Some((receipt, status)) = rx.recv().await {
                listener.on_status_change(&receipt, status);
            }
        });
    }

    /// Applies a transition and, if it took effect, delivers it to the
    /// listener. Waits for a free notification slot, never mutates and
    /// notifies under the same lock.
    pub async fn update(&self, receipt: &Arc<MessageReceipt>, status: DeliveryStatus) -> bool {
        if !receipt.transition(status) {
            return false;
        }
        debug!(client_id = %receipt.client_id(), status = status.as_str(), "receipt updated");

        let sender = self
            .notifier
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(sender) = sender {
            // a closed channel just means the listener task is gone
            let _ = sender.send((Arc::clone(receipt), status)).await;
        }
        if status.is_terminal() {
            self.remove(receipt.client_id());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn terminal_states_are_never_left() {
        let store = ReceiptStore::new();
        let receipt = store.insert("m-1");
        assert_eq!(receipt.status(), DeliveryStatus::Queued);

        assert!(store.update(&receipt, DeliveryStatus::Sending).await);
        assert!(store.update(&receipt, DeliveryStatus::Success).await);

        assert!(!store.update(&receipt, DeliveryStatus::Retrying).await);
        assert!(!store.update(&receipt, DeliveryStatus::Failure).await);
        assert_eq!(receipt.status(), DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn listener_sees_transitions_in_order() {
        let store = ReceiptStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.set_listener(move |receipt: &MessageReceipt, status: DeliveryStatus| {
            let _ = tx.send((receipt.client_id().to_string(), status));
        });

        let receipt = store.insert("m-1");
        store.update(&receipt, DeliveryStatus::Sending).await;
        store.update(&receipt, DeliveryStatus::Retrying).await;
        store.update(&receipt, DeliveryStatus::Queued).await;
        store.update(&receipt, DeliveryStatus::Sending).await;
        store.update(&receipt, DeliveryStatus::Success).await;

        let mut seen = Vec::new();
        for _ in 0..5 {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("listener delivery timed out")
                .unwrap();
            seen.push(event.1);
        }
        assert_eq!(
            seen,
            vec![
                DeliveryStatus::Sending,
                DeliveryStatus::Retrying,
                DeliveryStatus::Queued,
                DeliveryStatus::Sending,
                DeliveryStatus::Success,
            ]
        );
        assert_eq!(receipt.status(), DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn terminal_receipts_are_evicted_from_the_table() {
        let store = ReceiptStore::new();
        let receipt = store.insert("m-1");

        store.update(&receipt, DeliveryStatus::Sending).await;
        assert!(store.get("m-1").is_some());

        store.update(&receipt, DeliveryStatus::Success).await;
        assert!(store.get("m-1").is_none());
        // the caller's handle still reports the final status
        assert_eq!(receipt.status(), DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn abort_flag_is_sticky() {
        let store = ReceiptStore::new();
        let receipt = store.insert("m-1");
        assert!(!receipt.abort_requested());
        receipt.request_abort();
        assert!(receipt.abort_requested());
    }

    #[tokio::test]
    async fn unchanged_status_does_not_notify() {
        let store = ReceiptStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.set_listener(move |_: &MessageReceipt, status: DeliveryStatus| {
            let _ = tx.send(status);
        });

        let receipt = store.insert("m-1");
        // already QUEUED
        assert!(!store.update(&receipt, DeliveryStatus::Queued).await);
        assert!(store.update(&receipt, DeliveryStatus::Sending).await);

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(DeliveryStatus::Sending));
    }
}
