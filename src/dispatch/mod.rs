//! Async dispatch engine: an outbound sender task draining the priority
//! queue in batches, an inbound task invoking registered handlers in
//! arrival order, and per-message delivery receipts.

mod queue;
mod receipt;

pub use queue::QueueError;
pub use receipt::{DeliveryStatus, MessageReceipt, ReceiptListener};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, instrument, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionError, ConnectionManager, MESSAGES_PATH};
use crate::message::{codec, Message, Payload};
use crate::resource::{RegistryError, RequestHandler, Resolved, Resource, ResourceRegistry};
use crate::types::EndpointId;
use crate::util::http::{Headers, StatusCode};

use queue::{OutboundQueue, QueueEntry};
use receipt::ReceiptStore;

/// Sends and receives messages on behalf of one endpoint. Workers start
/// on construction and stop when the dispatcher is closed or dropped.
pub struct MessageDispatcher {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

struct Shared {
    endpoint_id: EndpointId,
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    queue: Mutex<OutboundQueue>,
    receipts: ReceiptStore,
    registry: Mutex<ResourceRegistry>,
    wake: Notify,
    inbound_tx: mpsc::Sender<Message>,
    closed: AtomicBool,
}

impl MessageDispatcher {
    pub fn new(
        endpoint_id: EndpointId,
        config: ClientConfig,
        connection: Arc<ConnectionManager>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.server_message_history_capacity.max(1));

        let shared = Arc::new(Shared {
            queue: Mutex::new(OutboundQueue::new(
                config.max_messages_to_queue,
                config.max_retries,
            )),
            registry: Mutex::new(ResourceRegistry::new(endpoint_id.to_string())),
            receipts: ReceiptStore::new(),
            wake: Notify::new(),
            inbound_tx,
            closed: AtomicBool::new(false),
            endpoint_id,
            config,
            connection,
        });

        tokio::spawn(outbound_task(Arc::clone(&shared), shutdown_tx.subscribe()));
        tokio::spawn(inbound_task(
            Arc::clone(&shared),
            inbound_rx,
            shutdown_tx.subscribe(),
        ));

        Self {
            shared,
            shutdown_tx,
        }
    }

    /// Queues a message for delivery and returns its receipt. Fails fast
    /// on a full or closed queue, and for GUARANTEED_DELIVERY messages,
    /// which would require persistence the client does not provide.
    pub fn queue_message(&self, message: Message) -> Result<Arc<MessageReceipt>, QueueError> {
        self.shared.enqueue(message)
    }

    /// Receipt for a message still in flight. Delivered and failed
    /// messages are evicted; hold on to the receipt returned by
    /// [`queue_message`](Self::queue_message) to observe final states.
    pub fn receipt(&self, client_id: &str) -> Option<Arc<MessageReceipt>> {
        self.shared.receipts.get(client_id)
    }

    /// Installs the receipt status listener. Callbacks run on their own
    /// task; only one is in flight at a time.
    pub fn set_receipt_listener(&self, listener: impl ReceiptListener) {
        self.shared.receipts.set_listener(listener);
    }

    /// Binds a handler to a resource and notifies the service with an
    /// UPDATE resources report.
    pub fn register_handler(
        &self,
        resource: Resource,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), RegistryError> {
        let report = {
            let mut registry = self.shared.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.register(resource.clone(), handler)?;
            self.shared.update_report(&registry, resource)
        };
        self.shared.queue_report(report);
        Ok(())
    }

    /// Replaces the catch-all default handler. No server notification.
    pub fn register_default_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register_default(handler);
    }

    /// Unbinds the handler for `resource`'s path. When something was
    /// actually removed, the service is notified with a report carrying
    /// the resource as REMOVED.
    pub fn unregister(&self, resource: &Resource) {
        let report = {
            let mut registry = self.shared.registry.lock().unwrap_or_else(|e| e.into_inner());
            if !registry.unregister(resource) {
                return;
            }
            self.shared.update_report(
                &registry,
                Resource::removed(resource.name(), resource.path()),
            )
        };
        self.shared.queue_report(report);
    }

    /// Unbinds every resource served by `handler`, notifying the service
    /// once per removed resource.
    pub fn unregister_handler(&self, handler: &Arc<dyn RequestHandler>) {
        let reports: Vec<_> = {
            let mut registry = self.shared.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry
                .unregister_handler(handler)
                .into_iter()
                .map(|resource| {
                    self.shared.update_report(
                        &registry,
                        Resource::removed(resource.name(), resource.path()),
                    )
                })
                .collect()
        };
        for report in reports {
            self.shared.queue_report(report);
        }
    }

    /// Stops both workers. Everything still queued outbound fails
    /// immediately; an in-flight send is allowed to finish but is not
    /// retried; queued inbound requests are dropped.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .close();
        for entry in drained {
            if let Some(receipt) = self.shared.receipts.get(entry.message.client_id()) {
                self.shared
                    .receipts
                    .update(&receipt, DeliveryStatus::Failure)
                    .await;
            }
        }
        let _ = self.shutdown_tx.send(());
        debug!(endpoint_id = %self.shared.endpoint_id, "dispatcher closed");
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Shared {
    fn enqueue(&self, message: Message) -> Result<Arc<MessageReceipt>, QueueError> {
        // the receipt must exist before the worker can pick the entry up
        let receipt = self.receipts.insert(message.client_id());
        let enqueued = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .enqueue(message);
        if let Err(error) = enqueued {
            self.receipts.remove(receipt.client_id());
            return Err(error);
        }
        self.wake.notify_one();
        Ok(receipt)
    }

    fn update_report(&self, registry: &ResourceRegistry, resource: Resource) -> Option<Message> {
        Message::resources_report()
            .source(self.endpoint_id.to_string())
            .endpoint_name(registry.endpoint_name())
            .reconciliation_mark(registry.reconciliation_mark())
            .resource(resource)
            .build()
            .map_err(|error| warn!(%error, "failed to build resources report"))
            .ok()
    }

    fn queue_report(&self, report: Option<Message>) {
        if let Some(report) = report {
            if let Err(error) = self.enqueue(report) {
                warn!(%error, "dropping resources report");
            }
        }
    }
}

#[instrument(skip_all, fields(endpoint_id = %shared.endpoint_id))]
async fn outbound_task(shared: Arc<Shared>, mut shutdown_rx: broadcast::Receiver<()>) {
    let poll_interval = shared.config.polling_interval;
    let mut next_poll = tokio::time::Instant::now() + poll_interval;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep_until(next_poll) => {}
        }

        let batch = shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .select_batch(shared.config.max_messages_per_connection);

        if batch.is_empty() {
            // liveness contact so the service can deliver pending requests
            if !shared.closed.load(Ordering::SeqCst) {
                exchange(&shared, Vec::new()).await;
            }
        } else {
            exchange(&shared, batch).await;
            if !shared
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty()
            {
                shared.wake.notify_one();
            }
        }

        next_poll = tokio::time::Instant::now() + poll_interval;
    }
}

/// One POST to the messages endpoint: the batch (or an empty liveness
/// array), then receipt transitions and inbound delivery based on the
/// outcome.
async fn exchange(shared: &Arc<Shared>, batch: Vec<QueueEntry>) {
    // aborted entries drop out of the batch before anything is sent
    let mut sending = Vec::with_capacity(batch.len());
    for entry in batch {
        if let Some(receipt) = shared.receipts.get(entry.message.client_id()) {
            if receipt.abort_requested() {
                shared.receipts.update(&receipt, DeliveryStatus::Failure).await;
                continue;
            }
            shared.receipts.update(&receipt, DeliveryStatus::Sending).await;
            sending.push((entry, receipt));
        } else {
            // receipt is created on enqueue; its absence is unexpected
            warn!(client_id = entry.message.client_id(), "no receipt for queued message");
        }
    }

    let messages: Vec<Message> = sending.iter().map(|(e, _)| e.message.clone()).collect();
    let body = codec::batch_to_json(&messages).to_string();

    let mut headers = Headers::new();
    headers.insert("X-EndpointId".to_string(), shared.endpoint_id.to_string());
    headers.insert("Content-Type".to_string(), "application/json".to_string());

    match shared
        .connection
        .post(MESSAGES_PATH, body.into_bytes(), &headers)
        .await
    {
        Ok(response) if response.status == StatusCode::ACCEPTED => {
            for (_, receipt) in &sending {
                shared.receipts.update(receipt, DeliveryStatus::Success).await;
            }
            accept_inbound(shared, &response.body).await;
        }
        // a 401 here already survived the connection manager's one
        // renew-and-retry; retrying the batch cannot help
        Ok(response) if response.status == StatusCode::UNAUTHORIZED => {
            warn!("authorization rejected after token renewal, failing batch");
            fail_all(shared, sending).await;
        }
        Ok(response) => {
            warn!(status = %response.status, "messages endpoint rejected batch");
            fail_or_retry(shared, sending).await;
        }
        Err(ConnectionError::Token(error)) => {
            warn!(%error, "cannot authenticate message exchange, failing batch");
            fail_all(shared, sending).await;
        }
        Err(error) => {
            warn!(%error, "message exchange failed");
            fail_or_retry(shared, sending).await;
        }
    }
}

async fn fail_all(shared: &Arc<Shared>, sending: Vec<(QueueEntry, Arc<MessageReceipt>)>) {
    for (_, receipt) in sending {
        shared.receipts.update(&receipt, DeliveryStatus::Failure).await;
    }
}

async fn fail_or_retry(shared: &Arc<Shared>, sending: Vec<(QueueEntry, Arc<MessageReceipt>)>) {
    for (mut entry, receipt) in sending {
        // retries_left counts remaining attempts including the one that
        // just failed
        if receipt.abort_requested() || entry.retries_left <= 1 {
            shared.receipts.update(&receipt, DeliveryStatus::Failure).await;
            continue;
        }
        shared.receipts.update(&receipt, DeliveryStatus::Retrying).await;
        entry.retries_left -= 1;
        entry.retries_used += 1;

        let requeued = shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .requeue(entry);
        match requeued {
            Ok(()) => {
                shared.receipts.update(&receipt, DeliveryStatus::Queued).await;
                shared.wake.notify_one();
            }
            Err(error) => {
                warn!(%error, "requeue rejected");
                shared.receipts.update(&receipt, DeliveryStatus::Failure).await;
            }
        }
    }
}

/// Parses the response body of a successful exchange and hands each
/// inbound request to the handler worker. A full inbound queue answers
/// the request with 503 instead of dropping it silently.
async fn accept_inbound(shared: &Arc<Shared>, body: &[u8]) {
    if body.is_empty() {
        return;
    }
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(error) => {
            warn!(%error, "unparseable messages response body");
            return;
        }
    };
    let inbound = match codec::from_json_array(&value) {
        Ok(inbound) => inbound,
        Err(error) => {
            warn!(%error, "invalid inbound message");
            return;
        }
    };

    for message in inbound {
        match shared.inbound_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(
                    capacity = shared.config.server_message_history_capacity,
                    "inbound queue full, answering 503"
                );
                shared.queue_report(error_response(shared, &message, 503, "server busy"));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

#[instrument(skip_all, fields(endpoint_id = %shared.endpoint_id))]
async fn inbound_task(
    shared: Arc<Shared>,
    mut inbound_rx: mpsc::Receiver<Message>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            request = inbound_rx.recv() => match request {
                Some(request) => handle_inbound(&shared, request).await,
                None => break,
            }
        }
    }

    // anything still queued will never get a real answer
    while let Ok(request) = inbound_rx.try_recv() {
        warn!(
            client_id = request.client_id(),
            "dropping inbound request, resource gone"
        );
    }
}

/// Resolves and invokes the handler for one inbound request, strictly in
/// arrival order, and queues the response for sending.
async fn handle_inbound(shared: &Arc<Shared>, request: Message) {
    let Payload::Request { url, method, .. } = request.payload() else {
        warn!(
            client_id = request.client_id(),
            kind = request.payload().type_tag(),
            "ignoring non-request inbound message"
        );
        return;
    };

    let outcome = {
        let registry = shared.registry.lock().unwrap_or_else(|e| e.into_inner());
        match registry.resolve(url, method) {
            Resolved::Reconciliation => Ok(registry.reconciliation_body()),
            Resolved::Handler(handler) | Resolved::Default(handler) => Err(handler),
        }
    };

    let response = match outcome {
        Ok(body) => reconciliation_response(shared, &request, body),
        // handler runs outside the registry lock
        Err(handler) => match handler.handle(&request) {
            Ok(response) => Some(response),
            Err(error) => {
                warn!(%error, %url, "request handler failed");
                error_response(shared, &request, 500, &error.to_string())
            }
        },
    };

    if let Some(response) = response {
        if let Err(error) = shared.enqueue(response) {
            warn!(%error, "dropping response to inbound request");
        }
    }
}

fn reconciliation_response(
    shared: &Shared,
    request: &Message,
    body: serde_json::Value,
) -> Option<Message> {
    respond(shared, request, 202, body.to_string().into_bytes())
}

fn error_response(
    shared: &Shared,
    request: &Message,
    status_code: u16,
    body: &str,
) -> Option<Message> {
    respond(shared, request, status_code, body.as_bytes().to_vec())
}

fn respond(
    shared: &Shared,
    request: &Message,
    status_code: u16,
    body: Vec<u8>,
) -> Option<Message> {
    let url = match request.payload() {
        Payload::Request { url, .. } => url.clone(),
        _ => String::new(),
    };
    let source = if request.destination().is_empty() {
        shared.endpoint_id.to_string()
    } else {
        request.destination().to_string()
    };
    Message::response()
        .source(source)
        .destination(request.source())
        .status_code(status_code)
        .url(url)
        .request_id(request.id().unwrap_or(request.client_id()))
        .body(body)
        .build()
        .map_err(|error| warn!(%error, "failed to build response message"))
        .ok()
}
