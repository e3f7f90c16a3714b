use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::Outbox;
use crate::core::panic_message;
use crate::core::protocol::{AgentMessage, CoordinatorMessage, QueryRequest, codes};

/// Runs one admitted job and reports its outcome through the outbox.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, request: QueryRequest, outbox: Outbox);
}

/// Routes decoded coordinator frames. Jobs run on their own tasks behind a
/// fixed number of permits; everything else is answered inline.
pub struct Dispatcher {
    handler: Arc<dyn JobHandler>,
    gate: Arc<Semaphore>,
    capacity: usize,
    outbox: Outbox,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn JobHandler>, capacity: usize, outbox: Outbox) -> Self {
        let capacity = capacity.max(1);
        Self {
            handler,
            gate: Arc::new(Semaphore::new(capacity)),
            capacity,
            outbox,
        }
    }

    /// Jobs currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.gate.available_permits()
    }

    pub async fn dispatch(&self, frame: &str) {
        let message = match CoordinatorMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping coordinator frame: {}", e);
                return;
            }
        };

        match message {
            CoordinatorMessage::Registered(ack) => {
                if ack.is_ok() {
                    info!("Registered with coordinator");
                } else {
                    warn!(
                        "Coordinator rejected registration: status={} message={}",
                        ack.status,
                        ack.message.as_deref().unwrap_or("")
                    );
                }
            }
            CoordinatorMessage::QueryRequest(request) => self.admit(request),
            CoordinatorMessage::Ping => {
                if let Err(e) = self.outbox.send(&AgentMessage::Pong).await {
                    warn!("Failed to answer ping: {}", e);
                }
            }
            CoordinatorMessage::Pong => debug!("Pong from coordinator"),
            CoordinatorMessage::Unknown(kind) => debug!("Ignoring unknown message type '{}'", kind),
        }
    }

    fn admit(&self, request: QueryRequest) {
        let outbox = self.outbox.clone();
        let request_id = request.request_id.clone();

        let permit = match Arc::clone(&self.gate).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "[{}] Rejecting query, {} queries already running",
                    request_id, self.capacity
                );
                let message = format!(
                    "Agent is at capacity ({} concurrent queries)",
                    self.capacity
                );
                tokio::spawn(async move {
                    outbox
                        .send_error(Some(&request_id), codes::AGENT_BUSY, &message)
                        .await;
                });
                return;
            }
        };

        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            let _permit = permit;
            let job = AssertUnwindSafe(handler.handle(request, outbox.clone())).catch_unwind();
            if let Err(panic) = job.await {
                let reason = panic_message(panic.as_ref());
                error!("[{}] Query task panicked: {}", request_id, reason);
                outbox
                    .send_error(
                        Some(&request_id),
                        codes::EXECUTION_ERROR,
                        &format!("Query execution panicked: {reason}"),
                    )
                    .await;
            }
        });
    }
}
