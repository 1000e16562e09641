use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Domain events emitted by the stock ledger after a transaction commits.
///
/// Events are strictly post-commit notifications: the ledger's own state
/// never depends on them, and a delivery failure is logged rather than
/// surfaced to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    StockReceived {
        product_id: Uuid,
        batch_id: Uuid,
        quantity: i32,
    },
    StockTransferred {
        product_id: Uuid,
        quantity: i32,
        from_location: String,
        to_location: String,
        batches_touched: usize,
    },
    StockSold {
        product_id: Uuid,
        quantity: i32,
        batches_touched: usize,
        reference: Option<String>,
    },
    StockAdjusted {
        product_id: Uuid,
        batch_id: Uuid,
        reason: String,
    },
    BatchReversed {
        product_id: Uuid,
        batch_id: Uuid,
        quantity_zeroed: i32,
    },
    BatchExpired {
        product_id: Uuid,
        batch_id: Uuid,
        quantity_written_off: i32,
        expired_on: Option<chrono::NaiveDate>,
    },
    LowStock {
        product_id: Uuid,
        stock_total: i32,
        threshold: i32,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), ServiceError> {
        self.sender
            .send(event)
            .await
            .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))
    }

    /// Sends an event and logs a warning on failure instead of returning it.
    /// Used after commit, where the ledger operation has already succeeded.
    pub async fn send_logged(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Dropped post-commit event: {}", e);
        }
    }
}

/// Processes incoming events. External integrations (reporting, alerting,
/// export tooling) hang off this loop; the ledger itself only logs.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::LowStock {
                product_id,
                stock_total,
                threshold,
                ..
            } => {
                warn!(
                    product_id = %product_id,
                    stock_total,
                    threshold,
                    "Product at or below low-stock threshold"
                );
            }
            Event::BatchExpired {
                product_id,
                batch_id,
                quantity_written_off,
                ..
            } => {
                warn!(
                    product_id = %product_id,
                    batch_id = %batch_id,
                    quantity_written_off,
                    "Batch written off as expired"
                );
            }
            other => {
                info!("Ledger event: {:?}", other);
            }
        }
    }

    error!("Event processing loop terminated: channel closed");
}
