//! Fan-out of server messages with per-recipient results.
//!
//! A failed or skipped recipient never aborts delivery to the rest.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::identity::ClientId;
use crate::domain::messages::ServerMsg;

use super::ports::ClientConnection;

/// One addressable client at the moment a broadcast started.
#[derive(Clone)]
pub struct Recipient {
    pub id: ClientId,
    pub connection: Arc<dyn ClientConnection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum Delivery {
    Sent,
    /// Connection was already closed; nothing was attempted.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastReport {
    pub deliveries: Vec<(ClientId, Delivery)>,
}

impl BroadcastReport {
    pub fn sent_count(&self) -> usize {
        self.count(|d| matches!(d, Delivery::Sent))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|d| matches!(d, Delivery::Skipped))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|d| matches!(d, Delivery::Failed(_)))
    }

    pub fn delivery_for(&self, id: &ClientId) -> Option<&Delivery> {
        self.deliveries
            .iter()
            .find(|(client, _)| client == id)
            .map(|(_, d)| d)
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    fn count(&self, pred: impl Fn(&Delivery) -> bool) -> usize {
        self.deliveries.iter().filter(|(_, d)| pred(d)).count()
    }
}

/// Send `msg` to a single recipient, absorbing transport failures.
pub async fn send_to(recipient: &Recipient, msg: &ServerMsg) -> Delivery {
    if !recipient.connection.is_open() {
        debug!(client_id = %recipient.id, kind = msg.kind(), "Skipping closed connection");
        return Delivery::Skipped;
    }
    match recipient.connection.send(msg).await {
        Ok(()) => Delivery::Sent,
        Err(e) => {
            warn!(client_id = %recipient.id, kind = msg.kind(), "Failed to send message: {e}");
            Delivery::Failed(e.to_string())
        }
    }
}

/// Send the same `msg` to every recipient.
pub async fn broadcast(recipients: &[Recipient], msg: &ServerMsg) -> BroadcastReport {
    let mut report = BroadcastReport {
        deliveries: Vec::with_capacity(recipients.len()),
    };
    for recipient in recipients {
        let delivery = send_to(recipient, msg).await;
        report.deliveries.push((recipient.id.clone(), delivery));
    }
    debug!(
        kind = msg.kind(),
        sent = report.sent_count(),
        skipped = report.skipped_count(),
        failed = report.failed_count(),
        "Broadcast complete"
    );
    report
}
