use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Confirmation messages produced by the reconciler after a successful
/// settlement. Delivery is best-effort and fully decoupled from the
/// reconciliation transaction.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    TicketConfirmation {
        ticket_number: String,
        passenger_name: String,
        passenger_email: String,
        route: String,
        departure_at: Option<DateTime<Utc>>,
        seat_number: i32,
        amount_cents: i64,
    },
    PaymentConfirmation {
        reference: String,
        passenger_email: String,
        ticket_number: String,
        method: String,
        amount_cents: i64,
    },
}

impl Notification {
    fn kind(&self) -> &'static str {
        match self {
            Notification::TicketConfirmation { .. } => "ticket_confirmation",
            Notification::PaymentConfirmation { .. } => "payment_confirmation",
        }
    }
}

/// Sending half of the notification queue. `enqueue` never blocks and never
/// fails the caller: a full queue drops the message with a warning.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, notification: Notification) {
        if let Err(e) = self.tx.try_send(notification) {
            let dropped = match &e {
                mpsc::error::TrySendError::Full(n) => n.kind(),
                mpsc::error::TrySendError::Closed(n) => n.kind(),
            };
            tracing::warn!(kind = dropped, "notification dropped: {e}");
        }
    }
}

/// Drains the queue and posts each message to the notifier endpoint. One
/// retry, then the failure is logged for manual follow-up. Without a
/// configured endpoint, messages are logged and discarded.
pub fn spawn_worker(
    mut rx: mpsc::Receiver<Notification>,
    http: reqwest::Client,
    notify_url: Option<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            let Some(url) = notify_url.as_deref() else {
                tracing::info!(kind = notification.kind(), "notifier not configured, skipping dispatch");
                continue;
            };
            let mut delivered = false;
            for attempt in 1..=2u32 {
                match http.post(url).json(&notification).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        delivered = true;
                        break;
                    }
                    Ok(resp) => {
                        tracing::warn!(
                            kind = notification.kind(),
                            attempt,
                            status = %resp.status(),
                            "notifier rejected dispatch"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            kind = notification.kind(),
                            attempt,
                            error = %e,
                            "notifier dispatch failed"
                        );
                    }
                }
            }
            if !delivered {
                tracing::error!(
                    kind = notification.kind(),
                    "notification undeliverable, dropped after retry"
                );
            }
        }
    })
}
