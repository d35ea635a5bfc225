use crate::error::ApiResult;
use crate::gateway::{NormalizedStatus, PaymentGateway};
use crate::reconcile::{self, Outcome, StatusSource};
use crate::state::AppState;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Where a polled status is delivered. Production wires this to the
/// reconciler; tests substitute a deterministic in-memory ledger.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn apply(
        &self,
        reference: &str,
        status: NormalizedStatus,
        source: StatusSource,
    ) -> ApiResult<Outcome>;
}

/// Sink backed by the real reconciler.
pub struct ReconcilerSink {
    pub state: AppState,
}

#[async_trait]
impl StatusSink for ReconcilerSink {
    async fn apply(
        &self,
        reference: &str,
        status: NormalizedStatus,
        source: StatusSource,
    ) -> ApiResult<Outcome> {
        reconcile::apply_status(&self.state, reference, status, source).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorReport {
    Settled(Outcome),
    /// Attempt budget exhausted with the payment still pending. Deliberately
    /// not a failure: a late webhook may still complete the payment.
    Timeout,
}

/// Bounded client-side poll loop. Asks the gateway for status on a fixed
/// cadence and feeds every answer to the sink until a terminal outcome or the
/// attempt ceiling.
pub struct PollingSupervisor {
    gateway: Arc<dyn PaymentGateway>,
    sink: Arc<dyn StatusSink>,
    interval: Duration,
    max_attempts: u32,
}

impl PollingSupervisor {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        sink: Arc<dyn StatusSink>,
        interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            gateway,
            sink,
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn run(&self, reference: &str, poll_url: &str) -> SupervisorReport {
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.interval).await;

            let status = self.gateway.poll_status(poll_url).await;
            if status == NormalizedStatus::TransientError {
                // No new information; the attempt still counts against the
                // hard ceiling.
                tracing::debug!(reference, attempt, "transient poll error, retrying");
                continue;
            }

            match self.sink.apply(reference, status, StatusSource::Poll).await {
                Ok(outcome) if outcome.is_terminal() => {
                    tracing::info!(reference, attempt, "polling settled payment");
                    return SupervisorReport::Settled(outcome);
                }
                Ok(_) => {}
                Err(e) => {
                    // Ledger write failure: retried on the next attempt.
                    tracing::warn!(reference, attempt, error = %e.detail, "status apply failed");
                }
            }
        }
        tracing::info!(
            reference,
            attempts = self.max_attempts,
            "polling budget exhausted, payment left pending"
        );
        SupervisorReport::Timeout
    }
}

/// Detached supervisor for a freshly initiated payment. The HTTP caller gets
/// its response immediately; this loop keeps reconciling in the background
/// even if the client disappears.
pub fn spawn_for_payment(state: AppState, reference: String, poll_url: String) {
    let supervisor = PollingSupervisor::new(
        state.gateway.clone(),
        Arc::new(ReconcilerSink {
            state: state.clone(),
        }),
        state.poll_interval,
        state.poll_max_attempts,
    );
    tokio::spawn(async move {
        let report = supervisor.run(&reference, &poll_url).await;
        tracing::debug!(reference = %reference, report = ?report, "detached polling supervisor done");
    });
}
