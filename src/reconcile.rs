use crate::error::{ApiError, ApiResult};
use crate::gateway::NormalizedStatus;
use crate::models::{PaymentStatus, TicketStatus};
use crate::notify::Notification;
use crate::state::AppState;
use chrono::{DateTime, Utc};
use sqlx::Row;

/// Which channel delivered a gateway status. Purely informational: the
/// reconciler behaves identically for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    Webhook,
    Poll,
}

impl StatusSource {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusSource::Webhook => "webhook",
            StatusSource::Poll => "poll",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// The gateway reported the payment as failed.
    Gateway,
    /// A competing ticket completed first and took the seat.
    SeatLost,
    /// The bus had no seats left when the commit was attempted.
    SeatExhausted,
}

impl FailReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailReason::Gateway => "gateway",
            FailReason::SeatLost => "seat_lost",
            FailReason::SeatExhausted => "seat_exhausted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "gateway" => Some(FailReason::Gateway),
            "seat_lost" => Some(FailReason::SeatLost),
            "seat_exhausted" => Some(FailReason::SeatExhausted),
            _ => None,
        }
    }
}

/// What a reconciliation call reports back to whichever channel invoked it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(FailReason),
    Cancelled,
    StillPending,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::StillPending)
    }
}

/// Terminal write the reconciler decided to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub payment: PaymentStatus,
    pub ticket: TicketStatus,
    pub fail_reason: Option<FailReason>,
    pub commit_seat: bool,
    pub notify: bool,
}

/// Decision produced by [`plan`] before any write happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// The payment is already terminal: report the stored outcome, touch
    /// nothing. This is what makes duplicate webhook+poll delivery safe.
    NoChange(Outcome),
    /// The incoming status carries no new information.
    StillPending,
    Settle(Settlement),
}

/// Outcome recorded for a payment that is already terminal.
pub fn stored_outcome(status: PaymentStatus, fail_reason: Option<FailReason>) -> Outcome {
    match status {
        PaymentStatus::Completed => Outcome::Completed,
        PaymentStatus::Cancelled => Outcome::Cancelled,
        PaymentStatus::Failed => Outcome::Failed(fail_reason.unwrap_or(FailReason::Gateway)),
        PaymentStatus::Pending => Outcome::StillPending,
    }
}

/// Pure transition planner for the payment+ticket pair. The caller is
/// responsible for evaluating it under the per-payment exclusivity guard and
/// for applying the returned settlement atomically.
pub fn plan(
    current: PaymentStatus,
    stored_fail: Option<FailReason>,
    incoming: NormalizedStatus,
    seat_free: bool,
) -> Plan {
    if current.is_terminal() {
        return Plan::NoChange(stored_outcome(current, stored_fail));
    }
    match incoming {
        NormalizedStatus::Pending | NormalizedStatus::Sent | NormalizedStatus::TransientError => {
            Plan::StillPending
        }
        NormalizedStatus::Paid => {
            if seat_free {
                Plan::Settle(Settlement {
                    payment: PaymentStatus::Completed,
                    ticket: TicketStatus::Completed,
                    fail_reason: None,
                    commit_seat: true,
                    notify: true,
                })
            } else {
                Plan::Settle(Settlement {
                    payment: PaymentStatus::Failed,
                    ticket: TicketStatus::Failed,
                    fail_reason: Some(FailReason::SeatLost),
                    commit_seat: false,
                    notify: false,
                })
            }
        }
        NormalizedStatus::Cancelled => Plan::Settle(Settlement {
            payment: PaymentStatus::Cancelled,
            ticket: TicketStatus::Cancelled,
            fail_reason: None,
            commit_seat: false,
            notify: false,
        }),
        NormalizedStatus::Failed => Plan::Settle(Settlement {
            payment: PaymentStatus::Failed,
            ticket: TicketStatus::Failed,
            fail_reason: Some(FailReason::Gateway),
            commit_seat: false,
            notify: false,
        }),
    }
}

struct LockedTicket {
    id: String,
    ticket_number: String,
    bus_id: String,
    seat_no: i32,
    passenger_name: String,
    passenger_email: String,
    amount_cents: i64,
}

/// Applies a normalized gateway status to the payment identified by
/// `reference`, idempotently, regardless of which channel delivered it.
///
/// Row locks are taken in a fixed order (payment, ticket, bus) so webhook and
/// poll deliveries for the same payment serialize instead of deadlocking. The
/// transaction covers exactly the status writes and the seat commit;
/// notifications are enqueued after it commits.
pub async fn apply_status(
    state: &AppState,
    reference: &str,
    incoming: NormalizedStatus,
    source: StatusSource,
) -> ApiResult<Outcome> {
    let payments = state.table("payments");
    let tickets = state.table("tickets");
    let buses = state.table("buses");

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin reconcile tx failed");
        ApiError::internal("database error")
    })?;

    let pay_row = sqlx::query(&format!(
        "SELECT id,ticket_id,method,status,fail_reason FROM {payments} WHERE reference=$1 FOR UPDATE"
    ))
    .bind(reference)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, reference, "db payment lock failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("payment not found"))?;

    let payment_id: String = pay_row.try_get("id").unwrap_or_default();
    let ticket_id: String = pay_row.try_get("ticket_id").unwrap_or_default();
    let method: String = pay_row.try_get("method").unwrap_or_default();
    let current = pay_row
        .try_get::<String, _>("status")
        .ok()
        .as_deref()
        .and_then(PaymentStatus::parse)
        .unwrap_or(PaymentStatus::Pending);
    let stored_fail = pay_row
        .try_get::<Option<String>, _>("fail_reason")
        .ok()
        .flatten()
        .as_deref()
        .and_then(FailReason::parse);

    if current.is_terminal() {
        return Ok(stored_outcome(current, stored_fail));
    }

    let t_row = sqlx::query(&format!(
        "SELECT id,ticket_number,bus_id,seat_no,passenger_name,passenger_email,amount_cents \
         FROM {tickets} WHERE id=$1 FOR UPDATE"
    ))
    .bind(&ticket_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, reference, "db ticket lock failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| {
        tracing::error!(reference, ticket_id = %ticket_id, "payment references missing ticket");
        ApiError::internal("ledger inconsistency")
    })?;
    let ticket = LockedTicket {
        id: t_row.try_get("id").unwrap_or_default(),
        ticket_number: t_row.try_get("ticket_number").unwrap_or_default(),
        bus_id: t_row.try_get("bus_id").unwrap_or_default(),
        seat_no: t_row.try_get("seat_no").unwrap_or(0),
        passenger_name: t_row.try_get("passenger_name").unwrap_or_default(),
        passenger_email: t_row.try_get("passenger_email").unwrap_or_default(),
        amount_cents: t_row.try_get("amount_cents").unwrap_or(0),
    };

    // The seat question only exists for a Paid delivery. Locking the bus row
    // first serializes concurrent completions racing for the same seat.
    let mut seat_free = true;
    let mut bus_route = String::new();
    let mut bus_departure: Option<DateTime<Utc>> = None;
    if incoming == NormalizedStatus::Paid {
        let bus_row = sqlx::query(&format!(
            "SELECT route,departure_at FROM {buses} WHERE id=$1 FOR UPDATE"
        ))
        .bind(&ticket.bus_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, reference, "db bus lock failed");
            ApiError::internal("database error")
        })?
        .ok_or_else(|| {
            tracing::error!(reference, bus_id = %ticket.bus_id, "ticket references missing bus");
            ApiError::internal("ledger inconsistency")
        })?;
        bus_route = bus_row.try_get("route").unwrap_or_default();
        bus_departure = bus_row
            .try_get::<Option<String>, _>("departure_at")
            .ok()
            .flatten()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let taken = sqlx::query(&format!(
            "SELECT 1 AS x FROM {tickets} WHERE bus_id=$1 AND seat_no=$2 AND status='completed' AND id != $3 LIMIT 1"
        ))
        .bind(&ticket.bus_id)
        .bind(ticket.seat_no)
        .bind(&ticket.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, reference, "db seat check failed");
            ApiError::internal("database error")
        })?;
        seat_free = taken.is_none();
    }

    let mut settlement = match plan(current, stored_fail, incoming, seat_free) {
        Plan::NoChange(outcome) => return Ok(outcome),
        Plan::StillPending => return Ok(Outcome::StillPending),
        Plan::Settle(s) => s,
    };

    if settlement.commit_seat {
        // Atomic compare-and-decrement: never read-modify-write.
        let committed = sqlx::query(&format!(
            "UPDATE {buses} SET seats_available=seats_available-1 WHERE id=$1 AND seats_available > 0"
        ))
        .bind(&ticket.bus_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, reference, "db seat commit failed");
            ApiError::internal("database error")
        })?;
        if committed.rows_affected() == 0 {
            tracing::warn!(reference, bus_id = %ticket.bus_id, "seat inventory exhausted at completion");
            settlement = Settlement {
                payment: PaymentStatus::Failed,
                ticket: TicketStatus::Failed,
                fail_reason: Some(FailReason::SeatExhausted),
                commit_seat: false,
                notify: false,
            };
        }
    }

    let now = Utc::now().to_rfc3339();
    sqlx::query(&format!(
        "UPDATE {payments} SET status=$1, fail_reason=$2, updated_at=$3 WHERE id=$4"
    ))
    .bind(settlement.payment.as_str())
    .bind(settlement.fail_reason.map(FailReason::as_str))
    .bind(&now)
    .bind(&payment_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, reference, "db payment settle failed");
        ApiError::internal("database error")
    })?;

    sqlx::query(&format!("UPDATE {tickets} SET status=$1 WHERE id=$2"))
        .bind(settlement.ticket.as_str())
        .bind(&ticket.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, reference, "db ticket settle failed");
            ApiError::internal("database error")
        })?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, reference, "db reconcile commit failed");
        ApiError::internal("database error")
    })?;

    let outcome = stored_outcome(settlement.payment, settlement.fail_reason);
    tracing::info!(
        reference,
        source = source.as_str(),
        status = settlement.payment.as_str(),
        reason = settlement.fail_reason.map(FailReason::as_str).unwrap_or(""),
        "payment reconciled"
    );

    if settlement.notify {
        state.notifier.enqueue(Notification::TicketConfirmation {
            ticket_number: ticket.ticket_number.clone(),
            passenger_name: ticket.passenger_name,
            passenger_email: ticket.passenger_email.clone(),
            route: bus_route,
            departure_at: bus_departure,
            seat_number: ticket.seat_no,
            amount_cents: ticket.amount_cents,
        });
        state.notifier.enqueue(Notification::PaymentConfirmation {
            reference: reference.to_string(),
            passenger_email: ticket.passenger_email,
            ticket_number: ticket.ticket_number,
            method,
            amount_cents: ticket.amount_cents,
        });
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERMEDIATE: [NormalizedStatus; 3] = [
        NormalizedStatus::Pending,
        NormalizedStatus::Sent,
        NormalizedStatus::TransientError,
    ];

    const ALL_INCOMING: [NormalizedStatus; 6] = [
        NormalizedStatus::Pending,
        NormalizedStatus::Sent,
        NormalizedStatus::Paid,
        NormalizedStatus::Cancelled,
        NormalizedStatus::Failed,
        NormalizedStatus::TransientError,
    ];

    #[test]
    fn terminal_payments_are_idempotent_for_every_incoming_status() {
        for incoming in ALL_INCOMING {
            for seat_free in [true, false] {
                assert_eq!(
                    plan(PaymentStatus::Completed, None, incoming, seat_free),
                    Plan::NoChange(Outcome::Completed)
                );
                assert_eq!(
                    plan(PaymentStatus::Cancelled, None, incoming, seat_free),
                    Plan::NoChange(Outcome::Cancelled)
                );
                assert_eq!(
                    plan(
                        PaymentStatus::Failed,
                        Some(FailReason::SeatLost),
                        incoming,
                        seat_free
                    ),
                    Plan::NoChange(Outcome::Failed(FailReason::SeatLost))
                );
            }
        }
    }

    #[test]
    fn failed_without_stored_reason_reports_gateway_failure() {
        assert_eq!(
            plan(PaymentStatus::Failed, None, NormalizedStatus::Paid, true),
            Plan::NoChange(Outcome::Failed(FailReason::Gateway))
        );
    }

    #[test]
    fn intermediate_statuses_leave_pending_payments_untouched() {
        for incoming in INTERMEDIATE {
            assert_eq!(
                plan(PaymentStatus::Pending, None, incoming, true),
                Plan::StillPending
            );
        }
    }

    #[test]
    fn paid_with_free_seat_settles_both_records_and_commits_the_seat() {
        let p = plan(PaymentStatus::Pending, None, NormalizedStatus::Paid, true);
        assert_eq!(
            p,
            Plan::Settle(Settlement {
                payment: PaymentStatus::Completed,
                ticket: TicketStatus::Completed,
                fail_reason: None,
                commit_seat: true,
                notify: true,
            })
        );
    }

    #[test]
    fn paid_with_taken_seat_fails_with_seat_lost_and_no_commit() {
        let p = plan(PaymentStatus::Pending, None, NormalizedStatus::Paid, false);
        assert_eq!(
            p,
            Plan::Settle(Settlement {
                payment: PaymentStatus::Failed,
                ticket: TicketStatus::Failed,
                fail_reason: Some(FailReason::SeatLost),
                commit_seat: false,
                notify: false,
            })
        );
    }

    #[test]
    fn cancelled_and_failed_settle_without_seat_or_notification() {
        let c = plan(PaymentStatus::Pending, None, NormalizedStatus::Cancelled, true);
        let Plan::Settle(c) = c else {
            panic!("expected settle, got {c:?}");
        };
        assert_eq!(c.payment, PaymentStatus::Cancelled);
        assert_eq!(c.ticket, TicketStatus::Cancelled);
        assert!(!c.commit_seat);
        assert!(!c.notify);

        let f = plan(PaymentStatus::Pending, None, NormalizedStatus::Failed, true);
        let Plan::Settle(f) = f else {
            panic!("expected settle, got {f:?}");
        };
        assert_eq!(f.payment, PaymentStatus::Failed);
        assert_eq!(f.fail_reason, Some(FailReason::Gateway));
    }

    #[test]
    fn stored_outcome_matches_recorded_state() {
        assert_eq!(
            stored_outcome(PaymentStatus::Completed, None),
            Outcome::Completed
        );
        assert_eq!(
            stored_outcome(PaymentStatus::Failed, Some(FailReason::SeatExhausted)),
            Outcome::Failed(FailReason::SeatExhausted)
        );
        assert_eq!(
            stored_outcome(PaymentStatus::Cancelled, None),
            Outcome::Cancelled
        );
        assert_eq!(
            stored_outcome(PaymentStatus::Pending, None),
            Outcome::StillPending
        );
    }

    #[test]
    fn fail_reasons_round_trip() {
        for r in [
            FailReason::Gateway,
            FailReason::SeatLost,
            FailReason::SeatExhausted,
        ] {
            assert_eq!(FailReason::parse(r.as_str()), Some(r));
        }
        assert_eq!(FailReason::parse("other"), None);
    }

    #[test]
    fn only_still_pending_is_non_terminal() {
        assert!(Outcome::Completed.is_terminal());
        assert!(Outcome::Cancelled.is_terminal());
        assert!(Outcome::Failed(FailReason::Gateway).is_terminal());
        assert!(!Outcome::StillPending.is_terminal());
    }
}
