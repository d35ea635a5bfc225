use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ticket lifecycle. A ticket is created `Pending` and only the reconciler
/// moves it to one of the three terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::Completed => "completed",
            TicketStatus::Failed => "failed",
            TicketStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(TicketStatus::Pending),
            "completed" => Some(TicketStatus::Completed),
            "failed" => Some(TicketStatus::Failed),
            "cancelled" | "canceled" => Some(TicketStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            "cancelled" | "canceled" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub status: &'static str,
    pub env: String,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize, Clone)]
pub struct BusOut {
    pub id: String,
    pub fleet_number: String,
    pub bus_type: Option<String>,
    pub route: String,
    pub departure_at: DateTime<Utc>,
    pub arrival_at: DateTime<Utc>,
    pub price_cents: i64,
    pub seats_total: i32,
    pub seats_available: i32,
}

#[derive(Debug, Deserialize)]
pub struct TicketIn {
    pub bus_id: String,
    pub seat_number: i32,
    pub passenger_name: String,
    pub passenger_email: String,
    pub passenger_phone: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct TicketOut {
    pub id: String,
    pub ticket_number: String,
    pub bus_id: String,
    pub user_id: String,
    pub seat_number: i32,
    pub passenger_name: String,
    pub passenger_email: String,
    pub passenger_phone: Option<String>,
    pub amount_cents: i64,
    pub status: String,
    pub payment_method: Option<String>,
    pub payment_reference: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct InitiateIn {
    pub ticket_id: String,
    pub phone_number: String,
    pub payment_method: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitiateOut {
    pub success: bool,
    pub message: String,
    pub reference: String,
    pub instructions: Option<String>,
    pub poll_url: Option<String>,
    pub payment_id: String,
    pub ticket_id: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentStatusOut {
    pub status: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<TicketOut>,
}

/// Gateway callback payload. The gateway posts form-encoded fields but some
/// integrations relay them as JSON, so both are accepted.
#[derive(Debug, Deserialize)]
pub struct WebhookIn {
    pub reference: Option<String>,
    pub status: Option<String>,
    pub pollurl: Option<String>,
    pub hash: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PaymentOut {
    pub id: String,
    pub reference: String,
    pub ticket_id: String,
    pub amount_cents: i64,
    pub method: String,
    pub status: String,
    pub fail_reason: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct BusSalesParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BusSalesRow {
    pub bus_id: String,
    pub fleet_number: String,
    pub route: String,
    pub tickets_sold: i64,
    pub revenue_cents: i64,
    pub profit_cents: i64,
}

#[derive(Debug, Deserialize)]
pub struct DailySummaryParams {
    pub date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DailySummaryOut {
    pub date: String,
    pub tickets_sold: i64,
    pub revenue_cents: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_round_trip_through_strings() {
        for s in [
            TicketStatus::Pending,
            TicketStatus::Completed,
            TicketStatus::Failed,
            TicketStatus::Cancelled,
        ] {
            assert_eq!(TicketStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            PaymentStatus::Pending,
            PaymentStatus::Completed,
            PaymentStatus::Failed,
            PaymentStatus::Cancelled,
        ] {
            assert_eq!(PaymentStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn parse_accepts_us_spelling_and_case() {
        assert_eq!(
            PaymentStatus::parse("Canceled"),
            Some(PaymentStatus::Cancelled)
        );
        assert_eq!(TicketStatus::parse(" COMPLETED "), Some(TicketStatus::Completed));
        assert_eq!(PaymentStatus::parse("refunded"), None);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Completed.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Cancelled.is_terminal());
    }
}
