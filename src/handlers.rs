use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::auth::require_user;
use crate::error::{ApiError, ApiResult};
use crate::gateway::{callback_hash, GatewayError, NormalizedStatus};
use crate::models::{
    BusOut, BusSalesParams, BusSalesRow, DailySummaryOut, DailySummaryParams, HealthOut,
    InitiateIn, InitiateOut, PaymentOut, PaymentStatus, PaymentStatusOut, TicketIn, TicketOut,
    WebhookIn,
};
use crate::poll::spawn_for_payment;
use crate::reconcile::{apply_status, stored_outcome, FailReason, Outcome, StatusSource};
use crate::state::AppState;
use subtle::ConstantTimeEq;

pub async fn health(State(state): State<AppState>) -> Json<HealthOut> {
    Json(HealthOut {
        status: "ok",
        env: state.env_name.clone(),
        service: "zupco-booking",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn row_dt(row: &PgRow, col: &str) -> Option<DateTime<Utc>> {
    row.try_get::<String, _>(col)
        .ok()
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_dt_opt(row: &PgRow, col: &str) -> Option<DateTime<Utc>> {
    row.try_get::<Option<String>, _>(col)
        .ok()
        .flatten()
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_bus(row: &PgRow) -> BusOut {
    BusOut {
        id: row.try_get("id").unwrap_or_default(),
        fleet_number: row.try_get("fleet_number").unwrap_or_default(),
        bus_type: row.try_get::<Option<String>, _>("bus_type").ok().flatten(),
        route: row.try_get("route").unwrap_or_default(),
        departure_at: row_dt(row, "departure_at").unwrap_or_default(),
        arrival_at: row_dt(row, "arrival_at").unwrap_or_default(),
        price_cents: row.try_get("price_cents").unwrap_or(0),
        seats_total: row.try_get("seats_total").unwrap_or(0),
        seats_available: row.try_get("seats_available").unwrap_or(0),
    }
}

fn row_to_ticket(row: &PgRow) -> TicketOut {
    TicketOut {
        id: row.try_get("id").unwrap_or_default(),
        ticket_number: row.try_get("ticket_number").unwrap_or_default(),
        bus_id: row.try_get("bus_id").unwrap_or_default(),
        user_id: row.try_get("user_id").unwrap_or_default(),
        seat_number: row.try_get("seat_no").unwrap_or(0),
        passenger_name: row.try_get("passenger_name").unwrap_or_default(),
        passenger_email: row.try_get("passenger_email").unwrap_or_default(),
        passenger_phone: row
            .try_get::<Option<String>, _>("passenger_phone")
            .ok()
            .flatten(),
        amount_cents: row.try_get("amount_cents").unwrap_or(0),
        status: row.try_get("status").unwrap_or_default(),
        payment_method: row
            .try_get::<Option<String>, _>("payment_method")
            .ok()
            .flatten(),
        payment_reference: row
            .try_get::<Option<String>, _>("payment_reference")
            .ok()
            .flatten(),
        created_at: row_dt_opt(row, "created_at").or_else(|| row_dt(row, "created_at")),
    }
}

const TICKET_COLS: &str = "id,ticket_number,bus_id,user_id,seat_no,passenger_name,passenger_email,\
     passenger_phone,amount_cents,status,payment_method,payment_reference,created_at";

// ---------- buses ----------

pub async fn list_buses(State(state): State<AppState>) -> ApiResult<Json<Vec<BusOut>>> {
    let buses = state.table("buses");
    let rows = sqlx::query(&format!(
        "SELECT id,fleet_number,bus_type,route,departure_at,arrival_at,price_cents,seats_total,seats_available \
         FROM {buses} ORDER BY departure_at ASC"
    ))
    .fetch_all(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db list buses failed");
        ApiError::internal("database error")
    })?;
    Ok(Json(rows.iter().map(row_to_bus).collect()))
}

pub async fn bus_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BusOut>> {
    let buses = state.table("buses");
    let row = sqlx::query(&format!(
        "SELECT id,fleet_number,bus_type,route,departure_at,arrival_at,price_cents,seats_total,seats_available \
         FROM {buses} WHERE id=$1"
    ))
    .bind(&id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db bus detail failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("bus not found"))?;
    Ok(Json(row_to_bus(&row)))
}

/// Seats that are actually sold. Seats on pending tickets are not reported:
/// a seat only leaves inventory once a payment completes.
pub async fn occupied_seats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<i32>>> {
    let buses = state.table("buses");
    let tickets = state.table("tickets");

    let exists = sqlx::query(&format!("SELECT 1 AS x FROM {buses} WHERE id=$1"))
        .bind(&id)
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db bus lookup failed");
            ApiError::internal("database error")
        })?;
    if exists.is_none() {
        return Err(ApiError::not_found("bus not found"));
    }

    let seats: Vec<i32> = sqlx::query_scalar(&format!(
        "SELECT seat_no FROM {tickets} WHERE bus_id=$1 AND status='completed' ORDER BY seat_no ASC"
    ))
    .bind(&id)
    .fetch_all(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db occupied seats failed");
        ApiError::internal("database error")
    })?;
    Ok(Json(seats))
}

// ---------- tickets ----------

pub async fn create_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TicketIn>,
) -> ApiResult<(StatusCode, Json<TicketOut>)> {
    let user_id = require_user(&state, &headers)?;

    let name = body.passenger_name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("passenger_name is required"));
    }
    let email = body.passenger_email.trim().to_lowercase();
    if !email.contains('@') || email.len() < 5 {
        return Err(ApiError::bad_request("passenger_email is invalid"));
    }
    if let Some(phone) = &body.passenger_phone {
        if !valid_zw_phone(phone) {
            return Err(ApiError::bad_request(
                "passenger_phone must be a Zimbabwean mobile number",
            ));
        }
    }

    let buses = state.table("buses");
    let tickets = state.table("tickets");

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin ticket tx failed");
        ApiError::internal("database error")
    })?;

    let bus = sqlx::query(&format!(
        "SELECT id,price_cents,seats_total,seats_available FROM {buses} WHERE id=$1 FOR UPDATE"
    ))
    .bind(&body.bus_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db bus lock failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("bus not found"))?;

    let price_cents: i64 = bus.try_get("price_cents").unwrap_or(0);
    let seats_total: i32 = bus.try_get("seats_total").unwrap_or(0);
    let seats_available: i32 = bus.try_get("seats_available").unwrap_or(0);

    if seats_available <= 0 {
        return Err(ApiError::conflict("bus is sold out"));
    }
    if body.seat_number < 1 || body.seat_number > seats_total {
        return Err(ApiError::bad_request(format!(
            "seat_number must be between 1 and {seats_total}"
        )));
    }

    let sold = sqlx::query(&format!(
        "SELECT 1 AS x FROM {tickets} WHERE bus_id=$1 AND seat_no=$2 AND status='completed' LIMIT 1"
    ))
    .bind(&body.bus_id)
    .bind(body.seat_number)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db seat check failed");
        ApiError::internal("database error")
    })?;
    if sold.is_some() {
        return Err(ApiError::conflict("seat is already taken"));
    }

    let id = Uuid::new_v4().to_string();
    let ticket_number = generate_ticket_number();
    let now = Utc::now().to_rfc3339();
    let phone = body
        .passenger_phone
        .as_deref()
        .map(normalize_phone);

    sqlx::query(&format!(
        "INSERT INTO {tickets} \
         (id,ticket_number,bus_id,user_id,seat_no,passenger_name,passenger_email,passenger_phone,\
          amount_cents,status,created_at,updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,'pending',$10,$10)"
    ))
    .bind(&id)
    .bind(&ticket_number)
    .bind(&body.bus_id)
    .bind(&user_id)
    .bind(body.seat_number)
    .bind(name)
    .bind(&email)
    .bind(&phone)
    .bind(price_cents)
    .bind(&now)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db ticket insert failed");
        ApiError::internal("database error")
    })?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db ticket commit failed");
        ApiError::internal("database error")
    })?;

    tracing::info!(ticket_number = %ticket_number, bus_id = %body.bus_id, seat = body.seat_number, "ticket created");

    Ok((
        StatusCode::CREATED,
        Json(TicketOut {
            id,
            ticket_number,
            bus_id: body.bus_id,
            user_id,
            seat_number: body.seat_number,
            passenger_name: name.to_string(),
            passenger_email: email,
            passenger_phone: phone,
            amount_cents: price_cents,
            status: "pending".to_string(),
            payment_method: None,
            payment_reference: None,
            created_at: DateTime::parse_from_rfc3339(&now)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }),
    ))
}

pub async fn list_user_tickets(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<TicketOut>>> {
    let user_id = require_user(&state, &headers)?;
    let tickets = state.table("tickets");
    let rows = sqlx::query(&format!(
        "SELECT {TICKET_COLS} FROM {tickets} WHERE user_id=$1 ORDER BY created_at DESC LIMIT 100"
    ))
    .bind(&user_id)
    .fetch_all(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db list tickets failed");
        ApiError::internal("database error")
    })?;
    Ok(Json(rows.iter().map(row_to_ticket).collect()))
}

pub async fn ticket_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<TicketOut>> {
    let user_id = require_user(&state, &headers)?;
    let tickets = state.table("tickets");
    let row = sqlx::query(&format!(
        "SELECT {TICKET_COLS} FROM {tickets} WHERE id=$1 AND user_id=$2"
    ))
    .bind(&id)
    .bind(&user_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db ticket detail failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("ticket not found"))?;
    Ok(Json(row_to_ticket(&row)))
}

// ---------- payments ----------

/// Whether a ticket may take a fresh payment attempt. A completed ticket was
/// already paid for; failed and cancelled tickets stay payable with a new
/// payment record, and at most one non-terminal payment may exist at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitiationGate {
    Allowed,
    AlreadyPaid,
    PaymentInProgress,
}

fn initiation_gate(ticket_status: &str, open_payment_exists: bool) -> InitiationGate {
    if ticket_status == "completed" {
        return InitiationGate::AlreadyPaid;
    }
    if open_payment_exists {
        return InitiationGate::PaymentInProgress;
    }
    InitiationGate::Allowed
}

pub async fn initiate_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<InitiateIn>,
) -> ApiResult<Json<InitiateOut>> {
    let user_id = require_user(&state, &headers)?;

    if !valid_zw_phone(&body.phone_number) {
        return Err(ApiError::bad_request(
            "phone_number must be a Zimbabwean mobile number",
        ));
    }
    let phone = normalize_phone(&body.phone_number);
    let method = body
        .payment_method
        .as_deref()
        .unwrap_or("ecocash")
        .trim()
        .to_lowercase();
    if !matches!(method.as_str(), "ecocash" | "onemoney") {
        return Err(ApiError::bad_request(
            "payment_method must be ecocash or onemoney",
        ));
    }

    let tickets = state.table("tickets");
    let payments = state.table("payments");

    let ticket = sqlx::query(&format!(
        "SELECT {TICKET_COLS} FROM {tickets} WHERE id=$1 AND user_id=$2"
    ))
    .bind(&body.ticket_id)
    .bind(&user_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db ticket lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("ticket not found"))?;

    let ticket_status: String = ticket.try_get("status").unwrap_or_default();
    let open = sqlx::query(&format!(
        "SELECT 1 AS x FROM {payments} WHERE ticket_id=$1 AND status='pending' LIMIT 1"
    ))
    .bind(&body.ticket_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db open payment check failed");
        ApiError::internal("database error")
    })?;

    match initiation_gate(&ticket_status, open.is_some()) {
        InitiationGate::Allowed => {}
        InitiationGate::AlreadyPaid => {
            return Err(ApiError::conflict("ticket is already paid"))
        }
        InitiationGate::PaymentInProgress => {
            return Err(ApiError::conflict(
                "a payment for this ticket is already in progress",
            ))
        }
    }

    let ticket_number: String = ticket.try_get("ticket_number").unwrap_or_default();
    let passenger_email: String = ticket.try_get("passenger_email").unwrap_or_default();
    let amount_cents: i64 = ticket.try_get("amount_cents").unwrap_or(0);

    let reference = generate_payment_reference();
    let description = format!("Bus ticket {ticket_number}");

    // No DB locks are held across the gateway round trip.
    let handle = state
        .gateway
        .create_payment(&reference, &passenger_email, amount_cents, &description)
        .map_err(|e| match e {
            GatewayError::InvalidAmount => ApiError::bad_request("ticket amount is invalid"),
            other => {
                tracing::error!(error = %other, reference = %reference, "gateway create failed");
                ApiError::upstream("payment gateway error")
            }
        })?;
    let prompt = state
        .gateway
        .send_mobile_prompt(&handle, &phone, &method)
        .await
        .map_err(|e| match e {
            GatewayError::Rejected(msg) => {
                tracing::warn!(reference = %reference, reason = %msg, "gateway rejected prompt");
                ApiError::upstream("payment gateway rejected the request")
            }
            other => {
                tracing::error!(error = %other, reference = %reference, "gateway prompt failed");
                ApiError::upstream("payment gateway unreachable")
            }
        })?;

    let payment_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let trace: String = prompt.raw.chars().take(2048).collect();

    sqlx::query(&format!(
        "INSERT INTO {payments} \
         (id,ticket_id,user_id,reference,phone,method,amount_cents,status,poll_url,gateway_trace,created_at,updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,'pending',$8,$9,$10,$10)"
    ))
    .bind(&payment_id)
    .bind(&body.ticket_id)
    .bind(&user_id)
    .bind(&reference)
    .bind(&phone)
    .bind(&method)
    .bind(amount_cents)
    .bind(&prompt.poll_url)
    .bind(&trace)
    .bind(&now)
    .execute(&state.pool)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.constraint() == Some("idx_payments_ticket_open") => {
            ApiError::conflict("a payment for this ticket is already in progress")
        }
        _ => {
            tracing::error!(error = %e, reference = %reference, "db payment insert failed");
            ApiError::internal("database error")
        }
    })?;

    sqlx::query(&format!(
        "UPDATE {tickets} SET payment_method=$1, payment_reference=$2, updated_at=$3 WHERE id=$4"
    ))
    .bind(&method)
    .bind(&reference)
    .bind(&now)
    .bind(&body.ticket_id)
    .execute(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, reference = %reference, "db ticket reference update failed");
        ApiError::internal("database error")
    })?;

    tracing::info!(reference = %reference, ticket_id = %body.ticket_id, method = %method, "payment initiated");
    spawn_for_payment(state.clone(), reference.clone(), prompt.poll_url.clone());

    Ok(Json(InitiateOut {
        success: true,
        message: "Payment initiated, confirm the prompt on your phone".to_string(),
        reference,
        instructions: prompt.instructions,
        poll_url: Some(prompt.poll_url),
        payment_id,
        ticket_id: body.ticket_id,
    }))
}

fn status_view(outcome: Outcome) -> (String, bool, String) {
    match outcome {
        Outcome::Completed => (
            "completed".to_string(),
            true,
            "Payment successful".to_string(),
        ),
        Outcome::Cancelled => (
            "cancelled".to_string(),
            false,
            "Payment cancelled".to_string(),
        ),
        Outcome::Failed(FailReason::Gateway) => {
            ("failed".to_string(), false, "Payment failed".to_string())
        }
        Outcome::Failed(_) => (
            "failed".to_string(),
            false,
            "Payment failed: seat no longer available".to_string(),
        ),
        Outcome::StillPending => (
            "pending".to_string(),
            false,
            "Payment still pending".to_string(),
        ),
    }
}

/// Status is keyed by the opaque payment reference alone; no re-auth. The
/// reference is unguessable and holding it proves the caller initiated the
/// payment.
pub async fn payment_status(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> ApiResult<Json<PaymentStatusOut>> {
    let payments = state.table("payments");
    let tickets = state.table("tickets");

    let row = sqlx::query(&format!(
        "SELECT ticket_id,status,fail_reason,poll_url FROM {payments} WHERE reference=$1"
    ))
    .bind(&reference)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db payment lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("payment not found"))?;

    let ticket_id: String = row.try_get("ticket_id").unwrap_or_default();
    let stored = row
        .try_get::<String, _>("status")
        .ok()
        .as_deref()
        .and_then(PaymentStatus::parse)
        .unwrap_or(PaymentStatus::Pending);
    let stored_fail = row
        .try_get::<Option<String>, _>("fail_reason")
        .ok()
        .flatten()
        .as_deref()
        .and_then(FailReason::parse);
    let poll_url = row
        .try_get::<Option<String>, _>("poll_url")
        .ok()
        .flatten();

    let outcome = if stored.is_terminal() {
        stored_outcome(stored, stored_fail)
    } else if let Some(url) = poll_url {
        // One on-demand poll so the caller sees fresh state even if the
        // background supervisor has not caught up yet.
        let polled = state.gateway.poll_status(&url).await;
        if polled == NormalizedStatus::TransientError {
            return Ok(Json(PaymentStatusOut {
                status: "pending".to_string(),
                success: false,
                message: "Unable to check payment status, please try again later".to_string(),
                ticket: None,
            }));
        }
        apply_status(&state, &reference, polled, StatusSource::Poll).await?
    } else {
        Outcome::StillPending
    };

    let (status, success, message) = status_view(outcome);
    let ticket = if outcome == Outcome::Completed {
        sqlx::query(&format!("SELECT {TICKET_COLS} FROM {tickets} WHERE id=$1"))
            .bind(&ticket_id)
            .fetch_optional(&state.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "db ticket fetch failed");
                ApiError::internal("database error")
            })?
            .map(|r| row_to_ticket(&r))
    } else {
        None
    };

    Ok(Json(PaymentStatusOut {
        status,
        success,
        message,
        ticket,
    }))
}

fn parse_webhook_body(body: &str) -> Option<WebhookIn> {
    serde_urlencoded::from_str::<WebhookIn>(body)
        .ok()
        .filter(|w| w.reference.is_some())
        .or_else(|| serde_json::from_str::<WebhookIn>(body).ok())
}

/// Checks the callback signature over the raw form body. The gateway hashes
/// every value it posts, in wire order, so verification has to work from the
/// ordered pair list rather than the parsed struct.
fn webhook_hash_valid(body: &str, integration_key: &str) -> bool {
    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(body.trim()) else {
        return false;
    };
    let provided = pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("hash"))
        .map(|(_, v)| v.trim().to_uppercase())
        .unwrap_or_default();
    if provided.is_empty() {
        return false;
    }
    let expected = callback_hash(&pairs, integration_key);
    expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1
}

/// Gateway callback. Always answers 200 with a plain body: the gateway
/// retries on anything else and every failure here is recoverable through
/// polling anyway.
pub async fn paynow_webhook(State(state): State<AppState>, body: String) -> (StatusCode, &'static str) {
    let Some(hook) = parse_webhook_body(&body) else {
        tracing::warn!("webhook body not parseable");
        return (StatusCode::OK, "OK");
    };
    let Some(reference) = hook.reference.filter(|r| !r.trim().is_empty()) else {
        tracing::warn!("webhook missing reference");
        return (StatusCode::OK, "OK");
    };
    let raw_status = hook.status.unwrap_or_default();

    if state.webhook_hash_required && !webhook_hash_valid(&body, &state.paynow_integration_key) {
        tracing::warn!(reference = %reference, "webhook hash mismatch");
        return (StatusCode::OK, "OK");
    }

    let incoming = NormalizedStatus::from_gateway(&raw_status);
    match apply_status(&state, &reference, incoming, StatusSource::Webhook).await {
        Ok(outcome) => {
            tracing::debug!(reference = %reference, outcome = ?outcome, "webhook applied");
        }
        Err(e) => {
            tracing::error!(reference = %reference, detail = %e.detail, "webhook apply failed");
        }
    }
    (StatusCode::OK, "OK")
}

pub async fn payment_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<PaymentOut>>> {
    let user_id = require_user(&state, &headers)?;
    let payments = state.table("payments");
    let rows = sqlx::query(&format!(
        "SELECT id,reference,ticket_id,amount_cents,method,status,fail_reason,created_at \
         FROM {payments} WHERE user_id=$1 ORDER BY created_at DESC LIMIT 50"
    ))
    .bind(&user_id)
    .fetch_all(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db payment history failed");
        ApiError::internal("database error")
    })?;

    let out = rows
        .iter()
        .map(|row| PaymentOut {
            id: row.try_get("id").unwrap_or_default(),
            reference: row.try_get("reference").unwrap_or_default(),
            ticket_id: row.try_get("ticket_id").unwrap_or_default(),
            amount_cents: row.try_get("amount_cents").unwrap_or(0),
            method: row.try_get("method").unwrap_or_default(),
            status: row.try_get("status").unwrap_or_default(),
            fail_reason: row
                .try_get::<Option<String>, _>("fail_reason")
                .ok()
                .flatten(),
            created_at: row_dt(row, "created_at"),
        })
        .collect();
    Ok(Json(out))
}

// ---------- reports ----------

/// Operator margin after route costs, fixed at 70% of ticket revenue.
fn profit_share_cents(revenue_cents: i64) -> i64 {
    revenue_cents * 70 / 100
}

fn valid_date(raw: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());
    re.is_match(raw)
}

pub async fn report_bus_sales(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<BusSalesParams>,
) -> ApiResult<Json<Vec<BusSalesRow>>> {
    require_user(&state, &headers)?;

    let start = params.start_date.unwrap_or_else(|| "0000-01-01".to_string());
    let end = params.end_date.unwrap_or_else(|| "9999-12-31".to_string());
    if !valid_date(&start) || !valid_date(&end) {
        return Err(ApiError::bad_request("dates must be YYYY-MM-DD"));
    }

    let buses = state.table("buses");
    let tickets = state.table("tickets");
    let rows = sqlx::query(&format!(
        "SELECT b.id AS bus_id, b.fleet_number, b.route, \
         COUNT(t.id) AS tickets_sold, COALESCE(SUM(t.amount_cents),0)::BIGINT AS revenue_cents \
         FROM {buses} b JOIN {tickets} t ON t.bus_id = b.id \
         WHERE t.status='completed' AND LEFT(t.created_at,10) >= $1 AND LEFT(t.created_at,10) <= $2 \
         GROUP BY b.id, b.fleet_number, b.route \
         ORDER BY revenue_cents DESC"
    ))
    .bind(&start)
    .bind(&end)
    .fetch_all(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db bus sales report failed");
        ApiError::internal("database error")
    })?;

    let out = rows
        .iter()
        .map(|row| {
            let revenue_cents: i64 = row.try_get("revenue_cents").unwrap_or(0);
            BusSalesRow {
                bus_id: row.try_get("bus_id").unwrap_or_default(),
                fleet_number: row.try_get("fleet_number").unwrap_or_default(),
                route: row.try_get("route").unwrap_or_default(),
                tickets_sold: row.try_get("tickets_sold").unwrap_or(0),
                revenue_cents,
                profit_cents: profit_share_cents(revenue_cents),
            }
        })
        .collect();
    Ok(Json(out))
}

pub async fn report_daily_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DailySummaryParams>,
) -> ApiResult<Json<DailySummaryOut>> {
    require_user(&state, &headers)?;

    let date = params
        .date
        .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
    if !valid_date(&date) {
        return Err(ApiError::bad_request("date must be YYYY-MM-DD"));
    }

    let tickets = state.table("tickets");
    let row = sqlx::query(&format!(
        "SELECT COUNT(id) AS tickets_sold, COALESCE(SUM(amount_cents),0)::BIGINT AS revenue_cents \
         FROM {tickets} WHERE status='completed' AND LEFT(created_at,10) = $1"
    ))
    .bind(&date)
    .fetch_one(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db daily summary failed");
        ApiError::internal("database error")
    })?;

    Ok(Json(DailySummaryOut {
        date,
        tickets_sold: row.try_get("tickets_sold").unwrap_or(0),
        revenue_cents: row.try_get("revenue_cents").unwrap_or(0),
    }))
}

// ---------- helpers ----------

/// Zimbabwean mobile numbers: +263 or local 0 prefix, network 77/78/71/73.
pub fn valid_zw_phone(raw: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(\+263|0)7[7813]\d{7}$").unwrap());
    re.is_match(raw.trim())
}

/// Local 0-prefixed numbers become international before they reach the
/// gateway.
pub fn normalize_phone(raw: &str) -> String {
    let raw = raw.trim();
    match raw.strip_prefix('0') {
        Some(rest) => format!("+263{rest}"),
        None => raw.to_string(),
    }
}

fn base36_millis() -> String {
    let mut n = Utc::now().timestamp_millis().max(0) as u64;
    if n == 0 {
        return "0".to_string();
    }
    let digits = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut out = Vec::new();
    while n > 0 {
        out.push(digits[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn random_suffix(len: usize) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

pub fn generate_ticket_number() -> String {
    format!("TKT-{}{}", base36_millis(), random_suffix(4))
}

pub fn generate_payment_reference() -> String {
    format!("PAY-{}{}", base36_millis(), random_suffix(6))
}
