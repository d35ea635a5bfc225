use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

fn table_name(schema: &Option<String>, name: &str) -> String {
    match schema {
        Some(s) => format!("{s}.{name}"),
        None => name.to_string(),
    }
}

pub async fn connect(db_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(db_url)
        .await
}

pub async fn ensure_schema(pool: &PgPool, db_schema: &Option<String>) -> Result<(), sqlx::Error> {
    if let Some(schema) = db_schema {
        let ddl = format!("CREATE SCHEMA IF NOT EXISTS {schema}");
        let _ = sqlx::query(&ddl).execute(pool).await;
    }

    let buses = table_name(db_schema, "buses");
    let tickets = table_name(db_schema, "tickets");
    let payments = table_name(db_schema, "payments");

    let ddls = [
        format!(
            "CREATE TABLE IF NOT EXISTS {buses} (\
             id VARCHAR(36) PRIMARY KEY,\
             fleet_number VARCHAR(32) NOT NULL UNIQUE,\
             bus_type VARCHAR(32),\
             route VARCHAR(160) NOT NULL,\
             departure_at TEXT NOT NULL,\
             arrival_at TEXT NOT NULL,\
             price_cents BIGINT NOT NULL,\
             seats_total INTEGER NOT NULL DEFAULT 60,\
             seats_available INTEGER NOT NULL DEFAULT 60,\
             created_at TEXT NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {tickets} (\
             id VARCHAR(36) PRIMARY KEY,\
             ticket_number VARCHAR(32) NOT NULL UNIQUE,\
             bus_id VARCHAR(36) NOT NULL,\
             user_id VARCHAR(36) NOT NULL,\
             seat_no INTEGER NOT NULL,\
             passenger_name VARCHAR(120) NOT NULL,\
             passenger_email VARCHAR(160) NOT NULL,\
             passenger_phone VARCHAR(32),\
             amount_cents BIGINT NOT NULL,\
             status VARCHAR(16) NOT NULL DEFAULT 'pending',\
             payment_method VARCHAR(32),\
             payment_reference VARCHAR(64),\
             created_at TEXT NOT NULL,\
             updated_at TEXT NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {payments} (\
             id VARCHAR(36) PRIMARY KEY,\
             ticket_id VARCHAR(36) NOT NULL,\
             user_id VARCHAR(36) NOT NULL,\
             reference VARCHAR(64) NOT NULL UNIQUE,\
             phone VARCHAR(32) NOT NULL,\
             method VARCHAR(32) NOT NULL,\
             amount_cents BIGINT NOT NULL,\
             status VARCHAR(16) NOT NULL DEFAULT 'pending',\
             fail_reason VARCHAR(32),\
             poll_url VARCHAR(512),\
             gateway_trace VARCHAR(2048),\
             created_at TEXT NOT NULL,\
             updated_at TEXT NOT NULL\
             )"
        ),
        format!("CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_reference ON {payments}(reference)"),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_ticket_open \
             ON {payments}(ticket_id) WHERE status = 'pending'"
        ),
        format!("CREATE UNIQUE INDEX IF NOT EXISTS idx_tickets_number ON {tickets}(ticket_number)"),
        format!("CREATE INDEX IF NOT EXISTS idx_tickets_user ON {tickets}(user_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_tickets_bus_seat ON {tickets}(bus_id, seat_no)"),
        format!("CREATE INDEX IF NOT EXISTS idx_payments_user ON {payments}(user_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_payments_created ON {payments}(created_at)"),
        format!("CREATE INDEX IF NOT EXISTS idx_buses_departure ON {buses}(departure_at)"),
    ];

    for ddl in ddls {
        let _ = sqlx::query(&ddl).execute(pool).await;
    }

    let _ = sqlx::query(&format!(
        "ALTER TABLE {payments} ADD COLUMN IF NOT EXISTS fail_reason VARCHAR(32)"
    ))
    .execute(pool)
    .await;
    let _ = sqlx::query(&format!(
        "ALTER TABLE {payments} ADD COLUMN IF NOT EXISTS poll_url VARCHAR(512)"
    ))
    .execute(pool)
    .await;
    let _ = sqlx::query(&format!(
        "ALTER TABLE {payments} ADD COLUMN IF NOT EXISTS gateway_trace VARCHAR(2048)"
    ))
    .execute(pool)
    .await;
    let _ = sqlx::query(&format!(
        "ALTER TABLE {tickets} ADD COLUMN IF NOT EXISTS payment_reference VARCHAR(64)"
    ))
    .execute(pool)
    .await;
    let _ = sqlx::query(&format!(
        "ALTER TABLE {buses} ADD COLUMN IF NOT EXISTS bus_type VARCHAR(32)"
    ))
    .execute(pool)
    .await;

    Ok(())
}

/// Inserts a handful of routes for local development when the table is empty.
pub async fn seed_demo_buses(pool: &PgPool, db_schema: &Option<String>) -> Result<(), sqlx::Error> {
    let buses = table_name(db_schema, "buses");

    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {buses}"))
        .fetch_one(pool)
        .await?;
    if count > 0 {
        return Ok(());
    }

    let now = Utc::now().to_rfc3339();
    let demo: [(&str, &str, &str, &str, &str, i64, i32); 3] = [
        (
            "ZB-101",
            "luxury",
            "Harare - Bulawayo",
            "2025-01-15T08:00:00Z",
            "2025-01-15T13:30:00Z",
            1500,
            60,
        ),
        (
            "ZB-204",
            "standard",
            "Harare - Mutare",
            "2025-01-15T09:30:00Z",
            "2025-01-15T13:00:00Z",
            1000,
            44,
        ),
        (
            "ZB-310",
            "standard",
            "Masvingo - Beitbridge",
            "2025-01-15T07:15:00Z",
            "2025-01-15T10:45:00Z",
            1200,
            44,
        ),
    ];

    for (fleet, kind, route, depart, arrive, price_cents, seats) in demo {
        let q = format!(
            "INSERT INTO {buses} \
             (id, fleet_number, bus_type, route, departure_at, arrival_at, price_cents, seats_total, seats_available, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, $9)"
        );
        sqlx::query(&q)
            .bind(Uuid::new_v4().to_string())
            .bind(fleet)
            .bind(kind)
            .bind(route)
            .bind(depart)
            .bind(arrive)
            .bind(price_cents)
            .bind(seats)
            .bind(&now)
            .execute(pool)
            .await?;
    }

    Ok(())
}
