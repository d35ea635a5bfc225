use crate::gateway::PaymentGateway;
use crate::notify::Notifier;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub db_schema: Option<String>,
    pub env_name: String,
    pub env_lower: String,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Notifier,
    pub auth_token_secret: String,
    pub paynow_integration_key: String,
    pub webhook_hash_required: bool,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
}

impl AppState {
    pub fn table(&self, name: &str) -> String {
        match &self.db_schema {
            Some(s) => format!("{s}.{name}"),
            None => name.to_string(),
        }
    }
}
