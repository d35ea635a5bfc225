use regex::Regex;
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub env_name: String,
    pub env_lower: String,

    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,

    pub db_url: String,
    pub db_schema: Option<String>,

    pub allowed_origins: Vec<String>,

    pub auth_token_secret: String,

    pub paynow_base_url: String,
    pub paynow_integration_id: String,
    pub paynow_integration_key: String,
    pub result_url: String,
    pub return_url: String,
    pub webhook_hash_required: bool,

    pub notify_url: Option<String>,
    pub notify_queue_capacity: usize,

    pub poll_interval_secs: u64,
    pub poll_max_attempts: u32,

    pub seed_demo_data: bool,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) => {
            let v = v.trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        }
        Err(_) => None,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    let v = raw.trim().to_lowercase();
    if v.is_empty() {
        return None;
    }
    if matches!(v.as_str(), "0" | "false" | "no" | "off") {
        Some(false)
    } else {
        Some(true)
    }
}

fn validate_postgres_url(url: &str) -> Result<(), String> {
    let scheme = url
        .split_once(':')
        .map(|(s, _)| s.trim().to_lowercase())
        .unwrap_or_default();
    match scheme.as_str() {
        "postgres" | "postgresql" => Ok(()),
        _ => Err("BOOKING_DB_URL (or DB_URL) must be a postgres URL".to_string()),
    }
}

fn validate_secret(env_lower: &str, name: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{name} must be set"));
    }
    let prod_like = matches!(env_lower, "prod" | "production" | "staging");
    if prod_like {
        let v = value.trim();
        if v.len() < 16 || v.to_lowercase().contains("change-me") {
            return Err(format!("{name} is too weak for prod/staging"));
        }
    }
    Ok(())
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let env_name = env_or("ENV", "dev");
        let env_lower = env_name.trim().to_lowercase();
        let prod_like = matches!(env_lower.as_str(), "prod" | "production" | "staging");

        let host = env_or("APP_HOST", "0.0.0.0");
        let port: u16 = env_or("APP_PORT", "8080")
            .parse()
            .map_err(|_| "APP_PORT must be a valid u16".to_string())?;

        let db_url = env_opt("BOOKING_DB_URL")
            .or_else(|| env_opt("DB_URL"))
            .unwrap_or_else(|| "postgresql://zupco:zupco@db:5432/zupco_booking".to_string());
        validate_postgres_url(&db_url)?;

        let db_schema = env_opt("DB_SCHEMA");
        if let Some(s) = &db_schema {
            let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|e| e.to_string())?;
            if !re.is_match(s) {
                return Err("DB_SCHEMA must match ^[A-Za-z_][A-Za-z0-9_]*$".to_string());
            }
        }

        let max_body_bytes: usize = env_or("BOOKING_MAX_BODY_BYTES", "1048576")
            .parse()
            .map_err(|_| "BOOKING_MAX_BODY_BYTES must be an integer".to_string())?;
        let max_body_bytes = max_body_bytes.clamp(16 * 1024, 10 * 1024 * 1024);

        let mut allowed_origins = parse_csv(&env_or("ALLOWED_ORIGINS", ""));
        if allowed_origins.is_empty() {
            allowed_origins = vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ];
        }
        if prod_like && allowed_origins.iter().any(|o| o.trim() == "*") {
            return Err("ALLOWED_ORIGINS must not contain '*' in prod/staging".to_string());
        }
        if prod_like
            && allowed_origins
                .iter()
                .any(|o| !o.trim().starts_with("https://"))
        {
            return Err("ALLOWED_ORIGINS must use https:// origins in prod/staging".to_string());
        }

        let auth_token_secret = env_opt("AUTH_TOKEN_SECRET").unwrap_or_default();
        validate_secret(&env_lower, "AUTH_TOKEN_SECRET", &auth_token_secret)?;

        let paynow_base_url = env_or("PAYNOW_BASE_URL", "https://www.paynow.co.zw");
        let paynow_integration_id = env_opt("PAYNOW_INTEGRATION_ID")
            .ok_or_else(|| "PAYNOW_INTEGRATION_ID must be set".to_string())?;
        let paynow_integration_key = env_opt("PAYNOW_INTEGRATION_KEY")
            .ok_or_else(|| "PAYNOW_INTEGRATION_KEY must be set".to_string())?;
        validate_secret(&env_lower, "PAYNOW_INTEGRATION_KEY", &paynow_integration_key)?;

        let base_url = env_or("BASE_URL", "http://localhost:8080");
        let frontend_url = env_or("FRONTEND_URL", "http://localhost:5173");
        let result_url = format!("{}/payments/webhook", base_url.trim_end_matches('/'));
        let return_url = format!("{}/tickets", frontend_url.trim_end_matches('/'));

        let webhook_hash_required = {
            let raw = env_or("PAYNOW_WEBHOOK_HASH_REQUIRED", "");
            match parse_bool_like(&raw) {
                Some(v) => v,
                None => prod_like,
            }
        };

        let notify_url = env_opt("NOTIFY_URL");
        let notify_queue_capacity: usize = env_or("NOTIFY_QUEUE_CAPACITY", "256")
            .parse()
            .map_err(|_| "NOTIFY_QUEUE_CAPACITY must be an integer".to_string())?;
        let notify_queue_capacity = notify_queue_capacity.clamp(16, 4096);

        let poll_interval_secs: u64 = env_or("PAYMENT_POLL_INTERVAL_SECS", "3")
            .parse()
            .map_err(|_| "PAYMENT_POLL_INTERVAL_SECS must be an integer".to_string())?;
        let poll_interval_secs = poll_interval_secs.clamp(1, 60);
        let poll_max_attempts: u32 = env_or("PAYMENT_POLL_MAX_ATTEMPTS", "20")
            .parse()
            .map_err(|_| "PAYMENT_POLL_MAX_ATTEMPTS must be an integer".to_string())?;
        let poll_max_attempts = poll_max_attempts.clamp(1, 200);

        let seed_demo_data = {
            let raw = env_or("SEED_DEMO_DATA", "");
            parse_bool_like(&raw).unwrap_or(false) && matches!(env_lower.as_str(), "dev" | "test")
        };

        Ok(Self {
            env_name,
            env_lower,
            host,
            port,
            max_body_bytes,
            db_url,
            db_schema,
            allowed_origins,
            auth_token_secret,
            paynow_base_url,
            paynow_integration_id,
            paynow_integration_key,
            result_url,
            return_url,
            webhook_hash_required,
            notify_url,
            notify_queue_capacity,
            poll_interval_secs,
            poll_max_attempts,
            seed_demo_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const ALL_KEYS: &[&str] = &[
        "ENV",
        "APP_HOST",
        "APP_PORT",
        "BOOKING_DB_URL",
        "DB_URL",
        "DB_SCHEMA",
        "BOOKING_MAX_BODY_BYTES",
        "ALLOWED_ORIGINS",
        "AUTH_TOKEN_SECRET",
        "PAYNOW_BASE_URL",
        "PAYNOW_INTEGRATION_ID",
        "PAYNOW_INTEGRATION_KEY",
        "PAYNOW_WEBHOOK_HASH_REQUIRED",
        "BASE_URL",
        "FRONTEND_URL",
        "NOTIFY_URL",
        "NOTIFY_QUEUE_CAPACITY",
        "PAYMENT_POLL_INTERVAL_SECS",
        "PAYMENT_POLL_MAX_ATTEMPTS",
        "SEED_DEMO_DATA",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let mut saved = Vec::with_capacity(ALL_KEYS.len());
            for k in ALL_KEYS {
                saved.push((k.to_string(), env::var(k).ok()));
                env::remove_var(k);
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain(..) {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }

    fn set_minimal_dev_env() {
        env::set_var("ENV", "dev");
        env::set_var("BOOKING_DB_URL", "postgresql://u:p@localhost:5432/booking");
        env::set_var("AUTH_TOKEN_SECRET", "dev-secret");
        env::set_var("PAYNOW_INTEGRATION_ID", "1234");
        env::set_var("PAYNOW_INTEGRATION_KEY", "dev-key");
    }

    #[test]
    fn rejects_non_postgres_url() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();
        set_minimal_dev_env();
        env::set_var("BOOKING_DB_URL", "sqlite:////tmp/booking.db");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn requires_gateway_credentials() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();
        set_minimal_dev_env();
        env::remove_var("PAYNOW_INTEGRATION_ID");
        let err = Config::from_env().expect_err("missing integration id must fail");
        assert!(err.contains("PAYNOW_INTEGRATION_ID"));
    }

    #[test]
    fn prod_rejects_weak_auth_secret() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();
        set_minimal_dev_env();
        env::set_var("ENV", "prod");
        env::set_var("ALLOWED_ORIGINS", "https://booking.example.com");
        env::set_var("PAYNOW_INTEGRATION_KEY", "paynow-key-0123456789abcdef");
        env::set_var("AUTH_TOKEN_SECRET", "short");
        let err = Config::from_env().expect_err("weak secret must fail in prod");
        assert!(err.contains("AUTH_TOKEN_SECRET"));
    }

    #[test]
    fn prod_rejects_wildcard_and_non_https_origins() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();
        set_minimal_dev_env();
        env::set_var("ENV", "prod");
        env::set_var("AUTH_TOKEN_SECRET", "auth-secret-0123456789abcdef");
        env::set_var("PAYNOW_INTEGRATION_KEY", "paynow-key-0123456789abcdef");

        env::set_var("ALLOWED_ORIGINS", "*");
        assert!(Config::from_env().is_err());

        env::set_var("ALLOWED_ORIGINS", "http://booking.example.com");
        let err = Config::from_env().expect_err("non-https origin must fail in prod");
        assert!(err.contains("https://"));
    }

    #[test]
    fn polling_and_body_limits_are_clamped() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();
        set_minimal_dev_env();

        env::set_var("BOOKING_MAX_BODY_BYTES", "1");
        env::set_var("PAYMENT_POLL_INTERVAL_SECS", "0");
        env::set_var("PAYMENT_POLL_MAX_ATTEMPTS", "100000");
        let cfg = Config::from_env().expect("config");
        assert_eq!(cfg.max_body_bytes, 16 * 1024);
        assert_eq!(cfg.poll_interval_secs, 1);
        assert_eq!(cfg.poll_max_attempts, 200);
    }

    #[test]
    fn defaults_follow_the_polling_contract() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();
        set_minimal_dev_env();
        let cfg = Config::from_env().expect("config");
        assert_eq!(cfg.poll_interval_secs, 3);
        assert_eq!(cfg.poll_max_attempts, 20);
        assert!(cfg.result_url.ends_with("/payments/webhook"));
        assert!(cfg.return_url.ends_with("/tickets"));
        assert!(!cfg.webhook_hash_required);
        assert!(!cfg.seed_demo_data);
    }

    #[test]
    fn demo_seed_is_ignored_outside_dev_and_test() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();
        set_minimal_dev_env();
        env::set_var("ENV", "prod");
        env::set_var("ALLOWED_ORIGINS", "https://booking.example.com");
        env::set_var("AUTH_TOKEN_SECRET", "auth-secret-0123456789abcdef");
        env::set_var("PAYNOW_INTEGRATION_KEY", "paynow-key-0123456789abcdef");
        env::set_var("SEED_DEMO_DATA", "true");
        let cfg = Config::from_env().expect("config");
        assert!(!cfg.seed_demo_data);
    }
}
