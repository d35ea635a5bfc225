use async_trait::async_trait;
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::fmt;

/// Fixed vocabulary every gateway response is normalized into. Anything the
/// gateway says that is not clearly recognized maps to `Pending`; transport
/// failures map to `TransientError`. Neither carries new information for the
/// reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizedStatus {
    Pending,
    Sent,
    Paid,
    Cancelled,
    Failed,
    TransientError,
}

impl NormalizedStatus {
    /// Maps a raw gateway status token. The gateway reports settled payments
    /// with more than one token ("Paid", "Awaiting Delivery", "Delivered"),
    /// all of which normalize to `Paid`.
    pub fn from_gateway(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "paid" | "awaiting delivery" | "delivered" | "completed" => NormalizedStatus::Paid,
            "sent" => NormalizedStatus::Sent,
            "cancelled" | "canceled" => NormalizedStatus::Cancelled,
            "failed" | "disputed" => NormalizedStatus::Failed,
            _ => NormalizedStatus::Pending,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NormalizedStatus::Pending => "pending",
            NormalizedStatus::Sent => "sent",
            NormalizedStatus::Paid => "paid",
            NormalizedStatus::Cancelled => "cancelled",
            NormalizedStatus::Failed => "failed",
            NormalizedStatus::TransientError => "transient_error",
        }
    }
}

#[derive(Debug)]
pub enum GatewayError {
    InvalidAmount,
    Rejected(String),
    Unreachable(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::InvalidAmount => write!(f, "amount must be positive"),
            GatewayError::Rejected(msg) => write!(f, "gateway rejected request: {msg}"),
            GatewayError::Unreachable(msg) => write!(f, "gateway unreachable: {msg}"),
        }
    }
}

/// Local aggregation of one payment request, assembled before anything goes
/// over the wire.
#[derive(Debug, Clone)]
pub struct PaymentHandle {
    pub reference: String,
    pub payer_email: String,
    pub amount_cents: i64,
    pub description: String,
}

/// Gateway answer to a mobile prompt: the instructions shown to the payer and
/// the opaque poll URL used for out-of-band status queries.
#[derive(Debug, Clone)]
pub struct PromptResponse {
    pub instructions: Option<String>,
    pub poll_url: String,
    pub raw: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn create_payment(
        &self,
        reference: &str,
        payer_email: &str,
        amount_cents: i64,
        description: &str,
    ) -> Result<PaymentHandle, GatewayError>;

    async fn send_mobile_prompt(
        &self,
        handle: &PaymentHandle,
        phone: &str,
        method: &str,
    ) -> Result<PromptResponse, GatewayError>;

    async fn poll_status(&self, poll_url: &str) -> NormalizedStatus;
}

/// Paynow-protocol client. Requests are form-encoded with a SHA512 integrity
/// hash over the field values; responses come back URL-encoded.
pub struct PaynowGateway {
    http: reqwest::Client,
    base_url: String,
    integration_id: String,
    integration_key: String,
    result_url: String,
    return_url: String,
}

impl PaynowGateway {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        integration_id: impl Into<String>,
        integration_key: impl Into<String>,
        result_url: impl Into<String>,
        return_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            integration_id: integration_id.into(),
            integration_key: integration_key.into(),
            result_url: result_url.into(),
            return_url: return_url.into(),
        }
    }

    fn remote_transaction_url(&self) -> String {
        format!(
            "{}/interface/remotetransaction",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn post_form(
        &self,
        url: &str,
        fields: &[(&str, &str)],
    ) -> Result<HashMap<String, String>, GatewayError> {
        let resp = self
            .http
            .post(url)
            .form(fields)
            .send()
            .await
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;
        let body = resp
            .text()
            .await
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;
        Ok(parse_urlencoded(&body))
    }
}

#[async_trait]
impl PaymentGateway for PaynowGateway {
    fn create_payment(
        &self,
        reference: &str,
        payer_email: &str,
        amount_cents: i64,
        description: &str,
    ) -> Result<PaymentHandle, GatewayError> {
        if amount_cents <= 0 {
            return Err(GatewayError::InvalidAmount);
        }
        Ok(PaymentHandle {
            reference: reference.to_string(),
            payer_email: payer_email.to_string(),
            amount_cents,
            description: description.to_string(),
        })
    }

    async fn send_mobile_prompt(
        &self,
        handle: &PaymentHandle,
        phone: &str,
        method: &str,
    ) -> Result<PromptResponse, GatewayError> {
        let amount = format_amount(handle.amount_cents);
        let fields: Vec<(&str, &str)> = vec![
            ("resulturl", self.result_url.as_str()),
            ("returnurl", self.return_url.as_str()),
            ("reference", handle.reference.as_str()),
            ("amount", amount.as_str()),
            ("id", self.integration_id.as_str()),
            ("additionalinfo", handle.description.as_str()),
            ("authemail", handle.payer_email.as_str()),
            ("phone", phone),
            ("method", method),
            ("status", "Message"),
        ];
        let hash = request_hash(fields.iter().map(|(_, v)| *v), &self.integration_key);
        let mut signed = fields;
        signed.push(("hash", hash.as_str()));

        let parsed = self.post_form(&self.remote_transaction_url(), &signed).await?;
        let status = parsed.get("status").map(String::as_str).unwrap_or("");
        if !status.eq_ignore_ascii_case("ok") {
            let err = parsed
                .get("error")
                .cloned()
                .unwrap_or_else(|| format!("unexpected gateway status '{status}'"));
            return Err(GatewayError::Rejected(err));
        }
        let poll_url = parsed
            .get("pollurl")
            .cloned()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| GatewayError::Rejected("missing pollurl".to_string()))?;

        Ok(PromptResponse {
            instructions: parsed.get("instructions").cloned(),
            poll_url,
            raw: serde_urlencoded::to_string(
                parsed.iter().collect::<Vec<(&String, &String)>>(),
            )
            .unwrap_or_default(),
        })
    }

    async fn poll_status(&self, poll_url: &str) -> NormalizedStatus {
        let resp = match self.http.post(poll_url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "gateway poll transport failure");
                return NormalizedStatus::TransientError;
            }
        };
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "gateway poll body read failure");
                return NormalizedStatus::TransientError;
            }
        };
        let parsed = parse_urlencoded(&body);
        match parsed.get("status") {
            Some(raw) => NormalizedStatus::from_gateway(raw),
            None => {
                tracing::warn!("gateway poll response carried no status field");
                NormalizedStatus::Pending
            }
        }
    }
}

/// SHA512 of the concatenated values followed by the integration key,
/// uppercase hex, as the gateway protocol requires.
pub fn request_hash<'a>(values: impl Iterator<Item = &'a str>, integration_key: &str) -> String {
    let mut hasher = Sha512::new();
    for v in values {
        hasher.update(v.as_bytes());
    }
    hasher.update(integration_key.as_bytes());
    hex::encode(hasher.finalize()).to_uppercase()
}

/// Integrity hash over a gateway callback: every posted field value in wire
/// order, excluding the `hash` field itself, followed by the key. The gateway
/// signs the whole payload, not just the fields this service consumes.
pub fn callback_hash(pairs: &[(String, String)], integration_key: &str) -> String {
    request_hash(
        pairs
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case("hash"))
            .map(|(_, v)| v.as_str()),
        integration_key,
    )
}

pub fn format_amount(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}

fn parse_urlencoded(body: &str) -> HashMap<String, String> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(body.trim())
        .map(|pairs| pairs.into_iter().collect())
        .unwrap_or_default()
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Deterministic gateway double: `send_mobile_prompt` can be scripted to
    /// fail, and `poll_status` replays a queue of statuses (repeating the last
    /// one once drained).
    pub struct ScriptedGateway {
        pub reject_prompt: Option<String>,
        polls: Mutex<VecDeque<NormalizedStatus>>,
        poll_count: Mutex<u32>,
    }

    impl ScriptedGateway {
        pub fn new(polls: Vec<NormalizedStatus>) -> Self {
            Self {
                reject_prompt: None,
                polls: Mutex::new(polls.into()),
                poll_count: Mutex::new(0),
            }
        }

        pub fn polls_made(&self) -> u32 {
            *self.poll_count.lock().unwrap()
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        fn create_payment(
            &self,
            reference: &str,
            payer_email: &str,
            amount_cents: i64,
            description: &str,
        ) -> Result<PaymentHandle, GatewayError> {
            if amount_cents <= 0 {
                return Err(GatewayError::InvalidAmount);
            }
            Ok(PaymentHandle {
                reference: reference.to_string(),
                payer_email: payer_email.to_string(),
                amount_cents,
                description: description.to_string(),
            })
        }

        async fn send_mobile_prompt(
            &self,
            _handle: &PaymentHandle,
            _phone: &str,
            _method: &str,
        ) -> Result<PromptResponse, GatewayError> {
            if let Some(err) = &self.reject_prompt {
                return Err(GatewayError::Rejected(err.clone()));
            }
            Ok(PromptResponse {
                instructions: Some("Dial *151# and approve the payment".to_string()),
                poll_url: "mock://poll/1".to_string(),
                raw: "status=Ok".to_string(),
            })
        }

        async fn poll_status(&self, _poll_url: &str) -> NormalizedStatus {
            *self.poll_count.lock().unwrap() += 1;
            let mut q = self.polls.lock().unwrap();
            if q.len() > 1 {
                q.pop_front().unwrap()
            } else {
                q.front().copied().unwrap_or(NormalizedStatus::Pending)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_gateway_success_tokens_normalize_to_paid() {
        assert_eq!(NormalizedStatus::from_gateway("Paid"), NormalizedStatus::Paid);
        assert_eq!(
            NormalizedStatus::from_gateway("Awaiting Delivery"),
            NormalizedStatus::Paid
        );
        assert_eq!(
            NormalizedStatus::from_gateway("Delivered"),
            NormalizedStatus::Paid
        );
    }

    #[test]
    fn unrecognized_tokens_are_conservatively_pending() {
        assert_eq!(
            NormalizedStatus::from_gateway("Refunded"),
            NormalizedStatus::Pending
        );
        assert_eq!(NormalizedStatus::from_gateway(""), NormalizedStatus::Pending);
        assert_eq!(
            NormalizedStatus::from_gateway("garbage"),
            NormalizedStatus::Pending
        );
    }

    #[test]
    fn intermediate_and_terminal_tokens_map_directly() {
        assert_eq!(NormalizedStatus::from_gateway("Sent"), NormalizedStatus::Sent);
        assert_eq!(
            NormalizedStatus::from_gateway("Created"),
            NormalizedStatus::Pending
        );
        assert_eq!(
            NormalizedStatus::from_gateway("Cancelled"),
            NormalizedStatus::Cancelled
        );
        assert_eq!(
            NormalizedStatus::from_gateway("Failed"),
            NormalizedStatus::Failed
        );
        assert_eq!(
            NormalizedStatus::from_gateway("Disputed"),
            NormalizedStatus::Failed
        );
    }

    #[test]
    fn create_payment_rejects_non_positive_amounts() {
        let gw = PaynowGateway::new(
            reqwest::Client::new(),
            "https://paynow.example",
            "1234",
            "key",
            "https://api.example/payments/webhook",
            "https://app.example/tickets",
        );
        assert!(matches!(
            gw.create_payment("PAY1", "a@b.c", 0, "ticket"),
            Err(GatewayError::InvalidAmount)
        ));
        assert!(matches!(
            gw.create_payment("PAY1", "a@b.c", -500, "ticket"),
            Err(GatewayError::InvalidAmount)
        ));
        assert!(gw.create_payment("PAY1", "a@b.c", 1500, "ticket").is_ok());
    }

    #[test]
    fn amount_is_rendered_with_two_decimals() {
        assert_eq!(format_amount(1500), "15.00");
        assert_eq!(format_amount(5), "0.05");
        assert_eq!(format_amount(123456), "1234.56");
    }

    #[test]
    fn request_hash_is_uppercase_hex_and_key_sensitive() {
        let h1 = request_hash(["a", "b"].into_iter(), "key1");
        let h2 = request_hash(["a", "b"].into_iter(), "key2");
        assert_ne!(h1, h2);
        assert_eq!(h1.len(), 128);
        assert!(h1.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn callback_hash_covers_every_field_in_order_except_the_hash_itself() {
        let pairs = |fields: &[(&str, &str)]| -> Vec<(String, String)> {
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };

        let full = pairs(&[
            ("reference", "PAY1"),
            ("paynowreference", "12345"),
            ("amount", "15.00"),
            ("status", "Paid"),
            ("pollurl", "http://p/u"),
        ]);
        let base = callback_hash(&full, "key");

        // Every field participates, including ones this service ignores.
        let mut other_amount = full.clone();
        other_amount[2].1 = "16.00".to_string();
        assert_ne!(base, callback_hash(&other_amount, "key"));

        // Order matters.
        let mut reordered = full.clone();
        reordered.swap(0, 3);
        assert_ne!(base, callback_hash(&reordered, "key"));

        // The transported hash field does not hash itself.
        let mut with_hash = full.clone();
        with_hash.push(("hash".to_string(), base.clone()));
        assert_eq!(base, callback_hash(&with_hash, "key"));

        assert_ne!(base, callback_hash(&full, "other-key"));
    }

    #[test]
    fn urlencoded_responses_parse_into_fields() {
        let parsed = parse_urlencoded("status=Ok&pollurl=https%3A%2F%2Fgw%2Fpoll%2F1&hash=AB");
        assert_eq!(parsed.get("status").map(String::as_str), Some("Ok"));
        assert_eq!(
            parsed.get("pollurl").map(String::as_str),
            Some("https://gw/poll/1")
        );
        assert!(parse_urlencoded("").is_empty());
    }
}
