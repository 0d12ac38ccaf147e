//! Payment gateway integration.
//!
//! Outbound: the [`PaymentGateway`] trait covers the charge/refund contract
//! consumed by checkout and the order lifecycle. Inbound: webhook payloads
//! are authenticated with an HMAC-SHA256 signature over the raw body
//! before anything is parsed or trusted.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, instrument};

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Successful charge details returned by the gateway.
#[derive(Debug, Clone)]
pub struct ChargeReceipt {
    /// Opaque reference correlating this charge with later webhook events.
    pub payment_intent_id: String,
}

/// External payment processor contract.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Captures a payment. A declined or errored charge surfaces as
    /// `ServiceError::PaymentFailed`; the caller must not have made any
    /// persistent state change before invoking this.
    async fn charge(
        &self,
        amount: Decimal,
        currency: &str,
        payment_method_token: &str,
    ) -> Result<ChargeReceipt, ServiceError>;

    /// Refunds a previously captured charge by its payment reference.
    async fn refund(&self, payment_intent_id: &str) -> Result<(), ServiceError>;
}

/// HTTP client for a Stripe-style payment API.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    secret_key: Option<String>,
}

#[derive(Serialize)]
struct ChargeRequest<'a> {
    amount: i64,
    currency: &'a str,
    payment_method: &'a str,
    confirm: bool,
}

#[derive(Deserialize)]
struct ChargeResponse {
    id: String,
    status: String,
    failure_reason: Option<String>,
}

#[derive(Deserialize)]
struct RefundResponse {
    status: String,
    failure_reason: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(base_url: String, secret_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            secret_key,
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.secret_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, payment_method_token))]
    async fn charge(
        &self,
        amount: Decimal,
        currency: &str,
        payment_method_token: &str,
    ) -> Result<ChargeReceipt, ServiceError> {
        // The gateway wire format is integer minor units.
        let amount_cents = (amount * Decimal::from(100))
            .round()
            .to_i64()
            .ok_or_else(|| ServiceError::PaymentFailed("amount out of range".to_string()))?;

        let request = ChargeRequest {
            amount: amount_cents,
            currency,
            payment_method: payment_method_token,
            confirm: true,
        };

        let response = self
            .authorize(
                self.client
                    .post(format!("{}/v1/payment_intents", self.base_url)),
            )
            .json(&request)
            .send()
            .await
            .map_err(|e| ServiceError::PaymentFailed(format!("gateway unreachable: {}", e)))?;

        let body: ChargeResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::PaymentFailed(format!("invalid gateway response: {}", e)))?;

        if body.status != "succeeded" {
            let reason = body
                .failure_reason
                .unwrap_or_else(|| format!("charge status: {}", body.status));
            return Err(ServiceError::PaymentFailed(reason));
        }

        info!(payment_intent_id = %body.id, %amount, "payment captured");
        Ok(ChargeReceipt {
            payment_intent_id: body.id,
        })
    }

    #[instrument(skip(self))]
    async fn refund(&self, payment_intent_id: &str) -> Result<(), ServiceError> {
        let response = self
            .authorize(self.client.post(format!("{}/v1/refunds", self.base_url)))
            .json(&serde_json::json!({ "payment_intent": payment_intent_id }))
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("gateway unreachable: {}", e)))?;

        let body: RefundResponse = response.json().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!("invalid gateway response: {}", e))
        })?;

        if body.status != "succeeded" {
            let reason = body
                .failure_reason
                .unwrap_or_else(|| format!("refund status: {}", body.status));
            return Err(ServiceError::ExternalServiceError(reason));
        }

        info!(payment_intent_id, "refund issued");
        Ok(())
    }
}

/// Parsed, signature-verified webhook event.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub kind: PaymentEventKind,
    pub event_type: String,
    pub payment_intent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEventKind {
    Succeeded,
    Failed,
    Other,
}

/// Verifies webhook authenticity before exposing the payload.
///
/// The signature header follows the `t=<unix ts>,v1=<hex hmac>` scheme:
/// the MAC covers `"{timestamp}.{raw body}"`, and timestamps older than
/// the configured tolerance are rejected to limit replay.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: u64,
}

impl WebhookVerifier {
    pub fn new(secret: String, tolerance_secs: u64) -> Self {
        Self {
            secret,
            tolerance_secs,
        }
    }

    pub fn verify_and_parse(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<PaymentEvent, ServiceError> {
        let (timestamp, signature) = parse_signature_header(signature_header)?;

        let ts: i64 = timestamp.parse().map_err(|_| {
            ServiceError::InvalidWebhookSignature("malformed timestamp".to_string())
        })?;
        if (Utc::now().timestamp() - ts).unsigned_abs() > self.tolerance_secs {
            return Err(ServiceError::InvalidWebhookSignature(
                "timestamp outside tolerance".to_string(),
            ));
        }

        let expected = compute_signature(&self.secret, timestamp, payload);
        if !constant_time_eq(&expected, signature) {
            return Err(ServiceError::InvalidWebhookSignature(
                "signature mismatch".to_string(),
            ));
        }

        // Only now is the payload trusted enough to parse.
        let json: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))?;

        let event_type = json
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::BadRequest("missing event type".to_string()))?
            .to_string();

        let payment_intent_id = json
            .pointer("/data/object/id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let kind = match event_type.as_str() {
            "payment_intent.succeeded" => PaymentEventKind::Succeeded,
            "payment_intent.payment_failed" => PaymentEventKind::Failed,
            _ => PaymentEventKind::Other,
        };

        Ok(PaymentEvent {
            kind,
            event_type,
            payment_intent_id,
        })
    }
}

/// Builds a signature header for a payload. Used by outbound test traffic
/// and by gateways simulated in integration tests.
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, &timestamp.to_string(), payload)
    )
}

fn parse_signature_header(header: &str) -> Result<(&str, &str), ServiceError> {
    let mut timestamp = "";
    let mut signature = "";
    for part in header.split(',') {
        let mut it = part.trim().splitn(2, '=');
        match (it.next(), it.next()) {
            (Some("t"), Some(val)) => timestamp = val,
            (Some("v1"), Some(val)) => signature = val,
            _ => {}
        }
    }
    if timestamp.is_empty() || signature.is_empty() {
        return Err(ServiceError::InvalidWebhookSignature(
            "missing signature header fields".to_string(),
        ));
    }
    Ok((timestamp, signature))
}

fn compute_signature(secret: &str, timestamp: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
