//! # Card Gateway Client
//!
//! HTTPS client for the fiat gateway: form-encoded POSTs, bearer auth,
//! typed responses. All amounts are USD cents; the gateway never sees
//! micro-units except as echoed metadata.
//!
//! ## Endpoints Used
//!
//! | Endpoint | Method | Purpose |
//! |----------|--------|---------|
//! | `/payment_intents` | POST | create + confirm a manual-capture hold |
//! | `/payment_intents/{id}/capture` | POST | settle a hold |
//! | `/payment_intents/{id}/cancel` | POST | release a hold |
//! | `/customers` | GET/POST | find/create customer by email |
//! | `/subscriptions` | GET/POST | enumerate/create subscriptions |
//! | `/invoices` | GET | paginated invoice listing |
//!
//! ## Error Mapping
//!
//! Network failures and 5xx → [`GatewayError::Unavailable`] (retryable);
//! 4xx → [`GatewayError::Api`] with the gateway's error code preserved so
//! callers can special-case idempotent cancels.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use verdant_common::config::GatewayConfig;

// ════════════════════════════════════════════════════════════════════════════════
// ERROR
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Network failure or 5xx; safe to retry.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    /// 4xx with the gateway's own error envelope.
    #[error("gateway error {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("gateway response decode failed: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TYPED MODELS
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    /// USD cents.
    pub amount: u64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub customer: String,
    pub status: String,
}

/// An invoice reduced to the fields pool accounting consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub id: String,
    pub customer: Option<String>,
    pub status: String,
    pub currency: String,
    /// USD cents actually paid.
    pub amount_paid: u64,
    pub paid_at: Option<DateTime<Utc>>,
    /// Price id of the first line, used for tier resolution.
    pub price_id: Option<String>,
}

impl Invoice {
    /// Paid, in USD, with a known payment time.
    pub fn is_paid_usd(&self) -> bool {
        self.status == "paid" && self.currency.eq_ignore_ascii_case("usd") && self.paid_at.is_some()
    }
}

/// One page of an invoice walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoicePage {
    pub invoices: Vec<Invoice>,
    pub has_more: bool,
}

// ── Wire shapes ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct InvoiceWire {
    id: String,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    amount_paid: u64,
    #[serde(default)]
    status_transitions: Option<StatusTransitions>,
    #[serde(default)]
    lines: Option<ListEnvelope<InvoiceLineWire>>,
}

#[derive(Debug, Deserialize)]
struct StatusTransitions {
    #[serde(default)]
    paid_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InvoiceLineWire {
    #[serde(default)]
    price: Option<PriceWire>,
}

#[derive(Debug, Deserialize)]
struct PriceWire {
    id: String,
}

impl From<InvoiceWire> for Invoice {
    fn from(wire: InvoiceWire) -> Self {
        let paid_at = wire
            .status_transitions
            .and_then(|t| t.paid_at)
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single());
        let price_id = wire
            .lines
            .and_then(|l| l.data.into_iter().next())
            .and_then(|line| line.price)
            .map(|p| p.id);
        Invoice {
            id: wire.id,
            customer: wire.customer,
            status: wire.status,
            currency: wire.currency,
            amount_paid: wire.amount_paid,
            paid_at,
            price_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
}

// ════════════════════════════════════════════════════════════════════════════════
// INVOICE SOURCE TRAIT
// ════════════════════════════════════════════════════════════════════════════════

/// The slice of the gateway subscription sync depends on. Kept narrow so
/// tests can script invoice pages without HTTP.
#[async_trait]
pub trait InvoiceGateway: Send + Sync {
    async fn find_customer_by_email(&self, email: &str)
        -> Result<Option<Customer>, GatewayError>;

    async fn list_invoices(
        &self,
        customer: Option<&str>,
        starting_after: Option<&str>,
        limit: u32,
    ) -> Result<InvoicePage, GatewayError>;
}

// ════════════════════════════════════════════════════════════════════════════════
// CLIENT
// ════════════════════════════════════════════════════════════════════════════════

/// Parameters for creating a manual-capture payment intent.
#[derive(Debug, Clone)]
pub struct CreateIntent {
    pub amount_cents: u64,
    pub customer: String,
    pub payment_method: String,
    /// Echoed verbatim onto the intent.
    pub metadata: HashMap<String, String>,
}

pub struct StripeClient {
    http: reqwest::Client,
    base: String,
    secret: String,
}

impl StripeClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let secret = config
            .secret_key
            .clone()
            .ok_or_else(|| GatewayError::Api {
                status: 401,
                code: None,
                message: "gateway secret key not configured".to_string(),
            })?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base: config.api_base.trim_end_matches('/').to_string(),
            secret,
        })
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GatewayError> {
        let response = request
            .bearer_auth(&self.secret)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| GatewayError::Decode(e.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(GatewayError::Unavailable(format!("{} {}", status, body)));
        }
        match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => Err(GatewayError::Api {
                status: status.as_u16(),
                code: envelope.error.code,
                message: envelope.error.message,
            }),
            Err(_) => Err(GatewayError::Api {
                status: status.as_u16(),
                code: None,
                message: body,
            }),
        }
    }

    pub async fn create_payment_intent(
        &self,
        params: &CreateIntent,
    ) -> Result<PaymentIntent, GatewayError> {
        let mut form: Vec<(String, String)> = vec![
            ("amount".to_string(), params.amount_cents.to_string()),
            ("currency".to_string(), "usd".to_string()),
            ("capture_method".to_string(), "manual".to_string()),
            ("confirm".to_string(), "true".to_string()),
            ("customer".to_string(), params.customer.clone()),
            ("payment_method".to_string(), params.payment_method.clone()),
        ];
        for (key, value) in &params.metadata {
            form.push((format!("metadata[{}]", key), value.clone()));
        }
        debug!(cents = params.amount_cents, "creating manual-capture intent");
        self.send(
            self.http
                .post(format!("{}/payment_intents", self.base))
                .form(&form),
        )
        .await
    }

    pub async fn capture_payment_intent(&self, id: &str) -> Result<PaymentIntent, GatewayError> {
        self.send(
            self.http
                .post(format!("{}/payment_intents/{}/capture", self.base, id))
                .form::<[(String, String); 0]>(&[]),
        )
        .await
    }

    pub async fn cancel_payment_intent(&self, id: &str) -> Result<PaymentIntent, GatewayError> {
        self.send(
            self.http
                .post(format!("{}/payment_intents/{}/cancel", self.base, id))
                .form::<[(String, String); 0]>(&[]),
        )
        .await
    }

    pub async fn create_customer(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> Result<Customer, GatewayError> {
        let mut form = vec![("email".to_string(), email.to_string())];
        if let Some(name) = name {
            form.push(("name".to_string(), name.to_string()));
        }
        self.send(
            self.http
                .post(format!("{}/customers", self.base))
                .form(&form),
        )
        .await
    }

    pub async fn create_subscription(
        &self,
        customer: &str,
        price: &str,
    ) -> Result<Subscription, GatewayError> {
        let form = vec![
            ("customer".to_string(), customer.to_string()),
            ("items[0][price]".to_string(), price.to_string()),
        ];
        self.send(
            self.http
                .post(format!("{}/subscriptions", self.base))
                .form(&form),
        )
        .await
    }

    pub async fn list_subscriptions(
        &self,
        customer: Option<&str>,
    ) -> Result<Vec<Subscription>, GatewayError> {
        let mut query: Vec<(String, String)> = Vec::new();
        if let Some(customer) = customer {
            query.push(("customer".to_string(), customer.to_string()));
        }
        let envelope: ListEnvelope<Subscription> = self
            .send(
                self.http
                    .get(format!("{}/subscriptions", self.base))
                    .query(&query),
            )
            .await?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl InvoiceGateway for StripeClient {
    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Customer>, GatewayError> {
        let envelope: ListEnvelope<Customer> = self
            .send(
                self.http
                    .get(format!("{}/customers", self.base))
                    .query(&[("email", email), ("limit", "1")]),
            )
            .await?;
        Ok(envelope.data.into_iter().next())
    }

    async fn list_invoices(
        &self,
        customer: Option<&str>,
        starting_after: Option<&str>,
        limit: u32,
    ) -> Result<InvoicePage, GatewayError> {
        let mut query: Vec<(String, String)> = vec![
            ("status".to_string(), "paid".to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(customer) = customer {
            query.push(("customer".to_string(), customer.to_string()));
        }
        if let Some(cursor) = starting_after {
            query.push(("starting_after".to_string(), cursor.to_string()));
        }
        let envelope: ListEnvelope<InvoiceWire> = self
            .send(
                self.http
                    .get(format!("{}/invoices", self.base))
                    .query(&query),
            )
            .await?;
        Ok(InvoicePage {
            invoices: envelope.data.into_iter().map(Invoice::from).collect(),
            has_more: envelope.has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(uri: &str) -> GatewayConfig {
        GatewayConfig {
            api_base: uri.to_string(),
            secret_key: Some("sk_test_123".to_string()),
            webhook_secret: None,
            customer_id: None,
            payment_method: None,
            usdc_denoms: vec!["uusdc".to_string()],
            request_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn intent_create_is_form_encoded_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payment_intents"))
            .and(header("authorization", "Bearer sk_test_123"))
            .and(body_string_contains("capture_method=manual"))
            .and(body_string_contains("confirm=true"))
            .and(body_string_contains("metadata%5Bonchain_denom%5D=uusdc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "pi_1",
                "status": "requires_capture",
                "amount": 475,
                "currency": "usd",
                "metadata": { "onchain_denom": "uusdc" }
            })))
            .mount(&server)
            .await;

        let client = StripeClient::new(&config_for(&server.uri())).unwrap();
        let intent = client
            .create_payment_intent(&CreateIntent {
                amount_cents: 475,
                customer: "cus_1".to_string(),
                payment_method: "pm_1".to_string(),
                metadata: [("onchain_denom".to_string(), "uusdc".to_string())]
                    .into_iter()
                    .collect(),
            })
            .await
            .unwrap();
        assert_eq!(intent.status, "requires_capture");
        assert_eq!(intent.amount, 475);
    }

    #[tokio::test]
    async fn api_errors_preserve_gateway_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payment_intents/pi_9/cancel"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {
                    "code": "payment_intent_unexpected_state",
                    "message": "This PaymentIntent has already been canceled."
                }
            })))
            .mount(&server)
            .await;

        let client = StripeClient::new(&config_for(&server.uri())).unwrap();
        let err = client.cancel_payment_intent("pi_9").await.unwrap_err();
        match err {
            GatewayError::Api { status, code, .. } => {
                assert_eq!(status, 400);
                assert_eq!(code.as_deref(), Some("payment_intent_unexpected_state"));
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn invoice_page_converts_wire_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invoices"))
            .and(query_param("customer", "cus_7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "object": "list",
                "has_more": true,
                "data": [{
                    "id": "in_march",
                    "customer": "cus_7",
                    "status": "paid",
                    "currency": "usd",
                    "amount_paid": 300,
                    "status_transitions": { "paid_at": 1773532800 },
                    "lines": { "data": [{ "price": { "id": "price_forest" } }] }
                }]
            })))
            .mount(&server)
            .await;

        let client = StripeClient::new(&config_for(&server.uri())).unwrap();
        let page = client.list_invoices(Some("cus_7"), None, 100).await.unwrap();
        assert!(page.has_more);
        let invoice = &page.invoices[0];
        assert!(invoice.is_paid_usd());
        assert_eq!(invoice.amount_paid, 300);
        assert_eq!(invoice.price_id.as_deref(), Some("price_forest"));
    }

    #[tokio::test]
    async fn five_hundreds_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/customers"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = StripeClient::new(&config_for(&server.uri())).unwrap();
        let err = client
            .find_customer_by_email("a@b.co")
            .await
            .unwrap_err();
        assert!(err.retryable());
    }

    #[test]
    fn missing_secret_fails_construction() {
        let mut config = config_for("http://unused");
        config.secret_key = None;
        assert!(StripeClient::new(&config).is_err());
    }
}
