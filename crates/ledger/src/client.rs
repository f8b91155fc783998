//! # Ledger Client
//!
//! [`LedgerClient`] is the object-safe async trait every consumer of the
//! ledger depends on; [`HttpLedgerClient`] is the production
//! implementation speaking REST to the chain, GraphQL to the indexer and
//! JSON broadcast to the tx endpoint.
//!
//! ## Contract
//!
//! - Reads never retry internally; retry policy belongs to callers.
//!   The one exception is [`LedgerClient::wait_for_retirement`], whose job
//!   IS the retry loop: it polls with exponential backoff until the
//!   deadline and maps "still not indexed" to `Ok(None)`.
//! - Network failures and HTTP 5xx → [`LedgerError::Unavailable`]
//!   (retryable). HTTP 4xx → [`LedgerError::Request`] (fatal).
//! - `sign_and_broadcast` serializes on one wallet handle; concurrent
//!   broadcasts queue on an async lock to keep the account sequence
//!   monotonic.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use verdant_common::config::LedgerConfig;

use crate::poll::{compute_delay, PollConfig};
use crate::types::{
    AllowedDenom, BroadcastResult, CreditClass, MsgBuyDirect, Project, RetirementRecord,
    SellOrder, SellOrderWire,
};
use crate::wallet::Wallet;

// ════════════════════════════════════════════════════════════════════════════════
// ERROR
// ════════════════════════════════════════════════════════════════════════════════

/// Errors from ledger and indexer interaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Network failure or 5xx; safe to retry.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    /// 4xx or chain-side validation failure; retrying cannot help.
    #[error("ledger rejected request: {0}")]
    Request(String),
    /// Response body did not match the expected shape.
    #[error("ledger response decode failed: {0}")]
    Decode(String),
    /// A signing operation was requested with no wallet configured.
    #[error("no wallet configured")]
    NoWallet,
}

impl LedgerError {
    /// Whether a caller may retry the operation with backoff.
    pub fn retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TRAIT
// ════════════════════════════════════════════════════════════════════════════════

/// Async abstraction over the credit ledger.
///
/// Implementations MUST NOT panic and MUST keep `sign_and_broadcast`
/// internally serialized (single account sequence).
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn list_sell_orders(&self) -> Result<Vec<SellOrder>, LedgerError>;

    async fn list_credit_classes(&self) -> Result<Vec<CreditClass>, LedgerError>;

    async fn list_projects(&self) -> Result<Vec<Project>, LedgerError>;

    async fn allowed_denoms(&self) -> Result<Vec<AllowedDenom>, LedgerError>;

    /// Look up a retirement by indexer node id or transaction hash.
    /// `Ok(None)` means "not indexed yet", not failure.
    async fn retirement_by_id(
        &self,
        id_or_tx_hash: &str,
    ) -> Result<Option<RetirementRecord>, LedgerError>;

    /// Spendable balance of `denom` for `address`, in micro-units.
    async fn bank_balance(&self, address: &str, denom: &str) -> Result<u128, LedgerError>;

    /// Address of the configured signing wallet, if any.
    fn wallet_address(&self) -> Option<String>;

    /// Sign and broadcast `messages` as one transaction.
    async fn sign_and_broadcast(
        &self,
        messages: &[MsgBuyDirect],
    ) -> Result<BroadcastResult, LedgerError>;

    /// Poll the indexer until a retirement for `tx_hash` appears or
    /// `timeout` elapses. Timeout is `Ok(None)`: indexer lag, try later.
    /// Transient `Unavailable` errors are absorbed into the polling loop;
    /// fatal errors propagate.
    async fn wait_for_retirement(
        &self,
        tx_hash: &str,
        timeout: Duration,
    ) -> Result<Option<RetirementRecord>, LedgerError> {
        let config = PollConfig::default();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempt: u32 = 1;
        loop {
            match self.retirement_by_id(tx_hash).await {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => {}
                Err(err) if err.retryable() => {
                    warn!(tx_hash, %err, "indexer poll failed, will retry");
                }
                Err(err) => return Err(err),
            }
            let delay = Duration::from_millis(compute_delay(&config, attempt));
            if tokio::time::Instant::now() + delay >= deadline {
                debug!(tx_hash, "retirement poll deadline reached");
                return Ok(None);
            }
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// WIRE ENVELOPES
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct SellOrdersEnvelope {
    #[serde(default)]
    sell_orders: Vec<SellOrderWire>,
}

#[derive(Deserialize)]
struct ClassesEnvelope {
    #[serde(default)]
    classes: Vec<CreditClass>,
}

#[derive(Deserialize)]
struct ProjectsEnvelope {
    #[serde(default)]
    projects: Vec<Project>,
}

#[derive(Deserialize)]
struct AllowedDenomsEnvelope {
    #[serde(default)]
    allowed_denoms: Vec<AllowedDenom>,
}

#[derive(Deserialize)]
struct BalanceEnvelope {
    balance: BalanceCoin,
}

#[derive(Deserialize)]
struct BalanceCoin {
    amount: String,
}

#[derive(Deserialize)]
struct TxEnvelope {
    tx_response: TxResponseWire,
}

#[derive(Deserialize)]
struct TxResponseWire {
    code: u32,
    txhash: String,
    #[serde(default)]
    height: String,
    #[serde(default)]
    raw_log: String,
}

#[derive(Deserialize)]
struct GraphQlEnvelope {
    #[serde(default)]
    data: Option<RetirementsData>,
    #[serde(default)]
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct RetirementsData {
    #[serde(rename = "allRetirements")]
    all_retirements: RetirementNodes,
}

#[derive(Deserialize)]
struct RetirementNodes {
    #[serde(default)]
    nodes: Vec<RetirementWire>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetirementWire {
    node_id: String,
    amount: String,
    batch_denom: String,
    owner: String,
    jurisdiction: String,
    reason: String,
    timestamp: String,
    tx_hash: String,
    block_height: u64,
}

impl From<RetirementWire> for RetirementRecord {
    fn from(wire: RetirementWire) -> Self {
        RetirementRecord {
            node_id: wire.node_id,
            amount: wire.amount,
            batch_denom: wire.batch_denom,
            owner: wire.owner,
            jurisdiction: wire.jurisdiction,
            reason: wire.reason,
            timestamp: wire.timestamp,
            tx_hash: wire.tx_hash,
            block_height: wire.block_height,
        }
    }
}

const RETIREMENT_QUERY: &str = r#"
query RetirementLookup($key: String!) {
  allRetirements(
    filter: { or: [{ txHash: { equalTo: $key } }, { nodeId: { equalTo: $key } }] }
    first: 1
  ) {
    nodes {
      nodeId amount batchDenom owner jurisdiction reason timestamp txHash blockHeight
    }
  }
}"#;

// ════════════════════════════════════════════════════════════════════════════════
// HTTP CLIENT
// ════════════════════════════════════════════════════════════════════════════════

/// Production ledger client over REST + GraphQL.
pub struct HttpLedgerClient {
    http: reqwest::Client,
    rest_url: String,
    indexer_url: String,
    broadcast_url: String,
    wallet: Option<Wallet>,
    /// Broadcast serialization point (account-sequence safety).
    broadcast_lock: tokio::sync::Mutex<()>,
}

impl HttpLedgerClient {
    /// Build from config; constructs the wallet when a mnemonic is set.
    pub fn new(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable(format!("failed to create HTTP client: {}", e)))?;

        let wallet = match &config.wallet_mnemonic {
            Some(phrase) => Some(
                Wallet::from_mnemonic(phrase, &config.derivation_path)
                    .map_err(|e| LedgerError::Request(e.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            http,
            rest_url: config.rest_url.trim_end_matches('/').to_string(),
            indexer_url: config.indexer_url.clone(),
            broadcast_url: config.broadcast_url.trim_end_matches('/').to_string(),
            wallet,
            broadcast_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, LedgerError> {
        let response = self.http.get(url).send().await.map_err(map_transport)?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))
    }
}

fn map_transport(err: reqwest::Error) -> LedgerError {
    LedgerError::Unavailable(err.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LedgerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(LedgerError::Unavailable(format!("{} {}", status, body)))
    } else {
        Err(LedgerError::Request(format!("{} {}", status, body)))
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn list_sell_orders(&self) -> Result<Vec<SellOrder>, LedgerError> {
        let url = format!("{}/ecocredit/marketplace/v1/sell-orders", self.rest_url);
        let envelope: SellOrdersEnvelope = self.get_json(&url).await?;
        envelope
            .sell_orders
            .into_iter()
            .map(|wire| SellOrder::try_from(wire).map_err(|e| LedgerError::Decode(e.to_string())))
            .collect()
    }

    async fn list_credit_classes(&self) -> Result<Vec<CreditClass>, LedgerError> {
        let url = format!("{}/ecocredit/v1/classes", self.rest_url);
        let envelope: ClassesEnvelope = self.get_json(&url).await?;
        Ok(envelope.classes)
    }

    async fn list_projects(&self) -> Result<Vec<Project>, LedgerError> {
        let url = format!("{}/ecocredit/v1/projects", self.rest_url);
        let envelope: ProjectsEnvelope = self.get_json(&url).await?;
        Ok(envelope.projects)
    }

    async fn allowed_denoms(&self) -> Result<Vec<AllowedDenom>, LedgerError> {
        let url = format!("{}/ecocredit/marketplace/v1/allowed-denoms", self.rest_url);
        let envelope: AllowedDenomsEnvelope = self.get_json(&url).await?;
        Ok(envelope.allowed_denoms)
    }

    async fn retirement_by_id(
        &self,
        id_or_tx_hash: &str,
    ) -> Result<Option<RetirementRecord>, LedgerError> {
        let body = json!({
            "query": RETIREMENT_QUERY,
            "variables": { "key": id_or_tx_hash },
        });
        let response = self
            .http
            .post(&self.indexer_url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;
        let response = check_status(response).await?;
        let envelope: GraphQlEnvelope = response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))?;

        if let Some(errors) = envelope.errors {
            let message = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(LedgerError::Request(format!("indexer error: {}", message)));
        }
        Ok(envelope
            .data
            .and_then(|d| d.all_retirements.nodes.into_iter().next())
            .map(RetirementRecord::from))
    }

    async fn bank_balance(&self, address: &str, denom: &str) -> Result<u128, LedgerError> {
        let url = format!(
            "{}/cosmos/bank/v1beta1/balances/{}/by_denom?denom={}",
            self.rest_url, address, denom
        );
        let envelope: BalanceEnvelope = self.get_json(&url).await?;
        envelope
            .balance
            .amount
            .parse::<u128>()
            .map_err(|e| LedgerError::Decode(format!("bad balance amount: {}", e)))
    }

    fn wallet_address(&self) -> Option<String> {
        self.wallet.as_ref().map(|w| w.address().to_string())
    }

    async fn sign_and_broadcast(
        &self,
        messages: &[MsgBuyDirect],
    ) -> Result<BroadcastResult, LedgerError> {
        let wallet = self.wallet.as_ref().ok_or(LedgerError::NoWallet)?;

        // One wallet handle, one account sequence: concurrent broadcasts
        // queue here instead of racing the sequence number.
        let _guard = self.broadcast_lock.lock().await;

        let sign_doc = json!({
            "signer": wallet.address(),
            "messages": messages,
        });
        let doc_bytes =
            serde_json::to_vec(&sign_doc).map_err(|e| LedgerError::Decode(e.to_string()))?;
        let signature = wallet.sign(&doc_bytes);

        let tx = json!({
            "doc": sign_doc,
            "signature": hex::encode(signature),
            "public_key": hex::encode(wallet.public_key()),
        });
        let tx_bytes = serde_json::to_vec(&tx).map_err(|e| LedgerError::Decode(e.to_string()))?;

        let url = format!("{}/cosmos/tx/v1beta1/txs", self.broadcast_url);
        let body = json!({
            "tx_bytes": BASE64_STANDARD.encode(tx_bytes),
            "mode": "BROADCAST_MODE_SYNC",
        });

        debug!(orders = messages.iter().map(|m| m.orders.len()).sum::<usize>(), "broadcasting buy-direct");
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;
        let response = check_status(response).await?;
        let envelope: TxEnvelope = response
            .json()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))?;

        Ok(BroadcastResult {
            code: envelope.tx_response.code,
            tx_hash: envelope.tx_response.txhash,
            height: envelope.tx_response.height.parse().unwrap_or(0),
            raw_log: envelope.tx_response.raw_log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn config_for(server_uri: &str, mnemonic: Option<&str>) -> LedgerConfig {
        LedgerConfig {
            rest_url: server_uri.to_string(),
            indexer_url: format!("{}/graphql", server_uri),
            broadcast_url: server_uri.to_string(),
            marketplace_url: "https://marketplace.test".to_string(),
            native_denom: "uverd".to_string(),
            wallet_mnemonic: mnemonic.map(str::to_string),
            derivation_path: "m/44'/118'/0'/0/0".to_string(),
            request_timeout: Duration::from_secs(2),
            retirement_poll_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn lists_and_converts_sell_orders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ecocredit/marketplace/v1/sell-orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sell_orders": [{
                    "id": "11",
                    "batch_denom": "C01-001-20240101-20241231-001",
                    "quantity": "2",
                    "ask_amount": "2200",
                    "ask_denom": "uverd",
                    "disable_auto_retire": false
                }]
            })))
            .mount(&server)
            .await;

        let client = HttpLedgerClient::new(&config_for(&server.uri(), None)).unwrap();
        let orders = client.list_sell_orders().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, 11);
        assert_eq!(orders[0].quantity_micro, 2_000_000);
    }

    #[tokio::test]
    async fn server_errors_are_retryable_client_errors_are_not() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ecocredit/v1/classes"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ecocredit/v1/projects"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let client = HttpLedgerClient::new(&config_for(&server.uri(), None)).unwrap();

        let err = client.list_credit_classes().await.unwrap_err();
        assert!(err.retryable(), "5xx should be retryable: {:?}", err);

        let err = client.list_projects().await.unwrap_err();
        assert!(!err.retryable(), "4xx must be fatal: {:?}", err);
        assert!(matches!(err, LedgerError::Request(_)));
    }

    #[tokio::test]
    async fn broadcast_without_wallet_is_no_wallet() {
        let server = MockServer::start().await;
        let client = HttpLedgerClient::new(&config_for(&server.uri(), None)).unwrap();
        let err = client.sign_and_broadcast(&[]).await.unwrap_err();
        assert_eq!(err, LedgerError::NoWallet);
    }

    #[tokio::test]
    async fn broadcast_parses_tx_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cosmos/tx/v1beta1/txs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tx_response": {
                    "code": 0,
                    "txhash": "ABCDEF",
                    "height": "4242",
                    "raw_log": ""
                }
            })))
            .mount(&server)
            .await;

        let client = HttpLedgerClient::new(&config_for(&server.uri(), Some(PHRASE))).unwrap();
        assert!(client.wallet_address().is_some());

        let result = client.sign_and_broadcast(&[]).await.unwrap();
        assert_eq!(result.code, 0);
        assert_eq!(result.tx_hash, "ABCDEF");
        assert_eq!(result.height, 4242);
    }

    #[tokio::test]
    async fn retirement_lookup_returns_none_when_unindexed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex("^/graphql$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "allRetirements": { "nodes": [] } }
            })))
            .mount(&server)
            .await;

        let client = HttpLedgerClient::new(&config_for(&server.uri(), None)).unwrap();
        let found = client.retirement_by_id("DEADBEEF").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn indexer_graphql_errors_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex("^/graphql$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errors": [{ "message": "syntax error" }]
            })))
            .mount(&server)
            .await;

        let client = HttpLedgerClient::new(&config_for(&server.uri(), None)).unwrap();
        let err = client.retirement_by_id("X").await.unwrap_err();
        assert!(matches!(err, LedgerError::Request(_)));
    }
}
