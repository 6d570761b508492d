#![deny(unsafe_code)]

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use interbank_adapters::{HttpPeerClient, PeerTimeouts};
use interbank_core::protocol::check_version;
use interbank_core::{
    Account, BankError, BankNode, CapitalReport, InterbankTransfer, NodeConfig, NodeSeams,
    PaymentOutcome, PaymentRequest, SettlementRequest, SettlementResponse, Transaction,
    PROTOCOL_HEADER, REQUESTING_BANK_HEADER,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub node: NodeConfig,
    pub timeouts: PeerTimeouts,
}

impl ServiceConfig {
    pub fn new(node: NodeConfig) -> Self {
        Self {
            node,
            timeouts: PeerTimeouts::default(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub node: Arc<BankNode>,
}

impl ServiceState {
    /// Bootstrap a node that reaches its peers over HTTP.
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig { node, timeouts } = config;
        let client = HttpPeerClient::new(node.bank_code.clone(), node.peers.clone(), timeouts)
            .map_err(|err| ServiceError::PeerClient(err.to_string()))?;
        let node = BankNode::bootstrap(node, NodeSeams::new(Arc::new(client))).await?;
        Ok(Self::with_node(Arc::new(node)))
    }

    pub fn with_node(node: Arc<BankNode>) -> Self {
        Self { node }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/accounts", post(open_account))
        .route("/v1/accounts/:account_number", get(get_account))
        .route("/v1/accounts/:account_number/close", post(close_account))
        .route(
            "/v1/accounts/:account_number/transactions",
            get(list_transactions),
        )
        .route("/v1/payments", post(create_payment).get(list_payments))
        .route("/v1/payments/:payment_id", get(get_payment))
        .route("/v1/capital", get(capital))
        .route("/v1/interbank/transfers", get(list_transfers))
        .route("/v1/interbank/receive", post(receive_settlement))
        .route("/v1/interbank/accounts/:account_number", get(probe_account))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core error: {0}")]
    Core(#[from] BankError),
    #[error("peer client setup failed: {0}")]
    PeerClient(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] BankError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

fn status_of(err: &BankError) -> StatusCode {
    match err {
        BankError::SourceAccountNotFound(_)
        | BankError::DestinationAccountNotFound(_)
        | BankError::AccountNotFound(_)
        | BankError::PaymentNotFound(_) => StatusCode::NOT_FOUND,
        BankError::AccountExists(_)
        | BankError::DuplicateTransfer(_)
        | BankError::InvalidTransition { .. } => StatusCode::CONFLICT,
        BankError::Unauthorized(_) => StatusCode::FORBIDDEN,
        BankError::AccountClosed(_)
        | BankError::AccountNotEmpty { .. }
        | BankError::InsufficientFunds { .. }
        | BankError::InvalidAmount(_)
        | BankError::CurrencyMismatch { .. }
        | BankError::SameAccount
        | BankError::Protocol(_) => StatusCode::BAD_REQUEST,
        BankError::StageViolation { .. } | BankError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => {
                let status = status_of(&err);
                if status.is_server_error() {
                    warn!(error = %err, "request failed");
                }
                (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    bank_code: String,
    storage_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "interbank-service",
        bank_code: state.node.bank_code().to_string(),
        storage_backend: state.node.storage_backend(),
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct OpenAccountBody {
    account_number: String,
    client_id: String,
    currency: Option<String>,
    #[serde(default)]
    opening_balance: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreatePaymentBody {
    source_account: String,
    destination_account: String,
    amount: Decimal,
    currency: Option<String>,
    #[serde(default)]
    description: String,
    consent_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PageQuery {
    limit: Option<usize>,
}

impl PageQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransactionsResponse {
    account_number: String,
    items: Vec<Transaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentsResponse {
    items: Vec<PaymentOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransfersResponse {
    items: Vec<InterbankTransfer>,
}

async fn open_account(
    State(state): State<ServiceState>,
    body: Result<Json<OpenAccountBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Account>), ApiError> {
    let Json(body) = body?;
    let account = state
        .node
        .open_account(
            &body.account_number,
            &body.client_id,
            body.currency.as_deref(),
            body.opening_balance,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn get_account(
    State(state): State<ServiceState>,
    Path(account_number): Path<String>,
) -> Result<Json<Account>, ApiError> {
    Ok(Json(state.node.account(&account_number).await?))
}

async fn close_account(
    State(state): State<ServiceState>,
    Path(account_number): Path<String>,
) -> Result<Json<Account>, ApiError> {
    Ok(Json(state.node.close_account(&account_number).await?))
}

async fn list_transactions(
    State(state): State<ServiceState>,
    Path(account_number): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let items = state
        .node
        .transactions(&account_number, page.limit())
        .await?;
    Ok(Json(TransactionsResponse {
        account_number,
        items,
    }))
}

async fn create_payment(
    State(state): State<ServiceState>,
    body: Result<Json<CreatePaymentBody>, JsonRejection>,
) -> Result<(StatusCode, Json<PaymentOutcome>), ApiError> {
    let Json(body) = body?;
    let currency = body
        .currency
        .unwrap_or_else(|| state.node.config().default_currency.clone());
    let mut request = PaymentRequest::new(
        body.source_account,
        body.destination_account,
        body.amount,
        currency,
    )
    .with_description(body.description);
    if let Some(consent_id) = body.consent_id {
        request = request.with_consent(consent_id);
    }

    let outcome = state.node.create_payment(request).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn list_payments(
    State(state): State<ServiceState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<PaymentsResponse>, ApiError> {
    Ok(Json(PaymentsResponse {
        items: state.node.payments(page.limit()).await?,
    }))
}

async fn get_payment(
    State(state): State<ServiceState>,
    Path(payment_id): Path<String>,
) -> Result<Json<PaymentOutcome>, ApiError> {
    Ok(Json(state.node.payment(&payment_id).await?))
}

async fn capital(State(state): State<ServiceState>) -> Result<Json<CapitalReport>, ApiError> {
    Ok(Json(state.node.capital_report().await?))
}

async fn list_transfers(
    State(state): State<ServiceState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<TransfersResponse>, ApiError> {
    Ok(Json(TransfersResponse {
        items: state.node.transfers(page.limit()).await?,
    }))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn receive_settlement(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<SettlementRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SettlementResponse>), ApiError> {
    check_version(header(&headers, PROTOCOL_HEADER))?;
    let Json(request) = body?;

    match header(&headers, REQUESTING_BANK_HEADER) {
        Some(bank) if bank == request.from_bank.as_str() => {}
        Some(bank) => {
            return Err(ApiError::bad_request(format!(
                "{REQUESTING_BANK_HEADER} '{bank}' does not match from_bank '{}'",
                request.from_bank
            )))
        }
        None => {
            return Err(ApiError::bad_request(format!(
                "missing {REQUESTING_BANK_HEADER} header"
            )))
        }
    }

    let receipt = state.node.receive_settlement(request).await?;
    let status = if receipt.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(receipt.response)))
}

async fn probe_account(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(account_number): Path<String>,
) -> Result<Response, ApiError> {
    check_version(header(&headers, PROTOCOL_HEADER))?;
    let probe = state.node.probe_account(&account_number).await?;
    info!(
        account = %account_number,
        requester = header(&headers, REQUESTING_BANK_HEADER).unwrap_or("unknown"),
        exists = probe.exists,
        "account probe"
    );

    let status = if probe.exists {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((status, Json(probe)).into_response())
}
