use crate::error::BankError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Short code identifying one independently operated bank node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BankCode(String);

impl BankCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BankCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BankCode {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

pub(crate) fn short_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &hex[..12])
}

/// Largest amount a single payment or settlement may move.
pub const MAX_AMOUNT: i64 = 1_000_000_000_000_000;
/// Money is kept to kopeck/cent precision.
pub const MAX_AMOUNT_SCALE: u32 = 2;

/// Range and precision check shared by payments and inbound settlements.
pub fn check_amount(context: &str, amount: Decimal) -> Result<(), BankError> {
    if amount <= Decimal::ZERO {
        return Err(BankError::InvalidAmount(format!(
            "{context} amount must be positive, got {amount}"
        )));
    }
    if amount > Decimal::from(MAX_AMOUNT) {
        return Err(BankError::InvalidAmount(format!(
            "{context} amount {amount} exceeds the limit of {MAX_AMOUNT}"
        )));
    }
    if amount.normalize().scale() > MAX_AMOUNT_SCALE {
        return Err(BankError::InvalidAmount(format!(
            "{context} amount {amount} has more than {MAX_AMOUNT_SCALE} decimal places"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Closed,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BankError> {
        match value {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(BankError::Storage(format!("unknown account status '{other}'"))),
        }
    }
}

/// Customer account held by this node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub account_number: String,
    pub client_id: String,
    pub currency: String,
    pub balance: Decimal,
    pub status: AccountStatus,
    pub opened_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        account_number: impl Into<String>,
        client_id: impl Into<String>,
        currency: impl Into<String>,
        opening_balance: Decimal,
    ) -> Self {
        Self {
            account_number: account_number.into(),
            client_id: client_id.into(),
            currency: currency.into(),
            balance: opening_balance,
            status: AccountStatus::Active,
            opened_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionDirection {
    Debit,
    Credit,
}

impl TransactionDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BankError> {
        match value {
            "debit" => Ok(Self::Debit),
            "credit" => Ok(Self::Credit),
            other => Err(BankError::Storage(format!(
                "unknown transaction direction '{other}'"
            ))),
        }
    }
}

/// Immutable journal entry. `balance_after` is the post-operation snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub transaction_id: String,
    pub account_number: String,
    pub direction: TransactionDirection,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub description: String,
    pub counterparty: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaymentStatus {
    #[serde(rename = "AcceptedSettlementInProcess")]
    InProcess,
    #[serde(rename = "AcceptedSettlementCompleted")]
    Completed,
    #[serde(rename = "Rejected")]
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProcess => "AcceptedSettlementInProcess",
            Self::Completed => "AcceptedSettlementCompleted",
            Self::Rejected => "Rejected",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BankError> {
        match value {
            "AcceptedSettlementInProcess" => Ok(Self::InProcess),
            "AcceptedSettlementCompleted" => Ok(Self::Completed),
            "Rejected" => Ok(Self::Rejected),
            other => Err(BankError::Storage(format!("unknown payment status '{other}'"))),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProcess)
    }
}

/// Why a payment ended `Rejected` after its debit was committed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    NoRouteFound,
    PeerRejected,
    PeerTimeout,
    PeerTransportError,
}

impl RejectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoRouteFound => "no_route_found",
            Self::PeerRejected => "peer_rejected",
            Self::PeerTimeout => "peer_timeout",
            Self::PeerTransportError => "peer_transport_error",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BankError> {
        match value {
            "no_route_found" => Ok(Self::NoRouteFound),
            "peer_rejected" => Ok(Self::PeerRejected),
            "peer_timeout" => Ok(Self::PeerTimeout),
            "peer_transport_error" => Ok(Self::PeerTransportError),
            other => Err(BankError::Storage(format!("unknown rejection kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub detail: String,
}

/// One transfer intent, tracked end to end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub payment_id: String,
    pub source_account: String,
    pub destination_account: String,
    pub destination_bank: Option<BankCode>,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub consent_id: Option<String>,
    pub status: PaymentStatus,
    pub rejection: Option<Rejection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn from_request(request: &PaymentRequest) -> Self {
        let now = Utc::now();
        Self {
            payment_id: short_id("pay"),
            source_account: request.source_account.clone(),
            destination_account: request.destination_account.clone(),
            destination_bank: None,
            amount: request.amount,
            currency: request.currency.clone(),
            description: request.description.clone(),
            consent_id: request.consent_id.clone(),
            status: PaymentStatus::InProcess,
            rejection: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Terminal states are final; a second transition is refused.
    pub fn complete(&mut self) -> Result<(), BankError> {
        self.transition(PaymentStatus::Completed)?;
        Ok(())
    }

    pub fn reject(&mut self, kind: RejectionKind, detail: impl Into<String>) -> Result<(), BankError> {
        self.transition(PaymentStatus::Rejected)?;
        self.rejection = Some(Rejection {
            kind,
            detail: detail.into(),
        });
        Ok(())
    }

    fn transition(&mut self, next: PaymentStatus) -> Result<(), BankError> {
        if self.status.is_terminal() {
            return Err(BankError::InvalidTransition {
                id: self.payment_id.clone(),
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Processing,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BankError> {
        match value {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(BankError::Storage(format!("unknown transfer status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

impl TransferDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BankError> {
        match value {
            "outgoing" => Ok(Self::Outgoing),
            "incoming" => Ok(Self::Incoming),
            other => Err(BankError::Storage(format!(
                "unknown transfer direction '{other}'"
            ))),
        }
    }
}

/// Cross-node leg of a payment. `transfer_id` is the receiver's idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterbankTransfer {
    pub transfer_id: String,
    pub payment_id: Option<String>,
    pub direction: TransferDirection,
    pub from_bank: BankCode,
    pub to_bank: BankCode,
    pub to_account_number: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransferStatus,
    pub request_digest: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl InterbankTransfer {
    pub fn outgoing(payment: &Payment, from_bank: BankCode, to_bank: BankCode) -> Self {
        Self {
            transfer_id: short_id("transfer"),
            payment_id: Some(payment.payment_id.clone()),
            direction: TransferDirection::Outgoing,
            from_bank,
            to_bank,
            to_account_number: payment.destination_account.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            status: TransferStatus::Processing,
            request_digest: None,
            failure_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn mark_completed(&mut self) -> Result<(), BankError> {
        self.finish(TransferStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), BankError> {
        self.finish(TransferStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    fn finish(&mut self, next: TransferStatus) -> Result<(), BankError> {
        if self.status != TransferStatus::Processing {
            return Err(BankError::InvalidTransition {
                id: self.transfer_id.clone(),
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Bank-level capital row; one per bank code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BankCapital {
    pub bank_code: BankCode,
    pub capital: Decimal,
    pub initial_capital: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Client-facing payment instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub source_account: String,
    pub destination_account: String,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub consent_id: Option<String>,
}

impl PaymentRequest {
    pub fn new(
        source_account: impl Into<String>,
        destination_account: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            source_account: source_account.into(),
            destination_account: destination_account.into(),
            amount,
            currency: currency.into(),
            description: String::new(),
            consent_id: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_consent(mut self, consent_id: impl Into<String>) -> Self {
        self.consent_id = Some(consent_id.into());
        self
    }
}

/// Terminal view of a saga run returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub payment: Payment,
    pub transfer: Option<InterbankTransfer>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn amount_check_bounds_range_and_precision() {
        assert!(check_amount("payment", dec!(5000.00)).is_ok());
        assert!(check_amount("payment", dec!(0.010)).is_ok());
        assert!(check_amount("payment", dec!(0)).is_err());
        assert!(check_amount("payment", dec!(0.001)).is_err());
        assert!(check_amount("payment", Decimal::MAX).is_err());
        assert!(check_amount("payment", Decimal::from(MAX_AMOUNT)).is_ok());
    }

    #[test]
    fn payment_terminal_state_is_final() {
        let request = PaymentRequest::new("40817810000000000001", "40817810000000000002", dec!(10), "RUB");
        let mut payment = Payment::from_request(&request);
        assert!(payment.payment_id.starts_with("pay-"));
        assert_eq!(payment.payment_id.len(), "pay-".len() + 12);

        payment.complete().unwrap();
        let err = payment
            .reject(RejectionKind::PeerRejected, "late")
            .unwrap_err();
        assert!(matches!(err, BankError::InvalidTransition { .. }));
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert!(payment.rejection.is_none());
    }

    #[test]
    fn payment_status_uses_settlement_names_on_the_wire() {
        let value = serde_json::to_value(PaymentStatus::InProcess).unwrap();
        assert_eq!(value, serde_json::json!("AcceptedSettlementInProcess"));
        assert_eq!(
            PaymentStatus::parse("AcceptedSettlementCompleted").unwrap(),
            PaymentStatus::Completed
        );
    }

    #[test]
    fn transfer_leaves_processing_only_once() {
        let request = PaymentRequest::new("a", "b", dec!(5), "RUB");
        let payment = Payment::from_request(&request);
        let mut transfer =
            InterbankTransfer::outgoing(&payment, BankCode::new("vbank"), BankCode::new("abank"));
        assert!(transfer.transfer_id.starts_with("transfer-"));

        transfer.mark_failed("peer down").unwrap();
        assert!(transfer.mark_completed().is_err());
        assert_eq!(transfer.status, TransferStatus::Failed);
        assert!(transfer.completed_at.is_none());
    }
}
