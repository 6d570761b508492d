//! Versioned peer-to-peer wire contract.
//!
//! Bodies are strict: unknown fields are rejected instead of guessed at, and
//! amounts travel as decimal strings.

use crate::error::BankError;
use crate::types::{check_amount, BankCode, InterbankTransfer};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u16 = 1;
pub const PROTOCOL_HEADER: &str = "x-interbank-protocol";
pub const REQUESTING_BANK_HEADER: &str = "x-requesting-bank";
pub const RECEIVE_PATH: &str = "/v1/interbank/receive";
pub const PROBE_PATH_PREFIX: &str = "/v1/interbank/accounts";

/// Validate the protocol header of an inbound peer request.
pub fn check_version(header: Option<&str>) -> Result<(), BankError> {
    match header.map(str::trim) {
        None => Err(BankError::Protocol(format!(
            "missing {PROTOCOL_HEADER} header"
        ))),
        Some(value) if value == PROTOCOL_VERSION.to_string() => Ok(()),
        Some(other) => Err(BankError::Protocol(format!(
            "unsupported protocol version '{other}', expected {PROTOCOL_VERSION}"
        ))),
    }
}

/// Request asking a peer to credit one of its accounts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SettlementRequest {
    pub transfer_id: String,
    pub from_bank: BankCode,
    pub to_account_number: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub description: String,
}

impl SettlementRequest {
    pub fn for_transfer(transfer: &InterbankTransfer, description: impl Into<String>) -> Self {
        Self {
            transfer_id: transfer.transfer_id.clone(),
            from_bank: transfer.from_bank.clone(),
            to_account_number: transfer.to_account_number.clone(),
            amount: transfer.amount,
            currency: transfer.currency.clone(),
            description: description.into(),
        }
    }

    pub fn validate(&self) -> Result<(), BankError> {
        if self.transfer_id.trim().is_empty() {
            return Err(BankError::Protocol("transfer_id must not be empty".to_string()));
        }
        if self.from_bank.as_str().trim().is_empty() {
            return Err(BankError::Protocol("from_bank must not be empty".to_string()));
        }
        if self.to_account_number.trim().is_empty() {
            return Err(BankError::Protocol(
                "to_account_number must not be empty".to_string(),
            ));
        }
        if self.currency.trim().is_empty() {
            return Err(BankError::Protocol("currency must not be empty".to_string()));
        }
        check_amount("settlement", self.amount)
    }

    /// Content digest used to tell a replay from a conflicting reuse of the
    /// same transfer id.
    pub fn digest(&self) -> String {
        let material = serde_json::json!({
            "transfer_id": self.transfer_id,
            "from_bank": self.from_bank,
            "to_account_number": self.to_account_number,
            "amount": self.amount.normalize().to_string(),
            "currency": self.currency,
            "description": self.description,
        });

        let bytes = serde_json::to_vec(&material).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SettlementResponse {
    pub success: bool,
    pub transfer_id: String,
    pub message: String,
    pub credited_at: Option<DateTime<Utc>>,
}

/// Existence answer for routing. Never carries a balance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AccountProbe {
    pub exists: bool,
    pub account_number: String,
    pub bank_code: BankCode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> SettlementRequest {
        SettlementRequest {
            transfer_id: "transfer-abc123def456".to_string(),
            from_bank: BankCode::new("vbank"),
            to_account_number: "40817810099910001234".to_string(),
            amount: dec!(5000.00),
            currency: "RUB".to_string(),
            description: "invoice 17".to_string(),
        }
    }

    #[test]
    fn amount_travels_as_decimal_string() {
        let value = serde_json::to_value(request()).unwrap();
        assert_eq!(value["amount"], serde_json::json!("5000.00"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let body = serde_json::json!({
            "transfer_id": "t-1",
            "from_bank": "vbank",
            "to_account_number": "acc",
            "amount": "10",
            "currency": "RUB",
            "toAccount": "acc"
        });
        assert!(serde_json::from_value::<SettlementRequest>(body).is_err());
    }

    #[test]
    fn numeric_amount_is_rejected() {
        let body = serde_json::json!({
            "transfer_id": "t-1",
            "from_bank": "vbank",
            "to_account_number": "acc",
            "amount": 10,
            "currency": "RUB"
        });
        assert!(serde_json::from_value::<SettlementRequest>(body).is_err());
    }

    #[test]
    fn digest_ignores_trailing_zeros_but_not_content() {
        let a = request();
        let mut b = request();
        b.amount = dec!(5000);
        assert_eq!(a.digest(), b.digest());

        b.to_account_number = "40817810099910009999".to_string();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn version_header_is_required() {
        assert!(check_version(Some("1")).is_ok());
        assert!(check_version(None).is_err());
        assert!(check_version(Some("2")).is_err());
    }

    #[test]
    fn validate_rejects_non_positive_amount() {
        let mut req = request();
        req.amount = dec!(0);
        assert!(matches!(req.validate(), Err(BankError::InvalidAmount(_))));
    }

    #[test]
    fn validate_rejects_oversized_and_overprecise_amounts() {
        let mut req = request();
        req.amount = Decimal::MAX;
        assert!(matches!(req.validate(), Err(BankError::InvalidAmount(_))));

        let mut req = request();
        req.amount = dec!(10.005);
        assert!(matches!(req.validate(), Err(BankError::InvalidAmount(_))));
    }
}
