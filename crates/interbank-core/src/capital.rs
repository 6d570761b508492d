use crate::error::BankError;
use crate::storage::{BankStore, CapitalAdjustment, LedgerWrite};
use crate::types::{BankCapital, BankCode};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Capital figure set against the sum of local balances.
///
/// `drift = capital - total_balances`. The invariant is monitored, not enforced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalReport {
    pub bank_code: BankCode,
    pub capital: Decimal,
    pub initial_capital: Decimal,
    pub net_flow: Decimal,
    pub total_balances: Decimal,
    pub drift: Decimal,
    pub balanced: bool,
    pub updated_at: DateTime<Utc>,
}

/// Capital Ledger for one bank identity.
#[derive(Debug, Clone)]
pub struct CapitalLedger {
    store: Arc<BankStore>,
    bank_code: BankCode,
    initial_capital: Decimal,
    tolerance: Decimal,
}

impl CapitalLedger {
    pub fn new(
        store: Arc<BankStore>,
        bank_code: BankCode,
        initial_capital: Decimal,
        tolerance: Decimal,
    ) -> Self {
        Self {
            store,
            bank_code,
            initial_capital,
            tolerance,
        }
    }

    pub fn bank_code(&self) -> &BankCode {
        &self.bank_code
    }

    /// Build the write for a capital change, to be committed together with
    /// the status writes it accompanies.
    pub fn adjustment(&self, delta: Decimal, reason: impl Into<String>) -> LedgerWrite {
        LedgerWrite::AdjustCapital(CapitalAdjustment {
            bank_code: self.bank_code.clone(),
            delta,
            initial_capital: self.initial_capital,
            reason: reason.into(),
        })
    }

    pub async fn adjust_capital(
        &self,
        delta: Decimal,
        reason: impl Into<String>,
    ) -> Result<BankCapital, BankError> {
        let receipt = self.store.commit(vec![self.adjustment(delta, reason)]).await?;
        receipt
            .capital
            .into_iter()
            .next()
            .ok_or_else(|| BankError::Storage("capital adjustment produced no row".to_string()))
    }

    /// Materialize the baseline row if it does not exist yet.
    pub async fn ensure_row(&self) -> Result<BankCapital, BankError> {
        match self.store.capital(&self.bank_code).await? {
            Some(row) => Ok(row),
            None => self.adjust_capital(Decimal::ZERO, "baseline").await,
        }
    }

    pub async fn current(&self) -> Result<BankCapital, BankError> {
        Ok(self
            .store
            .capital(&self.bank_code)
            .await?
            .unwrap_or_else(|| BankCapital {
                bank_code: self.bank_code.clone(),
                capital: self.initial_capital,
                initial_capital: self.initial_capital,
                updated_at: Utc::now(),
            }))
    }

    pub async fn report(&self) -> Result<CapitalReport, BankError> {
        let row = self.current().await?;
        let total_balances = self.store.total_balances().await?;
        let drift = row.capital - total_balances;

        Ok(CapitalReport {
            bank_code: row.bank_code,
            capital: row.capital,
            initial_capital: row.initial_capital,
            net_flow: row.capital - row.initial_capital,
            total_balances,
            drift,
            balanced: drift.abs() <= self.tolerance,
            updated_at: row.updated_at,
        })
    }
}
