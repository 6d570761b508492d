use crate::error::BankError;
use crate::storage::{BankStore, LedgerWrite, Posting};
use crate::types::{Account, Transaction};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Ledger Store: the only component that mutates accounts and the journal.
///
/// Single-posting operations commit on their own; callers that need several
/// postings to land together (intra-node transfer, saga steps) build one
/// [`LedgerWrite`] batch with [`Ledger::debit_write`]/[`Ledger::credit_write`]
/// and commit it through the store.
#[derive(Debug, Clone)]
pub struct Ledger {
    store: Arc<BankStore>,
}

impl Ledger {
    pub fn new(store: Arc<BankStore>) -> Self {
        Self { store }
    }

    pub async fn open_account(&self, account: Account) -> Result<Account, BankError> {
        self.store
            .commit(vec![LedgerWrite::OpenAccount(account.clone())])
            .await?;
        Ok(account)
    }

    pub async fn close_account(&self, account_number: &str) -> Result<Account, BankError> {
        self.store
            .commit(vec![LedgerWrite::CloseAccount {
                account_number: account_number.to_string(),
            }])
            .await?;
        self.store
            .account(account_number)
            .await?
            .ok_or_else(|| BankError::AccountNotFound(account_number.to_string()))
    }

    /// Local lookup. `Ok(None)` is a definitive answer that triggers routing.
    pub async fn resolve_local(&self, account_number: &str) -> Result<Option<Account>, BankError> {
        self.store.account(account_number).await
    }

    pub async fn debit(
        &self,
        account_number: &str,
        amount: Decimal,
        description: &str,
    ) -> Result<Transaction, BankError> {
        self.single(Self::debit_write(Posting::new(account_number, amount, description)))
            .await
    }

    pub async fn credit(
        &self,
        account_number: &str,
        amount: Decimal,
        description: &str,
    ) -> Result<Transaction, BankError> {
        self.single(Self::credit_write(Posting::new(account_number, amount, description)))
            .await
    }

    pub async fn transactions(
        &self,
        account_number: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>, BankError> {
        if self.store.account(account_number).await?.is_none() {
            return Err(BankError::AccountNotFound(account_number.to_string()));
        }
        self.store.transactions(account_number, limit).await
    }

    pub fn debit_write(posting: Posting) -> LedgerWrite {
        LedgerWrite::Debit(posting)
    }

    pub fn credit_write(posting: Posting) -> LedgerWrite {
        LedgerWrite::Credit(posting)
    }

    async fn single(&self, write: LedgerWrite) -> Result<Transaction, BankError> {
        let receipt = self.store.commit(vec![write]).await?;
        receipt
            .transactions
            .into_iter()
            .next()
            .ok_or_else(|| BankError::Storage("posting produced no journal entry".to_string()))
    }
}
