use crate::error::BankError;
use crate::types::{
    Account, AccountStatus, BankCapital, BankCode, InterbankTransfer, Payment, PaymentStatus,
    Rejection, RejectionKind, Transaction, TransactionDirection, TransferDirection,
    TransferStatus,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Persistence backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// Keep all node state in process memory only.
    #[default]
    Memory,
    /// Persist node state in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Balance movement against one account.
#[derive(Debug, Clone)]
pub struct Posting {
    pub account_number: String,
    pub amount: Decimal,
    pub description: String,
    pub counterparty: Option<String>,
}

impl Posting {
    pub fn new(
        account_number: impl Into<String>,
        amount: Decimal,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_number: account_number.into(),
            amount,
            description: description.into(),
            counterparty: None,
        }
    }

    pub fn with_counterparty(mut self, counterparty: impl Into<String>) -> Self {
        self.counterparty = Some(counterparty.into());
        self
    }
}

/// Signed change to a bank's capital row. The row is created at
/// `initial_capital` when absent.
#[derive(Debug, Clone)]
pub struct CapitalAdjustment {
    pub bank_code: BankCode,
    pub delta: Decimal,
    pub initial_capital: Decimal,
    pub reason: String,
}

/// One step of an all-or-nothing write batch.
#[derive(Debug, Clone)]
pub enum LedgerWrite {
    OpenAccount(Account),
    CloseAccount { account_number: String },
    Debit(Posting),
    Credit(Posting),
    AdjustCapital(CapitalAdjustment),
    InsertPayment(Payment),
    UpdatePayment(Payment),
    InsertTransfer(InterbankTransfer),
    UpdateTransfer(InterbankTransfer),
}

/// Rows produced by a committed batch, in write order.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    pub transactions: Vec<Transaction>,
    pub capital: Vec<BankCapital>,
}

fn validate_amount(posting: &Posting) -> Result<(), BankError> {
    if posting.amount <= Decimal::ZERO {
        return Err(BankError::InvalidAmount(format!(
            "posting amount must be positive, got {}",
            posting.amount
        )));
    }
    Ok(())
}

fn overflow(account: &str, amount: Decimal) -> BankError {
    BankError::InvalidAmount(format!(
        "applying {amount} to '{account}' overflows the balance"
    ))
}

fn next_capital(current: Decimal, adjustment: &CapitalAdjustment) -> Result<Decimal, BankError> {
    current.checked_add(adjustment.delta).ok_or_else(|| {
        BankError::InvalidAmount(format!(
            "capital change {} for '{}' overflows",
            adjustment.delta, adjustment.bank_code
        ))
    })
}

fn payment_is_open(stored: PaymentStatus, next: &Payment) -> Result<(), BankError> {
    if stored.is_terminal() {
        return Err(BankError::InvalidTransition {
            id: next.payment_id.clone(),
            from: stored.as_str().to_string(),
            to: next.status.as_str().to_string(),
        });
    }
    Ok(())
}

fn transfer_is_open(stored: TransferStatus, next: &InterbankTransfer) -> Result<(), BankError> {
    if stored != TransferStatus::Processing {
        return Err(BankError::InvalidTransition {
            id: next.transfer_id.clone(),
            from: stored.as_str().to_string(),
            to: next.status.as_str().to_string(),
        });
    }
    Ok(())
}

fn journal_entry(
    direction: TransactionDirection,
    posting: &Posting,
    balance_after: Decimal,
) -> Transaction {
    Transaction {
        transaction_id: crate::types::short_id("tx"),
        account_number: posting.account_number.clone(),
        direction,
        amount: posting.amount,
        balance_after,
        description: posting.description.clone(),
        counterparty: posting.counterparty.clone(),
        created_at: Utc::now(),
    }
}

#[derive(Debug)]
enum StoreBackend {
    Memory(MemoryStore),
    Postgres(PostgresStore),
}

/// Node state store. Every mutation goes through [`BankStore::commit`], which
/// applies a batch of [`LedgerWrite`]s atomically on either backend.
#[derive(Debug)]
pub struct BankStore {
    backend: StoreBackend,
}

impl BankStore {
    pub fn memory() -> Self {
        Self {
            backend: StoreBackend::Memory(MemoryStore::default()),
        }
    }

    pub async fn bootstrap(config: StorageConfig) -> Result<Self, BankError> {
        match config {
            StorageConfig::Memory => Ok(Self::memory()),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                Ok(Self {
                    backend: StoreBackend::Postgres(store),
                })
            }
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            StoreBackend::Memory(_) => "memory",
            StoreBackend::Postgres(_) => "postgres",
        }
    }

    pub async fn commit(&self, writes: Vec<LedgerWrite>) -> Result<CommitReceipt, BankError> {
        match &self.backend {
            StoreBackend::Memory(store) => store.commit(writes).await,
            StoreBackend::Postgres(store) => store.commit(writes).await,
        }
    }

    pub async fn account(&self, account_number: &str) -> Result<Option<Account>, BankError> {
        match &self.backend {
            StoreBackend::Memory(store) => {
                Ok(store.state.lock().await.accounts.get(account_number).cloned())
            }
            StoreBackend::Postgres(store) => store.account(account_number).await,
        }
    }

    /// Journal of one account, newest first.
    pub async fn transactions(
        &self,
        account_number: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>, BankError> {
        match &self.backend {
            StoreBackend::Memory(store) => {
                let state = store.state.lock().await;
                Ok(state
                    .journal
                    .iter()
                    .rev()
                    .filter(|tx| tx.account_number == account_number)
                    .take(limit)
                    .cloned()
                    .collect())
            }
            StoreBackend::Postgres(store) => store.transactions(account_number, limit).await,
        }
    }

    pub async fn total_balances(&self) -> Result<Decimal, BankError> {
        match &self.backend {
            StoreBackend::Memory(store) => {
                let state = store.state.lock().await;
                Ok(state.accounts.values().map(|account| account.balance).sum())
            }
            StoreBackend::Postgres(store) => store.total_balances().await,
        }
    }

    pub async fn payment(&self, payment_id: &str) -> Result<Option<Payment>, BankError> {
        match &self.backend {
            StoreBackend::Memory(store) => {
                Ok(store.state.lock().await.payments.get(payment_id).cloned())
            }
            StoreBackend::Postgres(store) => store.payment(payment_id).await,
        }
    }

    /// Payments newest first.
    pub async fn payments(&self, limit: usize) -> Result<Vec<Payment>, BankError> {
        match &self.backend {
            StoreBackend::Memory(store) => {
                let state = store.state.lock().await;
                let mut items: Vec<Payment> = state.payments.values().cloned().collect();
                items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                items.truncate(limit);
                Ok(items)
            }
            StoreBackend::Postgres(store) => store.payments(None, limit).await,
        }
    }

    pub async fn payments_in_process(&self) -> Result<Vec<Payment>, BankError> {
        match &self.backend {
            StoreBackend::Memory(store) => {
                let state = store.state.lock().await;
                let mut items: Vec<Payment> = state
                    .payments
                    .values()
                    .filter(|payment| payment.status == PaymentStatus::InProcess)
                    .cloned()
                    .collect();
                items.sort_by_key(|payment| payment.created_at);
                Ok(items)
            }
            StoreBackend::Postgres(store) => {
                let mut items = store
                    .payments(Some(PaymentStatus::InProcess), usize::MAX)
                    .await?;
                items.reverse();
                Ok(items)
            }
        }
    }

    pub async fn transfer(&self, transfer_id: &str) -> Result<Option<InterbankTransfer>, BankError> {
        match &self.backend {
            StoreBackend::Memory(store) => {
                Ok(store.state.lock().await.transfers.get(transfer_id).cloned())
            }
            StoreBackend::Postgres(store) => store.transfer_where("transfer_id", transfer_id).await,
        }
    }

    pub async fn transfer_for_payment(
        &self,
        payment_id: &str,
    ) -> Result<Option<InterbankTransfer>, BankError> {
        match &self.backend {
            StoreBackend::Memory(store) => Ok(store
                .state
                .lock()
                .await
                .transfers
                .values()
                .find(|transfer| transfer.payment_id.as_deref() == Some(payment_id))
                .cloned()),
            StoreBackend::Postgres(store) => store.transfer_where("payment_id", payment_id).await,
        }
    }

    /// Interbank transfers newest first.
    pub async fn transfers(&self, limit: usize) -> Result<Vec<InterbankTransfer>, BankError> {
        match &self.backend {
            StoreBackend::Memory(store) => {
                let state = store.state.lock().await;
                let mut items: Vec<InterbankTransfer> =
                    state.transfers.values().cloned().collect();
                items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                items.truncate(limit);
                Ok(items)
            }
            StoreBackend::Postgres(store) => store.transfers(limit).await,
        }
    }

    pub async fn capital(&self, bank_code: &BankCode) -> Result<Option<BankCapital>, BankError> {
        match &self.backend {
            StoreBackend::Memory(store) => Ok(store
                .state
                .lock()
                .await
                .capital
                .get(bank_code)
                .cloned()),
            StoreBackend::Postgres(store) => store.capital(bank_code).await,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    journal: Vec<Transaction>,
    payments: HashMap<String, Payment>,
    transfers: HashMap<String, InterbankTransfer>,
    capital: HashMap<BankCode, BankCapital>,
}

/// Inverse of one applied write; replayed in reverse when a batch fails.
enum Undo {
    Account(String, Option<Account>),
    Journal,
    Payment(String, Option<Payment>),
    Transfer(String, Option<InterbankTransfer>),
    Capital(BankCode, Option<BankCapital>),
}

#[derive(Debug, Default)]
struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    async fn commit(&self, writes: Vec<LedgerWrite>) -> Result<CommitReceipt, BankError> {
        let mut state = self.state.lock().await;
        let mut undo = Vec::with_capacity(writes.len() * 2);
        let mut receipt = CommitReceipt::default();

        for write in writes {
            if let Err(err) = state.apply(write, &mut undo, &mut receipt) {
                state.rollback(undo);
                return Err(err);
            }
        }

        Ok(receipt)
    }
}

impl MemoryState {
    fn apply(
        &mut self,
        write: LedgerWrite,
        undo: &mut Vec<Undo>,
        receipt: &mut CommitReceipt,
    ) -> Result<(), BankError> {
        match write {
            LedgerWrite::OpenAccount(account) => {
                if self.accounts.contains_key(&account.account_number) {
                    return Err(BankError::AccountExists(account.account_number));
                }
                if account.balance < Decimal::ZERO {
                    return Err(BankError::InvalidAmount(format!(
                        "opening balance must not be negative, got {}",
                        account.balance
                    )));
                }
                undo.push(Undo::Account(account.account_number.clone(), None));
                self.accounts.insert(account.account_number.clone(), account);
            }
            LedgerWrite::CloseAccount { account_number } => {
                let account = self
                    .accounts
                    .get_mut(&account_number)
                    .ok_or_else(|| BankError::AccountNotFound(account_number.clone()))?;
                if !account.balance.is_zero() {
                    return Err(BankError::AccountNotEmpty {
                        account: account_number,
                        balance: account.balance,
                    });
                }
                undo.push(Undo::Account(account_number, Some(account.clone())));
                account.status = AccountStatus::Closed;
            }
            LedgerWrite::Debit(posting) => {
                validate_amount(&posting)?;
                let account = self
                    .accounts
                    .get_mut(&posting.account_number)
                    .ok_or_else(|| BankError::AccountNotFound(posting.account_number.clone()))?;
                if !account.is_active() {
                    return Err(BankError::AccountClosed(posting.account_number));
                }
                if account.balance < posting.amount {
                    return Err(BankError::InsufficientFunds {
                        account: posting.account_number,
                        available: account.balance,
                        requested: posting.amount,
                    });
                }
                let balance_after = account
                    .balance
                    .checked_sub(posting.amount)
                    .ok_or_else(|| overflow(&posting.account_number, posting.amount))?;
                undo.push(Undo::Account(
                    posting.account_number.clone(),
                    Some(account.clone()),
                ));
                account.balance = balance_after;
                let entry = journal_entry(TransactionDirection::Debit, &posting, account.balance);
                undo.push(Undo::Journal);
                self.journal.push(entry.clone());
                receipt.transactions.push(entry);
            }
            LedgerWrite::Credit(posting) => {
                validate_amount(&posting)?;
                let account = self
                    .accounts
                    .get_mut(&posting.account_number)
                    .ok_or_else(|| BankError::AccountNotFound(posting.account_number.clone()))?;
                let balance_after = account
                    .balance
                    .checked_add(posting.amount)
                    .ok_or_else(|| overflow(&posting.account_number, posting.amount))?;
                undo.push(Undo::Account(
                    posting.account_number.clone(),
                    Some(account.clone()),
                ));
                account.balance = balance_after;
                let entry = journal_entry(TransactionDirection::Credit, &posting, account.balance);
                undo.push(Undo::Journal);
                self.journal.push(entry.clone());
                receipt.transactions.push(entry);
            }
            LedgerWrite::AdjustCapital(adjustment) => {
                let previous = self.capital.get(&adjustment.bank_code).cloned();
                let mut row = previous.clone().unwrap_or_else(|| BankCapital {
                    bank_code: adjustment.bank_code.clone(),
                    capital: adjustment.initial_capital,
                    initial_capital: adjustment.initial_capital,
                    updated_at: Utc::now(),
                });
                row.capital = next_capital(row.capital, &adjustment)?;
                row.updated_at = Utc::now();
                debug!(
                    bank = %adjustment.bank_code,
                    delta = %adjustment.delta,
                    reason = %adjustment.reason,
                    "capital adjusted"
                );
                undo.push(Undo::Capital(adjustment.bank_code.clone(), previous));
                self.capital.insert(adjustment.bank_code, row.clone());
                receipt.capital.push(row);
            }
            LedgerWrite::InsertPayment(payment) => {
                if self.payments.contains_key(&payment.payment_id) {
                    return Err(BankError::Storage(format!(
                        "payment '{}' already exists",
                        payment.payment_id
                    )));
                }
                undo.push(Undo::Payment(payment.payment_id.clone(), None));
                self.payments.insert(payment.payment_id.clone(), payment);
            }
            LedgerWrite::UpdatePayment(payment) => {
                let previous = self
                    .payments
                    .get(&payment.payment_id)
                    .cloned()
                    .ok_or_else(|| BankError::PaymentNotFound(payment.payment_id.clone()))?;
                payment_is_open(previous.status, &payment)?;
                undo.push(Undo::Payment(payment.payment_id.clone(), Some(previous)));
                self.payments.insert(payment.payment_id.clone(), payment);
            }
            LedgerWrite::InsertTransfer(transfer) => {
                if self.transfers.contains_key(&transfer.transfer_id) {
                    return Err(BankError::DuplicateTransfer(transfer.transfer_id));
                }
                undo.push(Undo::Transfer(transfer.transfer_id.clone(), None));
                self.transfers.insert(transfer.transfer_id.clone(), transfer);
            }
            LedgerWrite::UpdateTransfer(transfer) => {
                let previous = self
                    .transfers
                    .get(&transfer.transfer_id)
                    .cloned()
                    .ok_or_else(|| {
                        BankError::Storage(format!(
                            "transfer '{}' not found",
                            transfer.transfer_id
                        ))
                    })?;
                transfer_is_open(previous.status, &transfer)?;
                undo.push(Undo::Transfer(transfer.transfer_id.clone(), Some(previous)));
                self.transfers.insert(transfer.transfer_id.clone(), transfer);
            }
        }
        Ok(())
    }

    fn rollback(&mut self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::Account(number, Some(previous)) => {
                    self.accounts.insert(number, previous);
                }
                Undo::Account(number, None) => {
                    self.accounts.remove(&number);
                }
                Undo::Journal => {
                    self.journal.pop();
                }
                Undo::Payment(id, Some(previous)) => {
                    self.payments.insert(id, previous);
                }
                Undo::Payment(id, None) => {
                    self.payments.remove(&id);
                }
                Undo::Transfer(id, Some(previous)) => {
                    self.transfers.insert(id, previous);
                }
                Undo::Transfer(id, None) => {
                    self.transfers.remove(&id);
                }
                Undo::Capital(code, Some(previous)) => {
                    self.capital.insert(code, previous);
                }
                Undo::Capital(code, None) => {
                    self.capital.remove(&code);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct PostgresStore {
    pool: PgPool,
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, BankError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| BankError::storage(&format!("postgres decode {name} failed"), e))
}

const ACCOUNT_COLUMNS: &str =
    "account_number, client_id, currency, balance, status, opened_at";
const TRANSACTION_COLUMNS: &str = "transaction_id, account_number, direction, amount, \
     balance_after, description, counterparty, created_at";
const PAYMENT_COLUMNS: &str = "payment_id, source_account, destination_account, \
     destination_bank, amount, currency, description, consent_id, status, rejection_kind, \
     rejection_detail, created_at, updated_at";
const TRANSFER_COLUMNS: &str = "transfer_id, payment_id, direction, from_bank, to_bank, \
     to_account_number, amount, currency, status, request_digest, failure_reason, created_at, \
     completed_at";

impl PostgresStore {
    async fn connect(database_url: &str, max_connections: u32) -> Result<Self, BankError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| BankError::storage("postgres connect failed", e))?;

        Ok(Self { pool })
    }

    async fn ensure_schema(&self) -> Result<(), BankError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS bank_accounts (
                account_number TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                currency TEXT NOT NULL,
                balance NUMERIC NOT NULL CHECK (balance >= 0),
                status TEXT NOT NULL,
                opened_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS bank_transactions (
                seq BIGSERIAL PRIMARY KEY,
                transaction_id TEXT NOT NULL UNIQUE,
                account_number TEXT NOT NULL REFERENCES bank_accounts (account_number),
                direction TEXT NOT NULL,
                amount NUMERIC NOT NULL,
                balance_after NUMERIC NOT NULL,
                description TEXT NOT NULL,
                counterparty TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_bank_transactions_account ON bank_transactions (account_number)",
            r#"
            CREATE TABLE IF NOT EXISTS payments (
                payment_id TEXT PRIMARY KEY,
                source_account TEXT NOT NULL,
                destination_account TEXT NOT NULL,
                destination_bank TEXT NULL,
                amount NUMERIC NOT NULL,
                currency TEXT NOT NULL,
                description TEXT NOT NULL,
                consent_id TEXT NULL,
                status TEXT NOT NULL,
                rejection_kind TEXT NULL,
                rejection_detail TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_payments_status ON payments (status)",
            r#"
            CREATE TABLE IF NOT EXISTS interbank_transfers (
                transfer_id TEXT PRIMARY KEY,
                payment_id TEXT NULL,
                direction TEXT NOT NULL,
                from_bank TEXT NOT NULL,
                to_bank TEXT NOT NULL,
                to_account_number TEXT NOT NULL,
                amount NUMERIC NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL,
                request_digest TEXT NULL,
                failure_reason TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_interbank_transfers_payment ON interbank_transfers (payment_id)",
            r#"
            CREATE TABLE IF NOT EXISTS bank_capital (
                bank_code TEXT PRIMARY KEY,
                capital NUMERIC NOT NULL,
                initial_capital NUMERIC NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| BankError::storage("postgres schema create failed", e))?;
        }

        Ok(())
    }

    async fn commit(&self, writes: Vec<LedgerWrite>) -> Result<CommitReceipt, BankError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BankError::storage("postgres begin failed", e))?;
        let mut receipt = CommitReceipt::default();

        // Dropping `tx` on an early return rolls the whole batch back.
        for write in writes {
            apply_pg(&mut *tx, write, &mut receipt).await?;
        }

        tx.commit()
            .await
            .map_err(|e| BankError::storage("postgres commit failed", e))?;
        Ok(receipt)
    }

    async fn account(&self, account_number: &str) -> Result<Option<Account>, BankError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM bank_accounts WHERE account_number = $1"
        ))
        .bind(account_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BankError::storage("postgres account load failed", e))?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn transactions(
        &self,
        account_number: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>, BankError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM bank_transactions \
             WHERE account_number = $1 ORDER BY seq DESC LIMIT $2"
        ))
        .bind(account_number)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BankError::storage("postgres journal load failed", e))?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn total_balances(&self) -> Result<Decimal, BankError> {
        let row = sqlx::query("SELECT COALESCE(SUM(balance), 0) AS total FROM bank_accounts")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BankError::storage("postgres balance sum failed", e))?;
        column(&row, "total")
    }

    async fn payment(&self, payment_id: &str) -> Result<Option<Payment>, BankError> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BankError::storage("postgres payment load failed", e))?;

        row.as_ref().map(payment_from_row).transpose()
    }

    async fn payments(
        &self,
        status: Option<PaymentStatus>,
        limit: usize,
    ) -> Result<Vec<Payment>, BankError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(status.map(PaymentStatus::as_str))
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BankError::storage("postgres payment list failed", e))?;

        rows.iter().map(payment_from_row).collect()
    }

    async fn transfer_where(
        &self,
        key: &'static str,
        value: &str,
    ) -> Result<Option<InterbankTransfer>, BankError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM interbank_transfers WHERE {key} = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BankError::storage("postgres transfer load failed", e))?;

        row.as_ref().map(transfer_from_row).transpose()
    }

    async fn transfers(&self, limit: usize) -> Result<Vec<InterbankTransfer>, BankError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM interbank_transfers ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BankError::storage("postgres transfer list failed", e))?;

        rows.iter().map(transfer_from_row).collect()
    }

    async fn capital(&self, bank_code: &BankCode) -> Result<Option<BankCapital>, BankError> {
        let row = sqlx::query(
            "SELECT bank_code, capital, initial_capital, updated_at FROM bank_capital WHERE bank_code = $1",
        )
        .bind(bank_code.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BankError::storage("postgres capital load failed", e))?;

        row.as_ref().map(capital_from_row).transpose()
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

async fn locked_account(
    conn: &mut PgConnection,
    account_number: &str,
) -> Result<Account, BankError> {
    let row = sqlx::query(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM bank_accounts WHERE account_number = $1 FOR UPDATE"
    ))
    .bind(account_number)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| BankError::storage("postgres account lock failed", e))?
    .ok_or_else(|| BankError::AccountNotFound(account_number.to_string()))?;

    account_from_row(&row)
}

async fn post_pg(
    conn: &mut PgConnection,
    direction: TransactionDirection,
    posting: &Posting,
    balance_after: Decimal,
    receipt: &mut CommitReceipt,
) -> Result<(), BankError> {
    sqlx::query("UPDATE bank_accounts SET balance = $1 WHERE account_number = $2")
        .bind(balance_after)
        .bind(&posting.account_number)
        .execute(&mut *conn)
        .await
        .map_err(|e| BankError::storage("postgres balance update failed", e))?;

    let entry = journal_entry(direction, posting, balance_after);
    sqlx::query(&format!(
        "INSERT INTO bank_transactions ({TRANSACTION_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
    ))
    .bind(&entry.transaction_id)
    .bind(&entry.account_number)
    .bind(entry.direction.as_str())
    .bind(entry.amount)
    .bind(entry.balance_after)
    .bind(&entry.description)
    .bind(&entry.counterparty)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| BankError::storage("postgres journal insert failed", e))?;

    receipt.transactions.push(entry);
    Ok(())
}

async fn apply_pg(
    conn: &mut PgConnection,
    write: LedgerWrite,
    receipt: &mut CommitReceipt,
) -> Result<(), BankError> {
    match write {
        LedgerWrite::OpenAccount(account) => {
            if account.balance < Decimal::ZERO {
                return Err(BankError::InvalidAmount(format!(
                    "opening balance must not be negative, got {}",
                    account.balance
                )));
            }
            let inserted = sqlx::query(&format!(
                "INSERT INTO bank_accounts ({ACCOUNT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (account_number) DO NOTHING"
            ))
            .bind(&account.account_number)
            .bind(&account.client_id)
            .bind(&account.currency)
            .bind(account.balance)
            .bind(account.status.as_str())
            .bind(account.opened_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| BankError::storage("postgres account insert failed", e))?;
            if inserted.rows_affected() == 0 {
                return Err(BankError::AccountExists(account.account_number));
            }
        }
        LedgerWrite::CloseAccount { account_number } => {
            let account = locked_account(conn, &account_number).await?;
            if !account.balance.is_zero() {
                return Err(BankError::AccountNotEmpty {
                    account: account_number,
                    balance: account.balance,
                });
            }
            sqlx::query("UPDATE bank_accounts SET status = $1 WHERE account_number = $2")
                .bind(AccountStatus::Closed.as_str())
                .bind(&account_number)
                .execute(&mut *conn)
                .await
                .map_err(|e| BankError::storage("postgres account close failed", e))?;
        }
        LedgerWrite::Debit(posting) => {
            validate_amount(&posting)?;
            let account = locked_account(conn, &posting.account_number).await?;
            if !account.is_active() {
                return Err(BankError::AccountClosed(posting.account_number));
            }
            if account.balance < posting.amount {
                return Err(BankError::InsufficientFunds {
                    account: posting.account_number,
                    available: account.balance,
                    requested: posting.amount,
                });
            }
            let balance_after = account
                .balance
                .checked_sub(posting.amount)
                .ok_or_else(|| overflow(&posting.account_number, posting.amount))?;
            post_pg(conn, TransactionDirection::Debit, &posting, balance_after, receipt).await?;
        }
        LedgerWrite::Credit(posting) => {
            validate_amount(&posting)?;
            let account = locked_account(conn, &posting.account_number).await?;
            let balance_after = account
                .balance
                .checked_add(posting.amount)
                .ok_or_else(|| overflow(&posting.account_number, posting.amount))?;
            post_pg(conn, TransactionDirection::Credit, &posting, balance_after, receipt).await?;
        }
        LedgerWrite::AdjustCapital(adjustment) => {
            let current: Option<Decimal> = sqlx::query_scalar(
                "SELECT capital FROM bank_capital WHERE bank_code = $1 FOR UPDATE",
            )
            .bind(adjustment.bank_code.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| BankError::storage("postgres capital lock failed", e))?;
            next_capital(current.unwrap_or(adjustment.initial_capital), &adjustment)?;

            let row = sqlx::query(
                r#"
                INSERT INTO bank_capital (bank_code, capital, initial_capital, updated_at)
                VALUES ($1, $2 + $3, $2, $4)
                ON CONFLICT (bank_code) DO UPDATE
                SET capital = bank_capital.capital + $3, updated_at = $4
                RETURNING bank_code, capital, initial_capital, updated_at
                "#,
            )
            .bind(adjustment.bank_code.as_str())
            .bind(adjustment.initial_capital)
            .bind(adjustment.delta)
            .bind(Utc::now())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| BankError::storage("postgres capital upsert failed", e))?;
            debug!(
                bank = %adjustment.bank_code,
                delta = %adjustment.delta,
                reason = %adjustment.reason,
                "capital adjusted"
            );
            receipt.capital.push(capital_from_row(&row)?);
        }
        LedgerWrite::InsertPayment(payment) => {
            sqlx::query(&format!(
                "INSERT INTO payments ({PAYMENT_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
            ))
            .bind(&payment.payment_id)
            .bind(&payment.source_account)
            .bind(&payment.destination_account)
            .bind(payment.destination_bank.as_ref().map(BankCode::as_str))
            .bind(payment.amount)
            .bind(&payment.currency)
            .bind(&payment.description)
            .bind(&payment.consent_id)
            .bind(payment.status.as_str())
            .bind(payment.rejection.as_ref().map(|r| r.kind.as_str()))
            .bind(payment.rejection.as_ref().map(|r| r.detail.as_str()))
            .bind(payment.created_at)
            .bind(payment.updated_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| BankError::storage("postgres payment insert failed", e))?;
        }
        LedgerWrite::UpdatePayment(payment) => {
            let stored: Option<String> = sqlx::query_scalar(
                "SELECT status FROM payments WHERE payment_id = $1 FOR UPDATE",
            )
            .bind(&payment.payment_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| BankError::storage("postgres payment lock failed", e))?;
            let stored = stored.ok_or_else(|| BankError::PaymentNotFound(payment.payment_id.clone()))?;
            payment_is_open(PaymentStatus::parse(&stored)?, &payment)?;

            let updated = sqlx::query(
                r#"
                UPDATE payments
                SET destination_bank = $2, status = $3, rejection_kind = $4,
                    rejection_detail = $5, updated_at = $6
                WHERE payment_id = $1 AND status = $7
                "#,
            )
            .bind(&payment.payment_id)
            .bind(payment.destination_bank.as_ref().map(BankCode::as_str))
            .bind(payment.status.as_str())
            .bind(payment.rejection.as_ref().map(|r| r.kind.as_str()))
            .bind(payment.rejection.as_ref().map(|r| r.detail.as_str()))
            .bind(payment.updated_at)
            .bind(PaymentStatus::InProcess.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| BankError::storage("postgres payment update failed", e))?;
            if updated.rows_affected() == 0 {
                return Err(BankError::InvalidTransition {
                    id: payment.payment_id,
                    from: stored,
                    to: payment.status.as_str().to_string(),
                });
            }
        }
        LedgerWrite::InsertTransfer(transfer) => {
            let inserted = sqlx::query(&format!(
                "INSERT INTO interbank_transfers ({TRANSFER_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
                 ON CONFLICT (transfer_id) DO NOTHING"
            ))
            .bind(&transfer.transfer_id)
            .bind(&transfer.payment_id)
            .bind(transfer.direction.as_str())
            .bind(transfer.from_bank.as_str())
            .bind(transfer.to_bank.as_str())
            .bind(&transfer.to_account_number)
            .bind(transfer.amount)
            .bind(&transfer.currency)
            .bind(transfer.status.as_str())
            .bind(&transfer.request_digest)
            .bind(&transfer.failure_reason)
            .bind(transfer.created_at)
            .bind(transfer.completed_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| BankError::storage("postgres transfer insert failed", e))?;
            if inserted.rows_affected() == 0 {
                return Err(BankError::DuplicateTransfer(transfer.transfer_id));
            }
        }
        LedgerWrite::UpdateTransfer(transfer) => {
            let stored: Option<String> = sqlx::query_scalar(
                "SELECT status FROM interbank_transfers WHERE transfer_id = $1 FOR UPDATE",
            )
            .bind(&transfer.transfer_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| BankError::storage("postgres transfer lock failed", e))?;
            let stored = stored.ok_or_else(|| {
                BankError::Storage(format!("transfer '{}' not found", transfer.transfer_id))
            })?;
            transfer_is_open(TransferStatus::parse(&stored)?, &transfer)?;

            let updated = sqlx::query(
                r#"
                UPDATE interbank_transfers
                SET status = $2, failure_reason = $3, completed_at = $4
                WHERE transfer_id = $1 AND status = $5
                "#,
            )
            .bind(&transfer.transfer_id)
            .bind(transfer.status.as_str())
            .bind(&transfer.failure_reason)
            .bind(transfer.completed_at)
            .bind(TransferStatus::Processing.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| BankError::storage("postgres transfer update failed", e))?;
            if updated.rows_affected() == 0 {
                return Err(BankError::InvalidTransition {
                    id: transfer.transfer_id,
                    from: stored,
                    to: transfer.status.as_str().to_string(),
                });
            }
        }
    }
    Ok(())
}

fn account_from_row(row: &PgRow) -> Result<Account, BankError> {
    Ok(Account {
        account_number: column(row, "account_number")?,
        client_id: column(row, "client_id")?,
        currency: column(row, "currency")?,
        balance: column(row, "balance")?,
        status: AccountStatus::parse(&column::<String>(row, "status")?)?,
        opened_at: column(row, "opened_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, BankError> {
    Ok(Transaction {
        transaction_id: column(row, "transaction_id")?,
        account_number: column(row, "account_number")?,
        direction: TransactionDirection::parse(&column::<String>(row, "direction")?)?,
        amount: column(row, "amount")?,
        balance_after: column(row, "balance_after")?,
        description: column(row, "description")?,
        counterparty: column(row, "counterparty")?,
        created_at: column(row, "created_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, BankError> {
    let rejection_kind: Option<String> = column(row, "rejection_kind")?;
    let rejection = match rejection_kind {
        Some(kind) => Some(Rejection {
            kind: RejectionKind::parse(&kind)?,
            detail: column::<Option<String>>(row, "rejection_detail")?.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(Payment {
        payment_id: column(row, "payment_id")?,
        source_account: column(row, "source_account")?,
        destination_account: column(row, "destination_account")?,
        destination_bank: column::<Option<String>>(row, "destination_bank")?.map(BankCode::new),
        amount: column(row, "amount")?,
        currency: column(row, "currency")?,
        description: column(row, "description")?,
        consent_id: column(row, "consent_id")?,
        status: PaymentStatus::parse(&column::<String>(row, "status")?)?,
        rejection,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn transfer_from_row(row: &PgRow) -> Result<InterbankTransfer, BankError> {
    Ok(InterbankTransfer {
        transfer_id: column(row, "transfer_id")?,
        payment_id: column(row, "payment_id")?,
        direction: TransferDirection::parse(&column::<String>(row, "direction")?)?,
        from_bank: BankCode::new(column::<String>(row, "from_bank")?),
        to_bank: BankCode::new(column::<String>(row, "to_bank")?),
        to_account_number: column(row, "to_account_number")?,
        amount: column(row, "amount")?,
        currency: column(row, "currency")?,
        status: TransferStatus::parse(&column::<String>(row, "status")?)?,
        request_digest: column(row, "request_digest")?,
        failure_reason: column(row, "failure_reason")?,
        created_at: column(row, "created_at")?,
        completed_at: column(row, "completed_at")?,
    })
}

fn capital_from_row(row: &PgRow) -> Result<BankCapital, BankError> {
    Ok(BankCapital {
        bank_code: BankCode::new(column::<String>(row, "bank_code")?),
        capital: column(row, "capital")?,
        initial_capital: column(row, "initial_capital")?,
        updated_at: column(row, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PaymentRequest, TransferDirection};
    use rust_decimal_macros::dec;

    async fn seeded() -> BankStore {
        let store = BankStore::bootstrap(StorageConfig::memory()).await.unwrap();
        store
            .commit(vec![
                LedgerWrite::OpenAccount(Account::new("acc-1", "client-1", "RUB", dec!(100))),
                LedgerWrite::OpenAccount(Account::new("acc-2", "client-2", "RUB", dec!(0))),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn failing_step_rolls_back_the_whole_batch() {
        let store = seeded().await;
        let payment = Payment::from_request(&PaymentRequest::new("acc-1", "acc-9", dec!(40), "RUB"));

        let err = store
            .commit(vec![
                LedgerWrite::Debit(Posting::new("acc-1", dec!(40), "out")),
                LedgerWrite::InsertPayment(payment.clone()),
                LedgerWrite::Credit(Posting::new("acc-9", dec!(40), "in")),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, BankError::AccountNotFound(ref number) if number == "acc-9"));
        assert_eq!(store.account("acc-1").await.unwrap().unwrap().balance, dec!(100));
        assert!(store.transactions("acc-1", 10).await.unwrap().is_empty());
        assert!(store.payment(&payment.payment_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn debit_never_drives_balance_negative() {
        let store = seeded().await;
        let err = store
            .commit(vec![LedgerWrite::Debit(Posting::new("acc-1", dec!(100.01), "too much"))])
            .await
            .unwrap_err();

        match err {
            BankError::InsufficientFunds {
                available,
                requested,
                ..
            } => {
                assert_eq!(available, dec!(100));
                assert_eq!(requested, dec!(100.01));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn capital_row_starts_from_baseline() {
        let store = seeded().await;
        let bank = BankCode::new("vbank");
        let receipt = store
            .commit(vec![LedgerWrite::AdjustCapital(CapitalAdjustment {
                bank_code: bank.clone(),
                delta: dec!(-250),
                initial_capital: dec!(3500000),
                reason: "outgoing".to_string(),
            })])
            .await
            .unwrap();

        assert_eq!(receipt.capital[0].capital, dec!(3499750));
        let row = store.capital(&bank).await.unwrap().unwrap();
        assert_eq!(row.initial_capital, dec!(3500000));
        assert_eq!(row.capital, dec!(3499750));
    }

    #[tokio::test]
    async fn transfer_id_is_unique() {
        let store = seeded().await;
        let payment = Payment::from_request(&PaymentRequest::new("acc-1", "x", dec!(1), "RUB"));
        let mut transfer =
            InterbankTransfer::outgoing(&payment, BankCode::new("vbank"), BankCode::new("abank"));
        transfer.direction = TransferDirection::Incoming;

        store
            .commit(vec![LedgerWrite::InsertTransfer(transfer.clone())])
            .await
            .unwrap();
        let err = store
            .commit(vec![LedgerWrite::InsertTransfer(transfer)])
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::DuplicateTransfer(_)));
    }

    #[tokio::test]
    async fn only_empty_accounts_close_and_closed_accounts_still_take_credits() {
        let store = seeded().await;
        let err = store
            .commit(vec![LedgerWrite::CloseAccount {
                account_number: "acc-1".to_string(),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::AccountNotEmpty { .. }));

        store
            .commit(vec![LedgerWrite::CloseAccount {
                account_number: "acc-2".to_string(),
            }])
            .await
            .unwrap();
        let debit = store
            .commit(vec![LedgerWrite::Debit(Posting::new("acc-2", dec!(1), "x"))])
            .await
            .unwrap_err();
        assert!(matches!(debit, BankError::AccountClosed(_)));

        let receipt = store
            .commit(vec![LedgerWrite::Credit(Posting::new("acc-2", dec!(5), "refund"))])
            .await
            .unwrap();
        assert_eq!(receipt.transactions[0].balance_after, dec!(5));
    }

    #[tokio::test]
    async fn overflowing_credit_rolls_back_the_batch() {
        let store = seeded().await;
        store
            .commit(vec![LedgerWrite::OpenAccount(Account::new(
                "acc-full",
                "client-3",
                "RUB",
                Decimal::MAX,
            ))])
            .await
            .unwrap();
        let payment = Payment::from_request(&PaymentRequest::new("acc-1", "acc-full", dec!(1), "RUB"));
        let transfer =
            InterbankTransfer::outgoing(&payment, BankCode::new("vbank"), BankCode::new("abank"));

        let err = store
            .commit(vec![
                LedgerWrite::InsertTransfer(transfer.clone()),
                LedgerWrite::Credit(Posting::new("acc-full", dec!(1), "in")),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, BankError::InvalidAmount(_)));
        assert!(store.transfer(&transfer.transfer_id).await.unwrap().is_none());
        assert_eq!(
            store.account("acc-full").await.unwrap().unwrap().balance,
            Decimal::MAX
        );
    }

    #[tokio::test]
    async fn overflowing_capital_change_is_refused() {
        let store = seeded().await;
        let err = store
            .commit(vec![LedgerWrite::AdjustCapital(CapitalAdjustment {
                bank_code: BankCode::new("vbank"),
                delta: Decimal::MAX,
                initial_capital: dec!(3500000),
                reason: "incoming".to_string(),
            })])
            .await
            .unwrap_err();

        assert!(matches!(err, BankError::InvalidAmount(_)));
        assert!(store.capital(&BankCode::new("vbank")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_payment_is_not_overwritten() {
        let store = seeded().await;
        let mut payment = Payment::from_request(&PaymentRequest::new("acc-1", "acc-2", dec!(1), "RUB"));
        store
            .commit(vec![LedgerWrite::InsertPayment(payment.clone())])
            .await
            .unwrap();

        let mut rejected = payment.clone();
        rejected
            .reject(RejectionKind::PeerTransportError, "recovered after restart")
            .unwrap();
        store
            .commit(vec![LedgerWrite::UpdatePayment(rejected)])
            .await
            .unwrap();

        payment.complete().unwrap();
        let err = store
            .commit(vec![LedgerWrite::UpdatePayment(payment.clone())])
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::InvalidTransition { .. }));
        let stored = store.payment(&payment.payment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Rejected);
    }

    #[tokio::test]
    async fn finished_transfer_is_not_overwritten() {
        let store = seeded().await;
        let payment = Payment::from_request(&PaymentRequest::new("acc-1", "x", dec!(1), "RUB"));
        let transfer =
            InterbankTransfer::outgoing(&payment, BankCode::new("vbank"), BankCode::new("abank"));
        store
            .commit(vec![LedgerWrite::InsertTransfer(transfer.clone())])
            .await
            .unwrap();

        let mut failed = transfer.clone();
        failed.mark_failed("peer down").unwrap();
        store
            .commit(vec![LedgerWrite::UpdateTransfer(failed)])
            .await
            .unwrap();

        let mut completed = transfer;
        completed.mark_completed().unwrap();
        let err = store
            .commit(vec![LedgerWrite::UpdateTransfer(completed.clone())])
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::InvalidTransition { .. }));
        let stored = store.transfer(&completed.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Failed);
    }

    #[test]
    fn storage_labels() {
        assert_eq!(StorageConfig::memory().label(), "memory");
        assert_eq!(
            StorageConfig::postgres("postgres://localhost/bank", 4).label(),
            "postgres"
        );
    }
}
