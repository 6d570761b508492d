use crate::capital::CapitalLedger;
use crate::error::BankError;
use crate::ledger::Ledger;
use crate::protocol::{AccountProbe, SettlementRequest, SettlementResponse};
use crate::storage::{BankStore, LedgerWrite, Posting};
use crate::types::{BankCode, InterbankTransfer, TransferDirection, TransferStatus};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of handling one inbound settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementReceipt {
    pub response: SettlementResponse,
    /// `true` when the transfer id had already been credited by an identical
    /// request and nothing was applied this time.
    pub replayed: bool,
}

/// Receiving side of the settlement protocol.
///
/// Each accepted transfer id is credited at most once. The credit, the
/// incoming transfer record and the capital increase are one batch.
#[derive(Debug, Clone)]
pub struct SettlementReceiver {
    bank_code: BankCode,
    store: Arc<BankStore>,
    ledger: Ledger,
    capital: CapitalLedger,
}

impl SettlementReceiver {
    pub fn new(store: Arc<BankStore>, capital: CapitalLedger) -> Self {
        Self {
            bank_code: capital.bank_code().clone(),
            ledger: Ledger::new(store.clone()),
            store,
            capital,
        }
    }

    pub async fn probe(&self, account_number: &str) -> Result<AccountProbe, BankError> {
        let exists = self
            .ledger
            .resolve_local(account_number)
            .await?
            .is_some_and(|account| account.is_active());
        Ok(AccountProbe {
            exists,
            account_number: account_number.to_string(),
            bank_code: self.bank_code.clone(),
        })
    }

    pub async fn receive(&self, request: SettlementRequest) -> Result<SettlementReceipt, BankError> {
        request.validate()?;
        if request.from_bank == self.bank_code {
            return Err(BankError::Protocol(format!(
                "settlement from '{}' addressed to itself",
                request.from_bank
            )));
        }

        let digest = request.digest();
        if let Some(existing) = self.store.transfer(&request.transfer_id).await? {
            return self.replay_or_conflict(existing, &digest);
        }

        let account = self
            .ledger
            .resolve_local(&request.to_account_number)
            .await?
            .ok_or_else(|| BankError::DestinationAccountNotFound(request.to_account_number.clone()))?;
        if !account.is_active() {
            return Err(BankError::AccountClosed(account.account_number));
        }
        if account.currency != request.currency {
            return Err(BankError::CurrencyMismatch {
                expected: account.currency,
                actual: request.currency,
            });
        }

        self.credit(request, digest).await
    }

    /// Commit the credit batch. Losing the insert to a concurrent delivery of
    /// the same id resolves against the winner's record.
    async fn credit(
        &self,
        request: SettlementRequest,
        digest: String,
    ) -> Result<SettlementReceipt, BankError> {
        let record = self.incoming_record(&request, digest.clone());
        let posting = Posting::new(
            &request.to_account_number,
            request.amount,
            format!("Incoming transfer from {}: {}", request.from_bank, request.description),
        )
        .with_counterparty(request.from_bank.as_str());

        let writes = vec![
            LedgerWrite::InsertTransfer(record.clone()),
            Ledger::credit_write(posting),
            self.capital.adjustment(
                request.amount,
                format!("incoming transfer {}", request.transfer_id),
            ),
        ];

        match self.store.commit(writes).await {
            Ok(_) => {
                info!(
                    transfer_id = %request.transfer_id,
                    from_bank = %request.from_bank,
                    account = %request.to_account_number,
                    amount = %request.amount,
                    "incoming settlement credited"
                );
                Ok(SettlementReceipt {
                    response: SettlementResponse {
                        success: true,
                        transfer_id: record.transfer_id,
                        message: "Transfer credited".to_string(),
                        credited_at: record.completed_at,
                    },
                    replayed: false,
                })
            }
            Err(BankError::DuplicateTransfer(id)) => {
                let existing = self
                    .store
                    .transfer(&id)
                    .await?
                    .ok_or_else(|| BankError::DuplicateTransfer(id.clone()))?;
                self.replay_or_conflict(existing, &digest)
            }
            Err(err) => Err(err),
        }
    }

    fn replay_or_conflict(
        &self,
        existing: InterbankTransfer,
        digest: &str,
    ) -> Result<SettlementReceipt, BankError> {
        let faithful = existing.direction == TransferDirection::Incoming
            && existing.status == TransferStatus::Completed
            && existing.request_digest.as_deref() == Some(digest);

        if !faithful {
            warn!(transfer_id = %existing.transfer_id, "transfer id reused with different content");
            return Err(BankError::DuplicateTransfer(existing.transfer_id));
        }

        info!(transfer_id = %existing.transfer_id, "settlement replay acknowledged");
        Ok(SettlementReceipt {
            response: SettlementResponse {
                success: true,
                transfer_id: existing.transfer_id,
                message: "Transfer already credited".to_string(),
                credited_at: existing.completed_at,
            },
            replayed: true,
        })
    }

    fn incoming_record(&self, request: &SettlementRequest, digest: String) -> InterbankTransfer {
        let now = Utc::now();
        InterbankTransfer {
            transfer_id: request.transfer_id.clone(),
            payment_id: None,
            direction: TransferDirection::Incoming,
            from_bank: request.from_bank.clone(),
            to_bank: self.bank_code.clone(),
            to_account_number: request.to_account_number.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            status: TransferStatus::Completed,
            request_digest: Some(digest),
            failure_reason: None,
            created_at: now,
            completed_at: Some(now),
        }
    }
}
