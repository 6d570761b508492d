//! Settlement saga orchestrator.
//!
//! A payment is driven through a short series of atomic batches: the debit is
//! committed before any peer is contacted, and a failed or unreachable peer is
//! answered with a compensating refund. No lock is held across a remote call.
//!
//! A peer that credits after our timeout has fired still gets refunded here.
//! That window is the known exactly-once gap of this design.

use crate::capital::CapitalLedger;
use crate::error::{BankError, PeerError};
use crate::flow::{SagaStage, SagaStageMachine};
use crate::ledger::Ledger;
use crate::peer::PeerClient;
use crate::protocol::SettlementRequest;
use crate::routing::RoutingResolver;
use crate::storage::{BankStore, LedgerWrite, Posting};
use crate::types::{
    check_amount, Account, BankCode, InterbankTransfer, Payment, PaymentOutcome, PaymentRequest,
    RejectionKind, TransferStatus,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Precondition check supplied by an external consent collaborator.
#[async_trait]
pub trait PaymentAuthorizer: Send + Sync {
    async fn authorize(&self, request: &PaymentRequest) -> Result<(), BankError>;
}

/// Accepts every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitAll;

#[async_trait]
impl PaymentAuthorizer for PermitAll {
    async fn authorize(&self, _request: &PaymentRequest) -> Result<(), BankError> {
        Ok(())
    }
}

/// Maps a peer failure onto the rejection recorded on the payment.
pub fn rejection_kind(err: &PeerError) -> RejectionKind {
    match err {
        PeerError::Rejected { .. } => RejectionKind::PeerRejected,
        PeerError::Timeout { .. } => RejectionKind::PeerTimeout,
        PeerError::Transport { .. } | PeerError::Protocol { .. } | PeerError::UnknownPeer(_) => {
            RejectionKind::PeerTransportError
        }
    }
}

pub struct SettlementSaga {
    bank_code: BankCode,
    store: Arc<BankStore>,
    ledger: Ledger,
    capital: CapitalLedger,
    router: Arc<dyn RoutingResolver>,
    peers: Arc<dyn PeerClient>,
    authorizer: Arc<dyn PaymentAuthorizer>,
}

impl SettlementSaga {
    pub fn new(
        store: Arc<BankStore>,
        capital: CapitalLedger,
        router: Arc<dyn RoutingResolver>,
        peers: Arc<dyn PeerClient>,
        authorizer: Arc<dyn PaymentAuthorizer>,
    ) -> Self {
        Self {
            bank_code: capital.bank_code().clone(),
            ledger: Ledger::new(store.clone()),
            store,
            capital,
            router,
            peers,
            authorizer,
        }
    }

    /// Run one payment to a terminal state.
    ///
    /// Validation failures return `Err` with nothing persisted. Once the debit
    /// has committed, every failure ends as a `Rejected` payment in `Ok`.
    pub async fn execute(&self, request: PaymentRequest) -> Result<PaymentOutcome, BankError> {
        let destination = self.validate(&request).await?;
        let payment = Payment::from_request(&request);
        let stage = SagaStageMachine::new(payment.payment_id.clone());

        match destination {
            Some(destination) => self.settle_locally(payment, stage, destination).await,
            None => self.settle_remotely(payment, stage).await,
        }
    }

    /// Compensate payments left `InProcess` by an interrupted run.
    pub async fn recover_stalled(&self) -> Result<Vec<PaymentOutcome>, BankError> {
        let stalled = self.store.payments_in_process().await?;
        let mut recovered = Vec::with_capacity(stalled.len());

        for payment in stalled {
            let transfer = self
                .store
                .transfer_for_payment(&payment.payment_id)
                .await?
                .filter(|transfer| transfer.status == TransferStatus::Processing);
            let resumed_at = if transfer.is_some() {
                SagaStage::Settling
            } else {
                SagaStage::Debited
            };
            let mut stage = SagaStageMachine::resume(payment.payment_id.clone(), resumed_at);

            warn!(payment_id = %payment.payment_id, "compensating stalled payment");
            let outcome = self
                .compensate(
                    payment,
                    transfer,
                    &mut stage,
                    RejectionKind::PeerTransportError,
                    "recovered after restart".to_string(),
                )
                .await?;
            recovered.push(outcome);
        }

        Ok(recovered)
    }

    async fn validate(&self, request: &PaymentRequest) -> Result<Option<Account>, BankError> {
        check_amount("payment", request.amount)?;
        if request.source_account == request.destination_account {
            return Err(BankError::SameAccount);
        }

        let source = self
            .ledger
            .resolve_local(&request.source_account)
            .await?
            .ok_or_else(|| BankError::SourceAccountNotFound(request.source_account.clone()))?;
        if !source.is_active() {
            return Err(BankError::AccountClosed(source.account_number));
        }
        if source.currency != request.currency {
            return Err(BankError::CurrencyMismatch {
                expected: source.currency,
                actual: request.currency.clone(),
            });
        }
        if source.balance < request.amount {
            return Err(BankError::InsufficientFunds {
                account: source.account_number,
                available: source.balance,
                requested: request.amount,
            });
        }

        self.authorizer.authorize(request).await?;

        let destination = self.ledger.resolve_local(&request.destination_account).await?;
        if let Some(account) = &destination {
            if !account.is_active() {
                return Err(BankError::AccountClosed(account.account_number.clone()));
            }
            if account.currency != request.currency {
                return Err(BankError::CurrencyMismatch {
                    expected: account.currency.clone(),
                    actual: request.currency.clone(),
                });
            }
        }

        Ok(destination)
    }

    async fn settle_locally(
        &self,
        mut payment: Payment,
        mut stage: SagaStageMachine,
        destination: Account,
    ) -> Result<PaymentOutcome, BankError> {
        payment.destination_bank = Some(self.bank_code.clone());
        payment.complete()?;

        let debit = Posting::new(
            &payment.source_account,
            payment.amount,
            format!("Transfer to {}: {}", destination.account_number, payment.description),
        )
        .with_counterparty(&destination.account_number);
        let credit = Posting::new(
            &destination.account_number,
            payment.amount,
            format!("Transfer from {}: {}", payment.source_account, payment.description),
        )
        .with_counterparty(&payment.source_account);

        self.store
            .commit(vec![
                Ledger::debit_write(debit),
                Ledger::credit_write(credit),
                LedgerWrite::InsertPayment(payment.clone()),
            ])
            .await?;
        stage.mark_debited()?;
        stage.mark_completed()?;

        info!(
            payment_id = %payment.payment_id,
            source = %payment.source_account,
            destination = %payment.destination_account,
            amount = %payment.amount,
            "local payment completed"
        );
        Ok(PaymentOutcome {
            payment,
            transfer: None,
        })
    }

    async fn settle_remotely(
        &self,
        mut payment: Payment,
        mut stage: SagaStageMachine,
    ) -> Result<PaymentOutcome, BankError> {
        let debit = Posting::new(
            &payment.source_account,
            payment.amount,
            format!(
                "Interbank transfer to {}: {}",
                payment.destination_account, payment.description
            ),
        )
        .with_counterparty(&payment.destination_account);
        self.store
            .commit(vec![
                Ledger::debit_write(debit),
                LedgerWrite::InsertPayment(payment.clone()),
            ])
            .await?;
        stage.mark_debited()?;
        info!(payment_id = %payment.payment_id, amount = %payment.amount, "source debited");

        let peer = match self.router.resolve(&payment.destination_account).await {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                let detail = format!("no peer bank owns account {}", payment.destination_account);
                return self
                    .compensate(payment, None, &mut stage, RejectionKind::NoRouteFound, detail)
                    .await;
            }
            Err(err) => {
                let detail = format!("routing failed: {err}");
                return self
                    .compensate(payment, None, &mut stage, RejectionKind::NoRouteFound, detail)
                    .await;
            }
        };

        payment.destination_bank = Some(peer.clone());
        let transfer = InterbankTransfer::outgoing(&payment, self.bank_code.clone(), peer.clone());
        if let Err(err) = self
            .store
            .commit(vec![
                LedgerWrite::InsertTransfer(transfer.clone()),
                LedgerWrite::UpdatePayment(payment.clone()),
            ])
            .await
        {
            let detail = format!("transfer could not be recorded: {err}");
            return self
                .compensate(payment, None, &mut stage, RejectionKind::PeerTransportError, detail)
                .await;
        }
        stage.mark_routed()?;

        let request = SettlementRequest::for_transfer(&transfer, payment.description.clone());
        stage.mark_settling()?;
        info!(
            payment_id = %payment.payment_id,
            transfer_id = %transfer.transfer_id,
            peer = %peer,
            "settling with peer"
        );

        match self.peers.settle(&peer, &request).await {
            Ok(response) if response.success && response.transfer_id == transfer.transfer_id => {
                self.finish(payment, transfer, &mut stage).await
            }
            Ok(response) => {
                let err = PeerError::Protocol {
                    peer: peer.to_string(),
                    message: format!(
                        "unexpected settlement answer for '{}': {}",
                        response.transfer_id, response.message
                    ),
                };
                self.compensate(payment, Some(transfer), &mut stage, rejection_kind(&err), err.to_string())
                    .await
            }
            Err(err) => {
                self.compensate(payment, Some(transfer), &mut stage, rejection_kind(&err), err.to_string())
                    .await
            }
        }
    }

    async fn finish(
        &self,
        mut payment: Payment,
        mut transfer: InterbankTransfer,
        stage: &mut SagaStageMachine,
    ) -> Result<PaymentOutcome, BankError> {
        transfer.mark_completed()?;
        payment.complete()?;

        let writes = vec![
            LedgerWrite::UpdateTransfer(transfer.clone()),
            LedgerWrite::UpdatePayment(payment.clone()),
            self.capital.adjustment(
                -payment.amount,
                format!("outgoing transfer {}", transfer.transfer_id),
            ),
        ];
        if let Err(err) = self.store.commit(writes).await {
            // Peer already credited. The payment stays in process.
            error!(
                payment_id = %payment.payment_id,
                transfer_id = %transfer.transfer_id,
                error = %err,
                "settled with peer but failed to record completion"
            );
            return Err(err);
        }
        stage.mark_completed()?;

        info!(
            payment_id = %payment.payment_id,
            transfer_id = %transfer.transfer_id,
            peer = %transfer.to_bank,
            "interbank payment completed"
        );
        Ok(PaymentOutcome {
            payment,
            transfer: Some(transfer),
        })
    }

    async fn compensate(
        &self,
        mut payment: Payment,
        mut transfer: Option<InterbankTransfer>,
        stage: &mut SagaStageMachine,
        kind: RejectionKind,
        detail: String,
    ) -> Result<PaymentOutcome, BankError> {
        payment.reject(kind, detail.clone())?;

        let counterparty = transfer
            .as_ref()
            .map(|transfer| transfer.to_bank.to_string())
            .unwrap_or_else(|| payment.destination_account.clone());
        let refund = Posting::new(
            &payment.source_account,
            payment.amount,
            format!(
                "Refund: interbank transfer to {} failed",
                payment.destination_account
            ),
        )
        .with_counterparty(counterparty);

        let mut writes = vec![Ledger::credit_write(refund)];
        if let Some(transfer) = transfer.as_mut() {
            transfer.mark_failed(detail.clone())?;
            writes.push(LedgerWrite::UpdateTransfer(transfer.clone()));
        }
        writes.push(LedgerWrite::UpdatePayment(payment.clone()));

        self.store.commit(writes).await?;
        stage.mark_compensated()?;

        warn!(
            payment_id = %payment.payment_id,
            kind = kind.as_str(),
            detail = %detail,
            "payment rejected and refunded"
        );
        Ok(PaymentOutcome { payment, transfer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AccountProbe, SettlementResponse};
    use crate::routing::StaticRoutingTable;
    use crate::types::{PaymentStatus, TransactionDirection};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    const SOURCE: &str = "40817810000000000001";
    const LOCAL_DEST: &str = "40817810000000000002";
    const REMOTE_DEST: &str = "40817810099910001234";

    /// Peer double whose settlement answer is fixed per test.
    struct FakePeer {
        answer: Result<(), PeerError>,
        calls: Mutex<Vec<SettlementRequest>>,
    }

    impl FakePeer {
        fn answering(answer: Result<(), PeerError>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PeerClient for FakePeer {
        async fn probe_account(
            &self,
            peer: &BankCode,
            account_number: &str,
        ) -> Result<AccountProbe, PeerError> {
            Ok(AccountProbe {
                exists: false,
                account_number: account_number.to_string(),
                bank_code: peer.clone(),
            })
        }

        async fn settle(
            &self,
            _peer: &BankCode,
            request: &SettlementRequest,
        ) -> Result<SettlementResponse, PeerError> {
            self.calls.lock().unwrap().push(request.clone());
            self.answer.clone().map(|_| SettlementResponse {
                success: true,
                transfer_id: request.transfer_id.clone(),
                message: "Transfer credited".to_string(),
                credited_at: Some(Utc::now()),
            })
        }
    }

    struct DenyAll;

    #[async_trait]
    impl PaymentAuthorizer for DenyAll {
        async fn authorize(&self, request: &PaymentRequest) -> Result<(), BankError> {
            Err(BankError::Unauthorized(format!(
                "no consent for {}",
                request.source_account
            )))
        }
    }

    struct Fixture {
        store: Arc<BankStore>,
        saga: SettlementSaga,
    }

    async fn fixture(peer: Arc<FakePeer>, authorizer: Arc<dyn PaymentAuthorizer>) -> Fixture {
        let store = Arc::new(BankStore::memory());
        let ledger = Ledger::new(store.clone());
        ledger
            .open_account(Account::new(SOURCE, "client-1", "RUB", dec!(10000)))
            .await
            .unwrap();
        ledger
            .open_account(Account::new(LOCAL_DEST, "client-2", "RUB", dec!(0)))
            .await
            .unwrap();

        let capital = CapitalLedger::new(store.clone(), BankCode::new("vbank"), dec!(3500000), dec!(1000));
        capital.ensure_row().await.unwrap();
        let router = Arc::new(StaticRoutingTable::new().with_route("408178100999", "abank"));
        let saga = SettlementSaga::new(store.clone(), capital, router, peer, authorizer);
        Fixture { store, saga }
    }

    async fn balance(store: &BankStore, account: &str) -> Decimal {
        store.account(account).await.unwrap().unwrap().balance
    }

    async fn capital(store: &BankStore) -> Decimal {
        store
            .capital(&BankCode::new("vbank"))
            .await
            .unwrap()
            .unwrap()
            .capital
    }

    #[tokio::test]
    async fn local_transfer_moves_money_without_touching_capital() {
        let peer = FakePeer::answering(Ok(()));
        let fx = fixture(peer.clone(), Arc::new(PermitAll)).await;

        let outcome = fx
            .saga
            .execute(PaymentRequest::new(SOURCE, LOCAL_DEST, dec!(3000), "RUB"))
            .await
            .unwrap();

        assert_eq!(outcome.payment.status, PaymentStatus::Completed);
        assert_eq!(outcome.payment.destination_bank, Some(BankCode::new("vbank")));
        assert!(outcome.transfer.is_none());
        assert_eq!(balance(&fx.store, SOURCE).await, dec!(7000));
        assert_eq!(balance(&fx.store, LOCAL_DEST).await, dec!(3000));
        assert_eq!(capital(&fx.store).await, dec!(3500000));
        assert_eq!(fx.store.transactions(SOURCE, 10).await.unwrap().len(), 1);
        assert_eq!(fx.store.transactions(LOCAL_DEST, 10).await.unwrap().len(), 1);
        assert!(peer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_success_debits_sender_and_capital() {
        let peer = FakePeer::answering(Ok(()));
        let fx = fixture(peer.clone(), Arc::new(PermitAll)).await;

        let outcome = fx
            .saga
            .execute(
                PaymentRequest::new(SOURCE, REMOTE_DEST, dec!(5000), "RUB")
                    .with_description("invoice 17"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.payment.status, PaymentStatus::Completed);
        let transfer = outcome.transfer.unwrap();
        assert_eq!(transfer.status, TransferStatus::Completed);
        assert_eq!(transfer.to_bank, BankCode::new("abank"));
        assert_eq!(balance(&fx.store, SOURCE).await, dec!(5000));
        assert_eq!(capital(&fx.store).await, dec!(3495000));

        let sent = peer.calls.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].transfer_id, transfer.transfer_id);
        assert_eq!(sent[0].description, "invoice 17");
    }

    #[tokio::test]
    async fn unreachable_peer_refunds_sender() {
        let peer = FakePeer::answering(Err(PeerError::Transport {
            peer: "abank".to_string(),
            message: "connection refused".to_string(),
        }));
        let fx = fixture(peer, Arc::new(PermitAll)).await;

        let outcome = fx
            .saga
            .execute(PaymentRequest::new(SOURCE, REMOTE_DEST, dec!(3000), "RUB"))
            .await
            .unwrap();

        assert_eq!(outcome.payment.status, PaymentStatus::Rejected);
        assert_eq!(
            outcome.payment.rejection.unwrap().kind,
            RejectionKind::PeerTransportError
        );
        assert_eq!(outcome.transfer.unwrap().status, TransferStatus::Failed);
        assert_eq!(balance(&fx.store, SOURCE).await, dec!(10000));
        assert_eq!(capital(&fx.store).await, dec!(3500000));

        let journal = fx.store.transactions(SOURCE, 10).await.unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].direction, TransactionDirection::Credit);
        assert!(journal[0].description.starts_with("Refund:"));
    }

    #[tokio::test]
    async fn timeout_is_compensated_like_a_rejection() {
        let peer = FakePeer::answering(Err(PeerError::Timeout {
            peer: "abank".to_string(),
        }));
        let fx = fixture(peer, Arc::new(PermitAll)).await;

        let outcome = fx
            .saga
            .execute(PaymentRequest::new(SOURCE, REMOTE_DEST, dec!(3000), "RUB"))
            .await
            .unwrap();

        assert_eq!(
            outcome.payment.rejection.unwrap().kind,
            RejectionKind::PeerTimeout
        );
        assert_eq!(balance(&fx.store, SOURCE).await, dec!(10000));
    }

    #[tokio::test]
    async fn no_route_rejects_without_transfer() {
        let peer = FakePeer::answering(Ok(()));
        let fx = fixture(peer.clone(), Arc::new(PermitAll)).await;

        let outcome = fx
            .saga
            .execute(PaymentRequest::new(SOURCE, "30101810400000000225", dec!(3000), "RUB"))
            .await
            .unwrap();

        assert_eq!(outcome.payment.status, PaymentStatus::Rejected);
        assert_eq!(
            outcome.payment.rejection.unwrap().kind,
            RejectionKind::NoRouteFound
        );
        assert!(outcome.transfer.is_none());
        assert!(fx.store.transfers(10).await.unwrap().is_empty());
        assert_eq!(balance(&fx.store, SOURCE).await, dec!(10000));
        assert!(peer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn validation_failures_leave_no_trace() {
        let fx = fixture(FakePeer::answering(Ok(())), Arc::new(PermitAll)).await;

        let err = fx
            .saga
            .execute(PaymentRequest::new(SOURCE, REMOTE_DEST, dec!(10000.01), "RUB"))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::InsufficientFunds { .. }));

        let err = fx
            .saga
            .execute(PaymentRequest::new("40817810000000000404", LOCAL_DEST, dec!(1), "RUB"))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::SourceAccountNotFound(_)));

        let err = fx
            .saga
            .execute(PaymentRequest::new(SOURCE, SOURCE, dec!(1), "RUB"))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::SameAccount));

        let err = fx
            .saga
            .execute(PaymentRequest::new(SOURCE, LOCAL_DEST, dec!(1), "USD"))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::CurrencyMismatch { .. }));

        assert!(fx.store.payments(10).await.unwrap().is_empty());
        assert_eq!(balance(&fx.store, SOURCE).await, dec!(10000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_payments_never_overdraw_the_source() {
        let fx = fixture(FakePeer::answering(Ok(())), Arc::new(PermitAll)).await;
        let store = fx.store.clone();
        let saga = Arc::new(fx.saga);

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let saga = saga.clone();
            let destination = if i % 2 == 0 { LOCAL_DEST } else { REMOTE_DEST };
            tasks.spawn(async move {
                saga.execute(PaymentRequest::new(SOURCE, destination, dec!(3000), "RUB"))
                    .await
            });
        }

        let mut local_completed = Decimal::ZERO;
        let mut remote_completed = Decimal::ZERO;
        let mut refused = Decimal::ZERO;
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap() {
                Ok(outcome) => {
                    assert_eq!(outcome.payment.status, PaymentStatus::Completed);
                    if outcome.transfer.is_some() {
                        remote_completed += outcome.payment.amount;
                    } else {
                        local_completed += outcome.payment.amount;
                    }
                }
                Err(BankError::InsufficientFunds { requested, .. }) => refused += requested,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(local_completed + remote_completed, dec!(9000));
        assert_eq!(local_completed + remote_completed + refused, dec!(24000));
        assert_eq!(balance(&store, SOURCE).await, dec!(1000));
        assert_eq!(balance(&store, LOCAL_DEST).await, local_completed);
        assert_eq!(capital(&store).await, dec!(3500000) - remote_completed);

        let journal = store.transactions(SOURCE, 100).await.unwrap();
        assert_eq!(journal.len(), 3);
        assert!(journal.iter().all(|tx| tx.balance_after >= Decimal::ZERO));
    }

    #[tokio::test]
    async fn oversized_amount_is_refused_before_debit() {
        let fx = fixture(FakePeer::answering(Ok(())), Arc::new(PermitAll)).await;
        let err = fx
            .saga
            .execute(PaymentRequest::new(SOURCE, REMOTE_DEST, Decimal::MAX, "RUB"))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::InvalidAmount(_)));
        assert_eq!(balance(&fx.store, SOURCE).await, dec!(10000));
    }

    #[tokio::test]
    async fn completion_after_recovery_is_refused() {
        let fx = fixture(FakePeer::answering(Ok(())), Arc::new(PermitAll)).await;

        let payment = Payment::from_request(&PaymentRequest::new(SOURCE, REMOTE_DEST, dec!(2500), "RUB"));
        let transfer = InterbankTransfer::outgoing(&payment, BankCode::new("vbank"), BankCode::new("abank"));
        fx.store
            .commit(vec![
                Ledger::debit_write(Posting::new(SOURCE, dec!(2500), "Interbank transfer")),
                LedgerWrite::InsertPayment(payment.clone()),
                LedgerWrite::InsertTransfer(transfer.clone()),
            ])
            .await
            .unwrap();
        fx.saga.recover_stalled().await.unwrap();

        // A second process still holding the in-flight copies tries to finish.
        let mut stage = SagaStageMachine::resume(payment.payment_id.clone(), SagaStage::Settling);
        let err = fx.saga.finish(payment, transfer, &mut stage).await.unwrap_err();
        assert!(matches!(err, BankError::InvalidTransition { .. }));
        assert_eq!(balance(&fx.store, SOURCE).await, dec!(10000));
        assert_eq!(capital(&fx.store).await, dec!(3500000));
    }

    #[tokio::test]
    async fn authorizer_can_refuse_before_debit() {
        let fx = fixture(FakePeer::answering(Ok(())), Arc::new(DenyAll)).await;
        let err = fx
            .saga
            .execute(PaymentRequest::new(SOURCE, LOCAL_DEST, dec!(1), "RUB"))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::Unauthorized(_)));
        assert_eq!(balance(&fx.store, SOURCE).await, dec!(10000));
    }

    #[tokio::test]
    async fn recovery_refunds_payments_left_in_process() {
        let fx = fixture(FakePeer::answering(Ok(())), Arc::new(PermitAll)).await;

        let mut payment = Payment::from_request(&PaymentRequest::new(SOURCE, REMOTE_DEST, dec!(2500), "RUB"));
        payment.destination_bank = Some(BankCode::new("abank"));
        let transfer = InterbankTransfer::outgoing(&payment, BankCode::new("vbank"), BankCode::new("abank"));
        fx.store
            .commit(vec![
                Ledger::debit_write(Posting::new(SOURCE, dec!(2500), "Interbank transfer")),
                LedgerWrite::InsertPayment(payment.clone()),
                LedgerWrite::InsertTransfer(transfer.clone()),
            ])
            .await
            .unwrap();

        let recovered = fx.saga.recover_stalled().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].payment.status, PaymentStatus::Rejected);
        assert_eq!(
            recovered[0].transfer.as_ref().unwrap().status,
            TransferStatus::Failed
        );
        assert_eq!(balance(&fx.store, SOURCE).await, dec!(10000));
        assert!(fx.saga.recover_stalled().await.unwrap().is_empty());
    }
}
