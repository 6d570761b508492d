use crate::capital::{CapitalLedger, CapitalReport};
use crate::error::BankError;
use crate::ledger::Ledger;
use crate::peer::{PeerClient, PeerDirectory};
use crate::protocol::{AccountProbe, SettlementRequest};
use crate::routing::{ProbeRoutingResolver, RoutingResolver};
use crate::saga::{PaymentAuthorizer, PermitAll, SettlementSaga};
use crate::settlement::{SettlementReceipt, SettlementReceiver};
use crate::storage::{BankStore, StorageConfig};
use crate::types::{
    check_amount, Account, BankCode, InterbankTransfer, PaymentOutcome, PaymentRequest,
    Transaction,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// Settings for one bank node. The bank code is the node's identity on the
/// peer network and is never read from global state.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bank_code: BankCode,
    pub peers: PeerDirectory,
    pub storage: StorageConfig,
    pub initial_capital: Decimal,
    pub capital_tolerance: Decimal,
    pub default_currency: String,
}

impl NodeConfig {
    pub fn new(bank_code: impl Into<BankCode>) -> Self {
        Self {
            bank_code: bank_code.into(),
            peers: PeerDirectory::default(),
            storage: StorageConfig::Memory,
            initial_capital: Decimal::from(3_500_000),
            capital_tolerance: Decimal::from(1_000),
            default_currency: "RUB".to_string(),
        }
    }
}

/// Pluggable collaborators of a node.
pub struct NodeSeams {
    pub peers: Arc<dyn PeerClient>,
    pub router: Option<Arc<dyn RoutingResolver>>,
    pub authorizer: Arc<dyn PaymentAuthorizer>,
}

impl NodeSeams {
    /// Probe-based routing over `peers` and an authorizer that accepts all.
    pub fn new(peers: Arc<dyn PeerClient>) -> Self {
        Self {
            peers,
            router: None,
            authorizer: Arc::new(PermitAll),
        }
    }

    pub fn with_router(mut self, router: Arc<dyn RoutingResolver>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn PaymentAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }
}

/// One bank: its ledger, capital row, the sending saga and the receiving side.
pub struct BankNode {
    config: NodeConfig,
    store: Arc<BankStore>,
    ledger: Ledger,
    capital: CapitalLedger,
    saga: SettlementSaga,
    receiver: SettlementReceiver,
}

impl BankNode {
    /// Open storage, materialize the capital row and compensate any payment
    /// an earlier run left in flight.
    pub async fn bootstrap(config: NodeConfig, seams: NodeSeams) -> Result<Self, BankError> {
        let store = Arc::new(BankStore::bootstrap(config.storage.clone()).await?);
        let node = Self::assemble(config, store, seams);

        node.capital.ensure_row().await?;
        let recovered = node.saga.recover_stalled().await?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "compensated payments left in process");
        }

        info!(
            bank = %node.config.bank_code,
            storage = node.store.backend_label(),
            peers = node.config.peers.endpoints().len(),
            "bank node ready"
        );
        Ok(node)
    }

    fn assemble(config: NodeConfig, store: Arc<BankStore>, seams: NodeSeams) -> Self {
        let capital = CapitalLedger::new(
            store.clone(),
            config.bank_code.clone(),
            config.initial_capital,
            config.capital_tolerance,
        );
        let router: Arc<dyn RoutingResolver> = match seams.router {
            Some(router) => router,
            None => Arc::new(ProbeRoutingResolver::new(
                config.bank_code.clone(),
                config.peers.clone(),
                seams.peers.clone(),
            )),
        };
        let saga = SettlementSaga::new(
            store.clone(),
            capital.clone(),
            router,
            seams.peers,
            seams.authorizer,
        );
        let receiver = SettlementReceiver::new(store.clone(), capital.clone());

        Self {
            ledger: Ledger::new(store.clone()),
            config,
            store,
            capital,
            saga,
            receiver,
        }
    }

    pub fn bank_code(&self) -> &BankCode {
        &self.config.bank_code
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn storage_backend(&self) -> &'static str {
        self.store.backend_label()
    }

    pub async fn open_account(
        &self,
        account_number: &str,
        client_id: &str,
        currency: Option<&str>,
        opening_balance: Decimal,
    ) -> Result<Account, BankError> {
        if account_number.trim().is_empty() {
            return Err(BankError::Protocol("account_number must not be empty".to_string()));
        }
        if opening_balance < Decimal::ZERO {
            return Err(BankError::InvalidAmount(format!(
                "opening balance must not be negative, got {opening_balance}"
            )));
        }
        if !opening_balance.is_zero() {
            check_amount("opening", opening_balance)?;
        }
        let currency = currency.unwrap_or(self.config.default_currency.as_str());
        let account = self
            .ledger
            .open_account(Account::new(account_number, client_id, currency, opening_balance))
            .await?;
        info!(account = %account.account_number, client = %account.client_id, "account opened");
        Ok(account)
    }

    pub async fn close_account(&self, account_number: &str) -> Result<Account, BankError> {
        let account = self.ledger.close_account(account_number).await?;
        info!(account = %account.account_number, "account closed");
        Ok(account)
    }

    pub async fn account(&self, account_number: &str) -> Result<Account, BankError> {
        self.ledger
            .resolve_local(account_number)
            .await?
            .ok_or_else(|| BankError::AccountNotFound(account_number.to_string()))
    }

    pub async fn transactions(
        &self,
        account_number: &str,
        limit: usize,
    ) -> Result<Vec<Transaction>, BankError> {
        self.ledger.transactions(account_number, limit).await
    }

    pub async fn create_payment(&self, request: PaymentRequest) -> Result<PaymentOutcome, BankError> {
        self.saga.execute(request).await
    }

    pub async fn payment(&self, payment_id: &str) -> Result<PaymentOutcome, BankError> {
        let payment = self
            .store
            .payment(payment_id)
            .await?
            .ok_or_else(|| BankError::PaymentNotFound(payment_id.to_string()))?;
        let transfer = self.store.transfer_for_payment(payment_id).await?;
        Ok(PaymentOutcome { payment, transfer })
    }

    pub async fn payments(&self, limit: usize) -> Result<Vec<PaymentOutcome>, BankError> {
        let mut outcomes = Vec::new();
        for payment in self.store.payments(limit).await? {
            let transfer = self.store.transfer_for_payment(&payment.payment_id).await?;
            outcomes.push(PaymentOutcome { payment, transfer });
        }
        Ok(outcomes)
    }

    pub async fn transfers(&self, limit: usize) -> Result<Vec<InterbankTransfer>, BankError> {
        self.store.transfers(limit).await
    }

    pub async fn capital_report(&self) -> Result<CapitalReport, BankError> {
        self.capital.report().await
    }

    pub async fn receive_settlement(
        &self,
        request: SettlementRequest,
    ) -> Result<SettlementReceipt, BankError> {
        self.receiver.receive(request).await
    }

    pub async fn probe_account(&self, account_number: &str) -> Result<AccountProbe, BankError> {
        self.receiver.probe(account_number).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PeerError;
    use crate::protocol::SettlementResponse;
    use crate::types::PaymentStatus;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct Offline;

    #[async_trait]
    impl PeerClient for Offline {
        async fn probe_account(
            &self,
            peer: &BankCode,
            _account_number: &str,
        ) -> Result<AccountProbe, PeerError> {
            Err(PeerError::Transport {
                peer: peer.to_string(),
                message: "offline".to_string(),
            })
        }

        async fn settle(
            &self,
            peer: &BankCode,
            _request: &SettlementRequest,
        ) -> Result<SettlementResponse, PeerError> {
            Err(PeerError::Transport {
                peer: peer.to_string(),
                message: "offline".to_string(),
            })
        }
    }

    async fn node() -> BankNode {
        BankNode::bootstrap(NodeConfig::new("vbank"), NodeSeams::new(Arc::new(Offline)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn bootstrap_materializes_capital_baseline() {
        let node = node().await;
        let report = node.capital_report().await.unwrap();
        assert_eq!(report.capital, dec!(3500000));
        assert_eq!(report.net_flow, dec!(0));
        assert_eq!(node.storage_backend(), "memory");
    }

    #[tokio::test]
    async fn opens_accounts_in_default_currency() {
        let node = node().await;
        let account = node
            .open_account("40817810000000000001", "client-1", None, dec!(100))
            .await
            .unwrap();
        assert_eq!(account.currency, "RUB");

        let err = node
            .open_account("40817810000000000001", "client-1", None, dec!(0))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::AccountExists(_)));

        let err = node
            .open_account("40817810000000000002", "client-1", None, dec!(-1))
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::InvalidAmount(_)));

        let err = node
            .open_account("40817810000000000003", "client-1", None, Decimal::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn payment_lookup_includes_transfer_leg() {
        let node = node().await;
        node.open_account("40817810000000000001", "client-1", None, dec!(10000))
            .await
            .unwrap();

        let outcome = node
            .create_payment(PaymentRequest::new(
                "40817810000000000001",
                "40817810099910001234",
                dec!(3000),
                "RUB",
            ))
            .await
            .unwrap();
        assert_eq!(outcome.payment.status, PaymentStatus::Rejected);

        let fetched = node.payment(&outcome.payment.payment_id).await.unwrap();
        assert_eq!(fetched.payment.status, PaymentStatus::Rejected);
        assert_eq!(node.payments(10).await.unwrap().len(), 1);
        assert!(matches!(
            node.payment("pay-000000000000").await.unwrap_err(),
            BankError::PaymentNotFound(_)
        ));
    }
}
