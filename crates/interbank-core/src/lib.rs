//! Core of an interbank settlement node.
//!
//! Each node owns its accounts and a capital row. Payments to accounts held by
//! a peer bank run as a saga: debit locally, settle with the peer, refund on
//! failure. Inbound settlements are credited at most once per transfer id.

#![deny(unsafe_code)]

pub mod capital;
pub mod error;
pub mod flow;
pub mod ledger;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod routing;
pub mod saga;
pub mod settlement;
pub mod storage;
pub mod types;

pub use capital::{CapitalLedger, CapitalReport};
pub use error::{BankError, PeerError};
pub use flow::{SagaStage, SagaStageMachine};
pub use ledger::Ledger;
pub use node::{BankNode, NodeConfig, NodeSeams};
pub use peer::{PeerClient, PeerDirectory, PeerEndpoint};
pub use protocol::{
    AccountProbe, SettlementRequest, SettlementResponse, PROTOCOL_HEADER, PROTOCOL_VERSION,
    REQUESTING_BANK_HEADER,
};
pub use routing::{ProbeRoutingResolver, RoutingResolver, StaticRoutingTable};
pub use saga::{PaymentAuthorizer, PermitAll, SettlementSaga};
pub use settlement::{SettlementReceipt, SettlementReceiver};
pub use storage::{BankStore, CommitReceipt, LedgerWrite, Posting, StorageConfig};
pub use types::{
    Account, AccountStatus, BankCapital, BankCode, InterbankTransfer, Payment, PaymentOutcome,
    PaymentRequest, PaymentStatus, Rejection, RejectionKind, Transaction, TransactionDirection,
    TransferDirection, TransferStatus,
};
