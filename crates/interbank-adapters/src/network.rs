use async_trait::async_trait;
use interbank_core::error::{BankError, PeerError};
use interbank_core::node::BankNode;
use interbank_core::peer::PeerClient;
use interbank_core::protocol::{AccountProbe, SettlementRequest, SettlementResponse};
use interbank_core::types::BankCode;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::debug;

/// Routes peer calls straight into registered nodes of the same process.
///
/// Nodes are held weakly. Disconnected codes answer like a refused connection.
#[derive(Default)]
pub struct InProcessPeerNetwork {
    nodes: RwLock<HashMap<BankCode, Weak<BankNode>>>,
    disconnected: RwLock<HashSet<BankCode>>,
}

impl InProcessPeerNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, node: &Arc<BankNode>) {
        self.nodes
            .write()
            .await
            .insert(node.bank_code().clone(), Arc::downgrade(node));
    }

    pub async fn disconnect(&self, code: &BankCode) {
        self.disconnected.write().await.insert(code.clone());
    }

    pub async fn reconnect(&self, code: &BankCode) {
        self.disconnected.write().await.remove(code);
    }

    async fn reach(&self, peer: &BankCode) -> Result<Arc<BankNode>, PeerError> {
        if self.disconnected.read().await.contains(peer) {
            return Err(PeerError::Transport {
                peer: peer.to_string(),
                message: "peer disconnected".to_string(),
            });
        }
        self.nodes
            .read()
            .await
            .get(peer)
            .and_then(Weak::upgrade)
            .ok_or_else(|| PeerError::UnknownPeer(peer.to_string()))
    }
}

#[async_trait]
impl PeerClient for InProcessPeerNetwork {
    async fn probe_account(
        &self,
        peer: &BankCode,
        account_number: &str,
    ) -> Result<AccountProbe, PeerError> {
        let node = self.reach(peer).await?;
        node.probe_account(account_number)
            .await
            .map_err(|err| refusal(peer, err))
    }

    async fn settle(
        &self,
        peer: &BankCode,
        request: &SettlementRequest,
    ) -> Result<SettlementResponse, PeerError> {
        let node = self.reach(peer).await?;
        debug!(peer = %peer, transfer_id = %request.transfer_id, "in-process settlement");
        node.receive_settlement(request.clone())
            .await
            .map(|receipt| receipt.response)
            .map_err(|err| refusal(peer, err))
    }
}

/// Peer transport for a node with no reachable peers.
#[derive(Debug, Clone)]
pub struct UnreachablePeers {
    reason: String,
}

impl UnreachablePeers {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PeerClient for UnreachablePeers {
    async fn probe_account(
        &self,
        peer: &BankCode,
        _account_number: &str,
    ) -> Result<AccountProbe, PeerError> {
        Err(PeerError::Transport {
            peer: peer.to_string(),
            message: self.reason.clone(),
        })
    }

    async fn settle(
        &self,
        peer: &BankCode,
        _request: &SettlementRequest,
    ) -> Result<SettlementResponse, PeerError> {
        Err(PeerError::Transport {
            peer: peer.to_string(),
            message: self.reason.clone(),
        })
    }
}

fn refusal(peer: &BankCode, err: BankError) -> PeerError {
    let status = match &err {
        BankError::AccountNotFound(_) | BankError::DestinationAccountNotFound(_) => 404,
        BankError::DuplicateTransfer(_) => 409,
        BankError::Storage(_) => 500,
        _ => 400,
    };
    PeerError::Rejected {
        peer: peer.to_string(),
        status,
        message: err.to_string(),
    }
}
