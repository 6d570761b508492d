use crate::error::BankError;
use crate::peer::{PeerClient, PeerDirectory};
use crate::types::BankCode;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Maps an account number that is not local to the peer bank that owns it.
///
/// `Ok(None)` means no peer claims the account.
#[async_trait]
pub trait RoutingResolver: Send + Sync {
    async fn resolve(&self, account_number: &str) -> Result<Option<BankCode>, BankError>;
}

/// Asks each configured peer in directory order whether it holds the account.
///
/// The first positive answer wins. A failed probe counts as a negative answer
/// for that peer.
pub struct ProbeRoutingResolver {
    own_bank: BankCode,
    directory: PeerDirectory,
    client: Arc<dyn PeerClient>,
}

impl ProbeRoutingResolver {
    pub fn new(own_bank: BankCode, directory: PeerDirectory, client: Arc<dyn PeerClient>) -> Self {
        Self {
            own_bank,
            directory,
            client,
        }
    }
}

#[async_trait]
impl RoutingResolver for ProbeRoutingResolver {
    async fn resolve(&self, account_number: &str) -> Result<Option<BankCode>, BankError> {
        for peer in self.directory.codes_excluding(&self.own_bank) {
            match self.client.probe_account(peer, account_number).await {
                Ok(probe) if probe.exists && &probe.bank_code == peer => {
                    debug!(account = account_number, peer = %peer, "route resolved");
                    return Ok(Some(peer.clone()));
                }
                Ok(probe) if probe.exists => {
                    warn!(
                        account = account_number,
                        peer = %peer,
                        claimed = %probe.bank_code,
                        "ignoring probe answer for a different bank code"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(account = account_number, peer = %peer, error = %err, "probe failed");
                }
            }
        }
        Ok(None)
    }
}

/// Fixed prefix table. Longest matching prefix wins.
#[derive(Debug, Clone, Default)]
pub struct StaticRoutingTable {
    routes: Vec<(String, BankCode)>,
}

impl StaticRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, prefix: impl Into<String>, bank: impl Into<BankCode>) -> Self {
        self.routes.push((prefix.into(), bank.into()));
        self
    }
}

#[async_trait]
impl RoutingResolver for StaticRoutingTable {
    async fn resolve(&self, account_number: &str) -> Result<Option<BankCode>, BankError> {
        Ok(self
            .routes
            .iter()
            .filter(|(prefix, _)| account_number.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, bank)| bank.clone()))
    }
}
