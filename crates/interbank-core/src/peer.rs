use crate::error::{BankError, PeerError};
use crate::protocol::{AccountProbe, SettlementRequest, SettlementResponse};
use crate::types::BankCode;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

/// Transport to peer nodes.
///
/// Implementations classify every failure into a [`PeerError`]; a negative
/// probe answer is `Ok` with `exists == false`.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn probe_account(
        &self,
        peer: &BankCode,
        account_number: &str,
    ) -> Result<AccountProbe, PeerError>;

    async fn settle(
        &self,
        peer: &BankCode,
        request: &SettlementRequest,
    ) -> Result<SettlementResponse, PeerError>;
}

/// One statically configured peer, written `CODE=URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub code: BankCode,
    pub base_url: String,
}

impl PeerEndpoint {
    pub fn new(code: impl Into<BankCode>, base_url: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl FromStr for PeerEndpoint {
    type Err = BankError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (code, url) = value.split_once('=').ok_or_else(|| {
            BankError::Protocol(format!("peer '{value}' must be written CODE=URL"))
        })?;
        let code = code.trim();
        let url = url.trim();
        if code.is_empty() || url.is_empty() {
            return Err(BankError::Protocol(format!(
                "peer '{value}' has an empty code or url"
            )));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(BankError::Protocol(format!(
                "peer url '{url}' must start with http:// or https://"
            )));
        }
        Ok(Self::new(BankCode::new(code), url))
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.code, self.base_url)
    }
}

/// Ordered peer list. Probing follows this order.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: Vec<PeerEndpoint>,
}

impl PeerDirectory {
    pub fn new(peers: Vec<PeerEndpoint>) -> Self {
        let mut unique: Vec<PeerEndpoint> = Vec::with_capacity(peers.len());
        for peer in peers {
            if !unique.iter().any(|known| known.code == peer.code) {
                unique.push(peer);
            }
        }
        Self { peers: unique }
    }

    pub fn endpoints(&self) -> &[PeerEndpoint] {
        &self.peers
    }

    pub fn base_url(&self, code: &BankCode) -> Option<&str> {
        self.peers
            .iter()
            .find(|peer| &peer.code == code)
            .map(|peer| peer.base_url.as_str())
    }

    pub fn codes_excluding<'a>(&'a self, own: &'a BankCode) -> impl Iterator<Item = &'a BankCode> {
        self.peers
            .iter()
            .map(|peer| &peer.code)
            .filter(move |code| *code != own)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_code_equals_url() {
        let peer: PeerEndpoint = "abank=http://abank:8000/".parse().unwrap();
        assert_eq!(peer.code, BankCode::new("abank"));
        assert_eq!(peer.base_url, "http://abank:8000");
        assert_eq!(peer.to_string(), "abank=http://abank:8000");

        assert!("abank".parse::<PeerEndpoint>().is_err());
        assert!("abank=abank:8000".parse::<PeerEndpoint>().is_err());
        assert!("=http://x".parse::<PeerEndpoint>().is_err());
    }

    #[test]
    fn directory_keeps_order_and_skips_self() {
        let directory = PeerDirectory::new(vec![
            PeerEndpoint::new("vbank", "http://vbank:8000"),
            PeerEndpoint::new("abank", "http://abank:8000"),
            PeerEndpoint::new("sbank", "http://sbank:8000"),
            PeerEndpoint::new("abank", "http://other:9000"),
        ]);
        let own = BankCode::new("vbank");
        let codes: Vec<&str> = directory.codes_excluding(&own).map(BankCode::as_str).collect();
        assert_eq!(codes, vec!["abank", "sbank"]);
        assert_eq!(
            directory.base_url(&BankCode::new("abank")),
            Some("http://abank:8000")
        );
    }
}
