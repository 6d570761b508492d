use async_trait::async_trait;
use interbank_core::error::PeerError;
use interbank_core::peer::{PeerClient, PeerDirectory};
use interbank_core::protocol::{
    AccountProbe, SettlementRequest, SettlementResponse, PROBE_PATH_PREFIX, PROTOCOL_HEADER,
    PROTOCOL_VERSION, RECEIVE_PATH, REQUESTING_BANK_HEADER,
};
use interbank_core::types::BankCode;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Per-call deadlines for peer requests.
#[derive(Debug, Clone, Copy)]
pub struct PeerTimeouts {
    pub probe: Duration,
    pub settle: Duration,
}

impl Default for PeerTimeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(5),
            settle: Duration::from_secs(10),
        }
    }
}

/// Peer transport over HTTP/JSON.
pub struct HttpPeerClient {
    client: Client,
    own_bank: BankCode,
    directory: PeerDirectory,
    timeouts: PeerTimeouts,
}

impl HttpPeerClient {
    pub fn new(
        own_bank: BankCode,
        directory: PeerDirectory,
        timeouts: PeerTimeouts,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(timeouts.probe.min(timeouts.settle))
            .build()?;

        Ok(Self {
            client,
            own_bank,
            directory,
            timeouts,
        })
    }

    fn url(&self, peer: &BankCode, path: &str) -> Result<String, PeerError> {
        let base = self
            .directory
            .base_url(peer)
            .ok_or_else(|| PeerError::UnknownPeer(peer.to_string()))?;
        Ok(format!("{base}{path}"))
    }

    /// Probe URL with the account number as one percent-encoded segment.
    fn probe_url(&self, peer: &BankCode, account_number: &str) -> Result<Url, PeerError> {
        let invalid = |message: String| PeerError::Protocol {
            peer: peer.to_string(),
            message,
        };
        let mut url = Url::parse(&self.url(peer, PROBE_PATH_PREFIX)?)
            .map_err(|err| invalid(format!("invalid peer url: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| invalid("peer url cannot carry a path".to_string()))?
            .push(account_number);
        Ok(url)
    }

    fn stamp(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(PROTOCOL_HEADER, PROTOCOL_VERSION.to_string())
            .header(REQUESTING_BANK_HEADER, self.own_bank.as_str())
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn probe_account(
        &self,
        peer: &BankCode,
        account_number: &str,
    ) -> Result<AccountProbe, PeerError> {
        let url = self.probe_url(peer, account_number)?;
        debug!(peer = %peer, account = account_number, "probing peer");

        let response = self
            .stamp(self.client.get(url))
            .timeout(self.timeouts.probe)
            .send()
            .await
            .map_err(|err| classify(peer, err))?;

        match response.status() {
            StatusCode::OK => decode(peer, response).await,
            StatusCode::NOT_FOUND => Ok(decode(peer, response)
                .await
                .unwrap_or_else(|_| AccountProbe {
                    exists: false,
                    account_number: account_number.to_string(),
                    bank_code: peer.clone(),
                })),
            _ => Err(rejected(peer, response).await),
        }
    }

    async fn settle(
        &self,
        peer: &BankCode,
        request: &SettlementRequest,
    ) -> Result<SettlementResponse, PeerError> {
        let url = self.url(peer, RECEIVE_PATH)?;
        debug!(peer = %peer, transfer_id = %request.transfer_id, "sending settlement");

        let response = self
            .stamp(self.client.post(&url))
            .timeout(self.timeouts.settle)
            .json(request)
            .send()
            .await
            .map_err(|err| classify(peer, err))?;

        if !response.status().is_success() {
            return Err(rejected(peer, response).await);
        }

        let answer: SettlementResponse = decode(peer, response).await?;
        if !answer.success {
            return Err(PeerError::Rejected {
                peer: peer.to_string(),
                status: StatusCode::OK.as_u16(),
                message: answer.message,
            });
        }
        if answer.transfer_id != request.transfer_id {
            return Err(PeerError::Protocol {
                peer: peer.to_string(),
                message: format!(
                    "acknowledged transfer '{}' instead of '{}'",
                    answer.transfer_id, request.transfer_id
                ),
            });
        }
        Ok(answer)
    }
}

fn classify(peer: &BankCode, err: reqwest::Error) -> PeerError {
    if err.is_timeout() {
        PeerError::Timeout {
            peer: peer.to_string(),
        }
    } else {
        PeerError::Transport {
            peer: peer.to_string(),
            message: err.to_string(),
        }
    }
}

async fn decode<T: DeserializeOwned>(peer: &BankCode, response: Response) -> Result<T, PeerError> {
    let bytes = response.bytes().await.map_err(|err| classify(peer, err))?;
    serde_json::from_slice(&bytes).map_err(|err| PeerError::Protocol {
        peer: peer.to_string(),
        message: format!("unreadable body: {err}"),
    })
}

async fn rejected(peer: &BankCode, response: Response) -> PeerError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| value.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(body);

    PeerError::Rejected {
        peer: peer.to_string(),
        status,
        message,
    }
}
