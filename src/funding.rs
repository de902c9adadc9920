//! Channel funding: single-call opens and PSBT-funded (batch) opens.
//!
//! A batch chains every channel onto the same funding transaction: channel
//! `i + 1` is opened with the PSBT signed for channel `i` as its base, every
//! verification but the last skips finalization, and only the final step
//! publishes. Any failure stops the flow before finalization, so nothing is
//! broadcast for a partial batch.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, ChannelPoint, ConnectPeerRequest, FundPsbtRequest, FundingTransition,
    OpenChannelRequest, PendingChannelId, PsbtShim,
};
use crate::config;
use crate::errors::{ChannelError, FundingStep};

/// Extra channel of a batch open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalChannel {
    pub pubkey: String,
    #[serde(default)]
    pub host: Option<String>,
    pub sat_amount: u64,
}

/// User intent to open one or more channels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingRequest {
    pub node_pubkey: String,
    /// Peer address; the peer is not connected when absent.
    #[serde(default)]
    pub host: Option<String>,
    pub local_funding_amount_sat: u64,
    #[serde(default)]
    pub sat_per_vbyte: Option<u64>,
    #[serde(default)]
    pub min_confs: Option<u32>,
    #[serde(default)]
    pub private: bool,
    /// Wallet account to fund from; `None` is the default account.
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub additional_channels: Vec<AdditionalChannel>,
}

/// State of the funding flow, published to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FundingState {
    Idle,
    PeerConnect { index: usize },
    FundingRequested { index: usize },
    PsbtFunded { index: usize },
    PsbtSigned { index: usize },
    PsbtVerified { index: usize },
    PsbtFinalized,
    Published { txid: Option<String> },
    Failed { step: FundingStep, message: String },
}

/// Successful result of a funding attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FundingOutcome {
    /// Single-call open; the node reports the funding outpoint.
    Opened(ChannelPoint),
    /// PSBT flow; the funding transaction was published.
    Published { txid: Option<String> },
}

/// Result of connecting to a peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
}

/// One channel of a (possibly single-element) batch.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ChannelTarget {
    pubkey: String,
    host: Option<String>,
    amount_sat: u64,
}

impl FundingRequest {
    fn targets(&self) -> Vec<ChannelTarget> {
        Some(ChannelTarget {
            pubkey: self.node_pubkey.clone(),
            host: self.host.clone(),
            amount_sat: self.local_funding_amount_sat,
        })
        .into_iter()
        .chain(self.additional_channels.iter().map(|c| ChannelTarget {
            pubkey: c.pubkey.clone(),
            host: c.host.clone(),
            amount_sat: c.sat_amount,
        }))
        .collect()
    }

    /// Number of channels opened by the request.
    pub fn channel_count(&self) -> usize {
        1 + self.additional_channels.len()
    }

    fn validate(&self) -> Result<(), ChannelError> {
        for target in self.targets() {
            if target.pubkey.is_empty() {
                return Err(ChannelError::InvalidFundingRequest(
                    "node pubkey is missing".into(),
                ));
            }
            if target.amount_sat == 0 {
                return Err(ChannelError::InvalidFundingRequest(format!(
                    "funding amount for {} must be positive",
                    target.pubkey
                )));
            }
        }
        Ok(())
    }

    fn open_request(&self, target: &ChannelTarget) -> OpenChannelRequest {
        OpenChannelRequest {
            node_pubkey: target.pubkey.clone(),
            local_funding_amount_sat: target.amount_sat,
            sat_per_vbyte: self.sat_per_vbyte,
            min_confs: self.min_confs,
            private: self.private,
        }
    }
}

/// Connects to a peer. "Already connected" rejections count as success.
pub async fn connect_peer<B>(
    backend: &B,
    pubkey: &str,
    host: &str,
) -> Result<ConnectOutcome, ChannelError>
where
    B: Backend + ?Sized,
{
    let request = ConnectPeerRequest {
        pubkey: pubkey.to_string(),
        host: host.to_string(),
        perm: false,
    };
    match backend.connect_peer(request).await {
        Ok(()) => Ok(ConnectOutcome::Connected),
        Err(e) if e.message.to_lowercase().contains("already") => {
            debug!(%pubkey, "peer already connected");
            Ok(ConnectOutcome::AlreadyConnected)
        }
        Err(e) => Err(ChannelError::rejected(e)),
    }
}

/// Drives channel funding against a backend.
pub struct FundingStateMachine<B: Backend + ?Sized> {
    backend: Arc<B>,
    config: config::Funding,
    state: watch::Sender<FundingState>,
    request: Option<FundingRequest>,
    pending_chan_ids: Vec<PendingChannelId>,
    last_signed_psbt: Option<String>,
}

impl<B: Backend + ?Sized> FundingStateMachine<B> {
    pub fn new(backend: Arc<B>, config: config::Funding) -> Self {
        let (state, _) = watch::channel(FundingState::Idle);
        FundingStateMachine {
            backend,
            config,
            state,
            request: None,
            pending_chan_ids: Vec::new(),
            last_signed_psbt: None,
        }
    }

    /// Subscribes to funding state changes.
    pub fn subscribe(&self) -> watch::Receiver<FundingState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> FundingState {
        self.state.borrow().clone()
    }

    /// Request of the attempt in progress.
    pub fn request(&self) -> Option<&FundingRequest> {
        self.request.as_ref()
    }

    /// Pending-channel ids issued by the attempt in progress.
    pub fn pending_chan_ids(&self) -> &[PendingChannelId] {
        &self.pending_chan_ids
    }

    /// Last PSBT signed by the wallet. Kept after a failure for diagnostics.
    pub fn last_signed_psbt(&self) -> Option<&str> {
        self.last_signed_psbt.as_deref()
    }

    /// Whether the request can skip PSBT orchestration.
    pub fn is_direct(&self, request: &FundingRequest) -> bool {
        request.additional_channels.is_empty()
            && request
                .account
                .as_ref()
                .map(|a| a == &self.config.default_account)
                .unwrap_or(true)
    }

    /// Opens the channels of `request`.
    pub async fn open(&mut self, request: FundingRequest) -> Result<FundingOutcome, ChannelError> {
        request.validate()?;
        self.request = Some(request.clone());
        self.pending_chan_ids.clear();
        self.last_signed_psbt = None;

        let result = if self.is_direct(&request) {
            self.open_direct(&request).await
        } else {
            self.open_psbt(&request).await
        };

        self.request = None;
        self.pending_chan_ids.clear();
        match &result {
            Ok(outcome) => {
                self.last_signed_psbt = None;
                info!(?outcome, channels = request.channel_count(), "channel funding completed");
            }
            Err(ChannelError::BatchFailed { step, source }) => {
                warn!(%step, error = %source, "channel funding failed");
                self.transition(FundingState::Failed {
                    step: *step,
                    message: source.to_string(),
                });
            }
            Err(e) => warn!(error = %e, "channel funding failed"),
        }
        result
    }

    async fn open_direct(&mut self, request: &FundingRequest) -> Result<FundingOutcome, ChannelError> {
        let targets = request.targets();
        let target = &targets[0];
        self.connect(0, target).await?;
        debug!(pubkey = %target.pubkey, "opening channel in a single call");
        let point = self
            .backend
            .open_channel_sync(request.open_request(target))
            .await
            .map_err(|e| failed(FundingStep::DirectOpen, ChannelError::rejected(e)))?;
        let txid = Some(point.txid.clone());
        self.transition(FundingState::Published { txid });
        Ok(FundingOutcome::Opened(point))
    }

    async fn open_psbt(&mut self, request: &FundingRequest) -> Result<FundingOutcome, ChannelError> {
        let targets = request.targets();
        let last = targets.len() - 1;
        let mut previous: Option<String> = None;

        for (i, target) in targets.iter().enumerate() {
            self.connect(i, target).await?;

            let pending_chan_id = PendingChannelId::random();
            self.pending_chan_ids.push(pending_chan_id);
            let shim = PsbtShim {
                pending_chan_id,
                base_psbt: previous.clone(),
                no_publish: i < last,
            };
            let funding = self
                .backend
                .open_channel_psbt(request.open_request(target), shim)
                .await
                .map_err(|e| failed(FundingStep::FundingRequested(i), ChannelError::rejected(e)))?;
            self.transition(FundingState::FundingRequested { index: i });

            let funded = self
                .backend
                .fund_psbt(FundPsbtRequest {
                    template_psbt: funding.psbt.or_else(|| previous.clone()),
                    outputs: vec![(funding.funding_address, funding.funding_amount_sat)],
                    sat_per_vbyte: request.sat_per_vbyte,
                    min_confs: request.min_confs,
                    account: request.account.clone(),
                })
                .await
                .map_err(|e| failed(FundingStep::PsbtFunded(i), ChannelError::rejected(e)))?;
            self.transition(FundingState::PsbtFunded { index: i });

            let signed = self
                .backend
                .sign_psbt(&funded.funded_psbt)
                .await
                .map_err(|e| failed(FundingStep::PsbtSigned(i), ChannelError::rejected(e)))?;
            self.last_signed_psbt = Some(signed.clone());
            self.transition(FundingState::PsbtSigned { index: i });

            self.backend
                .funding_state_step(FundingTransition::PsbtVerify {
                    funded_psbt: signed.clone(),
                    pending_chan_id,
                    skip_finalize: i < last,
                })
                .await
                .map_err(|e| failed(FundingStep::PsbtVerified(i), ChannelError::rejected(e)))?;
            self.transition(FundingState::PsbtVerified { index: i });

            previous = Some(signed);
        }

        let signed_psbt = previous.unwrap_or_default();
        let pending_chan_id = match self.pending_chan_ids.last() {
            Some(id) => *id,
            None => {
                return Err(failed(
                    FundingStep::PsbtFinalized,
                    ChannelError::InvalidFundingRequest("no channel to finalize".into()),
                ))
            }
        };
        let response = self
            .backend
            .funding_state_step(FundingTransition::PsbtFinalize {
                signed_psbt,
                pending_chan_id,
            })
            .await
            .map_err(|e| failed(FundingStep::PsbtFinalized, ChannelError::rejected(e)))?;
        if let Some(publish_error) = response.publish_error.filter(|e| !e.is_empty()) {
            return Err(failed(
                FundingStep::PsbtFinalized,
                ChannelError::PublishFailed(publish_error),
            ));
        }
        self.transition(FundingState::PsbtFinalized);
        self.transition(FundingState::Published {
            txid: response.txid.clone(),
        });
        Ok(FundingOutcome::Published { txid: response.txid })
    }

    async fn connect(&mut self, index: usize, target: &ChannelTarget) -> Result<(), ChannelError> {
        if let Some(host) = target.host.as_deref().filter(|h| !h.is_empty()) {
            self.transition(FundingState::PeerConnect { index });
            connect_peer(&*self.backend, &target.pubkey, host)
                .await
                .map_err(|e| failed(FundingStep::PeerConnect(index), e))?;
        }
        Ok(())
    }

    fn transition(&self, state: FundingState) {
        debug!(?state, "funding state");
        self.state.send_replace(state);
    }
}

fn failed(step: FundingStep, source: ChannelError) -> ChannelError {
    ChannelError::BatchFailed {
        step,
        source: Box::new(source),
    }
}
