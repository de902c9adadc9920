//! Boundary to the Lightning node.
//!
//! The control plane never talks to a node directly: every call goes through
//! the `Backend` trait, implemented per node family (LND, Core Lightning, or a
//! remote proxy in front of LND). Calls that only exist for one family have
//! default implementations that reject with `BackendError`.
use core::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::channel::{de, Outpoint, PendingChannels, RawChannel};
use crate::errors::BackendError;

/// Node implementation family behind a backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// LND reached directly (REST or embedded).
    Lnd,
    /// Core Lightning, with route computation through routing layers.
    CoreLightning,
    /// LND behind a remote proxy; payment results arrive over a subscription.
    RemoteProxy,
}

/// Identity of our own node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub pubkey: String,
    #[serde(default)]
    pub alias: Option<String>,
}

/// Public information about a remote node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub pubkey: String,
    /// Announced alias; empty or absent for nodes that never announced one.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub num_channels: Option<u32>,
    /// Sum of the node's public channel capacities, in sat.
    #[serde(default)]
    pub total_capacity: Option<u64>,
}

/// Public graph information about a channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub channel_id: Option<String>,
    /// Funding outpoint as `txid:index`.
    #[serde(default)]
    pub chan_point: Option<String>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub capacity: Option<u64>,
    #[serde(default)]
    pub node1_pub: String,
    #[serde(default)]
    pub node2_pub: String,
    /// Forwarding policy announced by `node1_pub`.
    #[serde(default)]
    pub node1_policy: Option<RoutingPolicy>,
    /// Forwarding policy announced by `node2_pub`.
    #[serde(default)]
    pub node2_policy: Option<RoutingPolicy>,
}

/// Forwarding policy of one direction of a channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub time_lock_delta: u32,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub min_htlc: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub fee_base_msat: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub fee_rate_milli_msat: Option<u64>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub max_htlc_msat: Option<u64>,
}

impl ChannelInfo {
    /// Policy announced by `pubkey`, if it is one of the channel's endpoints.
    pub fn policy_of(&self, pubkey: &str) -> Option<&RoutingPolicy> {
        if pubkey == self.node1_pub {
            self.node1_policy.as_ref()
        } else if pubkey == self.node2_pub {
            self.node2_policy.as_ref()
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectPeerRequest {
    pub pubkey: String,
    /// `host:port` of the peer.
    pub host: String,
    /// Keep reconnecting to the peer.
    pub perm: bool,
}

/// Parameters of a single channel open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenChannelRequest {
    /// Pubkey of the counterparty.
    pub node_pubkey: String,
    /// Amount we commit to the channel, in sat.
    pub local_funding_amount_sat: u64,
    /// Fee rate of the funding transaction; node default when `None`.
    pub sat_per_vbyte: Option<u64>,
    /// Confirmations required of the spent wallet outputs.
    pub min_confs: Option<u32>,
    /// Do not announce the channel.
    pub private: bool,
}

/// Funding transaction outpoint returned by a single-call open.
pub type ChannelPoint = Outpoint;

/// Handle correlating the steps of one PSBT channel negotiation.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PendingChannelId(pub [u8; 32]);

/// PSBT funding shim attached to a channel open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PsbtShim {
    /// Id shared by every step of the negotiation.
    pub pending_chan_id: PendingChannelId,
    /// PSBT of the previous channel in a batch; `None` for the first channel.
    pub base_psbt: Option<String>,
    /// Set for all but the last channel of a batch.
    pub no_publish: bool,
}

/// Request from the node to fund a channel output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PsbtFundingRequest {
    /// Address of the channel's funding output.
    pub funding_address: String,
    /// Value the funding output must carry, in sat.
    pub funding_amount_sat: u64,
    /// Node-provided template PSBT, when the node already built one.
    pub psbt: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundPsbtRequest {
    /// PSBT to extend; `None` starts from an empty transaction.
    pub template_psbt: Option<String>,
    /// Outputs to add, as `(address, amount_sat)`.
    pub outputs: Vec<(String, u64)>,
    pub sat_per_vbyte: Option<u64>,
    /// Confirmations required of the selected inputs.
    pub min_confs: Option<u32>,
    /// Wallet account to spend from; the default account when `None`.
    pub account: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundedPsbt {
    /// Unsigned PSBT with inputs and change added.
    pub funded_psbt: String,
    /// Index of the change output, when one was added.
    pub change_output_index: Option<i32>,
}

/// Step of the node's funding state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FundingTransition {
    PsbtVerify {
        funded_psbt: String,
        pending_chan_id: PendingChannelId,
        skip_finalize: bool,
    },
    PsbtFinalize {
        signed_psbt: String,
        pending_chan_id: PendingChannelId,
    },
}

/// Answer of a funding state step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FundingStepResponse {
    /// Broadcast failure reported by a finalize step.
    pub publish_error: Option<String>,
    /// Funding transaction id, once published.
    pub txid: Option<String>,
}

/// How a close request addresses the channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseTarget {
    /// Outpoint-addressed backends (LND).
    Outpoint(Outpoint),
    /// Id-addressed backends (Core Lightning).
    ChannelId(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseChannelRequest {
    pub target: CloseTarget,
    /// Fee rate of the closing transaction; ignored by force closes.
    pub sat_per_vbyte: Option<u64>,
    /// Unilateral close.
    pub force: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloseChannelResponse {
    /// Whether the node accepted the close.
    pub success: bool,
    pub closing_txid: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvoiceRequest {
    pub memo: String,
    /// Invoice amount in sat.
    pub value_sat: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// BOLT 11 encoded invoice.
    pub payment_request: String,
    /// Hex payment hash.
    pub payment_hash: String,
    #[serde(default)]
    pub payment_secret: Option<String>,
    /// Final hop CLTV delta demanded by the invoice.
    #[serde(default)]
    pub min_final_cltv_expiry: Option<u32>,
}

/// Payment constrained to leave through one channel and return through a given last hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayInvoiceRequest {
    pub payment_request: String,
    /// Channels the payment may leave through.
    pub outgoing_chan_ids: Vec<String>,
    /// Raw 33-byte pubkey of the node before us on the return path.
    pub last_hop_pubkey: Vec<u8>,
    /// Routing fee ceiling, in sat.
    pub fee_limit_sat: u64,
    /// Required for circular payments.
    pub allow_self_payment: bool,
    /// Time the node may spend on the payment.
    pub timeout_seconds: u64,
    /// Largest number of parts of a multi-part payment.
    pub max_parts: u32,
}

/// Status update of a payment, as reported by the node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentUpdate {
    #[serde(default)]
    pub status: Option<String>,
    /// Status as named by remote-proxy payment events, read when `status` is absent.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Free-form failure text of remote-proxy payment events.
    #[serde(default)]
    pub failure_string: Option<String>,
    #[serde(default)]
    pub payment_hash: Option<String>,
    /// Present once the payment settled.
    #[serde(default)]
    pub payment_preimage: Option<String>,
    /// Routing fee paid, in sat.
    #[serde(default)]
    pub fee_sat: Option<u64>,
    /// Amount delivered, in sat.
    #[serde(default)]
    pub value_sat: Option<u64>,
}

impl PaymentUpdate {
    /// The reported status, falling back to `state`.
    pub fn reported_status(&self) -> Option<&str> {
        self.status
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.state.as_deref().filter(|s| !s.is_empty()))
    }

    /// The reported failure text, falling back to `failure_string`.
    pub fn failure_text(&self) -> Option<&str> {
        self.failure_reason
            .as_deref()
            .filter(|r| !r.is_empty())
            .or_else(|| self.failure_string.as_deref().filter(|r| !r.is_empty()))
    }
}

/// Result of a pay-invoice call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayInvoiceResponse {
    /// The call settled with a payment record and/or an error string.
    Settled {
        result: Option<PaymentUpdate>,
        payment_error: Option<String>,
    },
    /// The call only started the payment; updates arrive on a subscription.
    Streaming(SubscriptionHandle),
}

/// Key of a payment update subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub String);

/// Stream of payment updates for a subscription.
pub type PaymentStream = BoxStream<'static, Result<PaymentUpdate, BackendError>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerChannelUpdate {
    pub layer: String,
    /// `<scid>/<direction>`
    pub short_channel_id_dir: String,
    /// `false` removes the direction from route computation.
    pub enabled: bool,
}

/// Route computation request for layered routing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteQuery {
    /// Pubkey the route starts from.
    pub source: String,
    /// Pubkey the route ends at.
    pub destination: String,
    pub amount_msat: u64,
    /// Fee ceiling of the whole route.
    pub maxfee_msat: u64,
    /// Routing layers applied on top of the gossip graph.
    pub layers: Vec<String>,
    pub final_cltv: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routes {
    #[serde(default)]
    pub routes: Vec<Route>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Amount delivered to the destination.
    pub amount_msat: u64,
    pub final_cltv: u32,
    /// Hops after the route's source.
    pub path: Vec<RouteHop>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    /// `<scid>/<direction>` of the channel used by the hop.
    pub short_channel_id_dir: String,
    /// Node the hop reaches.
    pub next_node_id: String,
    /// Amount entering the hop's channel.
    pub amount_msat: u64,
    /// CLTV of the HTLC entering the hop's channel.
    pub delay: u32,
}

/// Hop of an explicit payment route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPayHop {
    /// Node reached through `channel`.
    pub id: String,
    /// Short channel id, without direction.
    pub channel: String,
    pub amount_msat: u64,
    pub delay: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendPayRequest {
    /// Hops starting at our first peer.
    pub route: Vec<SendPayHop>,
    pub payment_hash: String,
    pub payment_secret: Option<String>,
    /// Invoice being paid.
    pub bolt11: String,
}

/// Interface to a Lightning node.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Implementation family of the node.
    fn kind(&self) -> BackendKind;

    /// Whether the node reports pending and closed channels.
    fn supports_pending_channels(&self) -> bool {
        true
    }

    /// Whether the node can look up aliases of remote nodes.
    fn supports_node_info(&self) -> bool {
        true
    }

    /// Returns the identity of our node.
    async fn get_info(&self) -> Result<NodeIdentity, BackendError>;

    async fn get_channels(&self) -> Result<Vec<RawChannel>, BackendError>;

    async fn get_pending_channels(&self) -> Result<PendingChannels, BackendError>;

    async fn get_closed_channels(&self) -> Result<Vec<RawChannel>, BackendError>;

    /// Looks up public information about a remote node.
    async fn get_node_info(&self, pubkey: &str) -> Result<NodeInfo, BackendError>;

    /// Looks up graph information about one of our channels.
    async fn get_chan_info(&self, chan_id: &str) -> Result<ChannelInfo, BackendError> {
        Err(unsupported("channel info lookups", chan_id))
    }

    async fn connect_peer(&self, request: ConnectPeerRequest) -> Result<(), BackendError>;

    /// Opens a channel in one call, funding it from the default wallet account.
    async fn open_channel_sync(
        &self,
        request: OpenChannelRequest,
    ) -> Result<ChannelPoint, BackendError>;

    /// Starts a channel open funded by an externally built PSBT.
    async fn open_channel_psbt(
        &self,
        request: OpenChannelRequest,
        shim: PsbtShim,
    ) -> Result<PsbtFundingRequest, BackendError>;

    async fn fund_psbt(&self, request: FundPsbtRequest) -> Result<FundedPsbt, BackendError>;

    /// Obtains signatures for the PSBT and returns the signed PSBT.
    async fn sign_psbt(&self, psbt: &str) -> Result<String, BackendError>;

    async fn funding_state_step(
        &self,
        step: FundingTransition,
    ) -> Result<FundingStepResponse, BackendError>;

    async fn close_channel(
        &self,
        request: CloseChannelRequest,
    ) -> Result<CloseChannelResponse, BackendError>;

    async fn create_invoice(&self, request: InvoiceRequest) -> Result<Invoice, BackendError>;

    async fn pay_lightning_invoice(
        &self,
        request: PayInvoiceRequest,
    ) -> Result<PayInvoiceResponse, BackendError>;

    /// Subscribes to updates of a streaming payment.
    async fn subscribe_payment(
        &self,
        handle: &SubscriptionHandle,
    ) -> Result<PaymentStream, BackendError> {
        Err(unsupported("payment subscriptions", &handle.0))
    }

    /// Tears down a payment subscription.
    async fn unsubscribe_payment(&self, _handle: &SubscriptionHandle) {}

    async fn ask_rene_create_layer(&self, layer: &str) -> Result<(), BackendError> {
        Err(unsupported("routing layers", layer))
    }

    async fn ask_rene_update_channel(
        &self,
        update: LayerChannelUpdate,
    ) -> Result<(), BackendError> {
        Err(unsupported("routing layers", &update.layer))
    }

    async fn ask_rene_remove_layer(&self, layer: &str) -> Result<(), BackendError> {
        Err(unsupported("routing layers", layer))
    }

    async fn get_routes(&self, query: RouteQuery) -> Result<Routes, BackendError> {
        Err(unsupported("route queries", &query.destination))
    }

    async fn send_pay(&self, request: SendPayRequest) -> Result<(), BackendError> {
        Err(unsupported("explicit routes", &request.payment_hash))
    }

    async fn wait_send_pay(&self, payment_hash: &str) -> Result<PaymentUpdate, BackendError> {
        Err(unsupported("explicit routes", payment_hash))
    }
}

fn unsupported(what: &str, subject: &str) -> BackendError {
    BackendError::new(format!("{} are not supported by this backend ({})", what, subject))
}

impl PendingChannelId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        PendingChannelId(bytes)
    }

    /// Returns a hex representation of the id.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0[..])
    }
}

impl fmt::Debug for PendingChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PendingChannelId({})", self.to_hex())
    }
}

impl fmt::Display for PendingChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_hex().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_info_accepts_string_integers() {
        let info: ChannelInfo = serde_json::from_str(
            r#"{
                "channel_id": "770495967390531585",
                "chan_point": "ab:0",
                "capacity": "100000",
                "node1_pub": "02aa",
                "node2_pub": "02ff",
                "node1_policy": {"time_lock_delta": 80, "fee_base_msat": "1000", "fee_rate_milli_msat": 1},
                "node2_policy": {"disabled": true}
            }"#,
        )
        .unwrap();
        assert_eq!(info.channel_id.as_deref(), Some("770495967390531585"));
        assert_eq!(info.capacity, Some(100_000));
        assert_eq!(info.policy_of("02aa").unwrap().fee_base_msat, Some(1000));
        assert!(info.policy_of("02ff").unwrap().disabled);
        assert_eq!(info.policy_of("03cc"), None);
    }

    #[tokio::test]
    async fn optional_calls_are_unsupported_by_default() {
        struct Minimal;

        #[async_trait]
        impl Backend for Minimal {
            fn kind(&self) -> BackendKind {
                BackendKind::Lnd
            }
            async fn get_info(&self) -> Result<NodeIdentity, BackendError> {
                unimplemented!()
            }
            async fn get_channels(&self) -> Result<Vec<RawChannel>, BackendError> {
                unimplemented!()
            }
            async fn get_pending_channels(&self) -> Result<PendingChannels, BackendError> {
                unimplemented!()
            }
            async fn get_closed_channels(&self) -> Result<Vec<RawChannel>, BackendError> {
                unimplemented!()
            }
            async fn get_node_info(&self, _pubkey: &str) -> Result<NodeInfo, BackendError> {
                unimplemented!()
            }
            async fn connect_peer(&self, _r: ConnectPeerRequest) -> Result<(), BackendError> {
                unimplemented!()
            }
            async fn open_channel_sync(
                &self,
                _r: OpenChannelRequest,
            ) -> Result<ChannelPoint, BackendError> {
                unimplemented!()
            }
            async fn open_channel_psbt(
                &self,
                _r: OpenChannelRequest,
                _shim: PsbtShim,
            ) -> Result<PsbtFundingRequest, BackendError> {
                unimplemented!()
            }
            async fn fund_psbt(&self, _r: FundPsbtRequest) -> Result<FundedPsbt, BackendError> {
                unimplemented!()
            }
            async fn sign_psbt(&self, _psbt: &str) -> Result<String, BackendError> {
                unimplemented!()
            }
            async fn funding_state_step(
                &self,
                _step: FundingTransition,
            ) -> Result<FundingStepResponse, BackendError> {
                unimplemented!()
            }
            async fn close_channel(
                &self,
                _r: CloseChannelRequest,
            ) -> Result<CloseChannelResponse, BackendError> {
                unimplemented!()
            }
            async fn create_invoice(&self, _r: InvoiceRequest) -> Result<Invoice, BackendError> {
                unimplemented!()
            }
            async fn pay_lightning_invoice(
                &self,
                _r: PayInvoiceRequest,
            ) -> Result<PayInvoiceResponse, BackendError> {
                unimplemented!()
            }
        }

        let err = Minimal.get_chan_info("42").await.unwrap_err();
        assert_eq!(
            err.message,
            "channel info lookups are not supported by this backend (42)"
        );
        assert!(Minimal.ask_rene_create_layer("l").await.is_err());
    }
}
