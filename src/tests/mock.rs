//! Scripted backend that records every call.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time;

use crate::backend::*;
use crate::channel::{PendingChannels, RawChannel};
use crate::errors::BackendError;

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    GetInfo,
    GetChannels,
    GetPendingChannels,
    GetClosedChannels,
    GetNodeInfo(String),
    GetChanInfo(String),
    ConnectPeer(String),
    OpenChannelSync(String),
    OpenChannelPsbt {
        pubkey: String,
        base_psbt: Option<String>,
        no_publish: bool,
    },
    FundPsbt {
        template_psbt: Option<String>,
    },
    SignPsbt(String),
    PsbtVerify {
        psbt: String,
        skip_finalize: bool,
    },
    PsbtFinalize {
        psbt: String,
    },
    CloseChannel(CloseChannelRequest),
    CreateInvoice(InvoiceRequest),
    PayInvoice(PayInvoiceRequest),
    SubscribePayment(String),
    UnsubscribePayment(String),
    CreateLayer(String),
    UpdateChannel(String),
    RemoveLayer(String),
    GetRoutes(RouteQuery),
    SendPay(Vec<SendPayHop>),
    WaitSendPay(String),
}

/// Responses and delays the mock replays.
pub struct Script {
    pub own_pubkey: String,
    pub channels: Vec<RawChannel>,
    pub pending: PendingChannels,
    pub closed: Vec<RawChannel>,
    pub fetch_delay: Duration,

    /// Known node aliases; lookups of other pubkeys fail.
    pub aliases: HashMap<String, String>,
    pub node_info_delay: HashMap<String, Duration>,
    /// Graph information by channel id; lookups of other ids fail.
    pub chan_info: HashMap<String, ChannelInfo>,

    /// Method name -> (failing call index, or every call; error text).
    pub failures: HashMap<&'static str, (Option<usize>, String)>,

    pub close_delay: Duration,
    pub close_result: Result<CloseChannelResponse, BackendError>,

    pub pay_response: PayInvoiceResponse,
    /// Updates emitted by a subscription before it goes silent.
    pub stream_updates: Vec<PaymentUpdate>,

    pub routes: Routes,
    pub wait_send_pay: PaymentUpdate,

    pub finalize_response: FundingStepResponse,
}

pub struct MockBackend {
    kind: BackendKind,
    pub pending_support: bool,
    pub node_info_support: bool,
    script: Mutex<Script>,
    calls: Mutex<Vec<Call>>,
    counts: Mutex<HashMap<&'static str, usize>>,
}

impl Default for Script {
    fn default() -> Self {
        Script {
            own_pubkey: "02ff".into(),
            channels: Vec::new(),
            pending: PendingChannels::default(),
            closed: Vec::new(),
            fetch_delay: Duration::from_millis(0),
            aliases: HashMap::new(),
            node_info_delay: HashMap::new(),
            chan_info: HashMap::new(),
            failures: HashMap::new(),
            close_delay: Duration::from_secs(1),
            close_result: Ok(CloseChannelResponse {
                success: true,
                closing_txid: Some("c105e".into()),
            }),
            pay_response: PayInvoiceResponse::Settled {
                result: None,
                payment_error: None,
            },
            stream_updates: Vec::new(),
            routes: Routes::default(),
            wait_send_pay: PaymentUpdate::default(),
            finalize_response: FundingStepResponse {
                publish_error: None,
                txid: Some("f00d".into()),
            },
        }
    }
}

impl MockBackend {
    pub fn new(kind: BackendKind, script: Script) -> Self {
        MockBackend {
            kind,
            pending_support: true,
            node_info_support: true,
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn script<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        let mut script = self.script.lock().unwrap();
        f(&mut *script)
    }

    /// Records a call and applies any scripted failure for it.
    fn record(&self, method: &'static str, call: Call) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(call);
        let index = {
            let mut counts = self.counts.lock().unwrap();
            let n = counts.entry(method).or_insert(0);
            *n += 1;
            *n - 1
        };
        match self.script(|s| s.failures.get(method).cloned()) {
            Some((None, msg)) => Err(BackendError::new(msg)),
            Some((Some(at), msg)) if at == index => Err(BackendError::new(msg)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn supports_pending_channels(&self) -> bool {
        self.pending_support
    }

    fn supports_node_info(&self) -> bool {
        self.node_info_support
    }

    async fn get_info(&self) -> Result<NodeIdentity, BackendError> {
        self.record("get_info", Call::GetInfo)?;
        Ok(NodeIdentity {
            pubkey: self.script(|s| s.own_pubkey.clone()),
            alias: None,
        })
    }

    async fn get_channels(&self) -> Result<Vec<RawChannel>, BackendError> {
        self.record("get_channels", Call::GetChannels)?;
        time::sleep(self.script(|s| s.fetch_delay)).await;
        Ok(self.script(|s| s.channels.clone()))
    }

    async fn get_pending_channels(&self) -> Result<PendingChannels, BackendError> {
        self.record("get_pending_channels", Call::GetPendingChannels)?;
        Ok(self.script(|s| s.pending.clone()))
    }

    async fn get_closed_channels(&self) -> Result<Vec<RawChannel>, BackendError> {
        self.record("get_closed_channels", Call::GetClosedChannels)?;
        Ok(self.script(|s| s.closed.clone()))
    }

    async fn get_node_info(&self, pubkey: &str) -> Result<NodeInfo, BackendError> {
        self.record("get_node_info", Call::GetNodeInfo(pubkey.to_string()))?;
        let delay = self.script(|s| s.node_info_delay.get(pubkey).cloned());
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }
        match self.script(|s| s.aliases.get(pubkey).cloned()) {
            Some(alias) => Ok(NodeInfo {
                pubkey: pubkey.to_string(),
                alias: Some(alias),
                ..Default::default()
            }),
            None => Err(BackendError::new(format!("unable to find node {}", pubkey))),
        }
    }

    async fn get_chan_info(&self, chan_id: &str) -> Result<ChannelInfo, BackendError> {
        self.record("get_chan_info", Call::GetChanInfo(chan_id.to_string()))?;
        self.script(|s| s.chan_info.get(chan_id).cloned())
            .ok_or_else(|| BackendError::new(format!("edge not found: {}", chan_id)))
    }

    async fn connect_peer(&self, request: ConnectPeerRequest) -> Result<(), BackendError> {
        self.record("connect_peer", Call::ConnectPeer(request.pubkey))
    }

    async fn open_channel_sync(
        &self,
        request: OpenChannelRequest,
    ) -> Result<ChannelPoint, BackendError> {
        self.record(
            "open_channel_sync",
            Call::OpenChannelSync(request.node_pubkey),
        )?;
        Ok(ChannelPoint {
            txid: "0pen".into(),
            output_index: 0,
        })
    }

    async fn open_channel_psbt(
        &self,
        request: OpenChannelRequest,
        shim: PsbtShim,
    ) -> Result<PsbtFundingRequest, BackendError> {
        let address = format!("bc1q{}", request.node_pubkey);
        self.record(
            "open_channel_psbt",
            Call::OpenChannelPsbt {
                pubkey: request.node_pubkey,
                base_psbt: shim.base_psbt,
                no_publish: shim.no_publish,
            },
        )?;
        Ok(PsbtFundingRequest {
            funding_address: address,
            funding_amount_sat: request.local_funding_amount_sat,
            psbt: None,
        })
    }

    async fn fund_psbt(&self, request: FundPsbtRequest) -> Result<FundedPsbt, BackendError> {
        let (address, amount) = request.outputs[0].clone();
        let funded = match &request.template_psbt {
            Some(base) => format!("{}+{}:{}", base, address, amount),
            None => format!("{}:{}", address, amount),
        };
        self.record(
            "fund_psbt",
            Call::FundPsbt {
                template_psbt: request.template_psbt,
            },
        )?;
        Ok(FundedPsbt {
            funded_psbt: funded,
            change_output_index: None,
        })
    }

    async fn sign_psbt(&self, psbt: &str) -> Result<String, BackendError> {
        self.record("sign_psbt", Call::SignPsbt(psbt.to_string()))?;
        Ok(format!("signed({})", psbt))
    }

    async fn funding_state_step(
        &self,
        step: FundingTransition,
    ) -> Result<FundingStepResponse, BackendError> {
        match step {
            FundingTransition::PsbtVerify {
                funded_psbt,
                skip_finalize,
                ..
            } => {
                self.record(
                    "psbt_verify",
                    Call::PsbtVerify {
                        psbt: funded_psbt,
                        skip_finalize,
                    },
                )?;
                Ok(FundingStepResponse::default())
            }
            FundingTransition::PsbtFinalize { signed_psbt, .. } => {
                self.record("psbt_finalize", Call::PsbtFinalize { psbt: signed_psbt })?;
                Ok(self.script(|s| s.finalize_response.clone()))
            }
        }
    }

    async fn close_channel(
        &self,
        request: CloseChannelRequest,
    ) -> Result<CloseChannelResponse, BackendError> {
        self.record("close_channel", Call::CloseChannel(request))?;
        time::sleep(self.script(|s| s.close_delay)).await;
        self.script(|s| s.close_result.clone())
    }

    async fn create_invoice(&self, request: InvoiceRequest) -> Result<Invoice, BackendError> {
        self.record("create_invoice", Call::CreateInvoice(request))?;
        Ok(Invoice {
            payment_request: "lnbcrt1rebalance".into(),
            payment_hash: "aa11".into(),
            payment_secret: Some("5ec2e7".into()),
            min_final_cltv_expiry: None,
        })
    }

    async fn pay_lightning_invoice(
        &self,
        request: PayInvoiceRequest,
    ) -> Result<PayInvoiceResponse, BackendError> {
        self.record("pay_lightning_invoice", Call::PayInvoice(request))?;
        Ok(self.script(|s| s.pay_response.clone()))
    }

    async fn subscribe_payment(
        &self,
        handle: &SubscriptionHandle,
    ) -> Result<PaymentStream, BackendError> {
        self.record("subscribe_payment", Call::SubscribePayment(handle.0.clone()))?;
        let updates = self.script(|s| s.stream_updates.clone());
        Ok(stream::iter(updates.into_iter().map(Ok))
            .chain(stream::pending())
            .boxed())
    }

    async fn unsubscribe_payment(&self, handle: &SubscriptionHandle) {
        let _ = self.record(
            "unsubscribe_payment",
            Call::UnsubscribePayment(handle.0.clone()),
        );
    }

    async fn ask_rene_create_layer(&self, layer: &str) -> Result<(), BackendError> {
        self.record("create_layer", Call::CreateLayer(layer.to_string()))
    }

    async fn ask_rene_update_channel(
        &self,
        update: LayerChannelUpdate,
    ) -> Result<(), BackendError> {
        self.record(
            "update_channel",
            Call::UpdateChannel(update.short_channel_id_dir),
        )
    }

    async fn ask_rene_remove_layer(&self, layer: &str) -> Result<(), BackendError> {
        self.record("remove_layer", Call::RemoveLayer(layer.to_string()))
    }

    async fn get_routes(&self, query: RouteQuery) -> Result<Routes, BackendError> {
        self.record("get_routes", Call::GetRoutes(query))?;
        Ok(self.script(|s| s.routes.clone()))
    }

    async fn send_pay(&self, request: SendPayRequest) -> Result<(), BackendError> {
        self.record("send_pay", Call::SendPay(request.route))
    }

    async fn wait_send_pay(&self, payment_hash: &str) -> Result<PaymentUpdate, BackendError> {
        self.record("wait_send_pay", Call::WaitSendPay(payment_hash.to_string()))?;
        Ok(self.script(|s| s.wait_send_pay.clone()))
    }
}

/// LND-style open channel record.
pub fn lnd_channel(id: &str, pubkey: &str, local: u64, remote: u64, active: bool) -> RawChannel {
    RawChannel {
        chan_id: Some(id.into()),
        channel_point: Some(format!("{}00:0", id)),
        remote_pubkey: Some(pubkey.into()),
        local_balance: Some(local),
        remote_balance: Some(remote),
        local_chan_reserve_sat: Some(1_000),
        remote_chan_reserve_sat: Some(1_000),
        active: Some(active),
        ..Default::default()
    }
}

/// CLN-style open channel record.
pub fn cln_channel(scid: &str, peer: &str, to_us_sat: u64, total_sat: u64) -> RawChannel {
    RawChannel {
        short_channel_id: Some(scid.into()),
        channel_id: Some(format!("cid-{}", scid)),
        peer_id: Some(peer.into()),
        to_us_msat: Some(to_us_sat * 1000),
        total_msat: Some(total_sat * 1000),
        state: Some("CHANNELD_NORMAL".into()),
        ..Default::default()
    }
}
