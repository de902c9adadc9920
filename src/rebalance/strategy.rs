//! Payment strategies, one per backend family.
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{RebalanceIntent, RebalanceOutcome};
use crate::backend::{
    Backend, BackendKind, Invoice, LayerChannelUpdate, PayInvoiceRequest, PayInvoiceResponse,
    PaymentUpdate, Route, RouteQuery, SendPayHop, SendPayRequest, SubscriptionHandle,
};
use crate::channel::Channel;
use crate::config;
use crate::errors::{ChannelError, RejectionCategory};
use crate::race::{first_settled, Settled};

/// Status of payment updates that are not final.
pub const IN_FLIGHT: &str = "IN_FLIGHT";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Pay-invoice with outgoing channel and last hop constraints.
    Direct,
    /// Explicit route computed inside a temporary routing layer.
    LayeredRouting,
    /// Pay-invoice whose result arrives over a subscription.
    Streaming,
}

/// Executes the payment of a rebalance invoice.
#[async_trait]
pub trait RebalanceStrategy<B: Backend + ?Sized>: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn execute_payment(
        &self,
        backend: &B,
        intent: &RebalanceIntent,
        invoice: &Invoice,
        channels: &[Channel],
    ) -> Result<RebalanceOutcome, ChannelError>;
}

/// Selects the strategy of a backend family.
pub fn strategy_for<B: Backend + ?Sized>(
    kind: BackendKind,
    config: &config::Rebalance,
) -> Box<dyn RebalanceStrategy<B>> {
    match kind {
        BackendKind::Lnd => Box::new(Direct::new(config)),
        BackendKind::CoreLightning => Box::new(LayeredRouting::new(config)),
        BackendKind::RemoteProxy => Box::new(Streaming::new(config)),
    }
}

pub struct Direct {
    max_parts: u32,
    stream_grace: Duration,
}

pub struct Streaming {
    max_parts: u32,
    stream_grace: Duration,
}

pub struct LayeredRouting {
    layer: String,
    final_cltv: u32,
}

impl Direct {
    pub fn new(config: &config::Rebalance) -> Self {
        Direct {
            max_parts: config.max_parts,
            stream_grace: Duration::from_secs(config.stream_grace_secs),
        }
    }
}

impl Streaming {
    pub fn new(config: &config::Rebalance) -> Self {
        Streaming {
            max_parts: config.max_parts,
            stream_grace: Duration::from_secs(config.stream_grace_secs),
        }
    }
}

impl LayeredRouting {
    pub fn new(config: &config::Rebalance) -> Self {
        LayeredRouting {
            layer: config.layer_name.clone(),
            final_cltv: config.final_cltv,
        }
    }
}

#[async_trait]
impl<B: Backend + ?Sized> RebalanceStrategy<B> for Direct {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    async fn execute_payment(
        &self,
        backend: &B,
        intent: &RebalanceIntent,
        invoice: &Invoice,
        _channels: &[Channel],
    ) -> Result<RebalanceOutcome, ChannelError> {
        pay_constrained(backend, intent, invoice, self.max_parts, self.stream_grace).await
    }
}

#[async_trait]
impl<B: Backend + ?Sized> RebalanceStrategy<B> for Streaming {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Streaming
    }

    async fn execute_payment(
        &self,
        backend: &B,
        intent: &RebalanceIntent,
        invoice: &Invoice,
        _channels: &[Channel],
    ) -> Result<RebalanceOutcome, ChannelError> {
        pay_constrained(backend, intent, invoice, self.max_parts, self.stream_grace).await
    }
}

/// Pays with outgoing channel and last hop constraints. Both direct and
/// streaming backends accept the same call; the response shape decides how
/// the result is awaited.
async fn pay_constrained<B: Backend + ?Sized>(
    backend: &B,
    intent: &RebalanceIntent,
    invoice: &Invoice,
    max_parts: u32,
    stream_grace: Duration,
) -> Result<RebalanceOutcome, ChannelError> {
    let outgoing = intent
        .source
        .channel_id
        .clone()
        .ok_or(ChannelError::MissingChannelId)?;
    let last_hop_pubkey = hex::decode(&intent.destination.remote_pubkey).map_err(|e| {
        ChannelError::InvalidIntent(format!("destination pubkey is not hex: {}", e))
    })?;
    let request = PayInvoiceRequest {
        payment_request: invoice.payment_request.clone(),
        outgoing_chan_ids: vec![outgoing],
        last_hop_pubkey,
        fee_limit_sat: intent.fee_limit_sat,
        allow_self_payment: true,
        timeout_seconds: intent.timeout_seconds,
        max_parts,
    };

    match backend
        .pay_lightning_invoice(request)
        .await
        .map_err(ChannelError::rejected)?
    {
        PayInvoiceResponse::Settled {
            result,
            payment_error,
        } => Ok(classify_settled(
            result.as_ref(),
            payment_error.as_deref(),
            intent.amount_sat,
        )),
        PayInvoiceResponse::Streaming(handle) => {
            let deadline = Duration::from_secs(intent.timeout_seconds).saturating_add(stream_grace);
            await_subscription(backend, &handle, deadline, intent.amount_sat).await
        }
    }
}

/// Classifies a settled pay-invoice response. A payment record wins over an
/// error string; a response with neither is ambiguous.
pub fn classify_settled(
    result: Option<&PaymentUpdate>,
    payment_error: Option<&str>,
    amount_sat: u64,
) -> RebalanceOutcome {
    match (result, payment_error.filter(|e| !e.is_empty())) {
        (Some(update), _) => RebalanceOutcome::from_update(update, amount_sat),
        (None, Some(error)) => RebalanceOutcome::failed(error),
        (None, None) => RebalanceOutcome::Ambiguous { status: None },
    }
}

/// Waits for the first final update of a payment subscription, bounded by
/// `deadline`. The subscription is torn down exactly once on every path.
pub async fn await_subscription<B: Backend + ?Sized>(
    backend: &B,
    handle: &SubscriptionHandle,
    deadline: Duration,
    amount_sat: u64,
) -> Result<RebalanceOutcome, ChannelError> {
    let terminal = async {
        let mut updates = backend
            .subscribe_payment(handle)
            .await
            .map_err(ChannelError::rejected)?;
        while let Some(update) = updates.next().await {
            let update = update.map_err(ChannelError::rejected)?;
            if update
                .reported_status()
                .map_or(false, |s| s.eq_ignore_ascii_case(IN_FLIGHT))
            {
                debug!(handle = %handle.0, "payment in flight");
                continue;
            }
            return Ok(RebalanceOutcome::from_update(&update, amount_sat));
        }
        Ok(RebalanceOutcome::Ambiguous { status: None })
    };

    let settled = first_settled(terminal, deadline).await;
    backend.unsubscribe_payment(handle).await;
    match settled {
        Settled::Completed(result) => result,
        Settled::TimedOut => {
            warn!(handle = %handle.0, ?deadline, "payment subscription timed out");
            Err(ChannelError::Timeout {
                operation: "rebalance payment",
                after: deadline,
            })
        }
    }
}

#[async_trait]
impl<B: Backend + ?Sized> RebalanceStrategy<B> for LayeredRouting {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LayeredRouting
    }

    async fn execute_payment(
        &self,
        backend: &B,
        intent: &RebalanceIntent,
        invoice: &Invoice,
        channels: &[Channel],
    ) -> Result<RebalanceOutcome, ChannelError> {
        let own_pubkey = backend
            .get_info()
            .await
            .map_err(ChannelError::rejected)?
            .pubkey;
        let source_scid = intent
            .source
            .short_channel_id
            .clone()
            .ok_or(ChannelError::MissingChannelId)?;
        let destination_scid = intent
            .destination
            .short_channel_id
            .clone()
            .ok_or(ChannelError::MissingChannelId)?;
        if !channels
            .iter()
            .any(|c| c.short_channel_id.as_deref() == Some(source_scid.as_str()))
        {
            return Err(ChannelError::InvalidIntent(
                "source channel is not among the available channels".into(),
            ));
        }

        // leftover of an interrupted attempt
        if let Err(e) = backend.ask_rene_remove_layer(&self.layer).await {
            debug!(layer = %self.layer, error = %e, "no routing layer to remove");
        }

        let result = async {
            backend
                .ask_rene_create_layer(&self.layer)
                .await
                .map_err(ChannelError::rejected)?;
            self.exclude_channels(backend, &own_pubkey, &destination_scid, channels)
                .await?;
            self.route_and_pay(backend, &own_pubkey, &source_scid, intent, invoice)
                .await
        }
        .await;

        if let Err(e) = backend.ask_rene_remove_layer(&self.layer).await {
            warn!(layer = %self.layer, error = %e, "routing layer cleanup failed");
        }
        result
    }
}

impl LayeredRouting {
    /// Disables both directions of every channel except the destination inside the layer.
    async fn exclude_channels<B: Backend + ?Sized>(
        &self,
        backend: &B,
        own_pubkey: &str,
        destination_scid: &str,
        channels: &[Channel],
    ) -> Result<(), ChannelError> {
        for channel in channels {
            let scid = match channel.short_channel_id.as_deref() {
                Some(scid) if scid != destination_scid => scid,
                _ => continue,
            };
            let (outgoing, incoming) = if own_pubkey < channel.remote_pubkey.as_str() {
                (0, 1)
            } else {
                (1, 0)
            };
            for direction in [outgoing, incoming] {
                backend
                    .ask_rene_update_channel(LayerChannelUpdate {
                        layer: self.layer.clone(),
                        short_channel_id_dir: format!("{}/{}", scid, direction),
                        enabled: false,
                    })
                    .await
                    .map_err(ChannelError::rejected)?;
            }
        }
        Ok(())
    }

    async fn route_and_pay<B: Backend + ?Sized>(
        &self,
        backend: &B,
        own_pubkey: &str,
        source_scid: &str,
        intent: &RebalanceIntent,
        invoice: &Invoice,
    ) -> Result<RebalanceOutcome, ChannelError> {
        let routes = backend
            .get_routes(RouteQuery {
                source: intent.source.remote_pubkey.clone(),
                destination: own_pubkey.to_string(),
                amount_msat: intent.amount_sat.saturating_mul(1000),
                maxfee_msat: intent.fee_limit_sat.saturating_mul(1000),
                layers: vec![self.layer.clone()],
                final_cltv: invoice.min_final_cltv_expiry.unwrap_or(self.final_cltv),
            })
            .await
            .map_err(ChannelError::rejected)?;
        let route = routes
            .routes
            .first()
            .and_then(|route| explicit_route(route, &intent.source.remote_pubkey, source_scid))
            .ok_or_else(|| ChannelError::Rejected {
                category: RejectionCategory::NoRoute,
                raw: format!("no route in layer {}", self.layer),
            })?;
        debug!(hops = route.len(), "sending along explicit route");

        backend
            .send_pay(SendPayRequest {
                route,
                payment_hash: invoice.payment_hash.clone(),
                payment_secret: invoice.payment_secret.clone(),
                bolt11: invoice.payment_request.clone(),
            })
            .await
            .map_err(ChannelError::rejected)?;
        let update = backend
            .wait_send_pay(&invoice.payment_hash)
            .await
            .map_err(ChannelError::rejected)?;
        Ok(RebalanceOutcome::from_update(&update, intent.amount_sat))
    }
}

/// Builds the full hop list of a circular payment from a route that starts at
/// the source peer: the hop into the source channel is prepended, and every
/// hop carries the amount and delay of the hop after it (the route totals for
/// the last one). Returns `None` for an empty route.
pub fn explicit_route(
    route: &Route,
    source_pubkey: &str,
    source_scid: &str,
) -> Option<Vec<SendPayHop>> {
    let first = route.path.first()?;
    let mut hops = Vec::with_capacity(route.path.len() + 1);
    hops.push(SendPayHop {
        id: source_pubkey.to_string(),
        channel: source_scid.to_string(),
        amount_msat: first.amount_msat,
        delay: first.delay,
    });
    for (i, hop) in route.path.iter().enumerate() {
        let (amount_msat, delay) = match route.path.get(i + 1) {
            Some(next) => (next.amount_msat, next.delay),
            None => (route.amount_msat, route.final_cltv),
        };
        hops.push(SendPayHop {
            id: hop.next_node_id.clone(),
            channel: hop
                .short_channel_id_dir
                .split('/')
                .next()
                .unwrap_or_default()
                .to_string(),
            amount_msat,
            delay,
        });
    }
    Some(hops)
}
