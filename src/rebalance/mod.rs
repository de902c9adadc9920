//! Circular rebalancing: a self-payment that leaves through one channel and
//! comes back through another.
//!
//! The engine validates the intent without touching the network, creates a
//! self-addressed invoice and hands the payment to the strategy of the
//! backend family. Outcomes collapse into success, failure and ambiguous.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{Backend, Invoice, InvoiceRequest, PaymentUpdate};
use crate::channel::Channel;
use crate::config;
use crate::errors::{ChannelError, RejectionCategory};

pub mod strategy;

pub use self::strategy::{strategy_for, RebalanceStrategy, StrategyKind};

/// Request to move `amount_sat` from the source channel to the destination channel.
#[derive(Clone, Debug, PartialEq)]
pub struct RebalanceIntent {
    pub source: Channel,
    pub destination: Channel,
    pub amount_sat: u64,
    pub fee_limit_sat: u64,
    pub timeout_seconds: u64,
}

/// Projected balances after a rebalance.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancePreview {
    pub source_local: u64,
    pub source_remote: u64,
    pub destination_local: u64,
    pub destination_remote: u64,
}

/// Data of a settled rebalance payment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub payment_hash: Option<String>,
    pub payment_preimage: Option<String>,
    pub fee_sat: Option<u64>,
    pub amount_sat: u64,
}

/// Terminal result of a rebalance payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalanceOutcome {
    Succeeded(PaymentReceipt),
    /// The payment definitely failed.
    Failed {
        reason: String,
        raw: Option<String>,
    },
    /// No final status was reported; the transaction history must be checked.
    Ambiguous { status: Option<String> },
}

/// Progress of the engine, published to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RebalanceProgress {
    Idle,
    CreatingInvoice,
    Paying { strategy: StrategyKind },
    Finished(RebalanceOutcome),
    Errored(String),
}

/// Largest amount that can move from `source` to `destination`.
pub fn max_rebalance_amount(source: &Channel, destination: &Channel) -> u64 {
    source
        .sending_capacity()
        .min(destination.receiving_capacity())
}

/// Channels that can carry a rebalance: active, and neither pending nor closed.
pub fn available_channels(channels: &[Channel]) -> Vec<Channel> {
    channels
        .iter()
        .filter(|c| c.is_active && !c.pending_open && !c.pending_close && !c.closing)
        .filter(|c| c.close.is_none())
        .cloned()
        .collect()
}

/// Invoice memo naming both counterparties.
pub fn memo(source: &Channel, destination: &Channel) -> String {
    format!(
        "Rebalance {} -> {}",
        source.remote_pubkey, destination.remote_pubkey
    )
}

impl RebalanceIntent {
    /// Creates an intent with the configured fee limit and timeout.
    pub fn new(
        source: Channel,
        destination: Channel,
        amount_sat: u64,
        config: &config::Rebalance,
    ) -> Self {
        RebalanceIntent {
            source,
            destination,
            amount_sat,
            fee_limit_sat: config.fee_limit_sat,
            timeout_seconds: config.timeout_secs,
        }
    }

    pub fn with_fee_limit(mut self, fee_limit_sat: u64) -> Self {
        self.fee_limit_sat = fee_limit_sat;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn max_amount(&self) -> u64 {
        max_rebalance_amount(&self.source, &self.destination)
    }

    /// Checks the intent against the current channel balances.
    pub fn validate(&self, min_amount_sat: u64) -> Result<(), ChannelError> {
        let (src, dst) = (&self.source, &self.destination);
        if !is_identified(src) || !is_identified(dst) {
            return Err(ChannelError::InvalidIntent(
                "source and destination need a channel id, short channel id or funding outpoint"
                    .into(),
            ));
        }
        let same_id = src.channel_id.is_some() && src.channel_id == dst.channel_id;
        let same_scid = src.short_channel_id.is_some() && src.short_channel_id == dst.short_channel_id;
        let same_outpoint = src.funding_outpoint.is_some()
            && src.funding_outpoint == dst.funding_outpoint
            && src.remote_pubkey == dst.remote_pubkey;
        if same_id || same_scid || same_outpoint {
            return Err(ChannelError::InvalidIntent(
                "source and destination must be different channels".into(),
            ));
        }
        if self.amount_sat <= min_amount_sat {
            return Err(ChannelError::InvalidIntent(format!(
                "amount must be greater than {} sat",
                min_amount_sat
            )));
        }
        let max = self.max_amount();
        if self.amount_sat > max {
            return Err(ChannelError::InvalidIntent(format!(
                "amount {} sat exceeds the maximum of {} sat",
                self.amount_sat, max
            )));
        }
        if self.timeout_seconds == 0 {
            return Err(ChannelError::Rejected {
                category: RejectionCategory::InvalidTimeout,
                raw: "timeout_seconds must be specified".into(),
            });
        }
        Ok(())
    }

    /// Balances of both channels after moving `amount_sat`, ignoring fees.
    pub fn preview(&self) -> BalancePreview {
        let src_total = self.source.local_balance.saturating_add(self.source.remote_balance);
        let dst_total = self
            .destination
            .local_balance
            .saturating_add(self.destination.remote_balance);
        let source_local = self.source.local_balance.saturating_sub(self.amount_sat);
        let destination_local = self
            .destination
            .local_balance
            .saturating_add(self.amount_sat)
            .min(dst_total);
        BalancePreview {
            source_local,
            source_remote: src_total.saturating_sub(source_local),
            destination_local,
            destination_remote: dst_total.saturating_sub(destination_local),
        }
    }
}

fn is_identified(channel: &Channel) -> bool {
    channel.channel_id.is_some()
        || channel.short_channel_id.is_some()
        || channel.funding_outpoint.is_some()
}

impl RebalanceOutcome {
    /// Classifies a payment record by its status.
    pub fn from_update(update: &PaymentUpdate, amount_sat: u64) -> Self {
        let status = update.reported_status().unwrap_or("");
        if status.eq_ignore_ascii_case("SUCCEEDED") || status.eq_ignore_ascii_case("COMPLETE") {
            RebalanceOutcome::Succeeded(PaymentReceipt {
                payment_hash: update.payment_hash.clone(),
                payment_preimage: update.payment_preimage.clone(),
                fee_sat: update.fee_sat,
                amount_sat: update.value_sat.unwrap_or(amount_sat),
            })
        } else if status.eq_ignore_ascii_case("FAILED") {
            match update.failure_text() {
                Some(raw) => RebalanceOutcome::failed(raw),
                None => RebalanceOutcome::Failed {
                    reason: "Payment failed".into(),
                    raw: None,
                },
            }
        } else {
            RebalanceOutcome::Ambiguous {
                status: update.reported_status().map(str::to_string),
            }
        }
    }

    /// Failed outcome with a reason derived from the raw backend text.
    pub fn failed(raw: &str) -> Self {
        RebalanceOutcome::Failed {
            reason: RejectionCategory::classify(raw).message_with(raw),
            raw: Some(raw.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RebalanceOutcome::Succeeded(_))
    }
}

/// Executes rebalance intents against a backend.
pub struct RebalanceEngine<B: Backend + ?Sized> {
    backend: Arc<B>,
    config: config::Rebalance,
    progress: watch::Sender<RebalanceProgress>,
}

impl<B: Backend + ?Sized> RebalanceEngine<B> {
    pub fn new(backend: Arc<B>, config: config::Rebalance) -> Self {
        let (progress, _) = watch::channel(RebalanceProgress::Idle);
        RebalanceEngine {
            backend,
            config,
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RebalanceProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> RebalanceProgress {
        self.progress.borrow().clone()
    }

    pub fn config(&self) -> &config::Rebalance {
        &self.config
    }

    /// Runs `intent`. `channels` are the open channels of the node; the
    /// available ones are excluded from routing by strategies that need it.
    pub async fn execute(
        &self,
        intent: &RebalanceIntent,
        channels: &[Channel],
    ) -> Result<RebalanceOutcome, ChannelError> {
        intent.validate(self.config.min_amount_sat)?;
        let available = available_channels(channels);
        let result = self.run(intent, &available).await;
        match &result {
            Ok(outcome) => {
                info!(?outcome, amount = intent.amount_sat, "rebalance finished");
                self.progress
                    .send_replace(RebalanceProgress::Finished(outcome.clone()));
            }
            Err(e) => {
                warn!(error = %e, raw = ?e.raw(), "rebalance failed");
                self.progress
                    .send_replace(RebalanceProgress::Errored(e.to_string()));
            }
        }
        result
    }

    async fn run(
        &self,
        intent: &RebalanceIntent,
        channels: &[Channel],
    ) -> Result<RebalanceOutcome, ChannelError> {
        self.progress.send_replace(RebalanceProgress::CreatingInvoice);
        let invoice = self.create_invoice(intent).await?;

        let strategy = strategy_for::<B>(self.backend.kind(), &self.config);
        debug!(strategy = ?strategy.kind(), hash = %invoice.payment_hash, "paying rebalance invoice");
        self.progress.send_replace(RebalanceProgress::Paying {
            strategy: strategy.kind(),
        });
        strategy
            .execute_payment(&*self.backend, intent, &invoice, channels)
            .await
    }

    async fn create_invoice(&self, intent: &RebalanceIntent) -> Result<Invoice, ChannelError> {
        self.backend
            .create_invoice(InvoiceRequest {
                memo: memo(&intent.source, &intent.destination),
                value_sat: intent.amount_sat,
            })
            .await
            .map_err(ChannelError::rejected)
    }
}
