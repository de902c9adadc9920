//! Channel enrichment: alias resolution, display names, HTLC flattening and
//! aggregate statistics.
//!
//! Lookups are the only asynchronous part. Everything else is a pure function
//! over a channel snapshot, so the registry can apply a whole fetch cycle in
//! one write.
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::channel::{Channel, Htlc, UNKNOWN_NAME};

/// Memoized lookup results, keyed by node pubkey and by channel id.
/// A `None` entry is a node that was found but announces no alias.
/// Entries are only ever added; the whole cache is dropped on registry reset.
#[derive(Clone, Debug, Default)]
pub struct AliasCache {
    by_pubkey: HashMap<String, Option<String>>,
    by_channel_id: HashMap<String, Option<String>>,
}

/// Outcome of a single node-info lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// The node announced an alias.
    Resolved(String),
    /// The node is known but has no alias.
    NoAlias,
    /// The lookup failed or timed out.
    Failed,
}

/// Pending HTLC tagged with the name of the channel that carries it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedHtlc {
    pub channel_name: String,
    pub htlc: Htlc,
}

/// Aggregates over the open channels of one fetch cycle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTotals {
    /// Largest sending + receiving capacity among the channels.
    pub largest_channel_sats: u64,
    /// Remote balance of active channels.
    pub total_inbound: u64,
    /// Local balance of active channels.
    pub total_outbound: u64,
    /// Total balance of inactive channels.
    pub total_offline: u64,
}

impl AliasCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alias_for_pubkey(&self, pubkey: &str) -> Option<&str> {
        self.by_pubkey.get(pubkey).and_then(|a| a.as_deref())
    }

    pub fn alias_for_channel(&self, channel_id: &str) -> Option<&str> {
        self.by_channel_id.get(channel_id).and_then(|a| a.as_deref())
    }

    /// Whether a lookup result is memoized for the pubkey, with or without alias.
    pub fn is_known(&self, pubkey: &str) -> bool {
        self.by_pubkey.contains_key(pubkey)
    }

    pub fn insert_pubkey(&mut self, pubkey: impl Into<String>, alias: impl Into<String>) {
        self.by_pubkey.insert(pubkey.into(), Some(alias.into()));
    }

    /// Memoizes a node that has no alias, so it is not looked up again.
    pub fn insert_without_alias(&mut self, pubkey: impl Into<String>) {
        self.by_pubkey.entry(pubkey.into()).or_insert(None);
    }

    /// Number of memoized pubkeys.
    pub fn len(&self) -> usize {
        self.by_pubkey.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pubkey.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_pubkey.clear();
        self.by_channel_id.clear();
    }

    /// Distinct pubkeys that need a lookup: neither the pubkey nor the
    /// channel's id has a memoized result.
    pub fn unresolved_pubkeys<'a>(
        &self,
        channels: impl IntoIterator<Item = &'a Channel>,
    ) -> Vec<String> {
        let mut seen = HashSet::new();
        channels
            .into_iter()
            .filter(|c| !c.remote_pubkey.is_empty())
            .filter(|c| {
                !self.by_pubkey.contains_key(&c.remote_pubkey)
                    && c
                        .channel_id
                        .as_ref()
                        .map(|id| !self.by_channel_id.contains_key(id))
                        .unwrap_or(true)
            })
            .filter(|c| seen.insert(c.remote_pubkey.clone()))
            .map(|c| c.remote_pubkey.clone())
            .collect()
    }

    /// Memoizes successful lookups for the pubkeys and the ids of the channels
    /// that carry them. Failed lookups are left out and retried next cycle.
    pub fn apply<'a>(
        &mut self,
        lookups: &HashMap<String, Lookup>,
        channels: impl IntoIterator<Item = &'a Channel>,
    ) {
        for (pubkey, lookup) in lookups {
            match lookup {
                Lookup::Resolved(alias) => self.insert_pubkey(pubkey.clone(), alias.clone()),
                Lookup::NoAlias => self.insert_without_alias(pubkey.clone()),
                Lookup::Failed => {}
            }
        }
        for channel in channels {
            if let (Some(id), Some(alias)) = (
                channel.channel_id.as_ref(),
                self.by_pubkey.get(&channel.remote_pubkey),
            ) {
                self.by_channel_id.insert(id.clone(), alias.clone());
            }
        }
    }
}

/// Looks up every pubkey concurrently, each bounded by `timeout`, and waits for all of them.
/// Failures never fail the batch: they are reported as `Lookup::Failed`.
pub async fn resolve_aliases<B>(
    backend: &B,
    pubkeys: Vec<String>,
    timeout: Duration,
) -> HashMap<String, Lookup>
where
    B: Backend + ?Sized,
{
    if pubkeys.is_empty() {
        return HashMap::new();
    }
    debug!(count = pubkeys.len(), "resolving node aliases");

    let lookups = pubkeys.into_iter().map(|pubkey| async move {
        let lookup = match time::timeout(timeout, backend.get_node_info(&pubkey)).await {
            Ok(Ok(info)) => match info.alias.filter(|a| !a.is_empty()) {
                Some(alias) => Lookup::Resolved(alias),
                None => Lookup::NoAlias,
            },
            Ok(Err(e)) => {
                warn!(%pubkey, error = %e, "node info lookup failed");
                Lookup::Failed
            }
            Err(_) => {
                warn!(%pubkey, ?timeout, "node info lookup timed out");
                Lookup::Failed
            }
        };
        (pubkey, lookup)
    });

    join_all(lookups).await.into_iter().collect()
}

/// Assigns alias and display name to every channel.
///
/// Alias priority: alias reported with the channel, cached alias (by pubkey,
/// then by channel id), well-known override, `"unknown"` when this cycle's
/// lookup failed. Channels without any of these keep no alias and are named
/// by pubkey or id.
pub fn assign_aliases(
    channels: &mut [Channel],
    cache: &AliasCache,
    overrides: &HashMap<String, String>,
    lookups: &HashMap<String, Lookup>,
) {
    for channel in channels.iter_mut() {
        if channel.alias.is_none() {
            channel.alias = cache
                .alias_for_pubkey(&channel.remote_pubkey)
                .or_else(|| {
                    channel
                        .channel_id
                        .as_ref()
                        .and_then(|id| cache.alias_for_channel(id))
                })
                .or_else(|| overrides.get(&channel.remote_pubkey).map(|s| s.as_str()))
                .or_else(|| match lookups.get(&channel.remote_pubkey) {
                    Some(Lookup::Failed) => Some(UNKNOWN_NAME),
                    _ => None,
                })
                .map(|s| s.to_string());
        }
        channel.display_name = channel.fallback_name();
    }
}

/// Collects the pending HTLCs of all channels, tagged with their channel's display name.
pub fn flatten_htlcs(channels: &[Channel]) -> Vec<TaggedHtlc> {
    channels
        .iter()
        .flat_map(|c| {
            c.pending_htlcs.iter().map(move |htlc| TaggedHtlc {
                channel_name: c.display_name.clone(),
                htlc: htlc.clone(),
            })
        })
        .collect()
}

impl ChannelTotals {
    /// Computes the aggregates from scratch in a single pass.
    pub fn compute(channels: &[Channel]) -> Self {
        channels
            .iter()
            .fold(ChannelTotals::default(), |mut totals, channel| {
                let usable = channel
                    .sending_capacity()
                    .saturating_add(channel.receiving_capacity());
                totals.largest_channel_sats = totals.largest_channel_sats.max(usable);
                if channel.is_active {
                    totals.total_inbound = totals.total_inbound.saturating_add(channel.remote_balance);
                    totals.total_outbound = totals.total_outbound.saturating_add(channel.local_balance);
                } else {
                    totals.total_offline = totals
                        .total_offline
                        .saturating_add(channel.local_balance.saturating_add(channel.remote_balance));
                }
                totals
            })
    }
}
