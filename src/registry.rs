//! Channel registry: the single owner of channel collections, alias cache and
//! list views.
//!
//! All writes go through the registry's lock in one step per update, so
//! observers never see a mix of two fetch cycles. Changes are announced on a
//! broadcast channel; readers take cloned snapshots.
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::try_join3;
use tokio::sync::{broadcast, RwLock};
use tokio::time;
use tracing::{debug, info, warn};

use crate::backend::{Backend, ChannelInfo, NodeInfo};
use crate::channel::{Channel, PendingChannels, PendingKind, RawChannel};
use crate::close::{self, CloseOutcome};
use crate::config::Config;
use crate::enrichment::{
    assign_aliases, flatten_htlcs, resolve_aliases, AliasCache, ChannelTotals, TaggedHtlc,
};
use crate::errors::{BackendError, ChannelError};
use crate::funding::{self, ConnectOutcome, FundingStateMachine};
use crate::rebalance::{RebalanceEngine, RebalanceIntent, RebalanceOutcome};
use crate::view::{ChannelQuery, FilterOption, PeerSummary, SortSpec};

const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Reference to a shared registry.
pub type RegistryRef<B> = Arc<ChannelRegistry<B>>;

/// Receiver of registry events.
pub type RegistryEventReceiver = broadcast::Receiver<RegistryEvent>;

/// Change notifications emitted by the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A fetch cycle was applied.
    ChannelsUpdated { cycle: u64 },
    /// A fetch cycle failed.
    FetchFailed { cycle: u64, message: String },
    NodeInfoUpdated { pubkey: String },
    /// A channel info lookup settled; the entry is absent when it failed.
    ChannelInfoUpdated { channel_id: String },
    /// Search, filters or sort changed.
    ViewChanged,
    CloseSettled { success: bool },
    Reset,
}

/// Read-only copy of the registry state handed to the presentation layer.
#[derive(Clone, Debug, Default)]
pub struct RegistrySnapshot {
    pub channels: Vec<Channel>,
    pub pending_channels: Vec<Channel>,
    /// Closed channels, most recently closed first.
    pub closed_channels: Vec<Channel>,

    pub filtered_channels: Vec<Channel>,
    pub filtered_pending_channels: Vec<Channel>,
    pub filtered_closed_channels: Vec<Channel>,
    pub peers: Vec<PeerSummary>,

    pub pending_htlcs: Vec<TaggedHtlc>,
    pub totals: ChannelTotals,
    pub query: ChannelQuery,

    /// Fetch cycle the collections belong to.
    pub cycle: u64,
    pub loading: bool,
    pub error: Option<String>,

    pub node_info: Option<NodeInfo>,
    /// Graph information by channel id, filled by `load_channel_info`.
    pub chan_info: HashMap<String, ChannelInfo>,
    pub channel_info_error: Option<String>,

    pub closing_channel: bool,
    pub close_success: bool,
    pub close_error: Option<String>,
}

#[derive(Default)]
struct RegistryState {
    snapshot: RegistrySnapshot,
    aliases: AliasCache,
    /// Latest started fetch cycle.
    cycle: u64,
}

/// Store of the node's channels.
pub struct ChannelRegistry<B: Backend + ?Sized> {
    backend: Arc<B>,
    config: Config,
    state: RwLock<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
    fetch_cycle: AtomicU64,
    node_info_request: AtomicU64,
    resets: AtomicU64,
}

impl RegistrySnapshot {
    fn refresh_views(&mut self) {
        self.filtered_channels = self.query.apply(&self.channels);
        self.filtered_pending_channels = self.query.apply(&self.pending_channels);
        self.filtered_closed_channels = self.query.apply(&self.closed_channels);
        self.peers = self.query.peers(&self.channels);
    }
}

impl<B: Backend + ?Sized> ChannelRegistry<B> {
    pub fn new(backend: Arc<B>, config: Config) -> Self {
        let (events, _recv) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        ChannelRegistry {
            backend,
            config,
            state: RwLock::new(RegistryState::default()),
            events,
            fetch_cycle: AtomicU64::new(0),
            node_info_request: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates a subscription for notifications and returns a receiving end of a broadcast channel.
    pub fn subscribe(&self) -> RegistryEventReceiver {
        self.events.subscribe()
    }

    /// Returns a copy of the current state.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.state.read().await.snapshot.clone()
    }

    /// Number of pubkeys with a memoized lookup result.
    pub async fn cached_aliases(&self) -> usize {
        self.state.read().await.aliases.len()
    }

    /// Creates a funding state machine on the registry's backend.
    pub fn funding(&self) -> FundingStateMachine<B> {
        FundingStateMachine::new(self.backend.clone(), self.config.funding.clone())
    }

    /// Creates a rebalance engine on the registry's backend.
    pub fn rebalance_engine(&self) -> RebalanceEngine<B> {
        RebalanceEngine::new(self.backend.clone(), self.config.rebalance.clone())
    }

    /// Runs a rebalance against the open channels of the last fetch.
    pub async fn rebalance(
        &self,
        engine: &RebalanceEngine<B>,
        intent: &RebalanceIntent,
    ) -> Result<RebalanceOutcome, ChannelError> {
        let channels = self.state.read().await.snapshot.channels.clone();
        engine.execute(intent, &channels).await
    }

    /// Fetches open, pending and closed channels, resolves missing aliases and
    /// replaces the collections and aggregates in one write.
    ///
    /// Aggregates are zeroed as soon as the cycle starts. The result of a cycle
    /// that was overtaken by a newer one is dropped.
    pub async fn fetch_channels(&self) -> Result<(), ChannelError> {
        let cycle = self.fetch_cycle.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.state.write().await;
            state.cycle = cycle;
            state.snapshot.loading = true;
            state.snapshot.error = None;
            state.snapshot.totals = ChannelTotals::default();
            state.snapshot.pending_htlcs.clear();
        }
        debug!(cycle, "fetching channels");

        let (mut open, mut pending, mut closed) = match self.fetch_raw().await {
            Ok(collections) => collections,
            Err(e) => {
                let err = ChannelError::rejected(e);
                let mut state = self.state.write().await;
                if state.cycle == cycle {
                    state.snapshot.loading = false;
                    state.snapshot.error = Some(err.to_string());
                    self.notify(RegistryEvent::FetchFailed {
                        cycle,
                        message: err.to_string(),
                    });
                }
                warn!(cycle, error = %err, "channel fetch failed");
                return Err(err);
            }
        };

        let lookups = if self.config.registry.lookup_node_info && self.backend.supports_node_info() {
            let pubkeys = self
                .state
                .read()
                .await
                .aliases
                .unresolved_pubkeys(open.iter().chain(&pending).chain(&closed));
            resolve_aliases(
                &*self.backend,
                pubkeys,
                self.config.registry.node_info_timeout(),
            )
            .await
        } else {
            HashMap::new()
        };

        let mut state = self.state.write().await;
        if state.cycle != cycle {
            warn!(cycle, current = state.cycle, "discarding stale channel fetch");
            return Ok(());
        }
        let RegistryState {
            snapshot, aliases, ..
        } = &mut *state;

        aliases.apply(&lookups, open.iter().chain(&pending).chain(&closed));
        let overrides = &self.config.registry.alias_overrides;
        for list in [&mut open, &mut pending, &mut closed] {
            assign_aliases(list, aliases, overrides, &lookups);
        }
        // unknown heights sort last
        closed.sort_by(|a, b| b.close_height().cmp(&a.close_height()));

        snapshot.pending_htlcs = flatten_htlcs(&open);
        snapshot.totals = ChannelTotals::compute(&open);
        snapshot.channels = open;
        snapshot.pending_channels = pending;
        snapshot.closed_channels = closed;
        snapshot.cycle = cycle;
        snapshot.loading = false;
        snapshot.refresh_views();

        info!(
            cycle,
            open = snapshot.channels.len(),
            pending = snapshot.pending_channels.len(),
            closed = snapshot.closed_channels.len(),
            "channels updated"
        );
        self.notify(RegistryEvent::ChannelsUpdated { cycle });
        Ok(())
    }

    async fn fetch_raw(&self) -> Result<(Vec<Channel>, Vec<Channel>, Vec<Channel>), BackendError> {
        let backend = &*self.backend;
        if !backend.supports_pending_channels() {
            let open = backend.get_channels().await?;
            return Ok((normalize(open), Vec::new(), Vec::new()));
        }
        let (open, pending, closed) = try_join3(
            backend.get_channels(),
            backend.get_pending_channels(),
            backend.get_closed_channels(),
        )
        .await?;
        Ok((
            normalize(open),
            normalize_pending(pending),
            closed.into_iter().map(Channel::from_closed).collect(),
        ))
    }

    /// Looks up a single node. Returns `None` when a newer lookup was started
    /// while this one was in flight; its result is discarded.
    pub async fn get_node_info(&self, pubkey: &str) -> Result<Option<NodeInfo>, ChannelError> {
        let token = self.node_info_request.fetch_add(1, Ordering::SeqCst) + 1;
        let timeout = self.config.registry.node_info_timeout();
        let result = time::timeout(timeout, self.backend.get_node_info(pubkey)).await;

        let mut state = self.state.write().await;
        if self.node_info_request.load(Ordering::SeqCst) != token {
            warn!(%pubkey, token, "discarding stale node info");
            return Ok(None);
        }
        let info = match result {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => return Err(ChannelError::rejected(e)),
            Err(_) => {
                return Err(ChannelError::Timeout {
                    operation: "node info lookup",
                    after: timeout,
                })
            }
        };
        match info.alias.as_ref().filter(|a| !a.is_empty()) {
            Some(alias) => state.aliases.insert_pubkey(pubkey, alias.clone()),
            None => state.aliases.insert_without_alias(pubkey),
        }
        state.snapshot.node_info = Some(info.clone());
        self.notify(RegistryEvent::NodeInfoUpdated {
            pubkey: pubkey.to_string(),
        });
        Ok(Some(info))
    }

    /// Loads graph information about a channel into `chan_info`. With
    /// `delete_before_loading` the previous entry is dropped before the call
    /// so it cannot be observed while the lookup runs. A failed lookup drops
    /// the entry and records the error.
    pub async fn load_channel_info(
        &self,
        chan_id: &str,
        delete_before_loading: bool,
    ) -> Result<ChannelInfo, ChannelError> {
        let generation = self.resets.load(Ordering::SeqCst);
        {
            let mut state = self.state.write().await;
            state.snapshot.channel_info_error = None;
            if delete_before_loading {
                state.snapshot.chan_info.remove(chan_id);
            }
        }
        let result = self.backend.get_chan_info(chan_id).await;

        let mut state = self.state.write().await;
        if self.resets.load(Ordering::SeqCst) != generation {
            debug!(%chan_id, "discarding channel info loaded before reset");
            return result.map_err(ChannelError::rejected);
        }
        let result = match result {
            Ok(info) => {
                state
                    .snapshot
                    .chan_info
                    .insert(chan_id.to_string(), info.clone());
                Ok(info)
            }
            Err(e) => {
                let err = ChannelError::rejected(e);
                warn!(%chan_id, error = %err, "channel info lookup failed");
                state.snapshot.chan_info.remove(chan_id);
                state.snapshot.channel_info_error = Some(err.to_string());
                Err(err)
            }
        };
        self.notify(RegistryEvent::ChannelInfoUpdated {
            channel_id: chan_id.to_string(),
        });
        result
    }

    pub async fn set_search(&self, search: impl Into<String>) {
        let search = search.into();
        self.update_query(|q| q.search = search).await
    }

    pub async fn set_sort(&self, sort: SortSpec) {
        self.update_query(|q| q.sort = sort).await
    }

    pub async fn set_filters(&self, filters: BTreeSet<FilterOption>) {
        self.update_query(|q| q.filters = filters).await
    }

    async fn update_query(&self, change: impl FnOnce(&mut ChannelQuery)) {
        let mut state = self.state.write().await;
        change(&mut state.snapshot.query);
        state.snapshot.refresh_views();
        self.notify(RegistryEvent::ViewChanged);
    }

    /// Connects to a peer without opening a channel.
    pub async fn connect_peer_only(
        &self,
        pubkey: &str,
        host: &str,
    ) -> Result<ConnectOutcome, ChannelError> {
        let outcome = funding::connect_peer(&*self.backend, pubkey, host).await?;
        info!(%pubkey, ?outcome, "peer connected");
        Ok(outcome)
    }

    /// Drops every collection, the alias cache and the view query.
    /// Responses of requests started before the reset are discarded.
    pub async fn reset(&self) {
        self.fetch_cycle.fetch_add(1, Ordering::SeqCst);
        self.node_info_request.fetch_add(1, Ordering::SeqCst);
        self.resets.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        *state = RegistryState {
            cycle: self.fetch_cycle.load(Ordering::SeqCst),
            ..RegistryState::default()
        };
        debug!("registry reset");
        self.notify(RegistryEvent::Reset);
    }

    fn notify(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

impl<B: Backend + ?Sized + 'static> ChannelRegistry<B> {
    /// Closes `channel` with the close completion race and records the result.
    pub async fn close_channel(
        &self,
        channel: &Channel,
        sat_per_vbyte: Option<u64>,
        force: bool,
    ) -> Result<CloseOutcome, ChannelError> {
        let request = close::close_request_for(channel, self.backend.kind(), sat_per_vbyte, force)?;
        {
            let mut state = self.state.write().await;
            state.snapshot.closing_channel = true;
            state.snapshot.close_success = false;
            state.snapshot.close_error = None;
        }

        let result =
            close::close_channel(self.backend.clone(), request, self.config.close.timeout()).await;

        let mut state = self.state.write().await;
        state.snapshot.closing_channel = false;
        let success = match &result {
            Ok(CloseOutcome::Acknowledged(response)) => response.success,
            Ok(CloseOutcome::AssumedClosed) => true,
            Err(e) => {
                state.snapshot.close_error = Some(e.to_string());
                false
            }
        };
        state.snapshot.close_success = success;
        self.notify(RegistryEvent::CloseSettled { success });
        result
    }
}

fn normalize(raw: Vec<RawChannel>) -> Vec<Channel> {
    raw.into_iter().map(Channel::from_raw).collect()
}

fn normalize_pending(pending: PendingChannels) -> Vec<Channel> {
    let PendingChannels {
        pending_open_channels,
        pending_closing_channels,
        pending_force_closing_channels,
        waiting_close_channels,
    } = pending;
    let groups = [
        (pending_open_channels, PendingKind::Open),
        (pending_closing_channels, PendingKind::Closing),
        (pending_force_closing_channels, PendingKind::ForceClosing),
        (waiting_close_channels, PendingKind::WaitingClose),
    ];
    groups
        .into_iter()
        .flat_map(|(group, kind)| {
            group
                .into_iter()
                .map(move |pending| Channel::from_pending(pending, kind))
        })
        .collect()
}
