//! Search, filter and sort over channel snapshots.
//!
//! Views are recomputed from scratch whenever the channels or the query change;
//! they never hold references into the registry.
use core::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::channel::Channel;

/// Filter options offered to the user.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FilterOption {
    Announced,
    Unannounced,
    Online,
    Offline,
}

/// Key a channel or peer list is sorted by.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortKey {
    Capacity,
    /// Remote balance.
    Inbound,
    /// Local balance.
    Outbound,
    DisplayName,
    Pubkey,
    CloseHeight,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub key: SortKey,
    pub direction: SortDirection,
}

/// Search string, filter set and sort order applied to every channel list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelQuery {
    pub search: String,
    /// Empty means no filtering.
    pub filters: BTreeSet<FilterOption>,
    pub sort: SortSpec,
}

/// Open channels grouped by counterparty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub pubkey: String,
    pub alias: Option<String>,
    pub display_name: String,
    pub channel_count: usize,
    pub capacity: u64,
    pub local_balance: u64,
    pub remote_balance: u64,
    /// Whether any channel to the peer is active.
    pub is_active: bool,
}

impl Default for SortSpec {
    fn default() -> Self {
        SortSpec {
            key: SortKey::Capacity,
            direction: SortDirection::Descending,
        }
    }
}

impl SortKey {
    fn is_numeric(&self) -> bool {
        !matches!(self, SortKey::DisplayName | SortKey::Pubkey)
    }
}

impl FilterOption {
    fn matches(&self, channel: &Channel) -> bool {
        match self {
            FilterOption::Announced => !channel.private,
            FilterOption::Unannounced => channel.private,
            FilterOption::Online => channel.is_active,
            FilterOption::Offline => !channel.is_active,
        }
    }

    fn is_visibility(&self) -> bool {
        matches!(self, FilterOption::Announced | FilterOption::Unannounced)
    }
}

impl ChannelQuery {
    /// Case-insensitive match of the search string against alias, pubkey and channel id.
    pub fn matches_search(&self, channel: &Channel) -> bool {
        if self.search.is_empty() {
            return true;
        }
        let needle = self.search.to_lowercase();
        let hit = |s: &str| s.to_lowercase().contains(&needle);
        channel.alias.as_deref().map(hit).unwrap_or(false)
            || hit(&channel.remote_pubkey)
            || channel.channel_id.as_deref().map(hit).unwrap_or(false)
    }

    /// Options within one dimension are alternatives; dimensions must all match.
    pub fn matches_filters(&self, channel: &Channel) -> bool {
        let (visibility, activity): (Vec<_>, Vec<_>) =
            self.filters.iter().partition(|f| f.is_visibility());
        let any = |opts: &[&FilterOption]| opts.is_empty() || opts.iter().any(|f| f.matches(channel));
        any(&visibility) && any(&activity)
    }

    /// Returns the matching channels in sort order. The sort is stable.
    pub fn apply(&self, channels: &[Channel]) -> Vec<Channel> {
        let mut out: Vec<Channel> = channels
            .iter()
            .filter(|c| self.matches_search(c) && self.matches_filters(c))
            .cloned()
            .collect();
        out.sort_by(|a, b| self.sort.compare(&ChannelKey::of(a), &ChannelKey::of(b)));
        out
    }

    /// Groups open channels by remote pubkey and applies search and sort to the groups.
    /// Close height does not apply to peers; that key keeps first-seen order.
    pub fn peers(&self, channels: &[Channel]) -> Vec<PeerSummary> {
        let mut order: Vec<String> = Vec::new();
        let mut peers: HashMap<String, PeerSummary> = HashMap::new();
        for channel in channels.iter().filter(|c| !c.remote_pubkey.is_empty()) {
            let peer = peers.entry(channel.remote_pubkey.clone()).or_insert_with(|| {
                order.push(channel.remote_pubkey.clone());
                PeerSummary {
                    pubkey: channel.remote_pubkey.clone(),
                    alias: None,
                    display_name: channel.remote_pubkey.clone(),
                    channel_count: 0,
                    capacity: 0,
                    local_balance: 0,
                    remote_balance: 0,
                    is_active: false,
                }
            });
            if peer.alias.is_none() {
                peer.alias = channel.alias.clone();
                peer.display_name = channel.display_name.clone();
            }
            peer.channel_count += 1;
            peer.capacity = peer.capacity.saturating_add(channel.capacity);
            peer.local_balance = peer.local_balance.saturating_add(channel.local_balance);
            peer.remote_balance = peer.remote_balance.saturating_add(channel.remote_balance);
            peer.is_active |= channel.is_active;
        }

        let mut out: Vec<PeerSummary> = order
            .into_iter()
            .filter_map(|pk| peers.remove(&pk))
            .filter(|p| self.peer_matches_search(p))
            .collect();
        if self.sort.key != SortKey::CloseHeight {
            out.sort_by(|a, b| self.sort.compare(&ChannelKey::of_peer(a), &ChannelKey::of_peer(b)));
        }
        out
    }

    fn peer_matches_search(&self, peer: &PeerSummary) -> bool {
        if self.search.is_empty() {
            return true;
        }
        let needle = self.search.to_lowercase();
        peer.alias
            .as_deref()
            .map(|a| a.to_lowercase().contains(&needle))
            .unwrap_or(false)
            || peer.pubkey.to_lowercase().contains(&needle)
    }
}

/// Sortable projection of a channel or peer.
struct ChannelKey<'a> {
    capacity: u64,
    inbound: u64,
    outbound: u64,
    close_height: u64,
    display_name: &'a str,
    pubkey: &'a str,
}

impl<'a> ChannelKey<'a> {
    fn of(c: &'a Channel) -> Self {
        ChannelKey {
            capacity: c.capacity,
            inbound: c.remote_balance,
            outbound: c.local_balance,
            close_height: c.close_height().unwrap_or(0),
            display_name: &c.display_name,
            pubkey: &c.remote_pubkey,
        }
    }

    fn of_peer(p: &'a PeerSummary) -> Self {
        ChannelKey {
            capacity: p.capacity,
            inbound: p.remote_balance,
            outbound: p.local_balance,
            close_height: 0,
            display_name: &p.display_name,
            pubkey: &p.pubkey,
        }
    }

    fn numeric(&self, key: SortKey) -> u64 {
        match key {
            SortKey::Capacity => self.capacity,
            SortKey::Inbound => self.inbound,
            SortKey::Outbound => self.outbound,
            SortKey::CloseHeight => self.close_height,
            SortKey::DisplayName | SortKey::Pubkey => 0,
        }
    }

    fn text(&self, key: SortKey) -> String {
        match key {
            SortKey::Pubkey => self.pubkey.to_lowercase(),
            _ => self.display_name.to_lowercase(),
        }
    }
}

impl SortSpec {
    fn compare(&self, a: &ChannelKey<'_>, b: &ChannelKey<'_>) -> Ordering {
        let ord = if self.key.is_numeric() {
            a.numeric(self.key).cmp(&b.numeric(self.key))
        } else {
            a.text(self.key).cmp(&b.text(self.key))
        };
        match self.direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        }
    }
}
