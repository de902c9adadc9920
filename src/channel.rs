//! Channel records as reported by the node backends, and the uniform `Channel`
//! entity they are normalized into.
//!
//! LND-style records report balances in satoshis (often as decimal strings),
//! CLN-style records report millisatoshi totals and a textual state. Both
//! shapes deserialize into `RawChannel`, which `Channel::from_raw` normalizes.
use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// State string of an operational CLN channel.
pub const CLN_NORMAL_STATE: &str = "CHANNELD_NORMAL";

/// Display name used when a channel has no alias, pubkey or id.
pub const UNKNOWN_NAME: &str = "unknown";

/// Channel record as returned by a backend, before normalization.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawChannel {
    #[serde(default, deserialize_with = "de::opt_string")]
    pub chan_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub short_channel_id: Option<String>,
    #[serde(default)]
    pub channel_point: Option<String>,

    #[serde(default)]
    pub remote_pubkey: Option<String>,
    #[serde(default)]
    pub remote_node_pub: Option<String>,
    #[serde(default)]
    pub peer_id: Option<String>,

    #[serde(default, deserialize_with = "de::opt_u64")]
    pub local_balance: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub remote_balance: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub capacity: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub local_chan_reserve_sat: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub remote_chan_reserve_sat: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub to_us_msat: Option<u64>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub total_msat: Option<u64>,

    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub private: Option<bool>,
    #[serde(default)]
    pub alias: Option<String>,

    #[serde(default)]
    pub pending_htlcs: Vec<RawHtlc>,

    // closed channels only
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub close_height: Option<u64>,
    #[serde(default)]
    pub closing_tx_hash: Option<String>,
    #[serde(default)]
    pub close_type: Option<String>,
}

/// HTLC record as returned by a backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawHtlc {
    #[serde(default)]
    pub incoming: bool,
    /// Amount in satoshis.
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub amount: Option<u64>,
    #[serde(default)]
    pub hash_lock: String,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub expiration_height: Option<u64>,
}

/// Pending channel entry: the channel record plus the data of its pending group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingChannel {
    pub channel: RawChannel,
    #[serde(default)]
    pub closing_txid: Option<String>,
    #[serde(default, deserialize_with = "de::opt_u64")]
    pub blocks_til_maturity: Option<u64>,
}

/// Pending channels grouped by the kind of pending transition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingChannels {
    #[serde(default)]
    pub pending_open_channels: Vec<PendingChannel>,
    #[serde(default)]
    pub pending_closing_channels: Vec<PendingChannel>,
    #[serde(default)]
    pub pending_force_closing_channels: Vec<PendingChannel>,
    #[serde(default)]
    pub waiting_close_channels: Vec<PendingChannel>,
}

/// Funding transaction outpoint (`txid:index`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: String,
    pub output_index: u32,
}

/// In-flight conditional payment within a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Htlc {
    pub incoming: bool,
    pub amount_msat: u64,
    pub hash_lock: String,
    pub expiration_height: u64,
}

/// Details that only closed channels carry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseInfo {
    /// Absent for backends that do not report the closing block.
    pub close_height: Option<u64>,
    pub closing_tx_hash: Option<String>,
    pub close_type: Option<String>,
}

/// Coarse lifecycle phase of a channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelPhase {
    Open,
    PendingOpen,
    PendingClose,
    ForceClose,
    WaitingClose,
    Closed,
}

/// Kind of pending group a pending channel was reported in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PendingKind {
    Open,
    Closing,
    ForceClosing,
    WaitingClose,
}

/// Uniform channel entity shared by all backends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Backend-local channel id; absent before confirmation.
    pub channel_id: Option<String>,
    pub short_channel_id: Option<String>,
    pub funding_outpoint: Option<Outpoint>,

    pub local_balance: u64,
    pub remote_balance: u64,
    pub capacity: u64,
    pub local_reserve: u64,
    pub remote_reserve: u64,

    pub remote_pubkey: String,
    /// Resolved alias of the remote node, filled by enrichment.
    pub alias: Option<String>,
    /// First non-empty of alias, pubkey, id or `"unknown"`.
    pub display_name: String,

    pub is_active: bool,
    pub pending_open: bool,
    pub pending_close: bool,
    pub force_close: bool,
    pub closing: bool,
    pub private: bool,

    pub closing_txid: Option<String>,
    pub blocks_til_maturity: Option<u64>,
    pub close: Option<CloseInfo>,

    pub pending_htlcs: Vec<Htlc>,
}

impl Channel {
    /// Normalizes a raw backend record.
    pub fn from_raw(raw: RawChannel) -> Channel {
        let local_balance = match raw.to_us_msat {
            Some(msat) => msat / 1000,
            None => raw.local_balance.unwrap_or(0),
        };
        let remote_balance = match raw.total_msat {
            Some(total) => total.saturating_sub(raw.to_us_msat.unwrap_or(0)) / 1000,
            None => raw.remote_balance.unwrap_or(0),
        };
        let reported_capacity = raw
            .capacity
            .or_else(|| raw.total_msat.map(|msat| msat / 1000))
            .unwrap_or(0);
        let capacity = reported_capacity.max(local_balance.saturating_add(remote_balance));

        let is_active = raw.active.unwrap_or(false)
            || raw.state.as_ref().map(|s| s.as_str()) == Some(CLN_NORMAL_STATE);

        let channel_id = non_empty(raw.chan_id.clone()).or_else(|| non_empty(raw.channel_id));
        let short_channel_id = non_empty(raw.short_channel_id).or_else(|| {
            raw.chan_id
                .as_ref()
                .and_then(|id| id.parse::<u64>().ok())
                .and_then(format_short_channel_id)
        });
        let remote_pubkey = non_empty(raw.remote_pubkey)
            .or_else(|| non_empty(raw.remote_node_pub))
            .or_else(|| non_empty(raw.peer_id))
            .unwrap_or_default();

        let close = match (raw.close_height, raw.closing_tx_hash, raw.close_type) {
            (None, None, None) => None,
            (close_height, closing_tx_hash, close_type) => Some(CloseInfo {
                close_height,
                closing_tx_hash,
                close_type,
            }),
        };

        let pending_htlcs = raw
            .pending_htlcs
            .into_iter()
            .map(|h| Htlc {
                incoming: h.incoming,
                amount_msat: h.amount.unwrap_or(0).saturating_mul(1000),
                hash_lock: h.hash_lock,
                expiration_height: h.expiration_height.unwrap_or(0),
            })
            .collect();

        let mut channel = Channel {
            channel_id,
            short_channel_id,
            funding_outpoint: raw.channel_point.and_then(|p| p.parse().ok()),
            local_balance,
            remote_balance,
            capacity,
            local_reserve: raw.local_chan_reserve_sat.unwrap_or(0),
            remote_reserve: raw.remote_chan_reserve_sat.unwrap_or(0),
            remote_pubkey,
            alias: non_empty(raw.alias),
            display_name: String::new(),
            is_active,
            pending_open: false,
            pending_close: false,
            force_close: false,
            closing: false,
            private: raw.private.unwrap_or(false),
            closing_txid: None,
            blocks_til_maturity: None,
            close,
            pending_htlcs,
        };
        channel.display_name = channel.fallback_name();
        channel
    }

    /// Normalizes an entry of the closed list. The record is closed whether or
    /// not the backend reports close details.
    pub fn from_closed(raw: RawChannel) -> Channel {
        let mut channel = Channel::from_raw(raw);
        channel.is_active = false;
        if channel.close.is_none() {
            channel.close = Some(CloseInfo::default());
        }
        channel
    }

    /// Normalizes an entry of one of the pending groups, setting the matching phase flag.
    pub fn from_pending(pending: PendingChannel, kind: PendingKind) -> Channel {
        let mut channel = Channel::from_raw(pending.channel);
        match kind {
            PendingKind::Open => channel.pending_open = true,
            PendingKind::Closing => {
                channel.pending_close = true;
                channel.closing_txid = pending.closing_txid;
            }
            PendingKind::ForceClosing => {
                channel.force_close = true;
                channel.closing_txid = pending.closing_txid;
                channel.blocks_til_maturity = pending.blocks_til_maturity;
            }
            PendingKind::WaitingClose => channel.closing = true,
        }
        channel
    }

    /// Local balance net of the local reserve, never negative.
    pub fn sending_capacity(&self) -> u64 {
        self.local_balance.saturating_sub(self.local_reserve)
    }

    /// Remote balance net of the remote reserve, never negative.
    pub fn receiving_capacity(&self) -> u64 {
        self.remote_balance.saturating_sub(self.remote_reserve)
    }

    pub fn is_below_reserve(&self) -> bool {
        self.local_balance < self.local_reserve
    }

    pub fn total_reserve(&self) -> u64 {
        self.local_reserve.saturating_add(self.remote_reserve)
    }

    /// Phase of the channel, with flags checked in priority order.
    pub fn phase(&self) -> ChannelPhase {
        if self.close.is_some() {
            ChannelPhase::Closed
        } else if self.force_close {
            ChannelPhase::ForceClose
        } else if self.pending_close {
            ChannelPhase::PendingClose
        } else if self.closing {
            ChannelPhase::WaitingClose
        } else if self.pending_open {
            ChannelPhase::PendingOpen
        } else {
            ChannelPhase::Open
        }
    }

    /// Name derived only from the channel's own fields.
    pub(crate) fn fallback_name(&self) -> String {
        self.alias
            .iter()
            .chain(Some(&self.remote_pubkey))
            .chain(self.channel_id.iter())
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| UNKNOWN_NAME.to_string())
    }

    /// Height at which the channel closed, when known.
    pub fn close_height(&self) -> Option<u64> {
        self.close.as_ref().and_then(|c| c.close_height)
    }
}

/// Formats a numeric short channel id as `block x tx x output`.
/// Returns `None` for the all-zero id.
pub fn format_short_channel_id(id: u64) -> Option<String> {
    let block = id >> 40;
    let tx = (id >> 16) & 0xFF_FFFF;
    let output = id & 0xFFFF;
    if block == 0 && tx == 0 && output == 0 {
        return None;
    }
    Some(format!("{}x{}x{}", block, tx, output))
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

impl FromStr for Outpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, ':');
        let txid = parts.next().filter(|t| !t.is_empty());
        let index = parts.next().and_then(|i| i.parse::<u32>().ok());
        match (txid, index) {
            (Some(txid), Some(output_index)) => Ok(Outpoint {
                txid: txid.to_string(),
                output_index,
            }),
            _ => Err(format!("Malformed outpoint: {}", s)),
        }
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.output_index)
    }
}

/// Lenient deserializers: backends encode 64-bit integers either as JSON numbers or strings.
pub(crate) mod de {
    use serde::de::{Deserialize, Deserializer, Error};
    use serde_json::Value;

    pub fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("not an unsigned integer: {}", n))),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim_end_matches("msat")
                .parse::<u64>()
                .map(Some)
                .map_err(D::Error::custom),
            Some(other) => Err(D::Error::custom(format!("unexpected value: {}", other))),
        }
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(D::Error::custom(format!("unexpected value: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lnd_record() -> RawChannel {
        serde_json::from_value(json!({
            "chan_id": "770495967390531585",
            "channel_point": "6f2a1e5b1c:1",
            "remote_pubkey": "02abc",
            "local_balance": "50500",
            "remote_balance": "30300",
            "capacity": "100000",
            "local_chan_reserve_sat": "500",
            "remote_chan_reserve_sat": "300",
            "active": true,
            "private": false,
            "pending_htlcs": [
                {"incoming": true, "amount": "1000", "hash_lock": "aa", "expiration_height": 800000}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn normalizes_lnd_record() {
        let c = Channel::from_raw(lnd_record());
        assert_eq!(c.channel_id.as_deref(), Some("770495967390531585"));
        assert_eq!(c.short_channel_id.as_deref(), Some("700762x1327x1"));
        assert_eq!(
            c.funding_outpoint,
            Some(Outpoint {
                txid: "6f2a1e5b1c".into(),
                output_index: 1
            })
        );
        assert_eq!(c.sending_capacity(), 50_000);
        assert_eq!(c.receiving_capacity(), 30_000);
        assert!(c.is_active);
        assert_eq!(c.pending_htlcs[0].amount_msat, 1_000_000);
        assert_eq!(c.phase(), ChannelPhase::Open);
        assert_eq!(c.display_name, "02abc");
    }

    #[test]
    fn normalizes_cln_record() {
        let raw: RawChannel = serde_json::from_value(json!({
            "short_channel_id": "812345x12x0",
            "channel_id": "ab12",
            "peer_id": "03def",
            "to_us_msat": 2_500_999,
            "total_msat": "10000000msat",
            "state": "CHANNELD_NORMAL"
        }))
        .unwrap();
        let c = Channel::from_raw(raw);
        assert_eq!(c.local_balance, 2_500);
        assert_eq!(c.remote_balance, 7_499);
        assert_eq!(c.capacity, 10_000);
        assert_eq!(c.remote_pubkey, "03def");
        assert_eq!(c.short_channel_id.as_deref(), Some("812345x12x0"));
        assert!(c.is_active);
    }

    #[test]
    fn capacities_are_clamped() {
        let c = Channel::from_raw(RawChannel {
            local_balance: Some(100),
            remote_balance: Some(50),
            local_chan_reserve_sat: Some(500),
            remote_chan_reserve_sat: Some(600),
            ..Default::default()
        });
        assert_eq!(c.sending_capacity(), 0);
        assert_eq!(c.receiving_capacity(), 0);
        assert!(c.is_below_reserve());
        assert!(c.local_balance + c.remote_balance <= c.capacity);
    }

    #[test]
    fn phase_follows_flag_priority() {
        let mut c = Channel::from_pending(
            PendingChannel {
                channel: RawChannel::default(),
                closing_txid: Some("ff".into()),
                blocks_til_maturity: Some(144),
            },
            PendingKind::ForceClosing,
        );
        c.pending_open = true;
        c.closing = true;
        assert_eq!(c.phase(), ChannelPhase::ForceClose);
        c.force_close = false;
        assert_eq!(c.phase(), ChannelPhase::WaitingClose);
        c.closing = false;
        assert_eq!(c.phase(), ChannelPhase::PendingOpen);
        assert_eq!(c.blocks_til_maturity, Some(144));
    }

    #[test]
    fn closed_list_entries_are_closed_without_height() {
        let c = Channel::from_closed(RawChannel {
            short_channel_id: Some("1x2x3".into()),
            peer_id: Some("02dd".into()),
            state: Some("CHANNELD_NORMAL".into()),
            ..Default::default()
        });
        assert_eq!(c.phase(), ChannelPhase::Closed);
        assert_eq!(c.close_height(), None);
        assert!(!c.is_active);

        let c = Channel::from_raw(RawChannel {
            close_height: Some(700_000),
            ..Default::default()
        });
        assert_eq!(c.close_height(), Some(700_000));
    }

    #[test]
    fn oversized_values_saturate() {
        let c = Channel::from_raw(RawChannel {
            local_balance: Some(u64::MAX),
            remote_balance: Some(10),
            local_chan_reserve_sat: Some(u64::MAX),
            remote_chan_reserve_sat: Some(1),
            pending_htlcs: vec![RawHtlc {
                amount: Some(u64::MAX),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert_eq!(c.capacity, u64::MAX);
        assert_eq!(c.total_reserve(), u64::MAX);
        assert_eq!(c.pending_htlcs[0].amount_msat, u64::MAX);
    }

    #[test]
    fn empty_channel_is_unknown() {
        let c = Channel::from_raw(RawChannel::default());
        assert_eq!(c.display_name, UNKNOWN_NAME);
        assert_eq!(format_short_channel_id(0), None);
    }
}
