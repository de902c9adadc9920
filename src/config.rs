use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::errors::ChannelError;

/*
Example config file:

[registry]
node_info_timeout_secs = 10
lookup_node_info = true

[registry.alias_overrides]
"03abcd..." = "My LSP"

[close]
timeout_secs = 6

[rebalance]
timeout_secs = 120
fee_limit_sat = 100

[funding]
default_account = "default"

*/

/// Configuration of the channel control plane.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Channel registry options
    #[serde(default)]
    pub registry: Registry,

    /// Channel close options
    #[serde(default)]
    pub close: Close,

    /// Rebalance options
    #[serde(default)]
    pub rebalance: Rebalance,

    /// Channel funding options
    #[serde(default)]
    pub funding: Funding,
}

/// Registry configuration options
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Registry {
    /// Deadline for a single node-info lookup.
    #[serde(default = "Registry::default_node_info_timeout")]
    pub node_info_timeout_secs: u64,

    /// Set to false for backends that cannot look up node aliases.
    #[serde(default = "Registry::default_lookup_node_info")]
    pub lookup_node_info: bool,

    /// Fixed aliases for well-known nodes, keyed by pubkey. Applied after the
    /// reported and cached aliases, before the `"unknown"` marker.
    #[serde(default)]
    pub alias_overrides: HashMap<String, String>,
}

/// Channel close configuration options
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Close {
    /// Time after which an unanswered close request is treated as accepted.
    #[serde(default = "Close::default_timeout")]
    pub timeout_secs: u64,
}

/// Rebalance configuration options
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rebalance {
    /// Payment timeout passed to the node.
    #[serde(default = "Rebalance::default_timeout")]
    pub timeout_secs: u64,

    /// Default routing fee limit.
    #[serde(default = "Rebalance::default_fee_limit")]
    pub fee_limit_sat: u64,

    /// Maximum number of parts for a multi-part payment.
    #[serde(default = "Rebalance::default_max_parts")]
    pub max_parts: u32,

    /// Extra time granted to streaming subscriptions on top of the payment timeout.
    #[serde(default = "Rebalance::default_stream_grace")]
    pub stream_grace_secs: u64,

    /// Amounts at or below this value are rejected.
    #[serde(default = "Rebalance::default_min_amount")]
    pub min_amount_sat: u64,

    /// Name of the temporary routing layer.
    #[serde(default = "Rebalance::default_layer_name")]
    pub layer_name: String,

    /// Final CLTV delta used when the invoice does not specify one.
    #[serde(default = "Rebalance::default_final_cltv")]
    pub final_cltv: u32,
}

/// Funding configuration options
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Funding {
    /// Wallet account that allows the single-call open.
    #[serde(default = "Funding::default_account")]
    pub default_account: String,
}

impl Config {
    /// Parses the configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Config, ChannelError> {
        toml::from_str(s).map_err(|e| ChannelError::InvalidConfig(e.to_string()))
    }

    /// Loads the configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ChannelError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            ChannelError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Returns a documentation for the config file.
    pub fn documentation() -> &'static str {
        r##"
    [registry]
    node_info_timeout_secs = 10   # deadline for each node alias lookup
    lookup_node_info = true       # false for backends without node info lookups

    [registry.alias_overrides]    # fixed aliases by pubkey, used when no alias is reported or cached

    [close]
    timeout_secs = 6              # after this, an unanswered close is treated as accepted

    [rebalance]
    timeout_secs = 120            # payment timeout passed to the node
    fee_limit_sat = 100           # default routing fee limit
    max_parts = 5                 # maximum parts of a multi-part payment
    stream_grace_secs = 5         # extra wait for streaming payment updates
    min_amount_sat = 1            # amounts at or below this value are rejected
    layer_name = "circular-rebalance"
    final_cltv = 144

    [funding]
    default_account = "default"   # account that allows single-call channel opens
"##
    }
}

impl Registry {
    /// Default node-info lookup deadline (10 seconds).
    pub fn default_node_info_timeout() -> u64 {
        10
    }

    fn default_lookup_node_info() -> bool {
        true
    }

    /// Lookup deadline as a duration.
    pub fn node_info_timeout(&self) -> Duration {
        Duration::from_secs(self.node_info_timeout_secs)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            node_info_timeout_secs: Self::default_node_info_timeout(),
            lookup_node_info: Self::default_lookup_node_info(),
            alias_overrides: HashMap::new(),
        }
    }
}

impl Close {
    /// Default close race deadline (6 seconds).
    pub fn default_timeout() -> u64 {
        6
    }

    /// Close race deadline as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for Close {
    fn default() -> Self {
        Close {
            timeout_secs: Self::default_timeout(),
        }
    }
}

impl Rebalance {
    /// Default payment timeout (120 seconds).
    pub fn default_timeout() -> u64 {
        120
    }

    /// Default routing fee limit (100 sat).
    pub fn default_fee_limit() -> u64 {
        100
    }

    /// Default number of payment parts.
    pub fn default_max_parts() -> u32 {
        5
    }

    /// Default grace period for streaming updates.
    pub fn default_stream_grace() -> u64 {
        5
    }

    /// Default minimum amount.
    pub fn default_min_amount() -> u64 {
        1
    }

    /// Default routing layer name.
    pub fn default_layer_name() -> String {
        "circular-rebalance".to_string()
    }

    /// Default final CLTV delta.
    pub fn default_final_cltv() -> u32 {
        144
    }
}

impl Default for Rebalance {
    fn default() -> Self {
        Rebalance {
            timeout_secs: Self::default_timeout(),
            fee_limit_sat: Self::default_fee_limit(),
            max_parts: Self::default_max_parts(),
            stream_grace_secs: Self::default_stream_grace(),
            min_amount_sat: Self::default_min_amount(),
            layer_name: Self::default_layer_name(),
            final_cltv: Self::default_final_cltv(),
        }
    }
}

impl Funding {
    /// Default wallet account.
    pub fn default_account() -> String {
        "default".to_string()
    }
}

impl Default for Funding {
    fn default() -> Self {
        Funding {
            default_account: Self::default_account(),
        }
    }
}
