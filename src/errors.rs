//! Errors raised by the channel control plane.
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Raw rejection returned by a node backend call.
/// The message is kept verbatim for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    /// Error text as reported by the backend.
    pub message: String,
}

impl BackendError {
    /// Creates a backend error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        BackendError {
            message: message.into(),
        }
    }
}

/// Known classes of protocol rejections, recognized by inspecting the error text.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RejectionCategory {
    /// The node could not find a path for the payment.
    NoRoute,
    /// A channel or wallet did not hold enough funds.
    InsufficientBalance,
    /// The fee limit was too low for any available route.
    FeeLimit,
    /// The payment timeout was missing or malformed.
    InvalidTimeout,
    /// The backend rejected a request parameter; the raw text is shown to the user as is.
    InvalidParameters,
    /// The funding transaction could not be published.
    PublishFailed,
    /// Anything else.
    Generic,
}

/// Represents an error in fetching, funding, closing or rebalancing channels.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// This error occurs when a backend call is rejected without a recognizable cause.
    #[error("Backend request failed: {0}")]
    Backend(#[from] BackendError),

    /// This error occurs when the backend explicitly rejects a request for a known reason.
    #[error("{}", .category.message_with(.raw))]
    Rejected {
        /// Classified cause of the rejection.
        category: RejectionCategory,
        /// Raw error text from the backend.
        raw: String,
    },

    /// This error occurs when an operation did not settle within its deadline.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        /// Name of the operation that timed out.
        operation: &'static str,
        /// Deadline that elapsed.
        after: Duration,
    },

    /// This error occurs when a rebalance intent violates its invariants.
    #[error("Invalid rebalance: {0}")]
    InvalidIntent(String),

    /// This error occurs when a channel without a backend id is used where one is required.
    #[error("Channel id is missing.")]
    MissingChannelId,

    /// This error occurs when a funding request is incomplete or inconsistent.
    #[error("Invalid funding request: {0}")]
    InvalidFundingRequest(String),

    /// This error occurs when any step of a (batch) channel funding fails.
    /// The funding transaction is never finalized in that case.
    #[error("Channel funding failed at step {step}: {source}")]
    BatchFailed {
        /// Step of the funding flow that failed.
        step: FundingStep,
        /// Error raised by that step.
        source: Box<ChannelError>,
    },

    /// This error occurs when the node refuses to publish the funding transaction.
    #[error("{}", RejectionCategory::PublishFailed.message_with(.0))]
    PublishFailed(String),

    /// This error occurs when the configuration file is malformed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Identifies a step of the channel funding flow for error reporting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FundingStep {
    /// Connecting to the peer of the channel with the given batch index.
    PeerConnect(usize),
    /// Negotiating the funding shim with the peer.
    FundingRequested(usize),
    /// Funding the PSBT from the wallet.
    PsbtFunded(usize),
    /// Obtaining the signature for the PSBT.
    PsbtSigned(usize),
    /// Verifying the PSBT against the pending channel.
    PsbtVerified(usize),
    /// Finalizing and publishing the funding transaction.
    PsbtFinalized,
    /// Single-call channel open.
    DirectOpen,
}

impl RejectionCategory {
    /// Classifies a raw backend error text.
    pub fn classify(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        if lower.contains("no route")
            || raw.contains("NO_ROUTE")
            || lower.contains("unable to find a path")
        {
            RejectionCategory::NoRoute
        } else if lower.contains("insufficient") || raw.contains("INSUFFICIENT_BALANCE") {
            RejectionCategory::InsufficientBalance
        } else if lower.contains("fee") && lower.contains("limit") {
            RejectionCategory::FeeLimit
        } else if lower.contains("timeout_seconds must be specified") {
            RejectionCategory::InvalidTimeout
        } else if lower.contains("invalid")
            || lower.contains("must be")
            || lower.contains("required")
            || lower.contains("should be")
        {
            RejectionCategory::InvalidParameters
        } else if lower.contains("publish") {
            RejectionCategory::PublishFailed
        } else {
            RejectionCategory::Generic
        }
    }

    /// Fixed user-facing message for the category.
    pub fn message(&self) -> &'static str {
        match self {
            RejectionCategory::NoRoute => "No route found for the payment.",
            RejectionCategory::InsufficientBalance => "Insufficient balance.",
            RejectionCategory::FeeLimit => "Fee limit too low",
            RejectionCategory::InvalidTimeout => "Payment timeout must be specified.",
            RejectionCategory::InvalidParameters => "Invalid request",
            RejectionCategory::PublishFailed => "Funding transaction could not be published",
            RejectionCategory::Generic => "Request failed",
        }
    }

    /// Message for the category, with the raw text appended where it helps the user.
    pub fn message_with(&self, raw: &str) -> String {
        match self {
            RejectionCategory::NoRoute
            | RejectionCategory::InsufficientBalance
            | RejectionCategory::InvalidTimeout => self.message().to_string(),
            RejectionCategory::InvalidParameters => raw.to_string(),
            _ => format!("{}: {}", self.message(), raw),
        }
    }
}

impl ChannelError {
    /// Wraps a backend rejection into a classified error.
    pub fn rejected(err: BackendError) -> Self {
        match RejectionCategory::classify(&err.message) {
            RejectionCategory::Generic => ChannelError::Backend(err),
            category => ChannelError::Rejected {
                category,
                raw: err.message,
            },
        }
    }

    /// Raw error text kept for diagnostics, when the error originated from the backend.
    pub fn raw(&self) -> Option<&str> {
        match self {
            ChannelError::Backend(e) => Some(&e.message),
            ChannelError::Rejected { raw, .. } => Some(raw),
            ChannelError::PublishFailed(raw) => Some(raw),
            ChannelError::BatchFailed { source, .. } => source.raw(),
            _ => None,
        }
    }

    /// Category of the error as presented to the user.
    pub fn category(&self) -> RejectionCategory {
        match self {
            ChannelError::Rejected { category, .. } => *category,
            ChannelError::PublishFailed(_) => RejectionCategory::PublishFailed,
            ChannelError::BatchFailed { source, .. } => source.category(),
            _ => RejectionCategory::Generic,
        }
    }
}

impl fmt::Display for FundingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FundingStep::PeerConnect(i) => write!(f, "peer connect #{}", i),
            FundingStep::FundingRequested(i) => write!(f, "funding request #{}", i),
            FundingStep::PsbtFunded(i) => write!(f, "psbt funding #{}", i),
            FundingStep::PsbtSigned(i) => write!(f, "psbt signing #{}", i),
            FundingStep::PsbtVerified(i) => write!(f, "psbt verification #{}", i),
            FundingStep::PsbtFinalized => write!(f, "psbt finalization"),
            FundingStep::DirectOpen => write!(f, "channel open"),
        }
    }
}
