//! Channel close completion race.
//!
//! The close call and a timer start together. A backend answer that arrives
//! first is final. If the timer fires first the close is assumed accepted, the
//! call keeps running in the background and a late error is only logged. The
//! next channel fetch shows the real state of the channel.
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::backend::{Backend, BackendKind, CloseChannelRequest, CloseChannelResponse, CloseTarget};
use crate::channel::Channel;
use crate::errors::{BackendError, ChannelError};
use crate::race::{first_settled, Settled};

/// How a close request settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The backend answered within the deadline.
    Acknowledged(CloseChannelResponse),
    /// The deadline elapsed first; the close is treated as accepted.
    AssumedClosed,
}

impl CloseOutcome {
    pub fn closing_txid(&self) -> Option<&str> {
        match self {
            CloseOutcome::Acknowledged(resp) => resp.closing_txid.as_deref(),
            CloseOutcome::AssumedClosed => None,
        }
    }
}

/// Builds the close request for `channel` in the addressing scheme of the backend.
/// Id-addressed backends ignore the fee rate.
pub fn close_request_for(
    channel: &Channel,
    kind: BackendKind,
    sat_per_vbyte: Option<u64>,
    force: bool,
) -> Result<CloseChannelRequest, ChannelError> {
    let (target, sat_per_vbyte) = match kind {
        BackendKind::CoreLightning => {
            let id = channel
                .channel_id
                .clone()
                .or_else(|| channel.short_channel_id.clone())
                .ok_or(ChannelError::MissingChannelId)?;
            (CloseTarget::ChannelId(id), None)
        }
        BackendKind::Lnd | BackendKind::RemoteProxy => {
            let outpoint = channel
                .funding_outpoint
                .clone()
                .ok_or(ChannelError::MissingChannelId)?;
            (CloseTarget::Outpoint(outpoint), sat_per_vbyte)
        }
    };
    Ok(CloseChannelRequest {
        target,
        sat_per_vbyte,
        force,
    })
}

/// Races the close call against `deadline`.
pub async fn close_channel<B>(
    backend: Arc<B>,
    request: CloseChannelRequest,
    deadline: Duration,
) -> Result<CloseOutcome, ChannelError>
where
    B: Backend + ?Sized + 'static,
{
    let target = request.target.clone();
    let mut call = tokio::spawn(async move { backend.close_channel(request).await });

    match first_settled(&mut call, deadline).await {
        Settled::Completed(Ok(Ok(response))) => {
            info!(?target, success = response.success, "close acknowledged");
            Ok(CloseOutcome::Acknowledged(response))
        }
        Settled::Completed(Ok(Err(e))) => {
            warn!(?target, error = %e, "close rejected");
            Err(ChannelError::rejected(e))
        }
        Settled::Completed(Err(join_error)) => {
            Err(BackendError::new(format!("close task failed: {}", join_error)).into())
        }
        Settled::TimedOut => {
            warn!(?target, ?deadline, "close not acknowledged in time, assuming accepted");
            tokio::spawn(async move {
                match call.await {
                    Ok(Err(e)) => warn!(?target, error = %e, "late close error ignored"),
                    Ok(Ok(_)) => info!(?target, "late close acknowledgement"),
                    Err(e) => warn!(?target, error = %e, "close task failed"),
                }
            });
            Ok(CloseOutcome::AssumedClosed)
        }
    }
}
