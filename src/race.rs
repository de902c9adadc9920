//! First-settled-wins combinator.
//!
//! Used wherever an operation competes with a timer: the loser is dropped and
//! its effect is discarded.
use core::future::Future;
use std::time::Duration;

use tokio::time;

/// Outcome of racing an operation against a deadline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settled<T> {
    /// The operation settled first.
    Completed(T),
    /// The deadline elapsed first.
    TimedOut,
}

/// Runs `operation` against a timer of `deadline` and returns whichever settles first.
/// If both are ready at the same poll, the operation wins.
pub async fn first_settled<F>(operation: F, deadline: Duration) -> Settled<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        output = operation => Settled::Completed(output),
        _ = time::sleep(deadline) => Settled::TimedOut,
    }
}

impl<T> Settled<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Settled::Completed(t) => Some(t),
            Settled::TimedOut => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Settled::TimedOut)
    }
}
