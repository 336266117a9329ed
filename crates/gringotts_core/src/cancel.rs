//! Per-call cancellation and deadline signal.
//!
//! # Responsibility
//! - Let callers bound how long a repository call may block.
//! - Let another thread abort an in-flight call.
//!
//! # Invariants
//! - Clones share one cancellation flag; cancelling any clone cancels all.
//! - Once fired, a token stays fired.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a call stopped before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Cancelled,
    DeadlineExceeded,
}

impl Display for Interruption {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::DeadlineExceeded => write!(f, "operation deadline exceeded"),
        }
    }
}

impl Error for Interruption {}

/// Cancellation flag plus optional deadline, passed into every repository call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Token that only fires when [`CancelToken::cancel`] is called.
    pub fn none() -> Self {
        Self::default()
    }

    /// Token that fires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Token that fires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fires the token for this value and all of its clones.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns the reason the token fired, if it has.
    ///
    /// Explicit cancellation wins over an expired deadline.
    pub fn interruption(&self) -> Option<Interruption> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Some(Interruption::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interruption::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_fired(&self) -> bool {
        self.interruption().is_some()
    }

    /// `Err` once the token has fired.
    pub fn check(&self) -> Result<(), Interruption> {
        match self.interruption() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }
}
