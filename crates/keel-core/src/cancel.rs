//! Cooperative cancellation and pausing for transfers.
//!
//! A [`TransferSignal`] is handed to the transfer loop explicitly; the loop
//! polls it at every chunk boundary. Nothing here interrupts I/O that is
//! already in flight.

use crate::error::KeelError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shareable cancellation flag.
///
/// Clones observe the same state: cancelling any clone cancels them all.
///
/// ```
/// use keel_core::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let observer = token.clone();
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can guard a new run.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Why a transfer loop stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    Paused,
}

impl From<Interrupt> for KeelError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => KeelError::DownloadCancelled,
            Interrupt::Paused => KeelError::DownloadPaused,
        }
    }
}

/// Cancel and pause flags for a single transfer.
///
/// Cancelling the signal never touches the outer token it observes.
#[derive(Debug, Clone, Default)]
pub struct TransferSignal {
    cancel: CancellationToken,
    outer: Option<CancellationToken>,
    paused: Arc<AtomicBool>,
}

impl TransferSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that also observes an outer cancellation token.
    pub fn with_token(outer: CancellationToken) -> Self {
        Self {
            outer: Some(outer),
            ..Self::default()
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.outer.as_ref().is_some_and(|t| t.is_cancelled())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Poll point for transfer loops. Cancellation wins over pause.
    pub fn checkpoint(&self) -> Result<(), Interrupt> {
        if self.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else if self.is_paused() {
            Err(Interrupt::Paused)
        } else {
            Ok(())
        }
    }
}
