//! Cancellation token shared by every blocking operation.
//!
//! A [`CancelToken`] is a `watch` channel carrying a stop flag plus an
//! optional deadline. Clones observe the same flag; [`CancelToken::with_timeout`]
//! derives a token that additionally expires at a deadline, which transports
//! use for their read/write deadlines.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// A cloneable cancellation signal with an optional deadline.
#[derive(Debug, Clone)]
pub struct CancelToken {
    /// Sender side; sending `true` cancels every clone.
    stop_tx: Arc<watch::Sender<bool>>,
    /// Receiver side, cloned per waiter.
    stop_rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Creates a token that is not cancelled and has no deadline.
    #[must_use]
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            deadline: None,
        }
    }

    /// Cancels this token and all of its clones.
    ///
    /// Idempotent.
    pub fn cancel(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Whether the token is cancelled or past its deadline.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The deadline, if one was set.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if one was set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Derives a token sharing this stop flag that also expires after
    /// `timeout`. An existing earlier deadline is kept.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            stop_tx: Arc::clone(&self.stop_tx),
            stop_rx: self.stop_rx.clone(),
            deadline: Some(deadline),
        }
    }

    /// Completes once the token is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        let mut rx = self.stop_rx.clone();
        let stopped = async move {
            // The sender lives as long as any token, so `changed` only fails
            // after every clone is gone.
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = stopped => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => stopped.await,
        }
    }

    /// Runs `fut` until it completes or the token fires.
    ///
    /// Returns [`Error::Cancelled`] on cancellation and [`Error::Timeout`]
    /// when the deadline passes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        tokio::select! {
            biased;
            () = self.cancelled() => {
                if self.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    Err(Error::timeout(started.elapsed()))
                }
            }
            result = fut => result,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
