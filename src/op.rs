//! Per-operation context: an id for log correlation, a cooperative
//! cancellation flag and an optional deadline.
//!
//! Long-running calls (disk and VM tasks, uploads, commits) take an
//! `&Operation` and check it at every point where they would submit work to
//! the fabric. Clones share the same cancellation flag.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Default deadline for create/configure paths.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct Operation {
    id: String,
    cancel: Arc<watch::Sender<bool>>,
    deadline: Option<Instant>,
}

impl Operation {
    /// Start a new root operation. `name` becomes the prefix of the id.
    pub fn new(name: &str) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            id: format!("{}.{:08x}", name, rand::random::<u32>()),
            cancel: Arc::new(tx),
            deadline: None,
        }
    }

    /// A child operation sharing this one's cancellation, bounded by `timeout`
    /// or the parent's deadline, whichever comes first.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            id: self.id.clone(),
            cancel: self.cancel.clone(),
            deadline: Some(match self.deadline {
                Some(parent) if parent < deadline => parent,
                _ => deadline,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("op", id = %self.id)
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Fail fast if the operation has been cancelled or has run out of time.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once the operation is cancelled or its deadline passes,
    /// yielding the matching error.
    pub async fn done(&self) -> Error {
        let mut rx = self.cancel.subscribe();
        let cancelled = async move {
            let _ = rx.wait_for(|cancelled| *cancelled).await;
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = cancelled => Error::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Error::DeadlineExceeded,
            },
            None => {
                cancelled.await;
                Error::Cancelled
            }
        }
    }

    /// Run `fut` to completion unless the operation is cancelled first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            res = fut => res,
            err = self.done() => Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
