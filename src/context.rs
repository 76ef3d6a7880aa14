//! Cancellable execution context for one export
//!
//! Carries the caller's cancellation token, an optional deadline and the
//! tracing span that every event of the export is recorded under. The core
//! never reaches for ambient state; everything flows through this value.

use crate::{Error, Result};

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Span;

/// Execution context passed explicitly through the pipeline
#[derive(Debug, Clone)]
pub struct ExportContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    span: Span,
}

impl ExportContext {
    /// Create a context driven by `cancel`, with no deadline.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
            span: Span::current(),
        }
    }

    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Set a deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Record events of this export under `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Derive a context whose token is a child of this one.
    ///
    /// The returned guard cancels the child when dropped, which stops any
    /// task holding the child without touching the parent.
    pub fn child(&self) -> (Self, DropGuard) {
        let token = self.cancel.child_token();
        let guard = token.clone().drop_guard();
        let ctx = Self {
            cancel: token,
            deadline: self.deadline,
            span: self.span.clone(),
        };
        (ctx, guard)
    }

    /// Fail fast if the context is already cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Race `fut` against cancellation and the deadline.
    ///
    /// Cancellation wins ties so that a cancelled export never makes
    /// further progress.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

impl Default for ExportContext {
    fn default() -> Self {
        Self::background()
    }
}
