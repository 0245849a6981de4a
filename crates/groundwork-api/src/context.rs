//! Per-run context threaded through builders, runners and the aggregator.

use tokio_util::sync::CancellationToken;
use tracing::Span;

/// Cancellation signal plus the tracing span every component logs under.
///
/// Cloning is cheap; clones share the same token.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    cancel: CancellationToken,
    span: Span,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self::with_cancel(run_id, CancellationToken::new())
    }

    pub fn with_cancel(run_id: impl Into<String>, cancel: CancellationToken) -> Self {
        let run_id = run_id.into();
        let span = tracing::info_span!("run", run_id = %run_id);
        RunContext {
            run_id,
            cancel,
            span,
        }
    }

    /// Derive a context for a sub-task: cancelling the parent cancels the
    /// child, not the other way around.
    pub fn child(&self, name: &'static str) -> Self {
        RunContext {
            run_id: self.run_id.clone(),
            cancel: self.cancel.child_token(),
            span: tracing::info_span!(parent: &self.span, "task", name),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_child_follows_parent_cancellation() {
        let parent = RunContext::new("run-1");
        let child = parent.child("build");
        assert!(!child.is_cancelled());

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child("run");
        parent.cancel();
        other.cancelled().await;
        assert!(other.is_cancelled());
        assert_eq!(other.run_id, "run-1");
    }
}
