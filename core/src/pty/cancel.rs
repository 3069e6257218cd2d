use std::sync::Arc;
use std::sync::OnceLock;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Why a turn was cancelled. The first two tell the supervisor the work is
/// probably finished, so the child gets a chance to exit on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    ResponseComplete,
    SessionDetected,
    UserCancelled,
    Shutdown,
}

impl AbortReason {
    pub fn is_soft(self) -> bool {
        matches!(
            self,
            AbortReason::ResponseComplete | AbortReason::SessionDetected
        )
    }
}

/// Turn-scoped cancellation handle. Clones share state; the first reason
/// recorded wins.
#[derive(Debug, Clone, Default)]
pub struct TurnCancellation {
    token: CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
}

impl TurnCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: AbortReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.get().copied()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
