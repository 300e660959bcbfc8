//! Scoped cooperative shutdown with a cause.
//!
//! Every long-running task in the engine holds a [`StopToken`]. Pausing
//! and canceling a job differ only by the [`StopCause`] recorded next to
//! the cancellation, which the job runner reads back to decide the final
//! persisted job state.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Why a task was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCause {
    /// Stop and persist state so the job can be resumed later.
    Pause,
    /// Stop permanently; the job becomes terminal.
    Cancel,
}

type CauseCell = Arc<Mutex<Option<StopCause>>>;

/// A cancellation token paired with the cause of the cancellation.
///
/// Children created with [`StopToken::child`] are cancelled when any
/// ancestor is cancelled and report the nearest recorded cause in the
/// chain; signalling a child never affects its parent or siblings.
#[derive(Debug, Clone)]
pub struct StopToken {
    token: CancellationToken,
    // This token's cause first, then its ancestors' cells, root last.
    causes: Vec<CauseCell>,
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

impl StopToken {
    /// A fresh, unsignalled token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            causes: vec![Arc::new(Mutex::new(None))],
        }
    }

    /// A child token: cancelled when the parent is cancelled, reporting
    /// the parent's cause unless it was signalled directly.
    #[must_use]
    pub fn child(&self) -> Self {
        let mut causes = Vec::with_capacity(self.causes.len() + 1);
        causes.push(Arc::new(Mutex::new(None)));
        causes.extend(self.causes.iter().cloned());

        Self {
            token: self.token.child_token(),
            causes,
        }
    }

    /// Signal the token with a cause. The first cause wins; later
    /// signals still cancel but do not overwrite it.
    pub fn signal(&self, cause: StopCause) {
        let own = self.causes.first().expect("a token always has a cause cell");
        let mut slot = own.lock().expect("stop cause lock poisoned");
        if slot.is_none() {
            *slot = Some(cause);
        }
        drop(slot);

        self.token.cancel();
    }

    /// The nearest recorded cause in the ancestry chain, if any.
    #[must_use]
    pub fn cause(&self) -> Option<StopCause> {
        self.causes
            .iter()
            .find_map(|cell| *cell.lock().expect("stop cause lock poisoned"))
    }

    /// Whether the token has been cancelled.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the token is cancelled.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_observe_the_parent_cause() {
        let parent = StopToken::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.signal(StopCause::Pause);

        assert!(grandchild.is_stopped());
        assert_eq!(child.cause(), Some(StopCause::Pause));
        assert_eq!(grandchild.cause(), Some(StopCause::Pause));
    }

    #[test]
    fn signalling_a_child_leaves_siblings_alone() {
        let parent = StopToken::new();
        let left = parent.child();
        let right = parent.child();

        left.signal(StopCause::Cancel);

        assert!(left.is_stopped());
        assert!(!right.is_stopped());
        assert_eq!(right.cause(), None);
        assert_eq!(parent.cause(), None);
    }

    #[test]
    fn the_first_cause_wins() {
        let token = StopToken::new();
        token.signal(StopCause::Pause);
        token.signal(StopCause::Cancel);

        assert_eq!(token.cause(), Some(StopCause::Pause));
    }
}
