//! Composable cancellation, mapped onto [`tokio_util::sync::CancellationToken`].
//!
//! Every blocking operation in the pipeline (BufferedStream read/peek,
//! MediaObjectBuffer get/put, MediaObject waitForEnd, transport reads) takes
//! an `Interrupt` and races it against its own wait. An `Interrupt` composes a
//! parent token with a local one: cancelling either fires the child.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Interrupt {
    token: CancellationToken,
}

impl Interrupt {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Build a child interrupt that fires when either `self` or the returned
    /// handle's local `cancel()` is invoked.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub(crate) fn raw(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_cancelled_by_parent() {
        let parent = Interrupt::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn child_cancel_does_not_affect_parent() {
        let parent = Interrupt::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
