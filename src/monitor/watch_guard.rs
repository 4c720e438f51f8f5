//! Liveness and token bookkeeping shared between a watch task and its owner.
//!
//! A watch task loops "read-and-arm, report, wait for the firing". Its owner
//! may stop it at any point, including while a store call is in flight. The
//! guard makes the two sides agree on who cancels the armed token:
//!
//! - the task records every token it arms under the guard lock, and cancels
//!   the token itself when it finds the guard already stopped
//! - the owner stops the guard and cancels whatever token is recorded
//!
//! Either way no token armed by a stopped task stays registered with the
//! store, and the owner never has to wait for the task.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::coordination::CoordinationClient;
use crate::coordination::WatchFired;
use crate::coordination::WatchToken;

#[derive(Debug, Clone, Default)]
pub(crate) struct WatchGuard {
    cancel: CancellationToken,
    armed: Arc<Mutex<Option<WatchToken>>>,
}

impl WatchGuard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Records a freshly armed token.
    ///
    /// Returns false when the owner stopped the guard meanwhile; the token
    /// has then already been cancelled.
    pub(crate) fn arm(
        &self,
        client: &dyn CoordinationClient,
        token: WatchToken,
    ) -> bool {
        let mut slot = self.armed.lock();
        if self.cancel.is_cancelled() {
            client.cancel_watch(token);
            return false;
        }
        *slot = Some(token);
        true
    }

    /// Cancels `token` without stopping the guard
    pub(crate) fn release(
        &self,
        client: &dyn CoordinationClient,
        token: WatchToken,
    ) {
        let mut slot = self.armed.lock();
        if *slot == Some(token) {
            *slot = None;
        }
        client.cancel_watch(token);
    }

    /// Owner side. Idempotent.
    pub(crate) fn stop(
        &self,
        client: &dyn CoordinationClient,
    ) {
        let mut slot = self.armed.lock();
        self.cancel.cancel();
        if let Some(token) = slot.take() {
            client.cancel_watch(token);
        }
    }

    /// Waits until `token` fires. Firings of older tokens are skipped.
    ///
    /// Returns false when the guard was stopped first.
    pub(crate) async fn wait_for_fire(
        &self,
        fired_rx: &mut mpsc::UnboundedReceiver<WatchFired>,
        token: WatchToken,
    ) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                fired = fired_rx.recv() => match fired {
                    Some(fired) if fired.token == token => {
                        let mut slot = self.armed.lock();
                        if *slot == Some(token) {
                            *slot = None;
                        }
                        return self.is_live();
                    }
                    Some(_) => continue,
                    None => return false,
                },
            }
        }
    }
}
