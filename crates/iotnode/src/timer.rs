use std::time::Duration;

use tokio::task::JoinHandle;

use tracing::{debug, warn};

use crate::notification::{Mailbox, NotificationSlot};

/// A one-shot timer.
///
/// Once armed, the timer delivers the notification held by its slot into the
/// given [`Mailbox`] after `period`. The notification is read from the slot
/// when the timer expires, not when it is armed.
pub trait Timer: Send + 'static {
    /// Arms the timer, replacing any previously armed expiry.
    fn arm(&mut self, period: Duration, mailbox: &Mailbox, slot: &NotificationSlot);

    /// Cancels a pending expiry, if any.
    fn disarm(&mut self);
}

/// A [`Timer`] driven by the `tokio` time wheel.
///
/// Each expiry is a small task sleeping for the requested period. The task is
/// aborted whenever the timer is re-armed, disarmed, or dropped, so a timer
/// never delivers a notification after its job has been removed.
#[derive(Debug, Default)]
pub struct TokioTimer {
    pending: Option<JoinHandle<()>>,
}

impl TokioTimer {
    /// Creates an unarmed [`TokioTimer`].
    #[must_use]
    pub const fn new() -> Self {
        Self { pending: None }
    }

    /// Checks whether an expiry is still pending.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| !pending.is_finished())
    }
}

impl Timer for TokioTimer {
    fn arm(&mut self, period: Duration, mailbox: &Mailbox, slot: &NotificationSlot) {
        self.disarm();

        let mailbox = mailbox.clone();
        let slot = slot.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(period).await;

            let notification = slot.notification();
            debug!(
                "Timer of {} expired, delivering tag {:#x}",
                slot.key(),
                notification.tag()
            );

            if let Err(e) = mailbox.deliver(notification).await {
                warn!("Timer of {} expired without a receiver: {e}", slot.key());
            }
        }));
    }

    fn disarm(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
