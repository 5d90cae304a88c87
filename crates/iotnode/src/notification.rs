use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use tokio::sync::mpsc;

use crate::error::Result;
use crate::job::JobKey;

/// Offset of the first tag reserved for periodic jobs.
///
/// The job at position `i` of a registry is notified with tag
/// `BASE_TAG + i`.
pub const BASE_TAG: u16 = 0xC00;

/// Maximum number of jobs a single registry can hold.
pub const MAX_CAPACITY: usize = 0xFF;

// Positions are always lower than `MAX_CAPACITY`, so the sum cannot overflow.
#[inline]
pub(crate) const fn tag_for(position: usize) -> u16 {
    BASE_TAG + position as u16
}

/// A typed message delivered into the scheduler inbox.
///
/// Timers produce notifications carrying the [`JobKey`] of the job which
/// armed them. Other producers sharing the same inbox may only provide a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    tag: u16,
    key: Option<JobKey>,
}

impl Notification {
    /// Creates a [`Notification`] with the given tag and no job identity.
    ///
    /// A tag inside the job range is routed by position only.
    #[must_use]
    pub const fn new(tag: u16) -> Self {
        Self { tag, key: None }
    }

    pub(crate) const fn with_key(tag: u16, key: JobKey) -> Self {
        Self {
            tag,
            key: Some(key),
        }
    }

    /// Returns the notification tag.
    #[must_use]
    pub const fn tag(&self) -> u16 {
        self.tag
    }

    /// Returns the identity of the job which produced the notification,
    /// if any.
    #[must_use]
    pub const fn key(&self) -> Option<JobKey> {
        self.key
    }

    /// Returns the registry position encoded in the tag.
    ///
    /// Tags outside of `[BASE_TAG, BASE_TAG + capacity)` have no position.
    #[must_use]
    pub const fn position(&self, capacity: usize) -> Option<usize> {
        if self.tag < BASE_TAG {
            return None;
        }

        let offset = (self.tag - BASE_TAG) as usize;
        if offset < capacity {
            Some(offset)
        } else {
            None
        }
    }
}

/// The notification a job hands to its timer.
///
/// The tag is shared between the registry and the timer: when the registry
/// renumbers its jobs, a timer which is already armed delivers the updated
/// tag once it expires.
#[derive(Debug, Clone)]
pub struct NotificationSlot {
    tag: Arc<AtomicU16>,
    key: JobKey,
}

impl NotificationSlot {
    pub(crate) fn new(key: JobKey, position: usize) -> Self {
        Self {
            tag: Arc::new(AtomicU16::new(tag_for(position))),
            key,
        }
    }

    /// Returns the current tag.
    #[must_use]
    pub fn tag(&self) -> u16 {
        self.tag.load(Ordering::Acquire)
    }

    /// Returns the identity of the owning job.
    #[must_use]
    pub const fn key(&self) -> JobKey {
        self.key
    }

    /// Builds the [`Notification`] to be delivered right now.
    #[must_use]
    pub fn notification(&self) -> Notification {
        Notification::with_key(self.tag(), self.key)
    }

    pub(crate) fn stamp(&self, position: usize) {
        self.tag.store(tag_for(position), Ordering::Release);
    }
}

/// The sending side of a scheduler inbox.
///
/// It can be cloned and handed to any number of notification producers.
#[derive(Debug, Clone)]
pub struct Mailbox(mpsc::Sender<Notification>);

impl Mailbox {
    /// Creates a bounded inbox able to queue `queue_size` notifications,
    /// together with its [`Mailbox`].
    ///
    /// # Panics
    ///
    /// Panics if `queue_size` is zero.
    #[must_use]
    pub fn channel(queue_size: usize) -> (Self, Inbox) {
        let (sender, receiver) = mpsc::channel(queue_size);
        (Self(sender), Inbox(receiver))
    }

    /// Delivers a [`Notification`], waiting for a free inbox slot.
    ///
    /// # Errors
    ///
    /// Fails when the inbox has been dropped.
    pub async fn deliver(&self, notification: Notification) -> Result<()> {
        self.0.send(notification).await?;
        Ok(())
    }

    /// Checks whether the inbox has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// The receiving side of a scheduler inbox.
///
/// Notifications are received in delivery order.
#[derive(Debug)]
pub struct Inbox(mpsc::Receiver<Notification>);

impl Inbox {
    /// Waits for the next [`Notification`].
    ///
    /// Returns `None` once every [`Mailbox`] has been dropped and the queue
    /// is empty.
    pub async fn receive(&mut self) -> Option<Notification> {
        self.0.recv().await
    }

    /// Returns a queued [`Notification`] without waiting.
    pub fn try_receive(&mut self) -> Option<Notification> {
        self.0.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use crate::job::JobKey;

    use super::{BASE_TAG, Mailbox, Notification, NotificationSlot};

    #[test]
    fn notification_position() {
        assert_eq!(Notification::new(BASE_TAG).position(4), Some(0));
        assert_eq!(Notification::new(BASE_TAG + 3).position(4), Some(3));
        assert_eq!(Notification::new(BASE_TAG + 4).position(4), None);
        assert_eq!(Notification::new(BASE_TAG - 1).position(4), None);
        assert_eq!(Notification::new(0).position(4), None);
    }

    #[test]
    fn slot_renumbering() {
        let slot = NotificationSlot::new(JobKey::new(7), 2);
        let shared = slot.clone();
        assert_eq!(shared.tag(), BASE_TAG + 2);

        slot.stamp(0);

        let notification = shared.notification();
        assert_eq!(notification.tag(), BASE_TAG);
        assert_eq!(notification.key(), Some(JobKey::new(7)));
    }

    #[tokio::test]
    async fn mailbox_fifo() {
        let (mailbox, mut inbox) = Mailbox::channel(4);

        for tag in [BASE_TAG + 2, BASE_TAG, BASE_TAG + 1] {
            mailbox.deliver(Notification::new(tag)).await.unwrap();
        }

        assert_eq!(inbox.receive().await.unwrap().tag(), BASE_TAG + 2);
        assert_eq!(inbox.receive().await.unwrap().tag(), BASE_TAG);
        assert_eq!(inbox.receive().await.unwrap().tag(), BASE_TAG + 1);
        assert!(inbox.try_receive().is_none());

        drop(inbox);
        assert!(mailbox.is_closed());
        assert!(mailbox.deliver(Notification::new(BASE_TAG)).await.is_err());
    }
}
