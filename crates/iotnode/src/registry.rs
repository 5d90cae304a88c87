use indexmap::IndexMap;

use tracing::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::job::{Job, JobInfo, JobKey};
use crate::notification::{MAX_CAPACITY, Mailbox, Notification, NotificationSlot};
use crate::timer::{Timer, TokioTimer};

struct Entry<T> {
    job: Job,
    timer: T,
    slot: NotificationSlot,
}

/// An ordered registry of periodic jobs.
///
/// The position of a job inside the registry defines its notification tag:
/// the job at position `i` is tagged with
/// [`BASE_TAG`](crate::notification::BASE_TAG) `+ i`. Removing a job shifts
/// every later job one position back and their tags are renumbered
/// immediately, so the invariant holds after every operation.
///
/// Each job also has a [`JobKey`] which never changes. Notifications produced
/// by timers carry it, which allows the registry to discard a notification
/// belonging to a job that has been removed in the meantime.
///
/// A registry is not synchronized. It must be owned by the task which runs
/// the callbacks, see [`crate::scheduler::Scheduler`].
pub struct Registry<T = TokioTimer> {
    entries: IndexMap<JobKey, Entry<T>>,
    capacity: usize,
    next_key: u64,
}

impl<T: Timer> Registry<T> {
    /// Creates an empty [`Registry`] holding at most `capacity` jobs.
    ///
    /// The capacity is clamped to [`MAX_CAPACITY`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_CAPACITY);
        Self {
            entries: IndexMap::with_capacity(capacity),
            capacity,
            next_key: 0,
        }
    }

    /// Returns the maximum number of jobs.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of registered jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks whether the job identified by `key` is registered.
    #[must_use]
    pub fn contains(&self, key: JobKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Returns the current position of a job.
    #[must_use]
    pub fn position(&self, key: JobKey) -> Option<usize> {
        self.entries.get_index_of(&key)
    }

    /// Returns the current notification tag of a job.
    #[must_use]
    pub fn tag(&self, key: JobKey) -> Option<u16> {
        self.entries.get(&key).map(|entry| entry.slot.tag())
    }

    /// Returns a snapshot of all jobs, in registration order.
    #[must_use]
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.entries
            .iter()
            .map(|(key, entry)| JobInfo {
                key: *key,
                name: entry.job.name().into(),
                tag: entry.slot.tag(),
                period: entry.job.period(),
            })
            .collect()
    }

    /// Appends a job to the registry.
    ///
    /// The job is tagged after its position, its timer is armed towards
    /// `mailbox`, and its callback runs once before this method returns.
    ///
    /// # Errors
    ///
    /// When the registry is full, an [`ErrorKind::Full`] error is returned
    /// and the registry is left untouched.
    pub async fn register(&mut self, job: Job, timer: T, mailbox: &Mailbox) -> Result<JobKey> {
        let position = self.entries.len();
        if position >= self.capacity {
            debug!("Registry full, job `{}` not registered", job.name());
            return Err(Error::new(
                ErrorKind::Full,
                format!(
                    "Impossible to register `{}`: {} jobs already registered",
                    job.name(),
                    self.capacity
                ),
            ));
        }

        let key = JobKey::new(self.next_key);
        self.next_key += 1;

        let slot = NotificationSlot::new(key, position);
        debug!(
            "Registering job `{}` as {key} with tag {:#x}",
            job.name(),
            slot.tag()
        );

        let _ = self.entries.insert(key, Entry { job, timer, slot });

        self.resched(position, mailbox).await?;

        Ok(key)
    }

    /// Removes a job from the registry and returns it.
    ///
    /// The job timer is disarmed and the tags of all remaining jobs are
    /// renumbered after their new positions.
    /// Removing a job which is not registered does nothing.
    pub fn unregister(&mut self, key: JobKey) -> Option<Job> {
        let Some(mut entry) = self.entries.shift_remove(&key) else {
            debug!("{key} is not registered, nothing to remove");
            return None;
        };

        entry.timer.disarm();
        self.renumber();

        debug!("Unregistered job `{}` ({key})", entry.job.name());

        Some(entry.job)
    }

    /// Re-arms the timer of the job at `position` and runs its callback.
    ///
    /// The timer delivers its next notification to `mailbox` after the job
    /// period.
    ///
    /// # Errors
    ///
    /// An [`ErrorKind::NotFound`] error is returned when no job is
    /// registered at `position`.
    pub async fn resched(&mut self, position: usize, mailbox: &Mailbox) -> Result<()> {
        let Some((key, entry)) = self.entries.get_index_mut(position) else {
            debug!("No job registered at position {position}");
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("No job registered at position {position}"),
            ));
        };

        debug!(
            "Re-scheduling {key} `{}` in {:?}",
            entry.job.name(),
            entry.job.period()
        );

        entry.timer.arm(entry.job.period(), mailbox, &entry.slot);
        entry.job.run().await;

        Ok(())
    }

    /// Routes a [`Notification`] to its job and re-schedules it.
    ///
    /// A notification carrying a [`JobKey`] is routed to that job, wherever
    /// it currently is. A notification without a key is routed to the
    /// position encoded in its tag.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::UnknownTag`] if the tag is outside of the job range
    /// - [`ErrorKind::NotFound`] if the job has been removed, or no job is
    ///   registered at the tag position
    pub async fn dispatch(&mut self, notification: Notification, mailbox: &Mailbox) -> Result<()> {
        let tag = notification.tag();
        let Some(tag_position) = notification.position(self.capacity) else {
            return Err(Error::new(
                ErrorKind::UnknownTag,
                format!("Tag {tag:#x} is outside of the job range"),
            ));
        };

        let position = match notification.key() {
            Some(key) => self.position(key).ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("Stale tag {tag:#x}: {key} has been removed"),
                )
            })?,
            None => tag_position,
        };

        if position != tag_position {
            debug!("Tag {tag:#x} was renumbered, job now at position {position}");
        }

        self.resched(position, mailbox).await
    }

    fn renumber(&self) {
        for (position, entry) in self.entries.values().enumerate() {
            entry.slot.stamp(position);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::error::ErrorKind;
    use crate::job::{Job, job_fn};
    use crate::notification::{BASE_TAG, MAX_CAPACITY, Mailbox, Notification};
    use crate::timer::tests::RecordingTimer;

    use super::Registry;

    fn counting_job(name: &'static str, millis: u64, counter: &Arc<AtomicUsize>) -> Job {
        let counter = Arc::clone(counter);
        Job::new(
            name,
            Duration::from_millis(millis),
            job_fn(move || {
                let counter = Arc::clone(&counter);
                async move {
                    let _ = counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap()
    }

    fn logging_job(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Job {
        let log = Arc::clone(log);
        Job::new(
            name,
            Duration::from_secs(1),
            job_fn(move || {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(name);
                }
            }),
        )
        .unwrap()
    }

    fn assert_tags(registry: &Registry<RecordingTimer>) {
        for (position, info) in registry.jobs().iter().enumerate() {
            assert_eq!(info.tag, BASE_TAG + position as u16);
            assert_eq!(registry.tag(info.key), Some(info.tag));
            assert_eq!(registry.position(info.key), Some(position));
        }
    }

    #[test]
    fn clamp_capacity() {
        let registry = Registry::<RecordingTimer>::new(1000);
        assert_eq!(registry.capacity(), MAX_CAPACITY);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn register_runs_once_and_arms() {
        let (mailbox, _inbox) = Mailbox::channel(4);
        let mut registry = Registry::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let timer = RecordingTimer::default();

        let key = registry
            .register(counting_job("a", 1000, &counter), timer.clone(), &mailbox)
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(timer.arms(), vec![Duration::from_millis(1000)]);
        assert_eq!(registry.tag(key), Some(BASE_TAG));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn full_registry_is_untouched() {
        let (mailbox, _inbox) = Mailbox::channel(4);
        let mut registry = Registry::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for name in ["a", "b"] {
            let _ = registry
                .register(
                    counting_job(name, 1000, &counter),
                    RecordingTimer::default(),
                    &mailbox,
                )
                .await
                .unwrap();
        }

        let before = registry.jobs();
        let rejected_counter = Arc::new(AtomicUsize::new(0));
        let rejected_timer = RecordingTimer::default();

        let error = registry
            .register(
                counting_job("c", 1000, &rejected_counter),
                rejected_timer.clone(),
                &mailbox,
            )
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Full);
        assert_eq!(registry.jobs(), before);
        assert_eq!(rejected_counter.load(Ordering::SeqCst), 0);
        assert!(rejected_timer.arms().is_empty());
    }

    #[tokio::test]
    async fn tags_follow_positions() {
        let (mailbox, _inbox) = Mailbox::channel(4);
        let mut registry = Registry::new(8);
        let counter = Arc::new(AtomicUsize::new(0));

        let mut keys = Vec::new();
        for name in ["a", "b", "c", "d", "e"] {
            keys.push(
                registry
                    .register(
                        counting_job(name, 100, &counter),
                        RecordingTimer::default(),
                        &mailbox,
                    )
                    .await
                    .unwrap(),
            );
            assert_tags(&registry);
        }

        // Remove from the middle, the head and the tail.
        for key in [keys[2], keys[0], keys[4]] {
            assert!(registry.unregister(key).is_some());
            assert_tags(&registry);
        }

        let names: Vec<String> = registry.jobs().into_iter().map(|info| info.name).collect();
        assert_eq!(names, ["b", "d"]);

        // Appending after removals uses the first free position.
        let key = registry
            .register(
                counting_job("f", 100, &counter),
                RecordingTimer::default(),
                &mailbox,
            )
            .await
            .unwrap();
        assert_eq!(registry.tag(key), Some(BASE_TAG + 2));
        assert!(!keys.contains(&key));
        assert_tags(&registry);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let (mailbox, _inbox) = Mailbox::channel(4);
        let mut registry = Registry::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let timer = RecordingTimer::default();

        let a = registry
            .register(counting_job("a", 1000, &counter), timer.clone(), &mailbox)
            .await
            .unwrap();
        let b = registry
            .register(
                counting_job("b", 2000, &counter),
                RecordingTimer::default(),
                &mailbox,
            )
            .await
            .unwrap();

        let job = registry.unregister(a).unwrap();
        assert_eq!(job.name(), "a");
        assert_eq!(timer.disarms(), 1);

        assert!(registry.unregister(a).is_none());
        assert_eq!(timer.disarms(), 1);

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(b));
        assert!(!registry.contains(a));
    }

    #[tokio::test]
    async fn resched_missing_position() {
        let (mailbox, _inbox) = Mailbox::channel(4);
        let mut registry = Registry::<RecordingTimer>::new(4);

        let error = registry.resched(0, &mailbox).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn resched_invokes_job_at_position() {
        let (mailbox, _inbox) = Mailbox::channel(4);
        let mut registry = Registry::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        let timer = RecordingTimer::default();

        let _ = registry
            .register(logging_job("a", &log), RecordingTimer::default(), &mailbox)
            .await
            .unwrap();
        let _ = registry
            .register(logging_job("b", &log), timer.clone(), &mailbox)
            .await
            .unwrap();

        registry.resched(1, &mailbox).await.unwrap();

        assert_eq!(*log.lock().unwrap(), ["a", "b", "b"]);
        assert_eq!(timer.arms().len(), 2);
    }

    #[tokio::test]
    async fn stale_tags_are_dropped() {
        let (mailbox, _inbox) = Mailbox::channel(4);
        let mut registry = Registry::new(4);
        let a_counter = Arc::new(AtomicUsize::new(0));
        let b_counter = Arc::new(AtomicUsize::new(0));

        let a = registry
            .register(
                counting_job("a", 1000, &a_counter),
                RecordingTimer::default(),
                &mailbox,
            )
            .await
            .unwrap();
        let b = registry
            .register(
                counting_job("b", 2000, &b_counter),
                RecordingTimer::default(),
                &mailbox,
            )
            .await
            .unwrap();

        assert_eq!(registry.tag(a), Some(BASE_TAG));
        assert_eq!(registry.tag(b), Some(BASE_TAG + 1));
        assert_eq!(a_counter.load(Ordering::SeqCst), 1);
        assert_eq!(b_counter.load(Ordering::SeqCst), 1);

        let _ = registry.unregister(a).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tag(b), Some(BASE_TAG));

        // A positional tag beyond the registry length.
        let error = registry
            .dispatch(Notification::new(BASE_TAG + 1), &mailbox)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);

        // A timer of the removed job, fired right before the removal.
        let error = registry
            .dispatch(Notification::with_key(BASE_TAG, a), &mailbox)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);

        assert_eq!(a_counter.load(Ordering::SeqCst), 1);
        assert_eq!(b_counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn renumbered_notification_reaches_its_job() {
        let (mailbox, _inbox) = Mailbox::channel(4);
        let mut registry = Registry::new(4);
        let a_counter = Arc::new(AtomicUsize::new(0));
        let b_counter = Arc::new(AtomicUsize::new(0));

        let a = registry
            .register(
                counting_job("a", 1000, &a_counter),
                RecordingTimer::default(),
                &mailbox,
            )
            .await
            .unwrap();
        let b = registry
            .register(
                counting_job("b", 2000, &b_counter),
                RecordingTimer::default(),
                &mailbox,
            )
            .await
            .unwrap();

        // `b` expired and was queued with its old tag before `a` was removed.
        let queued = Notification::with_key(BASE_TAG + 1, b);
        let _ = registry.unregister(a);

        registry.dispatch(queued, &mailbox).await.unwrap();

        assert_eq!(a_counter.load(Ordering::SeqCst), 1);
        assert_eq!(b_counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn foreign_tags() {
        let (mailbox, _inbox) = Mailbox::channel(4);
        let mut registry = Registry::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let _ = registry
            .register(
                counting_job("a", 1000, &counter),
                RecordingTimer::default(),
                &mailbox,
            )
            .await
            .unwrap();

        // Outside of the job range.
        for tag in [0x0001, BASE_TAG - 1, BASE_TAG + 4] {
            let error = registry
                .dispatch(Notification::new(tag), &mailbox)
                .await
                .unwrap_err();
            assert_eq!(error.kind(), ErrorKind::UnknownTag);
        }

        // Inside the job range, routed by position.
        registry
            .dispatch(Notification::new(BASE_TAG), &mailbox)
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
