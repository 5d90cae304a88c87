use tokio::sync::{mpsc, oneshot};

use tokio_util::sync::CancellationToken;

use tracing::{debug, info, warn};

use crate::error::{ErrorKind, Result};
use crate::job::{Job, JobInfo, JobKey};
use crate::notification::{Inbox, Mailbox, Notification};
use crate::registry::Registry;
use crate::timer::{Timer, TokioTimer};

/// Default number of notifications the scheduler inbox can queue.
pub const DEFAULT_QUEUE_SIZE: usize = 4;

// The capacity of the bounded request channel.
const COMMAND_CHANNEL_CAPACITY: usize = 8;

enum Command<T> {
    Register {
        job: Job,
        timer: T,
        reply: oneshot::Sender<Result<JobKey>>,
    },
    Unregister {
        key: JobKey,
        reply: oneshot::Sender<bool>,
    },
    Jobs {
        reply: oneshot::Sender<Vec<JobInfo>>,
    },
}

/// The task owning a [`Registry`].
///
/// The scheduler waits for notifications in its inbox and, for each of them,
/// re-arms the timer of the originating job and runs its callback.
/// Callbacks are executed one at a time, in notification delivery order.
///
/// Before [`Scheduler::run`] is called, jobs can be added directly from the
/// owning context. Once the scheduler runs, other tasks interact with it
/// through a [`SchedulerHandle`].
pub struct Scheduler<T = TokioTimer> {
    registry: Registry<T>,
    mailbox: Mailbox,
    inbox: Inbox,
    commands: mpsc::Receiver<Command<T>>,
    cancellation_token: CancellationToken,
}

impl<T: Timer> Scheduler<T> {
    /// Creates a [`Scheduler`] holding at most `capacity` jobs, together
    /// with its [`SchedulerHandle`].
    ///
    /// The inbox queues up to [`DEFAULT_QUEUE_SIZE`] notifications.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, SchedulerHandle<T>) {
        Self::with_queue_size(capacity, DEFAULT_QUEUE_SIZE)
    }

    /// Creates a [`Scheduler`] with a custom inbox size.
    ///
    /// # Panics
    ///
    /// Panics if `queue_size` is zero.
    #[must_use]
    pub fn with_queue_size(capacity: usize, queue_size: usize) -> (Self, SchedulerHandle<T>) {
        let (mailbox, inbox) = Mailbox::channel(queue_size);
        let (sender, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let cancellation_token = CancellationToken::new();

        let handle = SchedulerHandle {
            commands: sender,
            mailbox: mailbox.clone(),
            cancellation_token: cancellation_token.clone(),
        };

        let scheduler = Self {
            registry: Registry::new(capacity),
            mailbox,
            inbox,
            commands,
            cancellation_token,
        };

        (scheduler, handle)
    }

    /// Returns the underlying [`Registry`].
    #[must_use]
    pub const fn registry(&self) -> &Registry<T> {
        &self.registry
    }

    /// Returns the [`Mailbox`] of the scheduler inbox.
    #[must_use]
    pub const fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Registers a job with a default timer.
    ///
    /// # Errors
    ///
    /// See [`Registry::register`].
    pub async fn register(&mut self, job: Job) -> Result<JobKey>
    where
        T: Default,
    {
        self.register_with(job, T::default()).await
    }

    /// Registers a job driven by the given timer.
    ///
    /// # Errors
    ///
    /// See [`Registry::register`].
    pub async fn register_with(&mut self, job: Job, timer: T) -> Result<JobKey> {
        self.registry.register(job, timer, &self.mailbox).await
    }

    /// Unregisters a job, returning it if it was registered.
    pub fn unregister(&mut self, key: JobKey) -> Option<Job> {
        self.registry.unregister(key)
    }

    /// Runs the scheduler loop until [`SchedulerHandle::shutdown`] is called.
    pub async fn run(mut self) {
        info!(
            "Scheduler started with {} jobs, capacity {}",
            self.registry.len(),
            self.registry.capacity()
        );

        loop {
            tokio::select! {
                biased;
                // Use the cancellation token to stop the loop
                () = self.cancellation_token.cancelled() => { break; }
                Some(notification) = self.inbox.receive() => {
                    self.dispatch(notification).await;
                }
                Some(command) = self.commands.recv() => {
                    self.handle(command).await;
                }
            }
        }

        info!("Scheduler stopped with {} jobs", self.registry.len());
    }

    async fn dispatch(&mut self, notification: Notification) {
        let Err(e) = self.registry.dispatch(notification, &self.mailbox).await else {
            return;
        };

        match e.kind() {
            ErrorKind::UnknownTag => warn!("Notification dropped: {e}"),
            _ => debug!("Notification dropped: {e}"),
        }
    }

    async fn handle(&mut self, command: Command<T>) {
        let delivered = match command {
            Command::Register { job, timer, reply } => {
                let result = self.registry.register(job, timer, &self.mailbox).await;
                reply.send(result).is_ok()
            }
            Command::Unregister { key, reply } => {
                let removed = self.registry.unregister(key).is_some();
                reply.send(removed).is_ok()
            }
            Command::Jobs { reply } => reply.send(self.registry.jobs()).is_ok(),
        };

        if !delivered {
            debug!("Requester gone before receiving its answer");
        }
    }
}

/// A cloneable handle to a running [`Scheduler`].
pub struct SchedulerHandle<T = TokioTimer> {
    commands: mpsc::Sender<Command<T>>,
    mailbox: Mailbox,
    cancellation_token: CancellationToken,
}

impl<T> Clone for SchedulerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            mailbox: self.mailbox.clone(),
            cancellation_token: self.cancellation_token.clone(),
        }
    }
}

impl<T: Timer> SchedulerHandle<T> {
    /// Registers a job with a default timer.
    ///
    /// The job runs once on the scheduler task before this method returns.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::Full`] when the registry is full
    /// - [`ErrorKind::SchedulerStopped`] when the scheduler is not running
    pub async fn register(&self, job: Job) -> Result<JobKey>
    where
        T: Default,
    {
        self.register_with(job, T::default()).await
    }

    /// Registers a job driven by the given timer.
    ///
    /// # Errors
    ///
    /// See [`SchedulerHandle::register`].
    pub async fn register_with(&self, job: Job, timer: T) -> Result<JobKey> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Register { job, timer, reply })
            .await?;
        response.await?
    }

    /// Unregisters a job.
    ///
    /// Returns `false` when the job was not registered.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler is not running.
    pub async fn unregister(&self, key: JobKey) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Unregister { key, reply })
            .await?;
        Ok(response.await?)
    }

    /// Returns a snapshot of the registered jobs.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler is not running.
    pub async fn jobs(&self) -> Result<Vec<JobInfo>> {
        let (reply, response) = oneshot::channel();
        self.commands.send(Command::Jobs { reply }).await?;
        Ok(response.await?)
    }
}

impl<T> SchedulerHandle<T> {
    /// Returns the [`Mailbox`] of the scheduler inbox.
    ///
    /// Other notification producers can share it.
    #[must_use]
    pub const fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Stops the scheduler loop.
    ///
    /// Registered jobs are dropped along with the scheduler, which disarms
    /// their timers.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }

    /// Checks whether the scheduler has been asked to stop.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
