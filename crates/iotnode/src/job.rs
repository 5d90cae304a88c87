use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};

/// The future returned by a [`JobCallback`].
pub type JobFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// The unit of work executed each time a job period elapses.
///
/// A callback is only ever invoked from the scheduler task, and it is never
/// invoked concurrently with any other callback of the same registry.
/// Failures must be handled inside the callback: the next period is the
/// retry mechanism.
pub trait JobCallback: Send {
    /// Runs the job once.
    fn call(&mut self) -> JobFuture<'_>;
}

/// A [`JobCallback`] built from a closure.
///
/// See [`job_fn`].
pub struct FnJob<F>(F);

impl<F, Fut> JobCallback for FnJob<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&mut self) -> JobFuture<'_> {
        Box::pin((self.0)())
    }
}

/// Wraps a closure returning a future into a [`JobCallback`].
#[must_use]
pub const fn job_fn<F, Fut>(function: F) -> FnJob<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnJob(function)
}

/// The stable identity of a registered job.
///
/// Keys are never reused by the registry which assigned them, so a key
/// always refers to the same job, even after other jobs have been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey(u64);

impl JobKey {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the numeric identifier.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// A periodic job.
///
/// A job is a named [`JobCallback`] executed every `period`.
pub struct Job {
    name: Cow<'static, str>,
    period: Duration,
    callback: Box<dyn JobCallback>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Creates a [`Job`].
    ///
    /// # Errors
    ///
    /// The period must be greater than zero.
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        period: Duration,
        callback: impl JobCallback + 'static,
    ) -> Result<Self> {
        let name = name.into();
        if period.is_zero() {
            return Err(Error::new(
                ErrorKind::InvalidJob,
                format!("The period of job `{name}` must be greater than zero"),
            ));
        }

        Ok(Self {
            name,
            period,
            callback: Box::new(callback),
        })
    }

    /// Returns the job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the job period.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    pub(crate) async fn run(&mut self) {
        self.callback.call().await;
    }
}

/// A snapshot of a registered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    /// Job identity.
    pub key: JobKey,
    /// Job name.
    pub name: String,
    /// Current notification tag.
    pub tag: u16,
    /// Job period.
    pub period: Duration,
}
