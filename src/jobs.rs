//! Download job registry.
//!
//! At most one conversion runs per video id. Callers that ask for an id whose
//! job is still pending or running (or finished within the grace window)
//! attach to it and receive the very same outcome.

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::error::JobFailure;

/// A finished MP3 on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

pub type JobOutcome = Result<ConvertedFile, JobFailure>;

type SharedOutcome = Shared<BoxFuture<'static, JobOutcome>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded(ConvertedFile),
    Failed(JobFailure),
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }
}

#[derive(Debug)]
struct JobStatus {
    state: Mutex<JobState>,
    waiters: AtomicUsize,
}

#[derive(Clone)]
struct JobEntry {
    generation: u64,
    status: Arc<JobStatus>,
    outcome: SharedOutcome,
}

type JobMap = Arc<Mutex<HashMap<String, JobEntry>>>;

pub struct JobRegistry {
    jobs: JobMap,
    grace: Duration,
    next_generation: AtomicU64,
}

impl JobRegistry {
    /// `grace` is how long a finished job stays attachable before removal.
    pub fn new(grace: Duration) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            grace,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Attaches to the job registered for `id`, or registers a new one and
    /// runs `start` for it on a background task.
    ///
    /// `start` is only invoked when a new job is created. The job runs to
    /// completion even if every handle is dropped.
    pub fn get_or_start<F, Fut>(&self, id: &str, start: F) -> ConversionHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = JobOutcome> + Send + 'static,
    {
        // The decision and the insert happen under one lock so two callers
        // can never both create a job for the same id.
        let mut jobs = self.jobs.lock();

        if let Some(entry) = jobs.get(id) {
            debug!("🔗 Attaching to existing job for {}", id);
            return ConversionHandle::new(id, entry, false);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let status = Arc::new(JobStatus {
            state: Mutex::new(JobState::Pending),
            waiters: AtomicUsize::new(0),
        });

        let task = tokio::spawn(run_job(
            id.to_string(),
            generation,
            Arc::clone(&status),
            Arc::clone(&self.jobs),
            self.grace,
            start,
        ));

        let outcome = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(JobFailure::Conversion(format!(
                    "conversion task aborted: {e}"
                ))),
            }
        }
        .boxed()
        .shared();

        let entry = JobEntry {
            generation,
            status,
            outcome,
        };
        info!("🚀 Started conversion job for {}", id);
        let handle = ConversionHandle::new(id, &entry, true);
        jobs.insert(id.to_string(), entry);
        handle
    }

    /// Current state of the job registered for `id`, if any.
    #[allow(dead_code)]
    pub fn state(&self, id: &str) -> Option<JobState> {
        self.jobs
            .lock()
            .get(id)
            .map(|entry| entry.status.state.lock().clone())
    }

    /// Number of live handles attached to the job for `id`.
    #[allow(dead_code)]
    pub fn waiters(&self, id: &str) -> Option<usize> {
        self.jobs
            .lock()
            .get(id)
            .map(|entry| entry.status.waiters.load(Ordering::Relaxed))
    }

    /// Jobs that have not reached a terminal state.
    pub fn active_jobs(&self) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|entry| !entry.status.state.lock().is_finished())
            .count()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }
}

async fn run_job<F, Fut>(
    id: String,
    generation: u64,
    status: Arc<JobStatus>,
    jobs: JobMap,
    grace: Duration,
    start: F,
) -> JobOutcome
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    *status.state.lock() = JobState::Running;

    let outcome = match AssertUnwindSafe(async move { start().await })
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(JobFailure::Conversion("conversion panicked".into())),
    };

    *status.state.lock() = match &outcome {
        Ok(file) => {
            info!("✅ Job for {} finished: {} ({} bytes)", id, file.path.display(), file.size_bytes);
            JobState::Succeeded(file.clone())
        }
        Err(failure) => {
            warn!("❌ Job for {} failed: {}", id, failure);
            JobState::Failed(failure.clone())
        }
    };

    if grace.is_zero() {
        remove_job(&jobs, &id, generation);
    } else {
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            remove_job(&jobs, &id, generation);
        });
    }

    outcome
}

/// Removes the entry for `id` only if it still belongs to `generation`.
fn remove_job(jobs: &Mutex<HashMap<String, JobEntry>>, id: &str, generation: u64) {
    let mut jobs = jobs.lock();
    if jobs
        .get(id)
        .is_some_and(|entry| entry.generation == generation)
    {
        jobs.remove(id);
        debug!("🧹 Job for {} removed from registry", id);
    }
}

/// A caller's view of a conversion job.
///
/// Dropping the handle detaches this caller only; the job keeps running.
pub struct ConversionHandle {
    id: String,
    created: bool,
    status: Arc<JobStatus>,
    outcome: SharedOutcome,
}

impl ConversionHandle {
    fn new(id: &str, entry: &JobEntry, created: bool) -> Self {
        entry.status.waiters.fetch_add(1, Ordering::Relaxed);
        Self {
            id: id.to_string(),
            created,
            status: Arc::clone(&entry.status),
            outcome: entry.outcome.clone(),
        }
    }

    /// Whether this handle's request created the job (as opposed to attaching).
    pub fn started_job(&self) -> bool {
        self.created
    }

    pub fn state(&self) -> JobState {
        self.status.state.lock().clone()
    }

    /// Waits for the job to finish.
    pub async fn wait(self) -> JobOutcome {
        self.outcome.clone().await
    }
}

impl Drop for ConversionHandle {
    fn drop(&mut self) {
        self.status.waiters.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ConversionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionHandle")
            .field("id", &self.id)
            .field("created", &self.created)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    fn file(name: &str, size: u64) -> ConvertedFile {
        ConvertedFile {
            path: PathBuf::from(name),
            size_bytes: size,
        }
    }

    async fn explode() -> JobOutcome {
        panic!("collaborator exploded")
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_conversion() {
        let registry = JobRegistry::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let slow_convert = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(file("abc123.mp3", 4_000_000))
            }
        };

        let first = registry.get_or_start("abc123", slow_convert(Arc::clone(&calls)));
        let second = registry.get_or_start("abc123", slow_convert(Arc::clone(&calls)));

        assert!(first.started_job());
        assert!(!second.started_job());
        assert_eq!(registry.waiters("abc123"), Some(2));

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, Ok(file("abc123.mp3", 4_000_000)));
        assert_eq!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_reach_every_waiter() {
        let registry = JobRegistry::new(Duration::from_secs(5));
        let (tx, rx) = oneshot::channel::<()>();

        let first = registry.get_or_start("bad", move || async move {
            let _ = rx.await;
            Err(JobFailure::NotFound("bad".into()))
        });
        let second = registry.get_or_start("bad", || async { Ok(file("restarted.mp3", 0)) });
        let third = registry.get_or_start("bad", || async { Ok(file("restarted.mp3", 0)) });

        tx.send(()).unwrap();
        let outcomes = futures::future::join_all([first.wait(), second.wait(), third.wait()]).await;
        for outcome in outcomes {
            assert_eq!(outcome, Err(JobFailure::NotFound("bad".into())));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn state_moves_from_pending_through_running() {
        let registry = JobRegistry::new(Duration::from_secs(5));
        let (tx, rx) = oneshot::channel::<()>();

        let handle = registry.get_or_start("id", move || async move {
            let _ = rx.await;
            Ok(file("id.mp3", 10))
        });
        assert_eq!(handle.state(), JobState::Pending);

        tokio::task::yield_now().await;
        assert_eq!(registry.state("id"), Some(JobState::Running));
        assert_eq!(registry.active_jobs(), 1);

        tx.send(()).unwrap();
        assert_eq!(handle.wait().await, Ok(file("id.mp3", 10)));
        assert_eq!(registry.state("id"), Some(JobState::Succeeded(file("id.mp3", 10))));
        assert_eq!(registry.active_jobs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_job_is_attachable_until_grace_expires() {
        let registry = JobRegistry::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = |calls: Arc<AtomicUsize>| {
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) as u64;
                Ok(file("x.mp3", n))
            }
        };

        let outcome = registry
            .get_or_start("x", counted(Arc::clone(&calls)))
            .wait()
            .await;
        assert_eq!(outcome, Ok(file("x.mp3", 0)));

        tokio::time::advance(Duration::from_secs(2)).await;
        let late = registry.get_or_start("x", counted(Arc::clone(&calls)));
        assert!(!late.started_job());
        assert_eq!(late.wait().await, Ok(file("x.mp3", 0)));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(registry.len(), 0);

        let fresh = registry.get_or_start("x", counted(Arc::clone(&calls)));
        assert!(fresh.started_job());
        assert_eq!(fresh.wait().await, Ok(file("x.mp3", 1)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_grace_removes_immediately() {
        let registry = JobRegistry::new(Duration::ZERO);
        let outcome = registry
            .get_or_start("z", || async { Ok(file("z.mp3", 1)) })
            .wait()
            .await;
        assert!(outcome.is_ok());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_waiter_does_not_cancel_the_job() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&finished);

        let handle = registry.get_or_start("keep", move || async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(file("keep.mp3", 7))
        });
        drop(handle);
        assert_eq!(registry.waiters("keep"), Some(0));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(
            registry.state("keep"),
            Some(JobState::Succeeded(file("keep.mp3", 7)))
        );

        let later = registry.get_or_start("keep", || async { Ok(file("restarted.mp3", 0)) });
        assert_eq!(later.wait().await, Ok(file("keep.mp3", 7)));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_conversion_becomes_a_failure() {
        let registry = JobRegistry::new(Duration::ZERO);
        let outcome = registry
            .get_or_start("boom", explode)
            .wait()
            .await;
        assert_eq!(outcome, Err(JobFailure::Conversion("conversion panicked".into())));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_ids_run_independently() {
        let registry = JobRegistry::new(Duration::from_secs(5));
        let a = registry.get_or_start("a", || async { Ok(file("a.mp3", 1)) });
        let b = registry.get_or_start("b", || async { Ok(file("b.mp3", 2)) });
        assert!(a.started_job() && b.started_job());
        assert_eq!(a.wait().await, Ok(file("a.mp3", 1)));
        assert_eq!(b.wait().await, Ok(file("b.mp3", 2)));
    }
}
