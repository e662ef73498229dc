use std::{
    collections::HashSet,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::{stream, FutureExt, StreamExt};
use recurmail_core::{
    config::SchedulerConfig,
    types::{Job, JobId, SendOutcome, UserId},
};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    dispatch::Dispatcher,
    error::{Result, SchedulerError},
    lifecycle,
    store::JobStore,
};

/// Loop timing and parallelism.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick: Duration,
    /// Due jobs dispatched at once within a tick. 1 = strictly sequential.
    pub max_concurrent_sends: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            max_concurrent_sends: 1,
        }
    }
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            tick: Duration::from_secs(cfg.tick_secs.max(1)),
            max_concurrent_sends: cfg.max_concurrent_sends.max(1),
        }
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Due jobs returned by the store.
    pub selected: usize,
    pub sent: usize,
    pub failed: usize,
    /// Due jobs left alone because another caller was already sending them.
    pub busy: usize,
    /// The whole tick was skipped because a previous one was still running.
    pub skipped: bool,
}

struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    options: SchedulerOptions,
    tick_in_progress: AtomicBool,
    /// Jobs with a send currently in flight, from a tick or a manual send.
    in_flight: Mutex<HashSet<JobId>>,
    running: Mutex<Option<RunningLoop>>,
}

/// Core scheduler: wakes on a fixed tick, selects due jobs and drives each
/// through dispatch and the state machine.
///
/// Cheap to clone; all clones share one loop and one lifecycle flag.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, dispatcher: Arc<Dispatcher>, options: SchedulerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                dispatcher,
                options,
                tick_in_progress: AtomicBool::new(false),
                in_flight: Mutex::new(HashSet::new()),
                running: Mutex::new(None),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    /// Arm the background loop. Returns `false` if it was already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = lock_ignoring_poison(&self.inner.running);
        if running.is_some() {
            debug!("scheduler already running; start ignored");
            return false;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run_loop(shutdown_rx).await });
        *running = Some(RunningLoop {
            shutdown_tx,
            handle,
        });
        info!(tick_secs = self.inner.options.tick.as_secs(), "scheduler started");
        true
    }

    /// Disarm the loop and wait for an in-flight tick to finish.
    /// Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let running = lock_ignoring_poison(&self.inner.running).take();
        let Some(running) = running else {
            debug!("scheduler not running; stop ignored");
            return false;
        };
        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await {
            error!(error = %e, "scheduler loop ended abnormally");
        }
        info!("scheduler stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        lock_ignoring_poison(&self.inner.running).is_some()
    }

    /// Run one pass over the jobs due at `now`.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickReport {
        self.inner.run_tick(now).await
    }

    /// Dispatch one job immediately, regardless of its due time, and record
    /// the outcome exactly as a tick would.
    pub async fn send_now(&self, owner: &UserId, id: &JobId) -> Result<SendOutcome> {
        let inner = &self.inner;
        let job = inner
            .store
            .get_job(id, owner)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        let user = inner
            .store
            .get_user(owner)
            .await?
            .ok_or_else(|| SchedulerError::UserNotFound {
                id: owner.to_string(),
            })?;

        let Some(_claim) = inner.claim(&job.id) else {
            return Err(SchedulerError::JobBusy { id: id.to_string() });
        };
        info!(job_id = %job.id, "manual send requested");
        let outcome = inner.dispatcher.execute(&job, &user).await;
        inner.reconcile(&job, &outcome).await?;
        Ok(outcome)
    }
}

impl Inner {
    /// Main event loop. Ticks until `shutdown` broadcasts `true`.
    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.options.tick);
        // A tick that overruns its period delays the next one; it never stacks.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.run_tick(Utc::now()).await;
                    if report.selected > 0 {
                        info!(
                            selected = report.selected,
                            sent = report.sent,
                            failed = report.failed,
                            busy = report.busy,
                            "tick complete"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_tick(&self, now: DateTime<Utc>) -> TickReport {
        if self
            .tick_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("previous tick still running; skipping this one");
            return TickReport {
                skipped: true,
                ..Default::default()
            };
        }
        let _tick = FlagGuard(&self.tick_in_progress);

        // A failed selection aborts only this tick; the next one retries.
        let due = match self.store.find_due_jobs(now).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "due-job query failed; tick aborted");
                return TickReport::default();
            }
        };
        if due.is_empty() {
            debug!("no due jobs");
            return TickReport::default();
        }
        info!(count = due.len(), "dispatching due jobs");

        let selected = due.len();
        let sent = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let busy = AtomicUsize::new(0);
        let (sent_ref, failed_ref, busy_ref) = (&sent, &failed, &busy);

        stream::iter(due)
            .for_each_concurrent(self.options.max_concurrent_sends, |job| async move {
                let job_id = job.id.clone();
                let Some(_claim) = self.claim(&job_id) else {
                    debug!(job_id = %job_id, "job already in flight; left for a later tick");
                    busy_ref.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                // Each job is isolated: an error or panic here must not
                // stop its siblings.
                match AssertUnwindSafe(self.process_job(job)).catch_unwind().await {
                    Ok(Ok(true)) => {
                        sent_ref.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Ok(false)) => {
                        failed_ref.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        error!(job_id = %job_id, error = %e, "job processing failed");
                        failed_ref.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        error!(job_id = %job_id, "job processing panicked");
                        failed_ref.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;

        TickReport {
            selected,
            sent: sent.into_inner(),
            failed: failed.into_inner(),
            busy: busy.into_inner(),
            skipped: false,
        }
    }

    /// Send one due job and fold the outcome back into the store.
    /// Returns whether the message was delivered.
    async fn process_job(&self, job: Job) -> Result<bool> {
        let Some(user) = self.store.get_user(&job.user_id).await? else {
            warn!(job_id = %job.id, user_id = %job.user_id, "job owner not found; skipping");
            return Ok(false);
        };
        let outcome = self.dispatcher.execute(&job, &user).await;
        self.reconcile(&job, &outcome).await?;
        Ok(outcome.success)
    }

    async fn reconcile(&self, job: &Job, outcome: &SendOutcome) -> Result<()> {
        let update = lifecycle::record_outcome(job, outcome);
        if update.is_empty() {
            return Ok(());
        }
        let matched = self
            .store
            .update_job_fields(&job.id, Some(&job.user_id), &update)
            .await?;
        if matched {
            debug!(job_id = %job.id, next_send = ?update.next_send, "send recorded");
        } else {
            info!(job_id = %job.id, "job deleted while sending; outcome not recorded");
        }
        Ok(())
    }

    fn claim(&self, id: &JobId) -> Option<Claim<'_>> {
        let mut set = lock_ignoring_poison(&self.in_flight);
        if !set.insert(id.clone()) {
            return None;
        }
        Some(Claim {
            set: &self.in_flight,
            id: id.clone(),
        })
    }
}

/// Clears an atomic flag on drop.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Marks a job as in flight until dropped.
struct Claim<'a> {
    set: &'a Mutex<HashSet<JobId>>,
    id: JobId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        lock_ignoring_poison(self.set).remove(&self.id);
    }
}

// The guarded data stays consistent even if a holder panicked.
fn lock_ignoring_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
