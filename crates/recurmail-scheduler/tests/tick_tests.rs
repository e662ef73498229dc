use std::{
    io::Write,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration as StdDuration,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use recurmail_core::{
    provider::{IdentityProvider, MessageTransport, OutgoingMessage, ProviderError},
    types::{Credential, FailureKind, Job, JobId, JobStatus, Profile, User, UserId},
};
use recurmail_scheduler::{
    CredentialBroker, Dispatcher, JobManager, JobStore, JobUpdate, NewJob, Scheduler,
    SchedulerError, SchedulerOptions, SqliteStore, TickReport,
};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Never refreshes. Profile lookups fail while `profile_down` is set.
#[derive(Default)]
struct FakeIdentity {
    profile_down: AtomicBool,
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    fn name(&self) -> &str {
        "fake"
    }

    async fn refresh_credential(&self, _refresh_token: &str) -> Result<Credential, ProviderError> {
        Err(ProviderError::Api {
            status: 400,
            message: "invalid_grant".into(),
        })
    }

    async fn get_profile(&self, _access_token: &str) -> Result<Profile, ProviderError> {
        if self.profile_down.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("userinfo endpoint down".into()));
        }
        Ok(Profile {
            email: "sender@example.com".into(),
            name: Some("Sender".into()),
        })
    }
}

/// Records every message. Fails while `failing` is set, panics for one
/// recipient, and optionally parks each send until released.
#[derive(Default)]
struct FakeTransport {
    sent: Mutex<Vec<OutgoingMessage>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
    panic_for: Option<String>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakeTransport {
    fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageTransport for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    async fn send_message(&self, _access_token: &str, message: &OutgoingMessage) -> Result<(), ProviderError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.panic_for.as_deref() == Some(message.to.as_str()) {
            panic!("transport exploded");
        }
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Api {
                status: 503,
                message: "backend unavailable".into(),
            });
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// SQLite underneath; the due-job query fails while `due_query_down` is set.
struct FlakyStore {
    inner: SqliteStore,
    due_query_down: AtomicBool,
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn find_due_jobs(&self, now: DateTime<Utc>) -> recurmail_scheduler::Result<Vec<Job>> {
        if self.due_query_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::Internal("database is locked".into()));
        }
        self.inner.find_due_jobs(now).await
    }

    async fn insert_job(&self, job: &Job) -> recurmail_scheduler::Result<()> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, id: &JobId, owner: &UserId) -> recurmail_scheduler::Result<Option<Job>> {
        self.inner.get_job(id, owner).await
    }

    async fn list_jobs(&self, owner: &UserId) -> recurmail_scheduler::Result<Vec<Job>> {
        self.inner.list_jobs(owner).await
    }

    async fn update_job_fields(
        &self,
        id: &JobId,
        owner: Option<&UserId>,
        update: &JobUpdate,
    ) -> recurmail_scheduler::Result<bool> {
        self.inner.update_job_fields(id, owner, update).await
    }

    async fn get_user(&self, id: &UserId) -> recurmail_scheduler::Result<Option<User>> {
        self.inner.get_user(id).await
    }

    async fn insert_user(&self, user: &User) -> recurmail_scheduler::Result<()> {
        self.inner.insert_user(user).await
    }

    async fn save_credential(&self, id: &UserId, credential: &Credential) -> recurmail_scheduler::Result<bool> {
        self.inner.save_credential(id, credential).await
    }

    async fn ping(&self) -> recurmail_scheduler::Result<()> {
        self.inner.ping().await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<FlakyStore>,
    identity: Arc<FakeIdentity>,
    transport: Arc<FakeTransport>,
    scheduler: Scheduler,
    jobs: JobManager,
    owner: UserId,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
}

async fn harness_with(transport: FakeTransport, credential: Credential, max_concurrent: usize) -> Harness {
    let store = Arc::new(FlakyStore {
        inner: SqliteStore::open_in_memory().unwrap(),
        due_query_down: AtomicBool::new(false),
    });
    let owner = UserId::from("user-1");
    store
        .insert_user(&User {
            id: owner.clone(),
            email: "sender@example.com".into(),
            name: "Sender".into(),
            google_id: "google-1".into(),
            credential,
            created_at: t0(),
            updated_at: t0(),
        })
        .await
        .unwrap();

    let transport = Arc::new(transport);
    let identity = Arc::new(FakeIdentity::default());
    let broker = Arc::new(CredentialBroker::new(
        store.clone(),
        identity.clone(),
        Duration::seconds(60),
    ));
    let dispatcher = Arc::new(Dispatcher::new(broker, transport.clone()));
    let scheduler = Scheduler::new(
        store.clone(),
        dispatcher,
        SchedulerOptions {
            tick: StdDuration::from_secs(3600),
            max_concurrent_sends: max_concurrent,
        },
    );
    let jobs = JobManager::new(store.clone());
    Harness {
        store,
        identity,
        transport,
        scheduler,
        jobs,
        owner,
    }
}

async fn harness(transport: FakeTransport) -> Harness {
    harness_with(transport, valid_credential(), 1).await
}

fn valid_credential() -> Credential {
    Credential {
        access_token: "access".into(),
        refresh_token: Some("refresh".into()),
        expires_at: Utc::now() + Duration::days(1),
    }
}

impl Harness {
    async fn insert(&self, id: &str, recipient: &str, next_send: Option<DateTime<Utc>>, every_n_days: u32) -> Job {
        let job = Job {
            id: JobId::from(id),
            user_id: self.owner.clone(),
            recipient: recipient.into(),
            subject: format!("subject {id}"),
            body: "hello".into(),
            attachments: vec![],
            every_n_days,
            last_sent: None,
            next_send,
            status: JobStatus::Active,
            created_at: t0() - Duration::days(30),
            updated_at: t0() - Duration::days(30),
        };
        self.store.insert_job(&job).await.unwrap();
        job
    }

    async fn reload(&self, id: &str) -> Job {
        self.store
            .get_job(&JobId::from(id), &self.owner)
            .await
            .unwrap()
            .unwrap()
    }
}

// ---------------------------------------------------------------------------
// Tick behaviour
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_send_advances_from_send_time() {
    let h = harness(FakeTransport::default()).await;
    h.insert("job-a", "friend@example.com", Some(t0() - Duration::minutes(1)), 7)
        .await;

    let report = h.scheduler.run_tick(t0()).await;
    assert_eq!((report.selected, report.sent, report.failed), (1, 1, 0));

    let job = h.reload("job-a").await;
    let sent_at = job.last_sent.expect("last_sent recorded");
    assert_eq!(job.next_send, Some(sent_at + Duration::days(7)));
    assert_eq!(job.status, JobStatus::Active);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].from, "sender@example.com");
    assert_eq!(sent[0].to, "friend@example.com");
}

#[tokio::test]
async fn job_without_next_send_is_due() {
    let h = harness(FakeTransport::default()).await;
    h.insert("job-a", "friend@example.com", None, 1).await;

    let report = h.scheduler.run_tick(t0()).await;
    assert_eq!(report.sent, 1);
}

#[tokio::test]
async fn future_job_is_not_selected() {
    let h = harness(FakeTransport::default()).await;
    h.insert("job-a", "friend@example.com", Some(t0() + Duration::seconds(1)), 1)
        .await;

    let report = h.scheduler.run_tick(t0()).await;
    assert_eq!(report.selected, 0);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn failures_leave_timing_unchanged_and_retry_every_tick() {
    let transport = FakeTransport::default();
    transport.failing.store(true, Ordering::SeqCst);
    let h = harness(transport).await;
    let due = t0() - Duration::hours(1);
    h.insert("job-a", "friend@example.com", Some(due), 3).await;

    for i in 0..5 {
        let report = h.scheduler.run_tick(t0() + Duration::minutes(i)).await;
        assert_eq!((report.selected, report.failed), (1, 1));
        let job = h.reload("job-a").await;
        assert_eq!(job.next_send, Some(due));
        assert_eq!(job.last_sent, None);
        assert_eq!(job.status, JobStatus::Active);
    }

    h.transport.failing.store(false, Ordering::SeqCst);
    let report = h.scheduler.run_tick(t0() + Duration::minutes(5)).await;
    assert_eq!((report.selected, report.sent), (1, 1));
    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn profile_lookup_failure_fails_the_send_before_transport() {
    let h = harness(FakeTransport::default()).await;
    h.identity.profile_down.store(true, Ordering::SeqCst);
    let due = t0() - Duration::minutes(1);
    h.insert("job-a", "friend@example.com", Some(due), 2).await;

    let report = h.scheduler.run_tick(t0()).await;
    assert_eq!((report.selected, report.sent, report.failed), (1, 0, 1));
    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 0);
    let job = h.reload("job-a").await;
    assert_eq!(job.next_send, Some(due));
    assert_eq!(job.last_sent, None);

    let outcome = h
        .scheduler
        .send_now(&h.owner, &JobId::from("job-a"))
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(FailureKind::ProfileLookup));
    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_due_query_aborts_only_that_tick() {
    let h = harness(FakeTransport::default()).await;
    h.insert("job-a", "friend@example.com", Some(t0() - Duration::minutes(1)), 1)
        .await;

    h.store.due_query_down.store(true, Ordering::SeqCst);
    let report = h.scheduler.run_tick(t0()).await;
    assert_eq!(report, TickReport::default());
    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 0);

    h.store.due_query_down.store(false, Ordering::SeqCst);
    let report = h.scheduler.run_tick(t0() + Duration::minutes(1)).await;
    assert_eq!((report.selected, report.sent), (1, 1));
    assert!(!report.skipped);
}

#[tokio::test]
async fn paused_and_deleted_jobs_are_not_sent() {
    let h = harness(FakeTransport::default()).await;
    let due = Some(t0() - Duration::minutes(1));
    h.insert("active", "a@example.com", due, 1).await;
    h.insert("paused", "p@example.com", due, 1).await;
    h.insert("deleted", "d@example.com", due, 1).await;
    h.jobs.pause(&h.owner, &JobId::from("paused")).await.unwrap();
    h.jobs.delete(&h.owner, &JobId::from("deleted")).await.unwrap();

    let report = h.scheduler.run_tick(t0()).await;
    assert_eq!((report.selected, report.sent), (1, 1));
    let recipients: Vec<_> = h.transport.sent().into_iter().map(|m| m.to).collect();
    assert_eq!(recipients, vec!["a@example.com"]);
}

#[tokio::test]
async fn resume_without_history_schedules_from_now() {
    let h = harness(FakeTransport::default()).await;
    let id = JobId::from("job-a");
    h.insert("job-a", "friend@example.com", Some(t0()), 2).await;
    h.jobs.pause(&h.owner, &id).await.unwrap();

    let before = Utc::now();
    let job = h.jobs.resume(&h.owner, &id).await.unwrap();
    let after = Utc::now();

    assert_eq!(job.status, JobStatus::Active);
    let next = job.next_send.unwrap();
    assert!(next >= before + Duration::days(2) && next <= after + Duration::days(2));
}

#[tokio::test]
async fn resume_after_a_send_anchors_on_last_sent() {
    let h = harness(FakeTransport::default()).await;
    let id = JobId::from("job-a");
    h.insert("job-a", "friend@example.com", Some(t0() - Duration::minutes(1)), 5)
        .await;
    h.scheduler.run_tick(t0()).await;
    let sent_at = h.reload("job-a").await.last_sent.unwrap();

    h.jobs.pause(&h.owner, &id).await.unwrap();
    let job = h.jobs.resume(&h.owner, &id).await.unwrap();
    assert_eq!(job.next_send, Some(sent_at + Duration::days(5)));
}

#[tokio::test]
async fn cadence_change_anchors_on_last_sent() {
    let h = harness(FakeTransport::default()).await;
    let id = JobId::from("job-a");
    h.insert("job-a", "friend@example.com", Some(t0() - Duration::minutes(1)), 7)
        .await;
    h.scheduler.run_tick(t0()).await;
    let sent_at = h.reload("job-a").await.last_sent.unwrap();

    let job = h.jobs.update_cadence(&h.owner, &id, 3).await.unwrap();
    assert_eq!(job.every_n_days, 3);
    assert_eq!(job.next_send, Some(sent_at + Duration::days(3)));

    let err = h.jobs.update_cadence(&h.owner, &id, 0).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidCadence(0)));
}

#[tokio::test]
async fn expired_credential_stops_the_send() {
    let expired = Credential {
        access_token: "stale".into(),
        refresh_token: Some("revoked".into()),
        expires_at: Utc::now() - Duration::hours(1),
    };
    let h = harness_with(FakeTransport::default(), expired, 1).await;
    let due = t0() - Duration::minutes(1);
    h.insert("job-a", "friend@example.com", Some(due), 1).await;

    let report = h.scheduler.run_tick(t0()).await;
    assert_eq!((report.selected, report.failed), (1, 1));
    assert_eq!(h.transport.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(h.reload("job-a").await.next_send, Some(due));
}

#[tokio::test]
async fn unreadable_attachment_does_not_block_the_send() {
    let h = harness(FakeTransport::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("report.csv");
    std::fs::File::create(&present)
        .unwrap()
        .write_all(b"a,b\n1,2\n")
        .unwrap();

    let mut job = h
        .insert("job-a", "friend@example.com", Some(t0() - Duration::minutes(1)), 1)
        .await;
    job.attachments = vec![
        dir.path().join("gone.pdf").to_string_lossy().into_owned(),
        present.to_string_lossy().into_owned(),
    ];
    h.store
        .update_job_fields(
            &job.id,
            None,
            &JobUpdate {
                attachments: Some(job.attachments.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let report = h.scheduler.run_tick(t0()).await;
    assert_eq!(report.sent, 1);
    let sent = h.transport.sent();
    assert_eq!(sent[0].attachments.len(), 1);
    assert_eq!(sent[0].attachments[0].filename, "report.csv");
}

#[tokio::test]
async fn panicking_job_does_not_stop_its_siblings() {
    let transport = FakeTransport {
        panic_for: Some("boom@example.com".into()),
        ..Default::default()
    };
    let h = harness(transport).await;
    let due = Some(t0() - Duration::minutes(1));
    h.insert("job-1", "boom@example.com", due, 1).await;
    h.insert("job-2", "fine@example.com", due, 1).await;

    let report = h.scheduler.run_tick(t0()).await;
    assert_eq!((report.selected, report.sent, report.failed), (2, 1, 1));
    assert_eq!(h.reload("job-1").await.next_send, due);
    assert!(h.reload("job-2").await.last_sent.is_some());

    // The panicked job's claim was released, so it is retried.
    let report = h.scheduler.run_tick(t0()).await;
    assert_eq!((report.selected, report.busy), (1, 0));
}

#[tokio::test]
async fn concurrent_sends_cover_every_due_job() {
    let h = harness_with(FakeTransport::default(), valid_credential(), 4).await;
    let due = Some(t0() - Duration::minutes(1));
    for i in 0..6 {
        h.insert(&format!("job-{i}"), &format!("r{i}@example.com"), due, 1)
            .await;
    }

    let report = h.scheduler.run_tick(t0()).await;
    assert_eq!((report.selected, report.sent), (6, 6));
    assert_eq!(h.transport.sent().len(), 6);
}

#[tokio::test]
async fn overlapping_tick_is_skipped() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let transport = FakeTransport {
        gate: Some((entered.clone(), release.clone())),
        ..Default::default()
    };
    let h = harness(transport).await;
    h.insert("job-a", "friend@example.com", Some(t0() - Duration::minutes(1)), 1)
        .await;

    let scheduler = h.scheduler.clone();
    let first = tokio::spawn(async move { scheduler.run_tick(t0()).await });
    entered.notified().await;

    let second = h.scheduler.run_tick(t0()).await;
    assert!(second.skipped);
    assert_eq!(second.selected, 0);

    // A manual send of the job being delivered is refused.
    let err = h
        .scheduler
        .send_now(&h.owner, &JobId::from("job-a"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::JobBusy { .. }));

    release.notify_one();
    let first = first.await.unwrap();
    assert_eq!((first.selected, first.sent), (1, 1));
    assert_eq!(h.transport.sent().len(), 1);
}

// ---------------------------------------------------------------------------
// Manual send and lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn created_job_is_sent_on_cadence() {
    let h = harness(FakeTransport::default()).await;
    let before = Utc::now();
    let job = h
        .jobs
        .create(
            &h.owner,
            NewJob {
                recipient: "friend@example.com".into(),
                subject: "every third day".into(),
                body: "hello".into(),
                attachments: vec![],
                every_n_days: 3,
            },
        )
        .await
        .unwrap();
    let after = Utc::now();

    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.last_sent, None);
    let first = job.next_send.unwrap();
    assert!(first >= before + Duration::days(3) - Duration::microseconds(1));
    assert!(first <= after + Duration::days(3));

    // Not due yet.
    let report = h.scheduler.run_tick(first - Duration::minutes(1)).await;
    assert_eq!(report.selected, 0);

    let report = h.scheduler.run_tick(first + Duration::minutes(1)).await;
    assert_eq!((report.selected, report.sent), (1, 1));

    let job = h.store.get_job(&job.id, &h.owner).await.unwrap().unwrap();
    let sent_at = job.last_sent.unwrap();
    assert_eq!(job.next_send, Some(sent_at + Duration::days(3)));
    assert_eq!(h.transport.sent()[0].subject, "every third day");
}

#[tokio::test]
async fn send_now_records_the_outcome() {
    let h = harness(FakeTransport::default()).await;
    let id = JobId::from("job-a");
    h.insert("job-a", "friend@example.com", Some(t0() + Duration::days(3)), 4)
        .await;

    let outcome = h.scheduler.send_now(&h.owner, &id).await.unwrap();
    assert!(outcome.success);

    // Stored timestamps keep microsecond precision.
    let job = h.reload("job-a").await;
    let last_sent = job.last_sent.unwrap();
    assert!((last_sent - outcome.sent_at).num_microseconds().unwrap().abs() < 1);
    assert_eq!(job.next_send, Some(last_sent + Duration::days(4)));
}

#[tokio::test]
async fn send_now_failure_leaves_job_untouched() {
    let transport = FakeTransport::default();
    transport.failing.store(true, Ordering::SeqCst);
    let h = harness(transport).await;
    let id = JobId::from("job-a");
    let next = Some(t0() + Duration::days(3));
    h.insert("job-a", "friend@example.com", next, 4).await;

    let outcome = h.scheduler.send_now(&h.owner, &id).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("503"));
    assert_eq!(h.reload("job-a").await.next_send, next);
}

#[tokio::test]
async fn send_now_of_unknown_job_is_not_found() {
    let h = harness(FakeTransport::default()).await;
    let err = h
        .scheduler
        .send_now(&h.owner, &JobId::from("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound { .. }));
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let h = harness(FakeTransport::default()).await;
    h.insert("job-a", "friend@example.com", Some(Utc::now() - Duration::minutes(1)), 1)
        .await;

    assert!(!h.scheduler.is_running());
    assert!(h.scheduler.start());
    assert!(!h.scheduler.start());
    assert!(h.scheduler.is_running());

    // The first tick fires immediately.
    for _ in 0..50 {
        if !h.transport.sent().is_empty() {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    assert_eq!(h.transport.sent().len(), 1);

    assert!(h.scheduler.stop().await);
    assert!(!h.scheduler.stop().await);
    assert!(!h.scheduler.is_running());
}
