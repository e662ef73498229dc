//! Job State Machine.
//!
//! ```text
//!   Active ──pause──▶ Paused ──resume──▶ Active
//!     │                  │
//!     └──────delete──────┴──▶ Deleted   (terminal)
//! ```
//!
//! Transitions are pure: each one inspects a [`Job`] and returns the
//! [`JobUpdate`] that realises it. [`JobManager`] loads jobs, applies the
//! transitions and persists the result through the [`JobStore`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use recurmail_core::types::{Job, JobId, JobStatus, SendOutcome, UserId};
use serde::Deserialize;
use tracing::{error, info};

use crate::{
    error::{Result, SchedulerError},
    schedule::{next_occurrence, validate_cadence},
    store::{JobStore, JobUpdate},
};

fn ensure_not_deleted(job: &Job, to: JobStatus) -> Result<()> {
    if job.status == JobStatus::Deleted {
        return Err(SchedulerError::InvalidTransition {
            from: JobStatus::Deleted,
            to,
        });
    }
    Ok(())
}

/// `next_send = (last_sent ?? now) + every_n_days`.
pub fn schedule(job: &Job, now: DateTime<Utc>) -> JobUpdate {
    JobUpdate {
        next_send: Some(next_occurrence(job.last_sent, now, job.every_n_days)),
        ..Default::default()
    }
}

/// Change the cadence and re-anchor `next_send` on it. Status is unchanged.
pub fn update_cadence(job: &Job, every_n_days: i64, now: DateTime<Utc>) -> Result<JobUpdate> {
    let every_n_days = validate_cadence(every_n_days)?;
    ensure_not_deleted(job, job.status)?;
    Ok(JobUpdate {
        every_n_days: Some(every_n_days),
        next_send: Some(next_occurrence(job.last_sent, now, every_n_days)),
        ..Default::default()
    })
}

/// Stop selecting the job. `next_send` is kept as is.
pub fn pause(job: &Job) -> Result<JobUpdate> {
    ensure_not_deleted(job, JobStatus::Paused)?;
    if job.status == JobStatus::Paused {
        return Ok(JobUpdate::default());
    }
    Ok(JobUpdate {
        status: Some(JobStatus::Paused),
        ..Default::default()
    })
}

/// Reactivate a paused job, rescheduling it exactly like [`schedule`].
///
/// Missed occurrences are not replayed. Resuming an already active job
/// changes nothing.
pub fn resume(job: &Job, now: DateTime<Utc>) -> Result<JobUpdate> {
    ensure_not_deleted(job, JobStatus::Active)?;
    if job.status == JobStatus::Active {
        return Ok(JobUpdate::default());
    }
    Ok(JobUpdate {
        status: Some(JobStatus::Active),
        ..schedule(job, now)
    })
}

/// Soft delete. One way.
pub fn delete(job: &Job) -> Result<JobUpdate> {
    ensure_not_deleted(job, JobStatus::Deleted)?;
    Ok(JobUpdate {
        status: Some(JobStatus::Deleted),
        ..Default::default()
    })
}

/// `last_sent = sent_at`, `next_send = sent_at + every_n_days`.
pub fn record_send_success(job: &Job, sent_at: DateTime<Utc>) -> JobUpdate {
    JobUpdate {
        last_sent: Some(sent_at),
        next_send: Some(next_occurrence(Some(sent_at), sent_at, job.every_n_days)),
        ..Default::default()
    }
}

/// Failure leaves both timing fields untouched, so the job stays due and is
/// picked up again on the next tick. No backoff, no attempt limit.
pub fn record_send_failure(job: &Job, error: &str) -> JobUpdate {
    error!(job_id = %job.id, error, "send failed; job stays due for the next tick");
    JobUpdate::default()
}

/// Fold a dispatch outcome into the job's timing fields.
pub fn record_outcome(job: &Job, outcome: &SendOutcome) -> JobUpdate {
    if outcome.success {
        record_send_success(job, outcome.sent_at)
    } else {
        record_send_failure(job, outcome.error.as_deref().unwrap_or("unknown error"))
    }
}

/// Recipient sanity check: one `@`, non-empty local part and a dotted domain.
fn validate_recipient(recipient: &str) -> Result<()> {
    let ok = match recipient.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !recipient.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if ok {
        Ok(())
    } else {
        Err(SchedulerError::InvalidJob(format!(
            "invalid recipient address: {recipient}"
        )))
    }
}

/// Input for creating a job.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub every_n_days: i64,
}

/// Partial edit of a job. Cadence and status changes run through the
/// corresponding transitions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPatch {
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub attachments: Option<Vec<String>>,
    pub every_n_days: Option<i64>,
    pub status: Option<JobStatus>,
}

/// Owner-facing job operations on top of a [`JobStore`].
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Create an active job, scheduled one cadence from now.
    pub async fn create(&self, owner: &UserId, new: NewJob) -> Result<Job> {
        let every_n_days = validate_cadence(new.every_n_days)?;
        validate_recipient(&new.recipient)?;
        if self.store.get_user(owner).await?.is_none() {
            return Err(SchedulerError::UserNotFound {
                id: owner.to_string(),
            });
        }

        let now = Utc::now();
        let mut job = Job {
            id: JobId::new(),
            user_id: owner.clone(),
            recipient: new.recipient,
            subject: new.subject,
            body: new.body,
            attachments: new.attachments,
            every_n_days,
            last_sent: None,
            next_send: None,
            status: JobStatus::Active,
            created_at: now,
            updated_at: now,
        };
        schedule(&job, now).apply_to(&mut job);
        self.store.insert_job(&job).await?;
        info!(job_id = %job.id, next_send = ?job.next_send, every_n_days, "job created");
        Ok(job)
    }

    pub async fn get(&self, owner: &UserId, id: &JobId) -> Result<Job> {
        self.store
            .get_job(id, owner)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    pub async fn list(&self, owner: &UserId) -> Result<Vec<Job>> {
        self.store.list_jobs(owner).await
    }

    pub async fn update_cadence(&self, owner: &UserId, id: &JobId, every_n_days: i64) -> Result<Job> {
        let job = self.get(owner, id).await?;
        let update = update_cadence(&job, every_n_days, Utc::now())?;
        let job = self.persist(job, update).await?;
        info!(job_id = %id, every_n_days, next_send = ?job.next_send, "job cadence updated");
        Ok(job)
    }

    pub async fn pause(&self, owner: &UserId, id: &JobId) -> Result<Job> {
        let job = self.get(owner, id).await?;
        let update = pause(&job)?;
        let job = self.persist(job, update).await?;
        info!(job_id = %id, "job paused");
        Ok(job)
    }

    pub async fn resume(&self, owner: &UserId, id: &JobId) -> Result<Job> {
        let job = self.get(owner, id).await?;
        let update = resume(&job, Utc::now())?;
        let job = self.persist(job, update).await?;
        info!(job_id = %id, next_send = ?job.next_send, "job resumed");
        Ok(job)
    }

    pub async fn delete(&self, owner: &UserId, id: &JobId) -> Result<()> {
        let job = self.get(owner, id).await?;
        let update = delete(&job)?;
        self.persist(job, update).await?;
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Apply a patch in one store write: content first, then cadence, then
    /// the status transition (so a resume uses the new cadence).
    pub async fn update(&self, owner: &UserId, id: &JobId, patch: JobPatch) -> Result<Job> {
        let job = self.get(owner, id).await?;
        if let Some(ref r) = patch.recipient {
            validate_recipient(r)?;
        }

        let now = Utc::now();
        let mut working = job.clone();
        let mut update = JobUpdate {
            recipient: patch.recipient,
            subject: patch.subject,
            body: patch.body,
            attachments: patch.attachments,
            ..Default::default()
        };
        update.apply_to(&mut working);

        if let Some(n) = patch.every_n_days {
            let step = update_cadence(&working, n, now)?;
            step.apply_to(&mut working);
            update = update.merge(step);
        }

        let step = match patch.status {
            Some(JobStatus::Paused) => pause(&working)?,
            Some(JobStatus::Active) => resume(&working, now)?,
            Some(JobStatus::Deleted) => delete(&working)?,
            None => JobUpdate::default(),
        };
        update = update.merge(step);

        let job = self.persist(job, update).await?;
        info!(job_id = %id, status = %job.status, "job updated");
        Ok(job)
    }

    async fn persist(&self, mut job: Job, update: JobUpdate) -> Result<Job> {
        if update.is_empty() {
            return Ok(job);
        }
        let matched = self
            .store
            .update_job_fields(&job.id, Some(&job.user_id), &update)
            .await?;
        if !matched {
            // Deleted or reassigned between load and write.
            return Err(SchedulerError::JobNotFound {
                id: job.id.to_string(),
            });
        }
        update.apply_to(&mut job);
        job.updated_at = Utc::now();
        Ok(job)
    }
}
