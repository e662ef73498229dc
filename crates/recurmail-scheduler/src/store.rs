//! Job Store Adapter: translates scheduler intents ("find due jobs", "record
//! send outcome") into persistent-store calls.
//!
//! All coordination happens here as conditional updates keyed on the job id
//! (and owner, when the caller has one); there are no in-process job locks.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recurmail_core::types::{Credential, Job, JobId, JobStatus, User, UserId};
use rusqlite::{types::Value, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::{
    db::{from_db_ts, init_db, to_db_ts},
    error::{Result, SchedulerError},
};

/// Partial update of a job row. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub attachments: Option<Vec<String>>,
    pub every_n_days: Option<u32>,
    pub status: Option<JobStatus>,
    pub last_sent: Option<DateTime<Utc>>,
    pub next_send: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn is_empty(&self) -> bool {
        *self == JobUpdate::default()
    }

    /// Mirror the update onto an in-memory copy of the job.
    pub fn apply_to(&self, job: &mut Job) {
        if let Some(ref v) = self.recipient {
            job.recipient = v.clone();
        }
        if let Some(ref v) = self.subject {
            job.subject = v.clone();
        }
        if let Some(ref v) = self.body {
            job.body = v.clone();
        }
        if let Some(ref v) = self.attachments {
            job.attachments = v.clone();
        }
        if let Some(v) = self.every_n_days {
            job.every_n_days = v;
        }
        if let Some(v) = self.status {
            job.status = v;
        }
        if let Some(v) = self.last_sent {
            job.last_sent = Some(v);
        }
        if let Some(v) = self.next_send {
            job.next_send = Some(v);
        }
    }

    /// Fold another update on top of this one; fields set in `other` win.
    pub fn merge(mut self, other: JobUpdate) -> JobUpdate {
        macro_rules! take {
            ($($f:ident),*) => { $( if other.$f.is_some() { self.$f = other.$f; } )* };
        }
        take!(recipient, subject, body, attachments, every_n_days, status, last_sent, next_send);
        self
    }
}

/// Persistent store operations the scheduler core issues.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Active jobs whose `next_send` is unset or at/before `now`, in store order.
    async fn find_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    async fn insert_job(&self, job: &Job) -> Result<()>;

    /// A non-deleted job belonging to `owner`.
    async fn get_job(&self, id: &JobId, owner: &UserId) -> Result<Option<Job>>;

    /// All non-deleted jobs of `owner`, oldest first.
    async fn list_jobs(&self, owner: &UserId) -> Result<Vec<Job>>;

    /// Apply `update` to the job matching `id` (and `owner` when given).
    ///
    /// Always stamps `updated_at`. Deleted jobs never match. Returns whether a
    /// row was updated.
    async fn update_job_fields(
        &self,
        id: &JobId,
        owner: Option<&UserId>,
        update: &JobUpdate,
    ) -> Result<bool>;

    async fn get_user(&self, id: &UserId) -> Result<Option<User>>;

    async fn insert_user(&self, user: &User) -> Result<()>;

    /// Overwrite the stored credential of `id`. Returns whether the user exists.
    async fn save_credential(&self, id: &UserId, credential: &Credential) -> Result<bool>;

    /// Cheap connectivity check for health reporting.
    async fn ping(&self) -> Result<()>;
}

const JOB_COLUMNS: &str = "id, user_id, recipient, subject, body, attachments, every_n_days,
     last_sent, next_send, status, created_at, updated_at";

const USER_COLUMNS: &str =
    "id, email, name, google_id, access_token, refresh_token, token_expiry, created_at, updated_at";

/// SQLite-backed [`JobStore`].
///
/// Uses its own `Connection` so HTTP handlers and the scheduler loop can share
/// one store without stepping on each other's statements.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::new(conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Internal("store connection mutex poisoned".to_string()))
    }

    fn query_jobs(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Job>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, row_to_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            match row {
                Ok(job) => jobs.push(job),
                // A corrupt row must not hide every other job from the caller.
                Err(e) => warn!(error = %e, "skipping unreadable job row"),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn find_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = 'active' AND (next_send IS NULL OR next_send <= ?1)"
        );
        Self::query_jobs(&conn, &sql, &[&to_db_ts(now)?])
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        let attachments = serde_json::to_string(&job.attachments)?;
        let last_sent = job.last_sent.map(to_db_ts).transpose()?;
        let next_send = job.next_send.map(to_db_ts).transpose()?;
        let created_at = to_db_ts(job.created_at)?;
        let updated_at = to_db_ts(job.updated_at)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"
            ),
            rusqlite::params![
                job.id.as_str(),
                job.user_id.as_str(),
                job.recipient,
                job.subject,
                job.body,
                attachments,
                i64::from(job.every_n_days),
                last_sent,
                next_send,
                job.status.to_string(),
                created_at,
                updated_at,
            ],
        )?;
        info!(job_id = %job.id, user_id = %job.user_id, "job stored");
        Ok(())
    }

    async fn get_job(&self, id: &JobId, owner: &UserId) -> Result<Option<Job>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE id = ?1 AND user_id = ?2 AND status != 'deleted'"
                ),
                [id.as_str(), owner.as_str()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    async fn list_jobs(&self, owner: &UserId) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE user_id = ?1 AND status != 'deleted'
             ORDER BY created_at, id"
        );
        Self::query_jobs(&conn, &sql, &[&owner.as_str()])
    }

    async fn update_job_fields(
        &self,
        id: &JobId,
        owner: Option<&UserId>,
        update: &JobUpdate,
    ) -> Result<bool> {
        let mut sets: Vec<&'static str> = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if let Some(ref v) = update.recipient {
            sets.push("recipient");
            params.push(Value::Text(v.clone()));
        }
        if let Some(ref v) = update.subject {
            sets.push("subject");
            params.push(Value::Text(v.clone()));
        }
        if let Some(ref v) = update.body {
            sets.push("body");
            params.push(Value::Text(v.clone()));
        }
        if let Some(ref v) = update.attachments {
            sets.push("attachments");
            params.push(Value::Text(serde_json::to_string(v)?));
        }
        if let Some(v) = update.every_n_days {
            sets.push("every_n_days");
            params.push(Value::Integer(i64::from(v)));
        }
        if let Some(v) = update.status {
            sets.push("status");
            params.push(Value::Text(v.to_string()));
        }
        if let Some(v) = update.last_sent {
            sets.push("last_sent");
            params.push(Value::Text(to_db_ts(v)?));
        }
        if let Some(v) = update.next_send {
            sets.push("next_send");
            params.push(Value::Text(to_db_ts(v)?));
        }
        sets.push("updated_at");
        params.push(Value::Text(to_db_ts(Utc::now())?));

        let mut sql = String::from("UPDATE jobs SET ");
        for (i, col) in sets.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("{col} = ?{}", i + 1));
        }
        params.push(Value::Text(id.as_str().to_string()));
        sql.push_str(&format!(" WHERE id = ?{} AND status != 'deleted'", params.len()));
        if let Some(owner) = owner {
            params.push(Value::Text(owner.as_str().to_string()));
            sql.push_str(&format!(" AND user_id = ?{}", params.len()));
        }

        let conn = self.lock()?;
        let n = conn.execute(&sql, rusqlite::params_from_iter(params))?;
        Ok(n > 0)
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        let conn = self.lock()?;
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                [id.as_str()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        let expires_at = to_db_ts(user.credential.expires_at)?;
        let created_at = to_db_ts(user.created_at)?;
        let updated_at = to_db_ts(user.updated_at)?;
        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT INTO users ({USER_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"),
            rusqlite::params![
                user.id.as_str(),
                user.email,
                user.name,
                user.google_id,
                user.credential.access_token,
                user.credential.refresh_token,
                expires_at,
                created_at,
                updated_at,
            ],
        )?;
        info!(user_id = %user.id, "user stored");
        Ok(())
    }

    async fn save_credential(&self, id: &UserId, credential: &Credential) -> Result<bool> {
        let expires_at = to_db_ts(credential.expires_at)?;
        let updated_at = to_db_ts(Utc::now())?;
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE users SET access_token = ?1, refresh_token = ?2, token_expiry = ?3,
                              updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![
                credential.access_token,
                credential.refresh_token,
                expires_at,
                updated_at,
                id.as_str(),
            ],
        )?;
        Ok(n > 0)
    }

    async fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

// --- row mapping ------------------------------------------------------------

fn conversion_err(idx: usize, msg: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(msg.into()),
    )
}

fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_db_ts(&raw).map_err(|e| conversion_err(idx, e.to_string()))
}

fn opt_ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| from_db_ts(&raw).map_err(|e| conversion_err(idx, e.to_string())))
        .transpose()
}

/// Map a SELECT row (column order from JOB_COLUMNS) to a Job.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let attachments: Vec<String> = serde_json::from_str(&row.get::<_, String>(5)?)
        .map_err(|e| conversion_err(5, e.to_string()))?;
    let every_n_days = u32::try_from(row.get::<_, i64>(6)?)
        .map_err(|e| conversion_err(6, e.to_string()))?;
    let status: JobStatus = row
        .get::<_, String>(9)?
        .parse()
        .map_err(|e: String| conversion_err(9, e))?;
    Ok(Job {
        id: JobId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        recipient: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        attachments,
        every_n_days,
        last_sent: opt_ts_col(row, 7)?,
        next_send: opt_ts_col(row, 8)?,
        status,
        created_at: ts_col(row, 10)?,
        updated_at: ts_col(row, 11)?,
    })
}

/// Map a SELECT row (column order from USER_COLUMNS) to a User.
fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId(row.get(0)?),
        email: row.get(1)?,
        name: row.get(2)?,
        google_id: row.get(3)?,
        credential: Credential {
            access_token: row.get(4)?,
            refresh_token: row.get(5)?,
            expires_at: ts_col(row, 6)?,
        },
        created_at: ts_col(row, 7)?,
        updated_at: ts_col(row, 8)?,
    })
}
