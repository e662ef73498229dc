use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a user (UUIDv7 — time-sortable for easier log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a recurring job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a recurring job.
///
/// `Deleted` is terminal: a deleted job is kept for history but never
/// selected, listed or transitioned again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Paused,
    Deleted,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobStatus::Active),
            "paused" => Ok(JobStatus::Paused),
            "deleted" => Ok(JobStatus::Deleted),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A recurring-send directive owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// Attachment file paths, in the order they are attached.
    pub attachments: Vec<String>,
    /// Days between sends. Always > 0.
    pub every_n_days: u32,
    pub last_sent: Option<DateTime<Utc>>,
    pub next_send: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-user transport authorization.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// True when the access token is expired at `now`, or will be within `skew`.
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now + skew >= self.expires_at
    }
}

// Tokens never appear in logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A registered account whose mailbox sends the job messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub google_id: String,
    #[serde(skip)]
    pub credential: Credential,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Profile returned by the identity provider for an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Why a dispatch attempt did not deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The job's owner no longer exists.
    UserNotFound,
    /// The credential was expired and could not be refreshed.
    CredentialExpired,
    /// The sender identity could not be resolved.
    ProfileLookup,
    /// The message could not be assembled (e.g. malformed address).
    Build,
    /// The transport rejected or failed to deliver the message.
    Transport,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::UserNotFound => "user_not_found",
            FailureKind::CredentialExpired => "credential_expired",
            FailureKind::ProfileLookup => "profile_lookup",
            FailureKind::Build => "build",
            FailureKind::Transport => "transport",
        };
        write!(f, "{s}")
    }
}

/// Result of one dispatch attempt. Never persisted on its own; only folded
/// into the job's timing fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendOutcome {
    pub job_id: JobId,
    pub recipient: String,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn delivered(job: &Job, sent_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id.clone(),
            recipient: job.recipient.clone(),
            subject: job.subject.clone(),
            sent_at,
            success: true,
            failure: None,
            error: None,
        }
    }

    pub fn failed(
        job: &Job,
        at: DateTime<Utc>,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            recipient: job.recipient.clone(),
            subject: job.subject.clone(),
            sent_at: at,
            success: false,
            failure: Some(kind),
            error: Some(error.into()),
        }
    }
}
