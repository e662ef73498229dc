//! Dispatch Executor: one send attempt for one job.
//!
//! Never mutates job or user state. Every failure is folded into the returned
//! [`SendOutcome`]; the state machine decides what that means for the job.

use std::{path::Path, sync::Arc};

use chrono::Utc;
use recurmail_core::{
    provider::{MessageAttachment, MessageTransport, OutgoingMessage, ProviderError},
    types::{FailureKind, Job, Profile, SendOutcome, User},
};
use tracing::{debug, info, warn};

use crate::{
    broker::CredentialBroker,
    error::{Result, SchedulerError},
};

const ATTACHMENT_CONTENT_TYPE: &str = "application/octet-stream";

pub struct Dispatcher {
    broker: Arc<CredentialBroker>,
    transport: Arc<dyn MessageTransport>,
}

impl Dispatcher {
    pub fn new(broker: Arc<CredentialBroker>, transport: Arc<dyn MessageTransport>) -> Self {
        Self { broker, transport }
    }

    /// Attempt to deliver `job` on behalf of `user`.
    pub async fn execute(&self, job: &Job, user: &User) -> SendOutcome {
        let credential = match self.broker.get_valid_credential(user).await {
            Ok(c) => c,
            Err(e) => {
                let kind = match e {
                    SchedulerError::UserNotFound { .. } => FailureKind::UserNotFound,
                    _ => FailureKind::CredentialExpired,
                };
                return SendOutcome::failed(job, Utc::now(), kind, e.to_string());
            }
        };

        let from = match self.broker.identity().get_profile(&credential.access_token).await {
            Ok(profile) => profile.email,
            Err(e) => {
                return SendOutcome::failed(
                    job,
                    Utc::now(),
                    FailureKind::ProfileLookup,
                    format!("sender lookup failed: {e}"),
                )
            }
        };

        let message = OutgoingMessage {
            from,
            to: job.recipient.clone(),
            subject: job.subject.clone(),
            body: job.body.clone(),
            attachments: load_attachments(&job.attachments).await,
        };

        debug!(
            job_id = %job.id,
            transport = self.transport.name(),
            attachments = message.attachments.len(),
            "handing message to transport"
        );
        match self
            .transport
            .send_message(&credential.access_token, &message)
            .await
        {
            Ok(()) => {
                info!(job_id = %job.id, to = %job.recipient, "message delivered");
                SendOutcome::delivered(job, Utc::now())
            }
            Err(ProviderError::InvalidMessage(msg)) => {
                SendOutcome::failed(job, Utc::now(), FailureKind::Build, msg)
            }
            Err(e) => SendOutcome::failed(job, Utc::now(), FailureKind::Transport, e.to_string()),
        }
    }

    /// Verify that `user` can still send: a valid credential plus a
    /// successful profile lookup.
    pub async fn check_connection(&self, user: &User) -> Result<Profile> {
        let credential = self.broker.get_valid_credential(user).await?;
        self.broker
            .identity()
            .get_profile(&credential.access_token)
            .await
            .map_err(|e| SchedulerError::CredentialExpired(format!("profile lookup failed: {e}")))
    }
}

/// Turn a failed outcome into the matching error, for callers that report
/// a single send synchronously.
pub fn outcome_into_result(outcome: SendOutcome) -> Result<SendOutcome> {
    if outcome.success {
        return Ok(outcome);
    }
    let reason = outcome.error.clone().unwrap_or_default();
    Err(match outcome.failure {
        Some(FailureKind::UserNotFound) => SchedulerError::UserNotFound {
            id: outcome.job_id.to_string(),
        },
        Some(FailureKind::CredentialExpired) | Some(FailureKind::ProfileLookup) => {
            SchedulerError::CredentialExpired(reason)
        }
        Some(FailureKind::Build) => SchedulerError::InvalidJob(reason),
        Some(FailureKind::Transport) | None => SchedulerError::Transport(reason),
    })
}

/// Read one attachment from disk.
pub async fn read_attachment(path: &str) -> Result<MessageAttachment> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| SchedulerError::AttachmentUnreadable {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
    let filename = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    Ok(MessageAttachment {
        filename,
        content_type: ATTACHMENT_CONTENT_TYPE.to_string(),
        data,
    })
}

/// Read every attachment in order, skipping the ones that cannot be read.
/// A missing file degrades the send; it never blocks it.
pub async fn load_attachments(paths: &[String]) -> Vec<MessageAttachment> {
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        match read_attachment(path).await {
            Ok(a) => out.push(a),
            Err(e) => warn!(error = %e, "skipping attachment"),
        }
    }
    out
}
