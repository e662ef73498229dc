//! Gmail REST transport: renders a MIME message and uploads it raw.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine};
use lettre::message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart};
use lettre::Message;
use recurmail_core::{
    config::GoogleConfig,
    provider::{MessageTransport, OutgoingMessage, ProviderError},
};
use serde::Deserialize;
use tracing::{debug, warn};

const SEND_PATH: &str = "/gmail/v1/users/me/messages/send";

pub struct GmailTransport {
    client: reqwest::Client,
    send_url: String,
}

impl GmailTransport {
    pub fn new(config: &GoogleConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: &GoogleConfig) -> Self {
        Self {
            client,
            send_url: format!("{}{}", config.gmail_base_url.trim_end_matches('/'), SEND_PATH),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: Option<String>,
}

/// Render `message` as RFC 5322 bytes: a plain-text body followed by one
/// part per attachment.
pub fn render_mime(message: &OutgoingMessage) -> Result<Vec<u8>, ProviderError> {
    let from: Mailbox = message
        .from
        .parse()
        .map_err(|e| ProviderError::InvalidMessage(format!("invalid from address: {e}")))?;
    let to: Mailbox = message
        .to
        .parse()
        .map_err(|e| ProviderError::InvalidMessage(format!("invalid to address: {e}")))?;

    let mut body = MultiPart::mixed().singlepart(SinglePart::plain(message.body.clone()));
    for attachment in &message.attachments {
        let content_type = ContentType::parse(&attachment.content_type)
            .map_err(|e| ProviderError::InvalidMessage(format!("bad content type: {e}")))?;
        body = body.singlepart(
            Attachment::new(attachment.filename.clone()).body(attachment.data.clone(), content_type),
        );
    }

    let email = Message::builder()
        .from(from)
        .to(to)
        .subject(message.subject.clone())
        .multipart(body)
        .map_err(|e| ProviderError::InvalidMessage(format!("build email: {e}")))?;
    Ok(email.formatted())
}

#[async_trait]
impl MessageTransport for GmailTransport {
    fn name(&self) -> &str {
        "gmail"
    }

    async fn send_message(&self, access_token: &str, message: &OutgoingMessage) -> Result<(), ProviderError> {
        let raw = URL_SAFE.encode(render_mime(message)?);

        let resp = self
            .client
            .post(&self.send_url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "raw": raw }))
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Gmail send rejected");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        match resp.json::<SendResponse>().await {
            Ok(SendResponse { id: Some(id) }) => debug!(gmail_id = %id, "Gmail accepted message"),
            Ok(_) => debug!("Gmail accepted message"),
            Err(e) => debug!(error = %e, "Gmail accepted message; response not parsed"),
        }
        Ok(())
    }
}
