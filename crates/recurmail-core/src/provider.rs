//! Seams to the outside world: the identity provider that issues and refreshes
//! credentials, and the transport that actually delivers messages.

use async_trait::async_trait;

use crate::types::{Credential, Profile};

/// A file attached to an outgoing message, already read into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Everything the transport needs to deliver one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<MessageAttachment>,
}

/// Exchanges refresh tokens for fresh credentials and resolves the profile
/// behind an access token.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Obtain a new credential from `refresh_token`.
    ///
    /// Providers that do not rotate refresh tokens return `refresh_token: None`;
    /// callers keep the one they already hold.
    async fn refresh_credential(&self, refresh_token: &str) -> Result<Credential, ProviderError>;

    /// Look up the account that owns `access_token`.
    async fn get_profile(&self, access_token: &str) -> Result<Profile, ProviderError>;
}

/// Delivers a rendered message on behalf of the holder of `access_token`.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send_message(
        &self,
        access_token: &str,
        message: &OutgoingMessage,
    ) -> Result<(), ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}
