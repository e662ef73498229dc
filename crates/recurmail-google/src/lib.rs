//! Google collaborators: OAuth2 token refresh and profile lookup, plus the
//! Gmail REST transport.

pub mod gmail;
pub mod oauth;

pub use gmail::GmailTransport;
pub use oauth::GoogleIdentity;
