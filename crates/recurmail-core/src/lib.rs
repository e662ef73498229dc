//! `recurmail-core` — domain types, collaborator traits and configuration
//! shared by every recurmail crate.

pub mod config;
pub mod error;
pub mod provider;
pub mod types;

pub use error::{RecurmailError, Result};
