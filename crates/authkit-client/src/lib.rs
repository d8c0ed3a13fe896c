//! Auth server collaborator for the authkit session manager.
//!
//! This crate provides:
//! - The [`AuthApi`] contract the session engine depends on
//! - [`GotrueClient`], an HTTP implementation against a GoTrue-style
//!   authentication server
//! - The uniform [`ClientError`] every network method fails with

mod contract;
mod error;
mod gotrue;

pub use contract::{AuthApi, Credentials, OAuthProvider, SignupRequest};
pub use error::{ClientError, ClientResult};
pub use gotrue::GotrueClient;
