//! HTTP surface of the gateway.
//!
//! - [`openai`]: `/v1/chat/completions` and `/v1/models`
//! - [`admin`]: `/health`, `/status`, and platform-admin management

pub mod admin;
pub mod openai;
