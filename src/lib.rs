// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Safe configuration delivery for Nixopus deployments.
//!
//! Nixopus keeps two kinds of configuration in sync for the services it
//! deploys: plain environment files on disk, and the live configuration of
//! the Caddy reverse proxy in front of them. Both go through components that
//! fail safely.
//!
//! - [`writer::ConfigWriter`] replaces environment files atomically, and
//!   restores the previous version if anything goes wrong.
//! - [`proxy::Publisher`] waits for the proxy admin API to come up, then
//!   loads new configuration into it with retries and backoff.
//! - [`retry::RetryPolicy`] supplies the backoff schedule both loops of the
//!   publisher run on.

pub mod config;
pub mod env;
pub mod log;
pub mod path;
pub mod proxy;
pub mod retry;
pub mod writer;

pub use config::Settings;
pub use env::EnvFile;
pub use proxy::{Payload, ProxyTarget, Publisher, PublisherConfig};
pub use retry::RetryPolicy;
pub use writer::ConfigWriter;
