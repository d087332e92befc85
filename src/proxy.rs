// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Reverse proxy configuration delivery.
//!
//! Nixopus fronts its services with Caddy, and drives it through Caddy's
//! admin API. Right after `docker compose up` the proxy container may still
//! be starting, so configuration is delivered by a readiness-gated
//! [`Publisher`]:
//!
//! 1. Resolve the JSON payload. Malformed JSON fails right away.
//! 2. Poll `GET <admin>/config/` until the admin API answers. A `404` means
//!    "up, nothing loaded yet", which is exactly when a first load happens,
//!    so it counts as ready just like `200`.
//! 3. `POST <admin>/load` with retries and exponential backoff. Connection
//!    errors, timeouts, `408`, `429`, and `5xx` are retried. Any other
//!    non-`2xx` status means Caddy rejected the configuration itself, which
//!    no amount of retrying will fix.
//!
//! Readiness is never re-checked between POST attempts.

use crate::{
    log::{self, SharedLogger},
    retry::{RetryError, RetryPolicy, Retryable, TimeoutError},
};

use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::instrument;

/// Admin API of a running proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    admin_url: String,
}

impl ProxyTarget {
    /// Construct new target from admin API base URL.
    pub fn new(admin_url: impl Into<String>) -> Self {
        let admin_url = admin_url.into();
        Self {
            admin_url: admin_url.trim_end_matches('/').to_owned(),
        }
    }

    pub fn admin_url(&self) -> &str {
        &self.admin_url
    }

    /// Endpoint probed for readiness.
    pub fn readiness_url(&self) -> String {
        format!("{}/config/", self.admin_url)
    }

    /// Endpoint that replaces the active configuration.
    pub fn load_url(&self) -> String {
        format!("{}/load", self.admin_url)
    }

    /// Endpoint that shuts the proxy down.
    pub fn stop_url(&self) -> String {
        format!("{}/stop", self.admin_url)
    }
}

/// Source of a JSON configuration payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Already parsed document.
    Json(Value),

    /// Unparsed JSON text.
    Text(String),

    /// File holding JSON text.
    File(PathBuf),
}

impl Payload {
    /// Load payload as JSON document.
    ///
    /// # Errors
    ///
    /// - Return [`PublishError::ReadPayload`] if payload file cannot be read.
    /// - Return [`PublishError::InvalidPayload`] if payload is not valid JSON.
    pub fn resolve(self) -> Result<Value> {
        match self {
            Self::Json(value) => Ok(value),
            Self::Text(text) => parse_payload(&text, None),
            Self::File(path) => {
                let text = read_to_string(&path).map_err(|source| PublishError::ReadPayload {
                    source,
                    path: path.clone(),
                })?;
                parse_payload(&text, Some(&path))
            }
        }
    }
}

fn parse_payload(text: &str, path: Option<&Path>) -> Result<Value> {
    serde_json::from_str(text).map_err(|source| PublishError::InvalidPayload {
        source,
        path: path.map(Path::to_path_buf),
    })
}

/// Timing settings of a [`Publisher`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    /// Timeout of one readiness probe.
    pub probe_timeout: Duration,

    /// Timeout of one POST attempt.
    pub request_timeout: Duration,

    /// Schedule for readiness probing.
    pub readiness: RetryPolicy,

    /// Schedule for POST attempts.
    pub publish: RetryPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            readiness: RetryPolicy::deadline(Duration::from_secs(30))
                .with_base_delay(Duration::from_secs(1))
                .with_multiplier(2.0)
                .with_max_delay(Duration::from_secs(5)),
            publish: RetryPolicy::attempts(5)
                .with_base_delay(Duration::from_secs(1))
                .with_multiplier(2.0)
                .with_max_delay(Duration::from_secs(10)),
        }
    }
}

/// Outcome of one failed request against the admin API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptFailure {
    /// Request never produced a response.
    #[error("request failed: {message}")]
    Transport { message: String },

    /// Response carried a non-success status.
    #[error("admin API answered {status}: {message}")]
    Status { status: u16, message: String },
}

impl Retryable for AttemptFailure {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => {
                *status >= 500
                    || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
        }
    }
}

/// Readiness-gated publisher of proxy configuration.
///
/// See the [module documentation](self) for the delivery procedure.
#[derive(Clone)]
pub struct Publisher {
    client: Client,
    config: PublisherConfig,
    logger: SharedLogger,
}

impl Publisher {
    /// Construct new publisher.
    ///
    /// # Errors
    ///
    /// - Return [`PublishError::Client`] if HTTP client cannot be built.
    pub fn new(config: PublisherConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("nixopus/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(PublishError::Client)?;

        Ok(Self {
            client,
            config,
            logger: log::noop(),
        })
    }

    /// Report progress through given logger.
    pub fn with_logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Deliver payload to target once it is ready.
    ///
    /// # Errors
    ///
    /// - Return [`PublishError::ReadPayload`] or
    ///   [`PublishError::InvalidPayload`] if payload cannot be loaded. No
    ///   request is made.
    /// - Return [`PublishError::ServiceNotReady`] if the admin API does not
    ///   come up in time. No POST is made.
    /// - Return [`PublishError::PublishFailed`] if the proxy rejects the
    ///   payload.
    /// - Return [`PublishError::RetryExhausted`] if every POST attempt failed
    ///   transiently.
    #[instrument(skip(self, target, payload), fields(admin_url = target.admin_url()), level = "debug")]
    pub async fn publish(&self, target: &ProxyTarget, payload: Payload) -> Result<()> {
        let body = payload.resolve()?;
        self.wait_until_ready(target).await?;

        let url = target.load_url();
        let (url_ref, body_ref) = (url.as_str(), &body);
        let outcome = self
            .config
            .publish
            .retry(
                || self.post_once(url_ref, Some(body_ref)),
                |attempt, delay, failure| {
                    self.logger.warning(&format!(
                        "load attempt {attempt} against {url_ref} failed ({failure}), retrying in {delay:?}"
                    ))
                },
            )
            .await;

        match outcome {
            Ok(()) => {
                self.logger.debug(&format!("loaded configuration into {url}"));
                Ok(())
            }
            Err(RetryError::Fatal(source)) => {
                self.logger
                    .error(&format!("proxy rejected configuration: {source}"));
                Err(PublishError::PublishFailed { source, url })
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                self.logger
                    .error(&format!("gave up loading configuration after {attempts} attempts"));
                Err(PublishError::RetryExhausted {
                    source: last,
                    url,
                    attempts,
                })
            }
        }
    }

    /// Block until target answers readiness probes.
    ///
    /// # Errors
    ///
    /// - Return [`PublishError::ServiceNotReady`] if readiness schedule runs
    ///   out first.
    pub async fn wait_until_ready(&self, target: &ProxyTarget) -> Result<()> {
        self.config
            .readiness
            .wait_for_condition(
                || self.is_ready(target),
                |attempt, delay| {
                    self.logger.debug(&format!(
                        "admin API at {} not ready after check {attempt}, checking again in {delay:?}",
                        target.admin_url()
                    ))
                },
                format!("admin API at {} never became ready", target.admin_url()),
            )
            .await
            .map_err(|source| {
                self.logger.error(&source.to_string());
                PublishError::ServiceNotReady {
                    source,
                    url: target.readiness_url(),
                }
            })
    }

    /// Probe target once.
    ///
    /// Ready means the admin API answered `200` or `404`.
    pub async fn is_ready(&self, target: &ProxyTarget) -> bool {
        let response = self
            .client
            .get(target.readiness_url())
            .timeout(self.config.probe_timeout)
            .send()
            .await;

        match response {
            Ok(response) => matches!(response.status(), StatusCode::OK | StatusCode::NOT_FOUND),
            Err(err) => {
                self.logger
                    .debug(&format!("readiness probe against {} failed: {err}", target.admin_url()));
                false
            }
        }
    }

    /// Ask target to shut down. Not retried.
    ///
    /// # Errors
    ///
    /// - Return [`PublishError::StopFailed`] if the request fails.
    pub async fn stop(&self, target: &ProxyTarget) -> Result<()> {
        let url = target.stop_url();
        self.post_once(&url, None)
            .await
            .map_err(|source| PublishError::StopFailed { source, url })
    }

    async fn post_once(&self, url: &str, body: Option<&Value>) -> Result<(), AttemptFailure> {
        let mut request = self.client.post(url).timeout(self.config.request_timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|err| AttemptFailure::Transport {
            message: if err.is_timeout() {
                format!("timed out after {:?}", self.config.request_timeout)
            } else {
                err.to_string()
            },
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                self.logger
                    .debug(&format!("failed to read response body from {url}: {err}"));
                String::new()
            }
        };
        let message = match body.trim() {
            "" => status.canonical_reason().unwrap_or("no response body").to_owned(),
            text => text.to_owned(),
        };

        Err(AttemptFailure::Status {
            status: status.as_u16(),
            message,
        })
    }
}

/// Configuration delivery error types.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// HTTP client cannot be constructed.
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),

    /// Payload file cannot be read.
    #[error("failed to read payload from {:?}", path.display())]
    ReadPayload {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Payload is not valid JSON.
    #[error("invalid JSON payload{}", path.as_ref().map(|p| format!(" in {:?}", p.display())).unwrap_or_default())]
    InvalidPayload {
        #[source]
        source: serde_json::Error,
        path: Option<PathBuf>,
    },

    /// Target never answered readiness probes.
    #[error("proxy is not ready at {url}")]
    ServiceNotReady {
        #[source]
        source: TimeoutError,
        url: String,
    },

    /// Every POST attempt failed transiently.
    #[error("failed to load configuration into {url} after {attempts} attempts")]
    RetryExhausted {
        #[source]
        source: AttemptFailure,
        url: String,
        attempts: u32,
    },

    /// Target rejected the payload.
    #[error("failed to load configuration into {url}")]
    PublishFailed {
        #[source]
        source: AttemptFailure,
        url: String,
    },

    /// Target did not accept the stop request.
    #[error("failed to stop proxy through {url}")]
    StopFailed {
        #[source]
        source: AttemptFailure,
        url: String,
    },
}

/// Friendly result alias :3
pub type Result<T, E = PublishError> = std::result::Result<T, E>;
