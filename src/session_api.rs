use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const SESSION_API_BASE_URL: &str = "https://api.pulsedesk.io";
pub const LOCAL_SESSION_API_BASE_URL: &str = "http://localhost:8080";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionApiDefaults;

impl SessionApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_ATTEMPTS: usize = 2;
    pub const BACKOFF: Duration = Duration::from_millis(250);
    pub const JITTER: Duration = Duration::from_millis(100);
}

#[derive(Clone, Debug)]
pub struct SessionApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for SessionApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: SessionApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: SessionApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: SessionApiDefaults::MAX_ATTEMPTS,
                initial_backoff: SessionApiDefaults::BACKOFF,
                max_backoff: SessionApiDefaults::BACKOFF,
                jitter: SessionApiDefaults::JITTER,
            },
        }
    }
}

/// HTTP client for the session endpoint.
///
/// Resolves the current authenticated user; the realtime client consults it
/// through [`SessionCheck`] before every connection attempt.
#[derive(Clone)]
pub struct SessionApiClient {
    http: Client,
    token: Option<SecretString>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    base_override: Option<String>,
    local: bool,
}

impl SessionApiClient {
    pub fn new() -> Result<Self, SessionApiError> {
        Self::with_options(None, SessionApiClientOptions::default())
    }

    pub fn with_token(token: SecretString) -> Result<Self, SessionApiError> {
        Self::with_options(Some(token), SessionApiClientOptions::default())
    }

    pub fn with_options(
        token: Option<SecretString>,
        options: SessionApiClientOptions,
    ) -> Result<Self, SessionApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(SessionApiError::Transport)?;

        Ok(Self {
            http,
            token,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            base_override: None,
            local: false,
        })
    }

    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit base URL, taking precedence over local mode.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_override = Some(base_url.trim().trim_end_matches('/').to_string());
        self
    }

    /// Fetches the currently authenticated user.
    pub async fn current_user(&self) -> Result<CurrentUser, SessionApiError> {
        let endpoint = self.endpoint("/v1/me");
        let policy = self.retry_policy.clone();

        retry_async(
            &policy,
            |_| {
                let endpoint = endpoint.clone();
                async move { self.fetch_attempt(&endpoint).await }
            },
            SessionApiError::is_retryable,
        )
        .await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    fn base_url(&self) -> &str {
        if let Some(base) = self.base_override.as_deref() {
            return base;
        }
        if self.local {
            LOCAL_SESSION_API_BASE_URL
        } else {
            SESSION_API_BASE_URL
        }
    }

    async fn fetch_attempt(&self, endpoint: &str) -> Result<CurrentUser, SessionApiError> {
        let mut builder = self.http.get(endpoint).timeout(self.attempt_timeout);

        if let Some(token) = self.token.as_ref() {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let response = builder.send().await.map_err(SessionApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(SessionApiError::Transport)?;

        if !status.is_success() {
            return Err(SessionApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        parse_current_user_response(&body)
    }
}

/// Authenticated user as reported by the session endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CurrentUser {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Errors produced by the session endpoint client.
#[derive(Debug, Error)]
pub enum SessionApiError {
    /// Request failed at the transport level.
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    /// Non-success HTTP status.
    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Response body did not match any supported schema.
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl SessionApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }

    /// Whether the failure means "no authenticated session" rather than an
    /// operational problem.
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            Self::HttpStatus { status, .. }
                if *status == StatusCode::UNAUTHORIZED
                    || *status == StatusCode::FORBIDDEN
                    || status.as_u16() == 419
        )
    }
}

#[derive(Debug, Deserialize)]
struct WrappedUserResponse {
    data: CurrentUser,
}

fn parse_current_user_response(body: &str) -> Result<CurrentUser, SessionApiError> {
    if let Ok(wrapped) = serde_json::from_str::<WrappedUserResponse>(body) {
        return Ok(wrapped.data);
    }

    if let Ok(bare) = serde_json::from_str::<CurrentUser>(body) {
        return Ok(bare);
    }

    Err(SessionApiError::Parse(
        "response did not match any supported schema".to_string(),
    ))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

/// Asynchronous session check consumed by the realtime client once per
/// connection attempt, before the transport is opened.
#[async_trait]
pub trait SessionCheck: Send + Sync {
    async fn is_authenticated(&self) -> bool;
}

#[async_trait]
impl SessionCheck for SessionApiClient {
    /// `true` only when the session endpoint resolves a current user.
    ///
    /// Auth rejections and transport failures both report `false`; the
    /// realtime subsystem skips the connection attempt rather than surface
    /// collaborator errors.
    async fn is_authenticated(&self) -> bool {
        match self.current_user().await {
            Ok(_) => true,
            Err(err) if err.is_unauthenticated() => {
                debug!(event = "session_check_unauthenticated");
                false
            }
            Err(err) => {
                debug!(event = "session_check_failed", error = %err);
                false
            }
        }
    }
}
