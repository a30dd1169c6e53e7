//! HTTP client for job status callbacks.

use rmbg_types::{CallbackNotice, CallbackSpec};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("callback endpoint returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

/// Deployment-wide callback settings. A job's own callback spec overrides url and token.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            auth_token: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl CallbackConfig {
    /// `CALLBACK_ENABLED`, `CALLBACK_URL`, `CALLBACK_AUTH_TOKEN`, `CALLBACK_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let enabled = std::env::var("CALLBACK_ENABLED")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(true);
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let timeout = std::env::var("CALLBACK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        Self {
            enabled,
            url: non_empty("CALLBACK_URL"),
            auth_token: non_empty("CALLBACK_AUTH_TOKEN"),
            timeout,
        }
    }

    /// Callbacks switched off for the whole deployment.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Best-effort notifier: one bounded POST per status transition, no retry.
pub struct CallbackClient {
    client: reqwest::Client,
    config: CallbackConfig,
}

impl CallbackClient {
    pub fn new(config: CallbackConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &CallbackConfig {
        &self.config
    }

    /// Send `notice` to the job's callback url (or the deployment url).
    ///
    /// Returns `true` only on a 2xx answer. Returns `false` without any network I/O when
    /// callbacks are disabled or no url is configured. Failures are logged, never raised.
    pub async fn notify(&self, notice: &CallbackNotice, target: Option<&CallbackSpec>) -> bool {
        let url = target
            .map(|t| t.url.as_str())
            .filter(|u| !u.is_empty())
            .or(self.config.url.as_deref());
        let url = match url {
            Some(u) if self.config.enabled => u,
            _ => {
                tracing::info!(
                    task_id = %notice.task_id,
                    status = %notice.status,
                    "callbacks disabled or url not configured"
                );
                return false;
            }
        };
        let token = target
            .and_then(|t| t.auth_token.as_deref())
            .or(self.config.auth_token.as_deref());
        let body = notice.to_body(target.and_then(|t| t.custom_data.as_ref()));

        tracing::info!(task_id = %notice.task_id, status = %notice.status, url, "sending callback");
        match self.send(url, token, &body).await {
            Ok(()) => {
                tracing::info!(task_id = %notice.task_id, "callback delivered");
                true
            }
            Err(e) => {
                tracing::error!(task_id = %notice.task_id, url, error = %e, "callback delivery failed");
                false
            }
        }
    }

    async fn send(
        &self,
        url: &str,
        token: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<(), DeliveryError> {
        let mut req = self.client.post(url).json(body);
        if let Some(token) = token {
            req = req.header(reqwest::header::AUTHORIZATION, authorization_value(token));
        }
        let res = req.send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(DeliveryError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Tokens given with their scheme ("Bearer abc") are sent verbatim.
fn authorization_value(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed
        .get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("bearer "))
    {
        trimmed.to_string()
    } else {
        format!("Bearer {}", trimmed)
    }
}
