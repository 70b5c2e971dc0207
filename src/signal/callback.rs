//! Outbound callback delivery.
//!
//! POSTs a JSON body to a caller-supplied URL with bounded redirects and
//! optional basic auth. HTTPS only unless configured otherwise. Failures are
//! reported to the caller (`post`) or logged (`notify`); nothing is retried
//! here, re-sending is the sender's job.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::CallbackConfig;
use crate::error::SignalError;

#[derive(Clone)]
pub struct CallbackClient {
    http: reqwest::Client,
    username: Option<String>,
    password: Option<Arc<SecretString>>,
    allow_http: bool,
}

impl CallbackClient {
    pub fn new(config: &CallbackConfig) -> Result<Self, SignalError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .danger_accept_invalid_certs(config.insecure)
            .https_only(!config.allow_http)
            .timeout(config.timeout)
            .build()
            .map_err(|e| SignalError::Callback {
                url: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        if config.insecure {
            warn!("Callback TLS certificate verification is disabled");
        }

        Ok(Self {
            http,
            username: config.username.clone(),
            password: config.password.clone().map(Arc::new),
            allow_http: config.allow_http,
        })
    }

    /// POST `body` to `url`. Non-2xx responses are errors.
    pub async fn post(&self, url: &str, body: &Value) -> Result<(), SignalError> {
        let fail = |reason: String| SignalError::Callback {
            url: url.to_string(),
            reason,
        };

        if !self.allow_http && !url.starts_with("https://") {
            return Err(fail("only https callback URLs are allowed".into()));
        }

        let mut request = self.http.post(url).json(body);
        if let Some(user) = &self.username {
            request = request.basic_auth(
                user,
                self.password.as_ref().map(|p| p.expose_secret().to_string()),
            );
        }

        let response = request.send().await.map_err(|e| fail(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(fail(format!("HTTP {status}: {}", text.trim())));
        }

        debug!(url, status = status.as_u16(), "Callback delivered");
        Ok(())
    }

    /// Fire-and-forget variant of `post`: failures are logged, not returned.
    pub async fn notify(&self, url: &str, body: &Value) {
        if let Err(e) = self.post(url, body).await {
            warn!(url, error = %e, "Callback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn plain_http_is_refused_by_default() {
        let client = CallbackClient::new(&CallbackConfig::default()).unwrap();
        let err = client
            .post("http://127.0.0.1:9/signals/x", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::Callback { ref reason, .. } if reason.contains("https")));
    }

    #[tokio::test]
    async fn unreachable_target_is_reported_not_retried() {
        let config = CallbackConfig {
            allow_http: true,
            timeout: std::time::Duration::from_secs(2),
            ..CallbackConfig::default()
        };
        let client = CallbackClient::new(&config).unwrap();
        // Port 9 (discard) is closed on test hosts.
        let err = client
            .post("http://127.0.0.1:9/signals/x", &json!({"a": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::Callback { .. }));

        // `notify` swallows the same failure.
        client.notify("http://127.0.0.1:9/signals/x", &json!({})).await;
    }
}
