//! Liveness probing of tool servers over HTTP.
//!
//! Liveness here means "the process answers on its advertised endpoint", not
//! "the process speaks the protocol correctly": an SSE endpoint that rejects
//! a bare `GET` with a server error is still alive.

use crate::config::HealthSettings;
use async_trait::async_trait;
use std::time::Duration;

/// Reachability check against a server's advertised endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns `true` if the server at `host:port` answered in time.
    ///
    /// Must never take longer than the implementation's configured timeout.
    async fn probe(&self, host: &str, port: u16) -> bool;
}

/// `GET http://{host}:{port}{path}` with a hard timeout.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
    timeout: Duration,
    alive_statuses: Vec<u16>,
}

impl HttpProbe {
    /// Builds a probe from health settings.
    pub fn new(settings: &HealthSettings) -> Self {
        let timeout = settings.timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            // each probe opens a fresh connection; an SSE stream must not linger in a pool
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_default();

        let path = if settings.path.starts_with('/') {
            settings.path.clone()
        } else {
            format!("/{}", settings.path)
        };

        Self {
            client,
            path,
            timeout,
            alive_statuses: settings.alive_statuses.clone(),
        }
    }

    /// The URL probed for `host:port`.
    pub fn url(&self, host: &str, port: u16) -> String {
        format!("http://{}:{}{}", host, port, self.path)
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(&HealthSettings::default())
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, host: &str, port: u16) -> bool {
        let url = self.url(host, port);
        let request = self.client.get(&url).send();

        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                let alive = self.alive_statuses.contains(&status);
                tracing::trace!(url = %url, status, alive, "Health probe answered");
                alive
            }
            Ok(Err(e)) => {
                tracing::trace!(url = %url, error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                tracing::trace!(url = %url, "Health probe timed out");
                false
            }
        }
    }
}
