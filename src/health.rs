//! Readiness checks for the remote endpoints a pipeline depends on.

use crate::backoff::BackoffPolicy;
use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::pipeline::Pipeline;
use crate::retry::retry_with_backoff;
use crate::PipelineError;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Checks whether one endpoint is ready to serve.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &str) -> Result<()>;
}

/// Probes `GET {endpoint}/q/health`; any 2xx is healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: Client,
    path: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            path: "/q/health".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            endpoint.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &str) -> Result<()> {
        let url = self.url(endpoint);
        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| PipelineError::TransientFailure(format!("{} unreachable: {}", url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::TransientFailure(format!(
                "{} returned HTTP {}",
                url,
                status.as_u16()
            )));
        }
        Ok(())
    }
}

/// Outcome for one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub healthy: bool,
    pub attempts: u32,
    /// Last failure, for unhealthy endpoints.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    pub endpoints: Vec<EndpointHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.endpoints.iter().all(|e| e.healthy)
    }

    pub fn unhealthy(&self) -> Vec<&str> {
        self.endpoints
            .iter()
            .filter(|e| !e.healthy)
            .map(|e| e.endpoint.as_str())
            .collect()
    }
}

/// Probes endpoints with retries before a run starts.
///
/// ```
/// use pipeline_framework::health::{HealthGate, HttpHealthProbe};
/// use std::sync::Arc;
///
/// let gate = HealthGate::new(Arc::new(HttpHealthProbe::default()));
/// assert_eq!(gate.policy().max_retries, 5);
/// ```
pub struct HealthGate {
    probe: Arc<dyn HealthProbe>,
    policy: BackoffPolicy,
}

impl HealthGate {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            probe,
            policy: BackoffPolicy {
                max_retries: 5,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                jitter: true,
            },
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Probe every endpoint concurrently, each under the retry policy.
    ///
    /// Cancellation or the context deadline aborts the whole check.
    pub async fn check(&self, ctx: &ExecCtx, endpoints: &[String]) -> Result<HealthReport> {
        let probes = endpoints.iter().map(|endpoint| async move {
            let mut attempts = 0;
            let outcome = retry_with_backoff(
                ctx,
                endpoint,
                &self.policy,
                PipelineError::is_retryable,
                |attempt| {
                    attempts = attempt + 1;
                    self.probe.probe(endpoint)
                },
            )
            .await;
            (endpoint, attempts, outcome)
        });

        let mut report = HealthReport::default();
        for (endpoint, attempts, outcome) in join_all(probes).await {
            match outcome {
                Ok(()) => {
                    info!(endpoint = %endpoint, attempts, "endpoint healthy");
                    report.endpoints.push(EndpointHealth {
                        endpoint: endpoint.clone(),
                        healthy: true,
                        attempts,
                        error: None,
                    });
                }
                Err(exhausted) => {
                    if matches!(
                        exhausted.error,
                        PipelineError::Cancelled | PipelineError::DeadlineExceeded
                    ) {
                        return Err(exhausted.error);
                    }
                    warn!(endpoint = %endpoint, attempts = exhausted.attempts, error = %exhausted.error, "endpoint unhealthy");
                    report.endpoints.push(EndpointHealth {
                        endpoint: endpoint.clone(),
                        healthy: false,
                        attempts: exhausted.attempts,
                        error: Some(exhausted.error.to_string()),
                    });
                }
            }
        }
        Ok(report)
    }

    /// [`check`](Self::check) over the endpoints `pipeline`'s steps declare.
    pub async fn check_pipeline(&self, ctx: &ExecCtx, pipeline: &Pipeline) -> Result<HealthReport> {
        self.check(ctx, &pipeline.endpoints()).await
    }

    /// Fail with `TransientFailure` naming every unhealthy endpoint.
    pub async fn ensure_healthy(&self, ctx: &ExecCtx, pipeline: &Pipeline) -> Result<HealthReport> {
        let report = self.check_pipeline(ctx, pipeline).await?;
        if !report.is_healthy() {
            return Err(PipelineError::TransientFailure(format!(
                "unhealthy endpoints: {}",
                report.unhealthy().join(", ")
            )));
        }
        Ok(report)
    }
}

impl std::fmt::Debug for HealthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthGate")
            .field("policy", &self.policy)
            .finish()
    }
}
