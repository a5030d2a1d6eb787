//! Bounded polling
//!
//! Every suspension point of the engine (master readiness, kubelet version
//! convergence) is a fixed-interval poll with its own overall timeout.

use crate::error::{CloudError, Result};
use crate::kube::KubeClient;
use fleetforge_core::{KubeVersion, ROLE_MASTER_LABEL};
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Fixed interval and overall deadline for one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Polls `check` until it returns `Ok(true)`.
///
/// `Ok(false)` means "not yet"; an `Err` is fatal and ends the wait
/// immediately. Closures map transient failures to `Ok(false)`.
pub async fn poll_until<F, Fut>(what: &str, config: &PollConfig, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + config.timeout;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if check().await? {
            tracing::debug!(what, attempt, "condition met");
            return Ok(());
        }
        if Instant::now() + config.interval > deadline {
            return Err(CloudError::Timeout(format!(
                "{what} after {}s",
                config.timeout.as_secs()
            )));
        }
        tracing::debug!(what, attempt, "waiting");
        sleep(config.interval).await;
    }
}

/// Waits for the API server to answer and every control-plane component to report healthy.
pub async fn wait_for_ready_master(client: &dyn KubeClient, config: &PollConfig) -> Result<()> {
    poll_until("waiting for the API server", config, move || async move {
        match client.probe().await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::debug!("API server not reachable yet: {e}");
                Ok(false)
            }
        }
    })
    .await?;

    poll_until("waiting for control-plane components", config, move || async move {
        match client.component_statuses().await {
            Ok(statuses) if !statuses.is_empty() => {
                let unhealthy: Vec<_> = statuses
                    .iter()
                    .filter(|c| !c.healthy)
                    .map(|c| c.name.as_str())
                    .collect();
                if !unhealthy.is_empty() {
                    tracing::debug!(?unhealthy, "components not healthy yet");
                }
                Ok(unhealthy.is_empty())
            }
            Ok(_) => Ok(false),
            Err(e) => {
                tracing::debug!("component statuses unavailable: {e}");
                Ok(false)
            }
        }
    })
    .await
}

/// Waits until the single master's kubelet reports `desired`.
pub async fn wait_for_master_version(
    client: &dyn KubeClient,
    desired: &KubeVersion,
    config: &PollConfig,
) -> Result<()> {
    let what = format!("waiting for master to report {desired}");
    poll_until(&what, config, move || async move {
        let masters = match client.list_nodes(ROLE_MASTER_LABEL).await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::debug!("listing masters failed: {e}");
                return Ok(false);
            }
        };
        match masters.as_slice() {
            [master] => Ok(KubeVersion::parse(&master.kubelet_version)
                .map(|v| &v == desired)
                .unwrap_or(false)),
            [] => Ok(false),
            _ => Err(CloudError::Topology("multiple master found".to_string())),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_succeeds_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let config = PollConfig::new(Duration::from_secs(1), Duration::from_secs(10));

        tokio_test::assert_ok!(
            poll_until("counter", &config, move || {
                let counter = counter.clone();
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
            })
            .await
        );

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let config = PollConfig::new(Duration::from_secs(2), Duration::from_secs(5));
        let err = poll_until("never", &config, || async { Ok(false) })
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_stops_on_fatal_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let config = PollConfig::default();

        let err = poll_until("fatal", &config, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(CloudError::Topology("no master found".to_string())) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, CloudError::Topology(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
