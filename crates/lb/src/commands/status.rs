// Query every configured runner's status once

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::join_all;
use serde::Serialize;
use switchyard_placement::prelude::*;
use tracing::warn;

use crate::config::LbConfig;

#[derive(Debug, Serialize)]
struct RunnerReport {
    address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<RunnerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn run(
    config: &LbConfig,
    factory: Arc<dyn RunnerFactory>,
    timeout: Duration,
) -> Result<()> {
    if config.runner_addresses.is_empty() {
        bail!("No runners configured; set RUNNER_ADDRESSES or pass --runners");
    }

    let reports = join_all(
        config
            .runner_addresses
            .iter()
            .map(|address| query_runner(factory.as_ref(), address, timeout)),
    )
    .await;

    println!("{}", serde_json::to_string_pretty(&reports)?);

    let unhealthy = reports
        .iter()
        .filter(|r| !r.status.as_ref().is_some_and(RunnerStatus::is_healthy))
        .count();
    if unhealthy > 0 {
        bail!("{} of {} runners unhealthy", unhealthy, reports.len());
    }
    Ok(())
}

async fn query_runner(
    factory: &dyn RunnerFactory,
    address: &str,
    timeout: Duration,
) -> RunnerReport {
    let report = |status, error| RunnerReport {
        address: address.to_string(),
        status,
        error,
    };

    let runner = match factory.build(address).await {
        Ok(runner) => runner,
        Err(e) => return report(None, Some(e.to_string())),
    };

    let ctx = CallContext::with_timeout_from_now(timeout);
    let result = runner.status(&ctx).await;
    if let Err(e) = runner
        .close(&CallContext::with_timeout_from_now(timeout))
        .await
    {
        warn!(runner = %address, error = %e, "Failed to close runner");
    }

    match result {
        Ok(status) => {
            let error = (!status.is_healthy())
                .then(|| status.error_str.clone().unwrap_or_else(|| status.details.clone()));
            report(Some(status), error)
        }
        Err(e) => report(None, Some(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Runner whose close always fails
    struct StubRunner {
        address: String,
        failed: bool,
    }

    #[async_trait]
    impl Runner for StubRunner {
        async fn try_exec(
            &self,
            _ctx: &CallContext,
            _call: &dyn RunnerCall,
        ) -> Result<TryOutcome, RunnerError> {
            Ok(TryOutcome::Declined)
        }

        async fn status(&self, _ctx: &CallContext) -> Result<RunnerStatus, RunnerError> {
            Ok(RunnerStatus {
                active_request_count: 1,
                status_failed: self.failed,
                details: "disk full".to_string(),
                ..Default::default()
            })
        }

        async fn close(&self, _ctx: &CallContext) -> Result<(), RunnerError> {
            Err(RunnerError::Protocol("drain interrupted".to_string()))
        }

        fn address(&self) -> &str {
            &self.address
        }
    }

    struct StubFactory;

    #[async_trait]
    impl RunnerFactory for StubFactory {
        async fn build(&self, address: &str) -> Result<Arc<dyn Runner>, FactoryError> {
            match address {
                "sick:1" | "ok:1" => Ok(Arc::new(StubRunner {
                    address: address.to_string(),
                    failed: address == "sick:1",
                })),
                _ => Err(FactoryError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                ))),
            }
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_close_failure_keeps_status() {
        let report = query_runner(&StubFactory, "ok:1", Duration::from_secs(1)).await;

        assert_eq!(report.address, "ok:1");
        assert_eq!(report.status.map(|s| s.active_request_count), Some(1));
        assert_eq!(report.error, None);
    }

    #[tokio::test]
    async fn test_unhealthy_and_unreachable_reports() {
        let sick = query_runner(&StubFactory, "sick:1", Duration::from_secs(1)).await;
        assert_eq!(sick.error.as_deref(), Some("disk full"));
        assert!(sick.status.is_some());

        let down = query_runner(&StubFactory, "down:1", Duration::from_secs(1)).await;
        assert!(down.status.is_none());
        assert!(down.error.is_some_and(|e| e.contains("refused")));
    }

    #[tokio::test]
    async fn test_run_fails_when_any_runner_unhealthy() {
        let config = LbConfig {
            runner_addresses: vec!["ok:1".to_string(), "down:1".to_string()],
            ..Default::default()
        };
        let err = run(&config, Arc::new(StubFactory), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "1 of 2 runners unhealthy");

        assert!(run(&LbConfig::default(), Arc::new(StubFactory), Duration::from_secs(1))
            .await
            .is_err());
    }
}
