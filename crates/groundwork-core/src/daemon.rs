//! Healthcheck request handler.
//!
//! Transport agnostic: takes the raw request body, returns a status code and a
//! JSON body. The report is returned with 200 even when checks failed; only
//! malformed requests and engine errors map to error statuses.

use http::StatusCode;
use serde_json::{json, Value};
use tracing::{info, warn};

use groundwork_api::{HealthcheckRequest, OrchestrationError, RunContext, Selector};

use crate::engine::Engine;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthcheckResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl HealthcheckResponse {
    fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }
}

/// Handle one `{runner, fix}` healthcheck request.
pub async fn handle_healthcheck(engine: &Engine, ctx: &RunContext, body: &[u8]) -> HealthcheckResponse {
    let req: HealthcheckRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return HealthcheckResponse::error(StatusCode::BAD_REQUEST, format!("failed to decode request: {e}")),
    };

    let runner: Selector = match req.runner.parse() {
        Ok(s) => s,
        Err(e) => return HealthcheckResponse::error(StatusCode::BAD_REQUEST, format!("runner: {e}")),
    };

    info!(runner = %runner, fix = req.fix, "handling healthcheck request");

    match engine.healthcheck(ctx, &runner, req.fix).await {
        Ok(Some(report)) => match serde_json::to_value(&report) {
            Ok(body) => HealthcheckResponse {
                status: StatusCode::OK,
                body,
            },
            Err(e) => HealthcheckResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Ok(None) => HealthcheckResponse::error(
            StatusCode::BAD_REQUEST,
            format!("runner {runner} does not support healthchecks"),
        ),
        Err(e @ OrchestrationError::UnknownSelector(_)) => {
            HealthcheckResponse::error(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            warn!(runner = %runner, error = %e, "healthcheck errored");
            HealthcheckResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::config::EnvConfig;
    use crate::fakes::FakeRunner;
    use crate::healthcheck::{checker, fixer, CheckOutcome, Healthcheck};
    use crate::registry::Registry;

    fn engine_with(runner: FakeRunner) -> (Engine, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::new();
        reg.register_runner(Arc::new(runner));
        (Engine::new(Arc::new(reg), EnvConfig::new(tmp.path())), tmp)
    }

    fn failing_check(fixes: Arc<AtomicUsize>) -> Healthcheck {
        let mut hc = Healthcheck::new();
        hc.enlist_with_fix(
            "outputs-dir",
            checker(|| async { Ok(CheckOutcome::failed("directory missing")) }),
            fixer(move || {
                let fixes = fixes.clone();
                async move {
                    fixes.fetch_add(1, Ordering::SeqCst);
                    Ok("directory created.".to_string())
                }
            }),
        );
        hc
    }

    #[tokio::test]
    async fn test_malformed_request_is_400() {
        let (engine, _tmp) = engine_with(FakeRunner::new("local:exec", &["exec"]));
        let resp = handle_healthcheck(&engine, &RunContext::new("hc"), b"{not json").await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert!(resp.body["error"].as_str().unwrap().contains("decode"));
    }

    #[tokio::test]
    async fn test_unknown_runner_is_400() {
        let (engine, _tmp) = engine_with(FakeRunner::new("local:exec", &["exec"]));
        let resp = handle_healthcheck(
            &engine,
            &RunContext::new("hc"),
            br#"{"runner": "cluster:k8s"}"#,
        )
        .await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert_eq!(resp.body["error"], "unknown runner: cluster:k8s");
    }

    #[tokio::test]
    async fn test_runner_without_healthcheck_is_400() {
        let (engine, _tmp) = engine_with(FakeRunner::new("local:exec", &["exec"]));
        let resp = handle_healthcheck(
            &engine,
            &RunContext::new("hc"),
            br#"{"runner": "local:exec"}"#,
        )
        .await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_failed_checks_still_return_report() {
        let fixes = Arc::new(AtomicUsize::new(0));
        let runner = FakeRunner::new("local:exec", &["exec"]).with_healthcheck(failing_check(fixes.clone()));
        let (engine, _tmp) = engine_with(runner);

        let resp = handle_healthcheck(
            &engine,
            &RunContext::new("hc"),
            br#"{"runner": "local:exec"}"#,
        )
        .await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body["checks"][0]["status"], "failed");
        assert_eq!(resp.body["fixes"][0]["status"], "omitted");
        assert_eq!(fixes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_canceled_engine_is_500() {
        let runner = FakeRunner::new("local:exec", &["exec"])
            .with_healthcheck(failing_check(Arc::new(AtomicUsize::new(0))));
        let (engine, _tmp) = engine_with(runner);
        let ctx = RunContext::new("hc");
        ctx.cancel();

        let resp = handle_healthcheck(&engine, &ctx, br#"{"runner": "local:exec", "fix": true}"#).await;
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
