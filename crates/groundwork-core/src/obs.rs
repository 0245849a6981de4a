//! Structured lifecycle events.
//!
//! Every emitter logs a single event with a stable `event` field so log
//! pipelines can filter on it. Emitters are called inside the run span carried
//! by [`RunContext`](groundwork_api::RunContext), so `run_id` is attached by
//! the span and only repeated where the event is emitted outside it.

use tracing::{info, warn};

use groundwork_api::{HealthcheckReport, Stage};

pub fn emit_build_started(build_id: &str, builder: &str, groups: &[String]) {
    info!(event = "build.started", build_id = %build_id, builder = %builder, groups = ?groups);
}

pub fn emit_build_finished(build_id: &str, duration_ms: u64, cached: bool, success: bool) {
    info!(
        event = "build.finished",
        build_id = %build_id,
        duration_ms = duration_ms,
        cached = cached,
        success = success,
    );
}

pub fn emit_run_started(run_id: &str, plan: &str, case: &str, runner: &str, instances: u32) {
    info!(
        event = "run.started",
        run_id = %run_id,
        plan = %plan,
        case = %case,
        runner = %runner,
        instances = instances,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, outcome: &str, failed: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        outcome = %outcome,
        failed = failed,
    );
}

pub fn emit_healthcheck_evaluated(runner: &str, report: &HealthcheckReport) {
    info!(
        event = "healthcheck.evaluated",
        runner = %runner,
        checks = report.checks.len(),
        checks_succeeded = report.checks_succeeded(),
        fixes_succeeded = report.fixes_succeeded(),
    );
}

pub fn emit_instance_verdict(instance_id: &str, verdict: &str) {
    info!(event = "instance.verdict", instance = %instance_id, verdict = %verdict);
}

/// Warning-level event for a stage that short-circuited the orchestration.
pub fn emit_stage_failed(stage: Stage, error: &dyn std::fmt::Display) {
    warn!(event = "stage.failed", stage = %stage, error = %error);
}
