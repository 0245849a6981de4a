//! Sequential check/fix engine used as a preflight gate before runs.
//!
//! Checks are enlisted by name, optionally with a fixer, and run strictly in
//! registration order. Outcome mapping per check:
//!
//! | checker returns        | check status |
//! |------------------------|--------------|
//! | `Ok(ok = true)`        | ok           |
//! | `Ok(ok = false)`       | failed       |
//! | `Err(_)`               | aborted      |
//!
//! Fix entries are only recorded for checks that have a fixer:
//!
//! | check   | fix requested | fix entry                          |
//! |---------|---------------|------------------------------------|
//! | ok      | yes           | unnecessary                        |
//! | failed  | no            | omitted                            |
//! | failed  | yes           | ok / failed, from the fixer result |
//! | aborted | yes           | omitted                            |
//!
//! The first report (or engine error) is memoized; later calls return it
//! unchanged whatever `fix` flag they pass.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use groundwork_api::{
    HealthcheckEngineError, HealthcheckItem, HealthcheckReport, HealthcheckStatus, Healthchecker,
    RunContext,
};

/// Result of a checker that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub ok: bool,
    pub message: String,
}

impl CheckOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// A checker or fixer that could not do its job.
#[derive(Debug, thiserror::Error)]
#[error("{message}; error: {source:#}")]
pub struct CheckError {
    pub message: String,
    #[source]
    pub source: anyhow::Error,
}

impl CheckError {
    pub fn new(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self {
            message: message.into(),
            source: source.into(),
        }
    }
}

pub type Checker =
    Box<dyn Fn() -> BoxFuture<'static, Result<CheckOutcome, CheckError>> + Send + Sync>;

pub type Fixer = Box<dyn Fn() -> BoxFuture<'static, Result<String, CheckError>> + Send + Sync>;

/// Wrap an async closure as a [`Checker`].
pub fn checker<F, Fut>(f: F) -> Checker
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CheckOutcome, CheckError>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

/// Wrap an async closure as a [`Fixer`].
pub fn fixer<F, Fut>(f: F) -> Fixer
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, CheckError>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

struct Item {
    name: String,
    checker: Checker,
    fixer: Option<Fixer>,
}

#[derive(Default)]
struct Memo {
    computed: bool,
    report: HealthcheckReport,
    error: Option<HealthcheckEngineError>,
}

/// Registry of named checks with a memoized report.
#[derive(Default)]
pub struct Healthcheck {
    items: Vec<Item>,
    memo: Mutex<Memo>,
}

impl std::fmt::Debug for Healthcheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.items.iter().map(|i| i.name.as_str()).collect();
        f.debug_struct("Healthcheck").field("items", &names).finish()
    }
}

impl Healthcheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a check without a fixer.
    pub fn enlist(&mut self, name: impl Into<String>, checker: Checker) -> &mut Self {
        self.items.push(Item {
            name: name.into(),
            checker,
            fixer: None,
        });
        self
    }

    /// Register a check with a fixer.
    pub fn enlist_with_fix(
        &mut self,
        name: impl Into<String>,
        checker: Checker,
        fixer: Fixer,
    ) -> &mut Self {
        self.items.push(Item {
            name: name.into(),
            checker,
            fixer: Some(fixer),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run every check once. See the module docs for the outcome mapping.
    pub async fn run_checks(
        &self,
        ctx: &RunContext,
        fix: bool,
    ) -> Result<HealthcheckReport, HealthcheckEngineError> {
        let mut memo = self.memo.lock().await;
        if !memo.computed {
            let (report, error) = self.evaluate(ctx, fix).await;
            memo.report = report;
            memo.error = error;
            memo.computed = true;
        }
        match &memo.error {
            Some(e) => Err(e.clone()),
            None => Ok(memo.report.clone()),
        }
    }

    async fn evaluate(
        &self,
        ctx: &RunContext,
        fix: bool,
    ) -> (HealthcheckReport, Option<HealthcheckEngineError>) {
        let mut report = HealthcheckReport::default();

        for item in &self.items {
            let checked = tokio::select! {
                biased;
                _ = ctx.cancelled() => return (report, Some(HealthcheckEngineError::Canceled)),
                r = (item.checker)() => r,
            };

            let (status, message) = match checked {
                Ok(o) if o.ok => (HealthcheckStatus::Ok, o.message),
                Ok(o) => (HealthcheckStatus::Failed, o.message),
                Err(e) => (HealthcheckStatus::Aborted, e.to_string()),
            };
            debug!(check = %item.name, status = %status, message = %message, "healthcheck item");
            report
                .checks
                .push(HealthcheckItem::new(&item.name, status, message));

            let Some(fixer) = &item.fixer else {
                continue;
            };

            let entry = match (status, fix) {
                (HealthcheckStatus::Ok, true) => {
                    HealthcheckItem::new(&item.name, HealthcheckStatus::Unnecessary, "")
                }
                (HealthcheckStatus::Aborted, true) => HealthcheckItem::new(
                    &item.name,
                    HealthcheckStatus::Omitted,
                    "check aborted; fix not attempted",
                ),
                (HealthcheckStatus::Failed, false) => HealthcheckItem::new(
                    &item.name,
                    HealthcheckStatus::Omitted,
                    "fix not requested",
                ),
                (HealthcheckStatus::Failed, true) => {
                    let fixed = tokio::select! {
                        biased;
                        _ = ctx.cancelled() => return (report, Some(HealthcheckEngineError::Canceled)),
                        r = fixer() => r,
                    };
                    match fixed {
                        Ok(msg) => HealthcheckItem::new(&item.name, HealthcheckStatus::Ok, msg),
                        Err(e) => {
                            warn!(check = %item.name, error = %e, "healthcheck fix failed");
                            HealthcheckItem::new(&item.name, HealthcheckStatus::Failed, e.to_string())
                        }
                    }
                }
                _ => continue,
            };
            report.fixes.push(entry);
        }

        (report, None)
    }
}

#[async_trait]
impl Healthchecker for Healthcheck {
    async fn healthcheck(
        &self,
        ctx: &RunContext,
        fix: bool,
    ) -> Result<HealthcheckReport, HealthcheckEngineError> {
        self.run_checks(ctx, fix).await
    }
}

// ---------------------------------------------------------------------------
// Stock checkers and fixers
// ---------------------------------------------------------------------------

/// Passes when `path` is a directory. A missing path fails (a fixer can
/// create it); any other filesystem error, or a non-directory, aborts.
pub fn dir_exists_checker(path: impl Into<PathBuf>) -> Checker {
    let path = path.into();
    checker(move || {
        let path = path.clone();
        async move {
            match tokio::fs::metadata(&path).await {
                Ok(md) if md.is_dir() => Ok(CheckOutcome::ok("directory already exists.")),
                Ok(_) => Err(CheckError::new(
                    "expected directory. found regular file. please fix manually.",
                    anyhow::anyhow!("not a directory: {}", path.display()),
                )),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CheckOutcome::failed(
                    "directory does not exist. can recreate.",
                )),
                Err(e) => Err(CheckError::new("filesystem error. cannot recreate.", e)),
            }
        }
    })
}

/// Creates `path` and any missing parents.
pub fn dir_exists_fixer(path: impl Into<PathBuf>) -> Fixer {
    let path = path.into();
    fixer(move || {
        let path = path.clone();
        async move {
            tokio::fs::create_dir_all(&path)
                .await
                .map(|_| "directory created.".to_string())
                .map_err(|e| CheckError::new("failed to create directory.", e))
        }
    })
}

/// Runs every fixer in order, stopping at the first error.
pub fn all_of(fixers: Vec<Fixer>) -> Fixer {
    let fixers = Arc::new(fixers);
    Box::new(move || {
        let fixers = Arc::clone(&fixers);
        async move {
            let mut messages = Vec::with_capacity(fixers.len());
            for f in fixers.iter() {
                messages.push(f().await?);
            }
            Ok(messages.join("; "))
        }
        .boxed()
    })
}

/// Runs fixers in order until one succeeds; fails with the last error.
pub fn any_of(fixers: Vec<Fixer>) -> Fixer {
    let fixers = Arc::new(fixers);
    Box::new(move || {
        let fixers = Arc::clone(&fixers);
        async move {
            let mut last = None;
            for f in fixers.iter() {
                match f().await {
                    Ok(msg) => return Ok(msg),
                    Err(e) => last = Some(e),
                }
            }
            Err(last.unwrap_or_else(|| {
                CheckError::new("no fixers to try.", anyhow::anyhow!("empty fixer list"))
            }))
        }
        .boxed()
    })
}

// ---------------------------------------------------------------------------
// Gate policy
// ---------------------------------------------------------------------------

/// How the orchestrator treats a runner's healthcheck report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckPolicy {
    /// Run the healthcheck at all.
    pub enabled: bool,
    /// Request fixes for failed checks.
    pub fix: bool,
    pub abort_on_failed_checks: bool,
    pub abort_on_failed_fixes: bool,
    pub abort_on_aborted_checks: bool,
}

impl Default for HealthcheckPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            fix: true,
            abort_on_failed_checks: false,
            abort_on_failed_fixes: true,
            abort_on_aborted_checks: false,
        }
    }
}

impl HealthcheckPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// The reason scheduling must not proceed, if any.
    pub fn rejection(&self, report: &HealthcheckReport) -> Option<String> {
        if self.abort_on_failed_fixes && !report.fixes_succeeded() {
            return Some("healthcheck fixes failed; aborting".to_string());
        }
        if self.abort_on_aborted_checks && report.has_aborted() {
            return Some("healthcheck checks aborted; aborting".to_string());
        }
        if !report.checks_succeeded() {
            if self.abort_on_failed_checks {
                return Some("healthcheck checks failed; aborting".to_string());
            }
            warn!("some healthchecks failed, but continuing");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_checker(calls: Arc<AtomicUsize>, outcome: CheckOutcome) -> Checker {
        checker(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let outcome = outcome.clone();
            async move { Ok(outcome) }
        })
    }

    fn counting_fixer(calls: Arc<AtomicUsize>, result: Result<&'static str, &'static str>) -> Fixer {
        fixer(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                result
                    .map(str::to_string)
                    .map_err(|m| CheckError::new(m, anyhow::anyhow!("fixer exploded")))
            }
        })
    }

    fn aborting_checker() -> Checker {
        checker(|| async {
            Err(CheckError::new(
                "cannot tell",
                anyhow::anyhow!("permission denied"),
            ))
        })
    }

    #[tokio::test]
    async fn test_outcome_mapping_without_fix() {
        let fixes = Arc::new(AtomicUsize::new(0));
        let mut hc = Healthcheck::new();
        hc.enlist("ok", counting_checker(Arc::default(), CheckOutcome::ok("fine")))
            .enlist_with_fix(
                "failing",
                counting_checker(Arc::default(), CheckOutcome::failed("missing")),
                counting_fixer(fixes.clone(), Ok("fixed")),
            )
            .enlist("aborted", aborting_checker())
            .enlist("failing-no-fixer", counting_checker(Arc::default(), CheckOutcome::failed("x")));

        let report = hc.run_checks(&RunContext::new("r"), false).await.unwrap();

        let statuses: Vec<_> = report.checks.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                HealthcheckStatus::Ok,
                HealthcheckStatus::Failed,
                HealthcheckStatus::Aborted,
                HealthcheckStatus::Failed
            ]
        );
        assert_eq!(report.checks[2].message, "cannot tell; error: permission denied");

        assert_eq!(report.fixes.len(), 1);
        assert_eq!(report.fixes[0].name, "failing");
        assert_eq!(report.fixes[0].status, HealthcheckStatus::Omitted);
        assert_eq!(fixes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fix_requested() {
        let fixes = Arc::new(AtomicUsize::new(0));
        let mut hc = Healthcheck::new();
        hc.enlist_with_fix(
            "ok",
            counting_checker(Arc::default(), CheckOutcome::ok("fine")),
            counting_fixer(fixes.clone(), Ok("never")),
        )
        .enlist_with_fix(
            "repairable",
            counting_checker(Arc::default(), CheckOutcome::failed("missing")),
            counting_fixer(fixes.clone(), Ok("recreated")),
        )
        .enlist_with_fix(
            "broken",
            counting_checker(Arc::default(), CheckOutcome::failed("missing")),
            counting_fixer(fixes.clone(), Err("could not recreate")),
        )
        .enlist_with_fix("aborted", aborting_checker(), counting_fixer(fixes.clone(), Ok("no")));

        let report = hc.run_checks(&RunContext::new("r"), true).await.unwrap();

        let fix_statuses: Vec<_> = report.fixes.iter().map(|f| (f.name.as_str(), f.status)).collect();
        assert_eq!(
            fix_statuses,
            vec![
                ("ok", HealthcheckStatus::Unnecessary),
                ("repairable", HealthcheckStatus::Ok),
                ("broken", HealthcheckStatus::Failed),
                ("aborted", HealthcheckStatus::Omitted),
            ]
        );
        assert_eq!(report.fixes[1].message, "recreated");
        assert!(report.fixes[2].message.starts_with("could not recreate"));
        // only the two failed checks invoked their fixers
        assert_eq!(fixes.load(Ordering::SeqCst), 2);
        assert!(!report.fixes_succeeded());
    }

    #[tokio::test]
    async fn test_report_is_memoized() {
        let checks = Arc::new(AtomicUsize::new(0));
        let fixes = Arc::new(AtomicUsize::new(0));
        let mut hc = Healthcheck::new();
        hc.enlist_with_fix(
            "dir",
            counting_checker(checks.clone(), CheckOutcome::failed("missing")),
            counting_fixer(fixes.clone(), Ok("created")),
        );

        let ctx = RunContext::new("r");
        let first = hc.run_checks(&ctx, false).await.unwrap();
        let second = hc.run_checks(&ctx, true).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.fixes[0].status, HealthcheckStatus::Omitted);
        assert_eq!(checks.load(Ordering::SeqCst), 1);
        assert_eq!(fixes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_callers_share_one_evaluation() {
        let checks = Arc::new(AtomicUsize::new(0));
        let mut hc = Healthcheck::new();
        {
            let checks = checks.clone();
            hc.enlist(
                "slow",
                checker(move || {
                    checks.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        Ok(CheckOutcome::ok("fine"))
                    }
                }),
            );
        }
        let hc = Arc::new(hc);

        let spawn = |hc: Arc<Healthcheck>| {
            tokio::spawn(async move { hc.run_checks(&RunContext::new("r"), true).await })
        };
        let (a, b) = tokio::join!(spawn(hc.clone()), spawn(hc.clone()));

        assert_eq!(a.unwrap().unwrap(), b.unwrap().unwrap());
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_is_an_engine_error() {
        let mut hc = Healthcheck::new();
        hc.enlist("ok", counting_checker(Arc::default(), CheckOutcome::ok("fine")));

        let ctx = RunContext::new("r");
        ctx.cancel();
        let err = hc.run_checks(&ctx, true).await.unwrap_err();
        assert_eq!(err, HealthcheckEngineError::Canceled);
        // memoized too
        let again = hc.healthcheck(&RunContext::new("r2"), true).await.unwrap_err();
        assert_eq!(again, HealthcheckEngineError::Canceled);
    }

    #[tokio::test]
    async fn test_dir_checker_and_fixer() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("outputs").join("nested");

        let check = dir_exists_checker(&dir);
        let out = check().await.unwrap();
        assert!(!out.ok);
        assert_eq!(out.message, "directory does not exist. can recreate.");

        let fix = dir_exists_fixer(&dir);
        assert_eq!(fix().await.unwrap(), "directory created.");
        assert!(check().await.unwrap().ok);

        let file = tmp.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let err = dir_exists_checker(&file)().await.unwrap_err();
        assert!(err.to_string().contains("found regular file"));
    }

    #[tokio::test]
    async fn test_fixer_combinators() {
        let calls = Arc::new(AtomicUsize::new(0));
        let all = all_of(vec![
            counting_fixer(calls.clone(), Ok("one")),
            counting_fixer(calls.clone(), Err("two failed")),
            counting_fixer(calls.clone(), Ok("three")),
        ]);
        assert!(all().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let calls = Arc::new(AtomicUsize::new(0));
        let any = any_of(vec![
            counting_fixer(calls.clone(), Err("first failed")),
            counting_fixer(calls.clone(), Ok("second")),
            counting_fixer(calls.clone(), Ok("third")),
        ]);
        assert_eq!(any().await.unwrap(), "second");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(any_of(vec![])().await.is_err());
    }

    #[test]
    fn test_policy_defaults() {
        let policy = HealthcheckPolicy::default();
        let mut report = HealthcheckReport {
            checks: vec![HealthcheckItem::new("a", HealthcheckStatus::Failed, "")],
            fixes: vec![HealthcheckItem::new("a", HealthcheckStatus::Ok, "")],
        };
        assert!(policy.rejection(&report).is_none());

        report.fixes[0].status = HealthcheckStatus::Failed;
        assert!(policy.rejection(&report).is_some());

        let strict = HealthcheckPolicy {
            abort_on_failed_checks: true,
            ..policy
        };
        report.fixes.clear();
        assert!(strict.rejection(&report).is_some());
    }
}
