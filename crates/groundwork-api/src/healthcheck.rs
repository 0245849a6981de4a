//! Healthcheck report types and the trait runners expose for preflight checks.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::RunContext;
use crate::error::HealthcheckEngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthcheckStatus {
    /// The check passed, or the fix was applied.
    Ok,
    /// The check ran and failed, or the fix errored.
    Failed,
    /// The check could not complete.
    Aborted,
    /// The fix was skipped.
    Omitted,
    /// No fix was needed because the check passed.
    Unnecessary,
}

impl fmt::Display for HealthcheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthcheckStatus::Ok => "ok",
            HealthcheckStatus::Failed => "failed",
            HealthcheckStatus::Aborted => "aborted",
            HealthcheckStatus::Omitted => "omitted",
            HealthcheckStatus::Unnecessary => "unnecessary",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckItem {
    pub name: String,
    pub status: HealthcheckStatus,
    pub message: String,
}

impl HealthcheckItem {
    pub fn new(name: impl Into<String>, status: HealthcheckStatus, message: impl Into<String>) -> Self {
        HealthcheckItem {
            name: name.into(),
            status,
            message: message.into(),
        }
    }
}

/// Ordered results of a healthcheck pass. Checks appear in registration
/// order; fixes follow the checks that had a fixer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckReport {
    #[serde(default)]
    pub checks: Vec<HealthcheckItem>,
    #[serde(default)]
    pub fixes: Vec<HealthcheckItem>,
}

impl HealthcheckReport {
    /// Every check reported OK.
    pub fn checks_succeeded(&self) -> bool {
        self.checks.iter().all(|c| c.status == HealthcheckStatus::Ok)
    }

    /// No fix reported Failed.
    pub fn fixes_succeeded(&self) -> bool {
        self.fixes.iter().all(|f| f.status != HealthcheckStatus::Failed)
    }

    pub fn has_aborted(&self) -> bool {
        self.checks.iter().any(|c| c.status == HealthcheckStatus::Aborted)
    }
}

impl fmt::Display for HealthcheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "checks:")?;
        for c in &self.checks {
            writeln!(f, "  {}: {} ({})", c.name, c.status, c.message)?;
        }
        if self.fixes.is_empty() {
            return write!(f, "no fixes");
        }
        write!(f, "fixes:")?;
        for x in &self.fixes {
            write!(f, "\n  {}: {} ({})", x.name, x.status, x.message)?;
        }
        Ok(())
    }
}

/// Body of a healthcheck request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckRequest {
    pub runner: String,
    #[serde(default)]
    pub fix: bool,
}

/// Something that can verify (and optionally repair) its own prerequisites.
#[async_trait]
pub trait Healthchecker: Send + Sync {
    /// Run the checks, applying fixes if `fix` is set. Implementations may
    /// memoize: a second call returns the first report.
    async fn healthcheck(
        &self,
        ctx: &RunContext,
        fix: bool,
    ) -> Result<HealthcheckReport, HealthcheckEngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use HealthcheckStatus as S;

    #[test]
    fn test_report_predicates() {
        let report = HealthcheckReport {
            checks: vec![
                HealthcheckItem::new("dirs", S::Ok, "present"),
                HealthcheckItem::new("daemon", S::Failed, "not running"),
            ],
            fixes: vec![
                HealthcheckItem::new("dirs", S::Unnecessary, ""),
                HealthcheckItem::new("daemon", S::Omitted, "fix not requested"),
            ],
        };
        assert!(!report.checks_succeeded());
        assert!(report.fixes_succeeded());
        assert!(!report.has_aborted());

        let text = report.to_string();
        assert!(text.contains("daemon: failed (not running)"));
        assert!(text.contains("dirs: unnecessary"));
    }

    #[test]
    fn test_status_wire_names() {
        let item = HealthcheckItem::new("x", S::Unnecessary, "m");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["status"], "unnecessary");

        let req: HealthcheckRequest = serde_json::from_str(r#"{"runner":"local:exec"}"#).unwrap();
        assert!(!req.fix);
    }
}
