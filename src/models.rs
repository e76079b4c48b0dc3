use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A request to evaluate one candidate solution for one project.
///
/// `submission_id` is generated server-side (SPEC_FULL.md §4.7 "Request
/// auto-numbering") if the client omits it.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionRequest {
    pub project_id: String,
    #[serde(default)]
    pub submission_id: Option<String>,
    #[serde(default)]
    pub build_timeout_secs: Option<u64>,
    #[serde(default)]
    pub test_timeout_secs: Option<u64>,
    #[serde(default)]
    pub per_test_timeout_secs: Option<u64>,
    #[serde(default)]
    pub test_name: Option<String>,
    #[serde(default)]
    pub test_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub submission_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub submission_id: String,
    pub status: CancelStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStatus {
    Cancelled,
    NoProcess,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pass,
    Fail,
    Error,
    Timeout,
    Cancelled,
}

impl VerdictStatus {
    pub fn is_pass(&self) -> bool {
        matches!(self, VerdictStatus::Pass)
    }
}

/// The outcome of one pipeline phase (build, or test).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseVerdict {
    pub status: VerdictStatus,
    pub exit_code: i32,
    pub message: String,
    /// Captured stdout+stderr, truncated to the configured cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Set when a test-phase timeout preserved a partial summary
    /// (SPEC_FULL.md §4.3, "Timeout with partial results").
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl PhaseVerdict {
    pub fn cancelled() -> Self {
        Self {
            status: VerdictStatus::Cancelled,
            exit_code: -1,
            message: "Cancelled".to_string(),
            output: None,
            partial: false,
        }
    }
}

/// The final, single outcome record for a completed submission
/// (SPEC_FULL.md §3, "Final verdict").
#[derive(Debug, Clone, Serialize)]
pub struct FinalVerdict {
    pub submission_id: String,
    pub project_id: String,
    pub build_verdict: PhaseVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_verdict: Option<PhaseVerdict>,
    pub completed_at: DateTime<Utc>,
}

impl FinalVerdict {
    pub fn success(&self) -> bool {
        self.build_verdict.status.is_pass()
            && self
                .test_verdict
                .as_ref()
                .is_some_and(|v| v.status.is_pass())
    }
}

/// One test outcome parsed from a task-local incremental runner's JSONL
/// output, or synthesized from the generic runner's failure records.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub test_id: String,
    pub status: crate::event::TestStatus,
    pub message: Option<String>,
}

/// Aggregated pass/fail/timeout/oom counts for a test phase.
#[derive(Debug, Clone, Default)]
pub struct TestSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub timeout: u32,
    pub oom: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_verdict_success_requires_both_phases_pass() {
        let build = PhaseVerdict {
            status: VerdictStatus::Pass,
            exit_code: 0,
            message: "ok".into(),
            output: None,
            partial: false,
        };
        let mut verdict = FinalVerdict {
            submission_id: "s1".into(),
            project_id: "demo".into(),
            build_verdict: build.clone(),
            test_verdict: None,
            completed_at: Utc::now(),
        };
        assert!(!verdict.success(), "no test verdict means not successful");

        verdict.test_verdict = Some(PhaseVerdict {
            status: VerdictStatus::Pass,
            ..build.clone()
        });
        assert!(verdict.success());

        verdict.test_verdict = Some(PhaseVerdict {
            status: VerdictStatus::Fail,
            ..build
        });
        assert!(!verdict.success());
    }

    #[test]
    fn cancelled_phase_verdict_is_terminal() {
        let v = PhaseVerdict::cancelled();
        assert_eq!(v.status, VerdictStatus::Cancelled);
        assert_eq!(v.exit_code, -1);
    }
}
