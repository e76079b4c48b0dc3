use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One test outcome as reported by a task-local incremental runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
    Timeout,
    Oom,
    Error,
}

/// Which of the three pipeline phases an event pertains to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Copy,
    Build,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Start,
    Pass,
    Fail,
}

/// The events emitted on the SSE transport, in the order enumerated in
/// SPEC_FULL.md §4.6. `#[serde(tag = "type")]` gives each a discriminant
/// field consumers can match on without a separate `event:` line lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RequestId {
        submission_id: String,
    },
    Phase {
        phase: Phase,
        project_id: String,
        status: PhaseStatus,
    },
    Error {
        phase: Option<Phase>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    TestResult {
        test_id: String,
        status: TestStatus,
        ordinal: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Summary {
        total: u32,
        passed: u32,
        failed: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        oom: Option<u32>,
    },
    Done {
        success: bool,
    },
}

impl OrchestratorEvent {
    /// The SSE `event:` name to pair with this payload's `data:` line.
    pub fn event_name(&self) -> &'static str {
        match self {
            OrchestratorEvent::RequestId { .. } => "request_id",
            OrchestratorEvent::Phase { .. } => "phase",
            OrchestratorEvent::Error { .. } => "error",
            OrchestratorEvent::TestResult { .. } => "test_result",
            OrchestratorEvent::Summary { .. } => "summary",
            OrchestratorEvent::Done { .. } => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, OrchestratorEvent::Done { .. })
    }
}

pub fn now_iso8601() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_event_serializes_with_tag() {
        let ev = OrchestratorEvent::Phase {
            phase: Phase::Build,
            project_id: "demo".into(),
            status: PhaseStatus::Start,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"phase\""));
        assert!(json.contains("\"phase\":\"build\""));
        assert!(json.contains("\"status\":\"start\""));
    }

    #[test]
    fn done_event_round_trips() {
        let ev = OrchestratorEvent::Done { success: false };
        let json = serde_json::to_string(&ev).unwrap();
        let back: OrchestratorEvent = serde_json::from_str(&json).unwrap();
        assert!(back.is_done());
        assert_eq!(ev.event_name(), "done");
    }

    #[test]
    fn test_result_omits_absent_optionals() {
        let ev = OrchestratorEvent::TestResult {
            test_id: "a".into(),
            status: TestStatus::Pass,
            ordinal: 1,
            total: None,
            message: None,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("\"total\""));
        assert!(!json.contains("\"message\""));
    }
}
