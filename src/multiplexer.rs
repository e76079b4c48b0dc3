use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::Sender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::event::{OrchestratorEvent, TestStatus};
use crate::models::{PhaseVerdict, TestSummary, VerdictStatus};
use crate::process::{terminate_guarded, ChildGuard};

/// What the Multiplexer hands the transport layer. Keep-alive is
/// content-free (SPEC_FULL.md §4.6) so it is not an `OrchestratorEvent`.
pub enum StreamSignal {
    Event(OrchestratorEvent),
    KeepAlive,
}

enum LineKind {
    TestCount(u32),
    TestResult {
        test_id: String,
        status: TestStatus,
        message: Option<String>,
    },
    Summary(TestSummary),
    SelectionError(String),
    Ignored,
}

fn parse_incremental_line(line: &str) -> LineKind {
    let v: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return LineKind::Ignored,
    };

    if let Some(err_msg) = v.get("error").and_then(Value::as_str) {
        let lower = err_msg.to_lowercase();
        if lower.contains("not unique") || lower.contains("not found") {
            return LineKind::SelectionError(err_msg.to_string());
        }
        return LineKind::Ignored;
    }

    if v.get("summary").and_then(Value::as_bool).unwrap_or(false) {
        return LineKind::Summary(TestSummary {
            total: v.get("total").and_then(Value::as_u64).unwrap_or(0) as u32,
            passed: v.get("passed").and_then(Value::as_u64).unwrap_or(0) as u32,
            failed: v.get("failed").and_then(Value::as_u64).unwrap_or(0) as u32,
            timeout: v.get("timeout").and_then(Value::as_u64).unwrap_or(0) as u32,
            oom: v.get("oom").and_then(Value::as_u64).unwrap_or(0) as u32,
        });
    }

    if let Some(count) = v.get("test_count").and_then(Value::as_u64) {
        return LineKind::TestCount(count as u32);
    }

    if let Some(test_name) = v.get("test_name").and_then(Value::as_str) {
        let status = match v.get("status").and_then(Value::as_str).unwrap_or("pass") {
            "pass" => TestStatus::Pass,
            "fail" => TestStatus::Fail,
            "timeout" => TestStatus::Timeout,
            "oom" => TestStatus::Oom,
            _ => TestStatus::Error,
        };
        let message = v.get("message").and_then(Value::as_str).map(String::from);
        return LineKind::TestResult {
            test_id: test_name.to_string(),
            status,
            message,
        };
    }

    LineKind::Ignored
}

/// One test outcome parsed out of a fully-buffered incremental-runner
/// output blob, used by the Pipeline Driver's buffered test-phase path.
pub(crate) struct BufferedOutcome {
    pub test_id: String,
    pub status: TestStatus,
    pub message: Option<String>,
}

/// Parses JSONL output captured in one pass after the incremental runner
/// has already exited (SPEC_FULL.md §4.4's buffered fallback for the
/// incremental runner). Shares line semantics with `run_streaming_tests`.
pub(crate) fn parse_buffered_incremental_output(
    output: &str,
) -> (Vec<BufferedOutcome>, Option<TestSummary>, Option<String>) {
    let mut outcomes = Vec::new();
    let mut summary = None;
    let mut selection_error = None;
    let mut total: Option<u32> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_incremental_line(line) {
            LineKind::TestCount(n) => total = Some(n),
            LineKind::TestResult { test_id, status, message } => {
                let _ = total;
                outcomes.push(BufferedOutcome { test_id, status, message });
            }
            LineKind::Summary(s) => summary = Some(s),
            LineKind::SelectionError(msg) => selection_error = Some(msg),
            LineKind::Ignored => {}
        }
    }

    (outcomes, summary, selection_error)
}

/// Runs the task-local incremental test runner, forwarding each test
/// outcome to `tx` as it's observed, per SPEC_FULL.md §4.3.
///
/// Returns once the child exits, the deadline expires, cancellation is
/// observed, or `tx` is found to be disconnected.
#[allow(clippy::too_many_arguments)]
pub async fn run_streaming_tests(
    argv: &[String],
    cwd: &Path,
    deadline: Duration,
    grace_period: Duration,
    keepalive_interval: Duration,
    cancel_token: &CancellationToken,
    on_spawned: impl FnOnce(u32),
    tx: Sender<StreamSignal>,
) -> Result<PhaseVerdict> {
    if cancel_token.is_cancelled() {
        return Ok(PhaseVerdict::cancelled());
    }

    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| Error::Other("empty argv".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(rest)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(Error::SpawnFailed)?;
    let pid = child
        .id()
        .ok_or_else(|| Error::Other("failed to get child pid".into()))?;
    on_spawned(pid);
    let guard = ChildGuard::new(pid);

    let stdout = child.stdout.take().expect("stdout piped");
    let mut reader = BufReader::new(stdout).lines();

    let deadline_sleep = tokio::time::sleep(deadline);
    tokio::pin!(deadline_sleep);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    let mut last_activity = Instant::now();
    let mut ordinal: u32 = 0;
    let mut total: Option<u32> = None;
    let mut last_summary: Option<TestSummary> = None;
    let mut selection_error: Option<String> = None;

    #[derive(PartialEq)]
    enum Outcome {
        Eof,
        Timeout,
        Cancelled,
        Disconnected,
    }
    let outcome;

    'outer: loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                outcome = Outcome::Cancelled;
                break 'outer;
            }
            _ = &mut deadline_sleep => {
                outcome = Outcome::Timeout;
                break 'outer;
            }
            _ = ticker.tick() => {
                if last_activity.elapsed() >= keepalive_interval {
                    if tx.send(StreamSignal::KeepAlive).await.is_err() {
                        outcome = Outcome::Disconnected;
                        break 'outer;
                    }
                    last_activity = Instant::now();
                }
            }
            line = reader.next_line() => {
                match line {
                    Ok(Some(l)) => {
                        last_activity = Instant::now();
                        if l.trim().is_empty() {
                            continue;
                        }
                        match parse_incremental_line(&l) {
                            LineKind::TestCount(n) => total = Some(n),
                            LineKind::TestResult { test_id, status, message } => {
                                ordinal += 1;
                                let ev = OrchestratorEvent::TestResult {
                                    test_id,
                                    status,
                                    ordinal,
                                    total,
                                    message,
                                };
                                if tx.send(StreamSignal::Event(ev)).await.is_err() {
                                    outcome = Outcome::Disconnected;
                                    break 'outer;
                                }
                            }
                            LineKind::Summary(summary) => {
                                last_summary = Some(summary.clone());
                                let ev = OrchestratorEvent::Summary {
                                    total: summary.total,
                                    passed: summary.passed,
                                    failed: summary.failed,
                                    timeout: Some(summary.timeout),
                                    oom: Some(summary.oom),
                                };
                                if tx.send(StreamSignal::Event(ev)).await.is_err() {
                                    outcome = Outcome::Disconnected;
                                    break 'outer;
                                }
                            }
                            LineKind::SelectionError(msg) => selection_error = Some(msg),
                            LineKind::Ignored => {}
                        }
                    }
                    Ok(None) => {
                        outcome = Outcome::Eof;
                        break 'outer;
                    }
                    Err(_) => {
                        outcome = Outcome::Eof;
                        break 'outer;
                    }
                }
            }
        }
    }

    match outcome {
        Outcome::Cancelled | Outcome::Disconnected => {
            terminate_guarded(&guard, &mut child, grace_period).await;
            Ok(PhaseVerdict::cancelled())
        }
        Outcome::Timeout => {
            terminate_guarded(&guard, &mut child, grace_period).await;
            Ok(PhaseVerdict {
                status: VerdictStatus::Timeout,
                exit_code: -1,
                message: "Timeout".to_string(),
                output: None,
                partial: last_summary.is_some() || ordinal > 0,
            })
        }
        Outcome::Eof => {
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
            if let Some(msg) = selection_error {
                return Ok(PhaseVerdict {
                    status: VerdictStatus::Error,
                    exit_code: -1,
                    message: msg,
                    output: None,
                    partial: false,
                });
            }
            match last_summary {
                Some(summary) => Ok(PhaseVerdict {
                    status: if summary.failed == 0 {
                        VerdictStatus::Pass
                    } else {
                        VerdictStatus::Fail
                    },
                    exit_code: 0,
                    message: format!(
                        "{} passed, {} failed (of {})",
                        summary.passed, summary.failed, summary.total
                    ),
                    output: None,
                    partial: false,
                }),
                None => Ok(PhaseVerdict {
                    status: VerdictStatus::Error,
                    exit_code: -1,
                    message: "runner exited without emitting a summary".to_string(),
                    output: None,
                    partial: false,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_test_count_preamble() {
        match parse_incremental_line(r#"{"test_count": 3}"#) {
            LineKind::TestCount(3) => {}
            _ => panic!("expected TestCount(3)"),
        }
    }

    #[test]
    fn parses_passing_result() {
        match parse_incremental_line(r#"{"test_name": "a", "status": "pass"}"#) {
            LineKind::TestResult { test_id, status: TestStatus::Pass, .. } => {
                assert_eq!(test_id, "a");
            }
            _ => panic!("expected TestResult pass"),
        }
    }

    #[test]
    fn parses_failing_result_with_message() {
        match parse_incremental_line(r#"{"test_name": "b", "status": "fail", "message": "boom"}"#) {
            LineKind::TestResult { test_id, status: TestStatus::Fail, message: Some(m) } => {
                assert_eq!(test_id, "b");
                assert_eq!(m, "boom");
            }
            _ => panic!("expected TestResult fail"),
        }
    }

    #[test]
    fn parses_terminal_summary() {
        match parse_incremental_line(r#"{"summary": true, "total": 3, "passed": 2, "failed": 1}"#) {
            LineKind::Summary(s) => {
                assert_eq!((s.total, s.passed, s.failed), (3, 2, 1));
            }
            _ => panic!("expected Summary"),
        }
    }

    #[test]
    fn classifies_selection_errors() {
        match parse_incremental_line(r#"{"error": "test name 'foo' not found"}"#) {
            LineKind::SelectionError(_) => {}
            _ => panic!("expected SelectionError"),
        }
        match parse_incremental_line(r#"{"error": "test name 'foo' is not unique"}"#) {
            LineKind::SelectionError(_) => {}
            _ => panic!("expected SelectionError"),
        }
    }

    #[test]
    fn buffered_parse_collects_outcomes_and_summary() {
        let output = concat!(
            "{\"test_count\": 2}\n",
            "{\"test_name\": \"a\", \"status\": \"pass\"}\n",
            "{\"test_name\": \"b\", \"status\": \"fail\", \"message\": \"boom\"}\n",
            "{\"summary\": true, \"total\": 2, \"passed\": 1, \"failed\": 1}\n",
        );
        let (outcomes, summary, selection_error) = parse_buffered_incremental_output(output);
        assert_eq!(outcomes.len(), 2);
        assert!(selection_error.is_none());
        let summary = summary.unwrap();
        assert_eq!((summary.total, summary.passed, summary.failed), (2, 1, 1));
    }

    #[test]
    fn ignores_unrecognized_lines() {
        assert!(matches!(parse_incremental_line("not json"), LineKind::Ignored));
        assert!(matches!(parse_incremental_line(r#"{"foo":"bar"}"#), LineKind::Ignored));
    }
}
