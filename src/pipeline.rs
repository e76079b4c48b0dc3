use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::Sender;

use crate::admission::{AdmissionRegistry, AdmitConflict, ChildHandle};
use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::event::{OrchestratorEvent, Phase, PhaseStatus, TestStatus};
use crate::materializer;
use crate::models::{FinalVerdict, PhaseVerdict, SubmissionRequest, TestSummary, VerdictStatus};
use crate::multiplexer::{self, StreamSignal};
use crate::process;

/// What `run_submission` produced: either the submission was never admitted
/// (the caller still owns formatting the conflict response), or it ran to
/// some terminal verdict.
pub enum PipelineOutcome {
    Conflict(AdmitConflict),
    Verdict(FinalVerdict),
}

fn emit(tx: Option<&Sender<StreamSignal>>, event: OrchestratorEvent) {
    if let Some(tx) = tx {
        // A full channel or a dropped receiver both just drop the event;
        // disconnect is detected (and acted on) by the caller, which owns
        // the send that actually blocks (phase/test events further down).
        let _ = tx.try_send(StreamSignal::Event(event));
    }
}

/// Send an event and report whether the subscriber is still there. Used at
/// the points SPEC_FULL.md §5.1 designates as disconnect probes.
async fn emit_probed(tx: &Sender<StreamSignal>, event: OrchestratorEvent) -> bool {
    tx.send(StreamSignal::Event(event)).await.is_ok()
}

/// Drives one submission through `admitted -> materialising -> building ->
/// testing -> completed` (SPEC_FULL.md §4.4). `tx` is `Some` for the SSE
/// transport and `None` for the buffered transport; phase/error events are
/// only emitted when `tx` is set.
pub async fn run_submission(
    config: Arc<HarnessConfig>,
    registry: AdmissionRegistry,
    request: SubmissionRequest,
    tx: Option<Sender<StreamSignal>>,
) -> PipelineOutcome {
    let submission_id = request
        .submission_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let project_id = request.project_id.clone();

    emit(tx.as_ref(), OrchestratorEvent::RequestId {
        submission_id: submission_id.clone(),
    });

    let cancel_token = match registry.try_admit(&project_id, &submission_id).await {
        Ok(token) => token,
        Err(conflict) => {
            let message = match &conflict {
                AdmitConflict::ProjectBusy { active_submission_id } => {
                    format!("project busy: {active_submission_id} is already running")
                }
                AdmitConflict::RequestIdBusy => {
                    "submission id already in use for another project".to_string()
                }
            };
            emit(tx.as_ref(), OrchestratorEvent::Error { phase: None, message, code: None });
            emit(tx.as_ref(), OrchestratorEvent::Done { success: false });
            return PipelineOutcome::Conflict(conflict);
        }
    };

    let verdict = run_admitted(&config, &registry, &submission_id, &request, &cancel_token, tx.as_ref()).await;
    registry.release(&submission_id).await;

    emit(tx.as_ref(), OrchestratorEvent::Done { success: verdict.success() });
    PipelineOutcome::Verdict(verdict)
}

async fn run_admitted(
    config: &HarnessConfig,
    registry: &AdmissionRegistry,
    submission_id: &str,
    request: &SubmissionRequest,
    cancel_token: &tokio_util::sync::CancellationToken,
    tx: Option<&Sender<StreamSignal>>,
) -> FinalVerdict {
    let project_id = request.project_id.clone();
    let client_dir = config.client_data_dir(&project_id);
    let server_dir = config.server_data_dir(&project_id);

    if !client_dir.is_dir() {
        let build_verdict = PhaseVerdict {
            status: VerdictStatus::Error,
            exit_code: -1,
            message: "Project not found".to_string(),
            output: None,
            partial: false,
        };
        if let Some(tx) = tx {
            emit_probed(
                tx,
                OrchestratorEvent::Error {
                    phase: None,
                    message: build_verdict.message.clone(),
                    code: Some(Error::ProjectNotFound(project_id.clone()).code().to_string()),
                },
            )
            .await;
        }
        return FinalVerdict {
            submission_id: submission_id.to_string(),
            project_id,
            build_verdict,
            test_verdict: None,
            completed_at: crate::event::now_iso8601(),
        };
    }

    emit(tx, OrchestratorEvent::Phase {
        phase: Phase::Copy,
        project_id: project_id.clone(),
        status: PhaseStatus::Start,
    });
    {
        let src = client_dir.clone();
        let dst = server_dir.clone();
        let _ = tokio::task::spawn_blocking(move || materializer::materialize(&src, &dst)).await;
    }
    let copy_connected = if let Some(tx) = tx {
        emit_probed(tx, OrchestratorEvent::Phase {
            phase: Phase::Copy,
            project_id: project_id.clone(),
            status: PhaseStatus::Pass,
        })
        .await
    } else {
        true
    };
    if !copy_connected {
        return cancelled_verdict(submission_id, &project_id, None);
    }

    let incremental = materializer::has_incremental_runner(&server_dir, &config.incremental_runner_marker);
    let filters_requested =
        request.per_test_timeout_secs.is_some() || request.test_name.is_some() || request.test_file.is_some();
    if filters_requested && !incremental {
        let build_verdict = PhaseVerdict {
            status: VerdictStatus::Error,
            exit_code: -1,
            message: Error::FiltersUnsupported.to_string(),
            output: None,
            partial: false,
        };
        emit(tx, OrchestratorEvent::Phase {
            phase: Phase::Build,
            project_id: project_id.clone(),
            status: PhaseStatus::Fail,
        });
        if let Some(tx) = tx {
            emit_probed(
                tx,
                OrchestratorEvent::Error {
                    phase: Some(Phase::Build),
                    message: build_verdict.message.clone(),
                    code: Some(Error::FiltersUnsupported.code().to_string()),
                },
            )
            .await;
        }
        return FinalVerdict {
            submission_id: submission_id.to_string(),
            project_id,
            build_verdict,
            test_verdict: None,
            completed_at: crate::event::now_iso8601(),
        };
    }

    emit(tx, OrchestratorEvent::Phase {
        phase: Phase::Build,
        project_id: project_id.clone(),
        status: PhaseStatus::Start,
    });

    let registry_for_build = registry.clone();
    let submission_id_for_build = submission_id.to_string();
    let build_timeout = Duration::from_secs(request.build_timeout_secs.unwrap_or(config.build_timeout_secs));
    let build_verdict = match process::run_supervised(
        &config.build_argv,
        &server_dir,
        build_timeout,
        Duration::from_secs(config.grace_period_secs),
        config.captured_output_cap_bytes,
        cancel_token,
        |pid| {
            let registry = registry_for_build;
            let submission_id = submission_id_for_build;
            tokio::spawn(async move {
                registry.attach_child(&submission_id, Some(ChildHandle { pid })).await;
            });
        },
    )
    .await
    {
        Ok(v) => v,
        Err(e) => PhaseVerdict {
            status: VerdictStatus::Error,
            exit_code: -1,
            message: e.to_string(),
            output: None,
            partial: false,
        },
    };

    let build_connected = if let Some(tx) = tx {
        emit_probed(tx, OrchestratorEvent::Phase {
            phase: Phase::Build,
            project_id: project_id.clone(),
            status: if build_verdict.status.is_pass() { PhaseStatus::Pass } else { PhaseStatus::Fail },
        })
        .await
    } else {
        true
    };
    if !build_connected {
        return cancelled_verdict(submission_id, &project_id, Some(build_verdict));
    }

    if !build_verdict.status.is_pass() {
        if let Some(tx) = tx {
            emit_probed(
                tx,
                OrchestratorEvent::Error {
                    phase: Some(Phase::Build),
                    message: build_verdict.message.clone(),
                    code: None,
                },
            )
            .await;
        }
        return FinalVerdict {
            submission_id: submission_id.to_string(),
            project_id,
            build_verdict,
            test_verdict: None,
            completed_at: crate::event::now_iso8601(),
        };
    }

    emit(tx, OrchestratorEvent::Phase {
        phase: Phase::Test,
        project_id: project_id.clone(),
        status: PhaseStatus::Start,
    });

    let test_verdict = run_test_phase(config, registry, submission_id, request, &server_dir, incremental, cancel_token, tx)
        .await;

    emit(tx, OrchestratorEvent::Phase {
        phase: Phase::Test,
        project_id: project_id.clone(),
        status: if test_verdict.status.is_pass() { PhaseStatus::Pass } else { PhaseStatus::Fail },
    });
    if matches!(test_verdict.status, VerdictStatus::Error | VerdictStatus::Timeout) {
        emit(tx, OrchestratorEvent::Error {
            phase: Some(Phase::Test),
            message: test_verdict.message.clone(),
            code: None,
        });
    }

    FinalVerdict {
        submission_id: submission_id.to_string(),
        project_id,
        build_verdict,
        test_verdict: Some(test_verdict),
        completed_at: crate::event::now_iso8601(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_test_phase(
    config: &HarnessConfig,
    registry: &AdmissionRegistry,
    submission_id: &str,
    request: &SubmissionRequest,
    server_dir: &Path,
    incremental: bool,
    cancel_token: &tokio_util::sync::CancellationToken,
    tx: Option<&Sender<StreamSignal>>,
) -> PhaseVerdict {
    let grace = Duration::from_secs(config.grace_period_secs);
    let registry = registry.clone();
    let submission_id = submission_id.to_string();
    let on_spawned = move |pid: u32| {
        let registry = registry.clone();
        let submission_id = submission_id.clone();
        tokio::spawn(async move {
            registry.attach_child(&submission_id, Some(ChildHandle { pid })).await;
        });
    };

    if incremental && tx.is_some() {
        let test_timeout = Duration::from_secs(
            request.test_timeout_secs.unwrap_or(config.incremental_test_timeout_secs),
        );
        let argv = build_incremental_argv(config, request);
        let keepalive = Duration::from_secs(config.sse_keepalive_interval_secs);
        return match multiplexer::run_streaming_tests(
            &argv,
            server_dir,
            test_timeout,
            grace,
            keepalive,
            cancel_token,
            on_spawned,
            tx.unwrap().clone(),
        )
        .await
        {
            Ok(v) => v,
            Err(e) => PhaseVerdict {
                status: VerdictStatus::Error,
                exit_code: -1,
                message: e.to_string(),
                output: None,
                partial: false,
            },
        };
    }

    // Buffered execution: either the client wants a single reply, or there
    // is no task-local runner to stream from (SPEC_FULL.md §4.4).
    let (argv, test_timeout) = if incremental {
        (
            build_incremental_argv(config, request),
            Duration::from_secs(request.test_timeout_secs.unwrap_or(config.incremental_test_timeout_secs)),
        )
    } else {
        (
            config.generic_test_argv.clone(),
            Duration::from_secs(request.test_timeout_secs.unwrap_or(config.generic_test_timeout_secs)),
        )
    };

    let raw_verdict = match process::run_supervised(
        &argv,
        server_dir,
        test_timeout,
        grace,
        config.captured_output_cap_bytes,
        cancel_token,
        on_spawned,
    )
    .await
    {
        Ok(v) => v,
        Err(e) => {
            return PhaseVerdict {
                status: VerdictStatus::Error,
                exit_code: -1,
                message: e.to_string(),
                output: None,
                partial: false,
            }
        }
    };

    if !matches!(raw_verdict.status, VerdictStatus::Pass | VerdictStatus::Fail) {
        // Timeout / cancelled / error: the Supervisor already classified it.
        return raw_verdict;
    }

    let output = raw_verdict.output.clone().unwrap_or_default();
    if incremental {
        synthesize_incremental_verdict(&output, tx).await
    } else {
        synthesize_generic_verdict(&output, server_dir, tx).await
    }
}

fn build_incremental_argv(config: &HarnessConfig, request: &SubmissionRequest) -> Vec<String> {
    let mut argv = config.incremental_test_argv.clone();
    let per_test = request.per_test_timeout_secs.unwrap_or(config.per_test_timeout_secs);
    argv.push("--timeout".to_string());
    argv.push(per_test.to_string());
    if let Some(name) = &request.test_name {
        argv.push("--test-name".to_string());
        argv.push(name.clone());
    }
    if let Some(file) = &request.test_file {
        argv.push("--test-file".to_string());
        argv.push(file.clone());
    }
    argv
}

async fn synthesize_incremental_verdict(output: &str, tx: Option<&Sender<StreamSignal>>) -> PhaseVerdict {
    let (outcomes, summary, selection_error) = multiplexer::parse_buffered_incremental_output(output);

    if let Some(msg) = selection_error {
        return PhaseVerdict {
            status: VerdictStatus::Error,
            exit_code: -1,
            message: msg,
            output: None,
            partial: false,
        };
    }

    if let Some(tx) = tx {
        for (ordinal, outcome) in outcomes.iter().enumerate() {
            let _ = tx
                .send(StreamSignal::Event(OrchestratorEvent::TestResult {
                    test_id: outcome.test_id.clone(),
                    status: outcome.status,
                    ordinal: (ordinal + 1) as u32,
                    total: summary.as_ref().map(|s| s.total),
                    message: outcome.message.clone(),
                }))
                .await;
        }
        if let Some(summary) = &summary {
            let _ = tx
                .send(StreamSignal::Event(OrchestratorEvent::Summary {
                    total: summary.total,
                    passed: summary.passed,
                    failed: summary.failed,
                    timeout: Some(summary.timeout),
                    oom: Some(summary.oom),
                }))
                .await;
        }
    }

    match summary {
        Some(summary) => PhaseVerdict {
            status: if summary.failed == 0 { VerdictStatus::Pass } else { VerdictStatus::Fail },
            exit_code: 0,
            message: format!("{} passed, {} failed (of {})", summary.passed, summary.failed, summary.total),
            output: None,
            partial: false,
        },
        None => PhaseVerdict {
            status: VerdictStatus::Error,
            exit_code: -1,
            message: "runner exited without emitting a summary".to_string(),
            output: None,
            partial: false,
        },
    }
}

/// Maximum number of formatted failure summaries kept, matching the
/// reference deployment.
const MAX_FAILURES: usize = 5;

async fn synthesize_generic_verdict(
    output: &str,
    server_dir: &Path,
    tx: Option<&Sender<StreamSignal>>,
) -> PhaseVerdict {
    let summary = parse_generic_summary(output);
    let failures = parse_generic_failures(output);

    if let Some(tx) = tx {
        for (ordinal, failure) in failures.iter().take(MAX_FAILURES).enumerate() {
            let test_id = failure
                .get("test_name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let message = format_failure_message(failure, server_dir);
            let _ = tx
                .send(StreamSignal::Event(OrchestratorEvent::TestResult {
                    test_id,
                    status: TestStatus::Fail,
                    ordinal: (ordinal + 1) as u32,
                    total: summary.as_ref().map(|s| s.total),
                    message: Some(message),
                }))
                .await;
        }
        if let Some(summary) = &summary {
            let _ = tx
                .send(StreamSignal::Event(OrchestratorEvent::Summary {
                    total: summary.total,
                    passed: summary.passed,
                    failed: summary.failed,
                    timeout: None,
                    oom: None,
                }))
                .await;
        }
    }

    if let Some(summary) = summary {
        if summary.failed == 0 {
            return PhaseVerdict {
                status: VerdictStatus::Pass,
                exit_code: 0,
                message: "ok".to_string(),
                output: None,
                partial: false,
            };
        }
        let messages: Vec<String> = failures
            .iter()
            .take(MAX_FAILURES)
            .map(|f| format_failure_message(f, server_dir))
            .collect();
        return PhaseVerdict {
            status: VerdictStatus::Fail,
            exit_code: 1,
            message: messages.join("\n\n"),
            output: None,
            partial: false,
        };
    }

    // No summary line found; fall back to the runner's own exit status,
    // which run_supervised already classified as pass/fail before we got here.
    PhaseVerdict {
        status: if failures.is_empty() { VerdictStatus::Pass } else { VerdictStatus::Fail },
        exit_code: if failures.is_empty() { 0 } else { 1 },
        message: if failures.is_empty() {
            "ok".to_string()
        } else {
            failures
                .iter()
                .take(MAX_FAILURES)
                .map(|f| format_failure_message(f, server_dir))
                .collect::<Vec<_>>()
                .join("\n\n")
        },
        output: None,
        partial: false,
    }
}

/// Parses `Total tests: N, passed: M, failed: K` without pulling in a
/// regex engine for one fixed-shape line (DESIGN.md).
fn parse_generic_summary(output: &str) -> Option<TestSummary> {
    let idx = output.find("Total tests:")?;
    let rest = &output[idx + "Total tests:".len()..];
    let mut numbers = rest.split(|c: char| !c.is_ascii_digit()).filter(|s| !s.is_empty());
    let total: u32 = numbers.next()?.parse().ok()?;
    let passed_idx = rest.find("passed:")?;
    let after_passed = &rest[passed_idx + "passed:".len()..];
    let passed: u32 = after_passed
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())?
        .parse()
        .ok()?;
    let failed_idx = rest.find("failed:")?;
    let after_failed = &rest[failed_idx + "failed:".len()..];
    let failed: u32 = after_failed
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())?
        .parse()
        .ok()?;
    Some(TestSummary { total, passed, failed, timeout: 0, oom: 0 })
}

fn parse_generic_failures(output: &str) -> Vec<Value> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let v: Value = serde_json::from_str(line).ok()?;
            if v.is_object() && v.get("test_name").is_some() {
                Some(v)
            } else {
                None
            }
        })
        .collect()
}

/// Builds a one-line (or, when the source test block is found, multi-line)
/// failure message, mirroring the reference deployment's
/// `_format_failure_message` including best-effort source extraction.
fn format_failure_message(failure: &Value, server_dir: &Path) -> String {
    let test_name = failure.get("test_name").and_then(Value::as_str).unwrap_or("unknown");
    let message = match failure.get("message") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let kind = failure.get("kind").and_then(Value::as_str).unwrap_or("");
    let expected = failure.get("expected").and_then(Value::as_str).unwrap_or("");
    let actual = failure.get("actual").and_then(Value::as_str).unwrap_or("");

    let mut parts = vec![test_name.to_string()];
    if !kind.is_empty() {
        parts.push(format!("[{kind}]"));
    }
    if !message.is_empty() {
        parts.push(message);
    }
    if !expected.is_empty() && !actual.is_empty() {
        parts.push(format!("(expected: {expected}, actual: {actual})"));
    }
    let summary = if parts.len() > 1 { parts.join(": ") } else { parts.into_iter().next().unwrap_or_default() };

    let filename = match failure.get("filename").and_then(Value::as_str) {
        Some(f) => f,
        None => return summary,
    };
    let package = failure.get("package").and_then(Value::as_str);
    let test_file = match materializer::find_test_file(server_dir, filename, package) {
        Some(f) => f,
        None => return summary,
    };
    let text = match std::fs::read_to_string(&test_file) {
        Ok(t) => t,
        Err(_) => return summary,
    };
    let block = match extract_test_block(&text, test_name) {
        Some(b) => b,
        None => return summary,
    };

    const MAX_CHARS: usize = 2000;
    let (source, truncated_note) = if block.source.len() > MAX_CHARS {
        (block.source[..MAX_CHARS].to_string(), "\n... (truncated)")
    } else {
        (block.source, "")
    };

    format!(
        "{summary}\n\n--- test case: {}#L{} ---\n{source}{truncated_note}\n--- end test case ---",
        test_file.display(),
        block.start_line,
    )
}

struct TestBlock {
    start_line: usize,
    source: String,
}

/// Best-effort extraction of `test "<name>" { ... }`, including any
/// immediately preceding `///` doc-comment header, by brace-balanced,
/// string-literal-aware scanning — mirrors
/// `_extract_test_block_from_text` in the reference deployment.
fn extract_test_block(text: &str, test_name: &str) -> Option<TestBlock> {
    let lines: Vec<&str> = text.lines().collect();
    let decl = format!("test \"{test_name}\" {{");
    let start_line = lines.iter().position(|l| {
        let trimmed = l.trim_end();
        trimmed.trim_start() == decl || trimmed.trim_start().starts_with(&decl)
    })?;

    let mut header_start = start_line;
    while header_start > 0 {
        let prev = lines[header_start - 1].trim();
        if prev.is_empty() {
            break;
        }
        if prev.starts_with("///") {
            header_start -= 1;
            continue;
        }
        break;
    }

    let mut brace_balance: i64 = 0;
    let mut saw_opening_brace = false;
    let mut in_string = false;
    let mut escape = false;
    let mut end_line = start_line;

    for (idx, line) in lines.iter().enumerate().skip(start_line) {
        end_line = idx;
        for ch in line.chars() {
            if in_string {
                if escape {
                    escape = false;
                } else if ch == '\\' {
                    escape = true;
                } else if ch == '"' {
                    in_string = false;
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '{' => {
                    brace_balance += 1;
                    saw_opening_brace = true;
                }
                '}' => brace_balance -= 1,
                _ => {}
            }
        }
        if saw_opening_brace && brace_balance == 0 {
            break;
        }
    }

    let source = lines[header_start..=end_line].join("\n");
    Some(TestBlock { start_line: header_start + 1, source })
}

fn cancelled_verdict(submission_id: &str, project_id: &str, build_verdict: Option<PhaseVerdict>) -> FinalVerdict {
    FinalVerdict {
        submission_id: submission_id.to_string(),
        project_id: project_id.to_string(),
        build_verdict: build_verdict.unwrap_or_else(PhaseVerdict::cancelled),
        test_verdict: Some(PhaseVerdict::cancelled()),
        completed_at: crate::event::now_iso8601(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generic_summary_line() {
        let output = "Building...\nTotal tests: 10, passed: 8, failed: 2\nDone";
        let summary = parse_generic_summary(output).unwrap();
        assert_eq!((summary.total, summary.passed, summary.failed), (10, 8, 2));
    }

    #[test]
    fn missing_summary_line_returns_none() {
        assert!(parse_generic_summary("no summary here").is_none());
    }

    #[test]
    fn parses_failure_jsonl_lines_only() {
        let output = "not json\n{\"test_name\":\"a\",\"message\":\"boom\"}\n{\"other\":1}\n";
        let failures = parse_generic_failures(output);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0]["test_name"], "a");
    }

    #[test]
    fn extracts_test_block_with_doc_comment_header() {
        let text = "\
///|
/// does a thing
test \"my test\" {
  assert_eq(1, 1)
}
";
        let block = extract_test_block(text, "my test").unwrap();
        assert!(block.source.contains("does a thing"));
        assert!(block.source.contains("assert_eq"));
        assert_eq!(block.start_line, 1);
    }

    #[test]
    fn format_failure_message_without_source_falls_back_to_summary() {
        let failure = serde_json::json!({
            "test_name": "t1",
            "message": "expected 1 got 2",
            "kind": "assertion",
        });
        let dir = tempfile::tempdir().unwrap();
        let msg = format_failure_message(&failure, dir.path());
        assert!(msg.contains("t1"));
        assert!(msg.contains("assertion"));
        assert!(msg.contains("expected 1 got 2"));
    }
}
