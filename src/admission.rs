use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::models::CancelStatus;

/// Handle to the currently-running child of an admitted submission, if any.
/// `attach_child` swaps this in once the Process Supervisor has spawned;
/// cancellation reads it to decide whether there is anything to terminate.
#[derive(Clone)]
pub struct ChildHandle {
    pub pid: u32,
}

struct ActiveRequest {
    project_id: String,
    cancel_token: CancellationToken,
    child: Option<ChildHandle>,
}

/// Enforces the admission singleton from SPEC_FULL.md §3/§4.1: at most one
/// in-flight submission per project id, at most one per submission id.
#[derive(Clone, Default)]
pub struct AdmissionRegistry {
    inner: Arc<Mutex<HashMap<String, ActiveRequest>>>,
}

/// Why `try_admit` refused a submission.
#[derive(Debug, Clone)]
pub enum AdmitConflict {
    /// Another submission already holds this project.
    ProjectBusy { active_submission_id: String },
    /// This submission id is in use for a different project.
    RequestIdBusy,
}

impl AdmissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to admit `submission_id` for `project_id`. On success,
    /// returns the cancellation token the pipeline worker should watch.
    pub async fn try_admit(
        &self,
        project_id: &str,
        submission_id: &str,
    ) -> Result<CancellationToken, AdmitConflict> {
        let mut map = self.inner.lock().await;

        if let Some(existing) = map.get(submission_id) {
            if existing.project_id != project_id {
                return Err(AdmitConflict::RequestIdBusy);
            }
        }
        if let Some((busy_submission_id, _)) = map
            .iter()
            .find(|(_, req)| req.project_id == project_id)
        {
            return Err(AdmitConflict::ProjectBusy {
                active_submission_id: busy_submission_id.clone(),
            });
        }

        let token = CancellationToken::new();
        map.insert(
            submission_id.to_string(),
            ActiveRequest {
                project_id: project_id.to_string(),
                cancel_token: token.clone(),
                child: None,
            },
        );
        Ok(token)
    }

    /// Record the child currently running for this submission, so an
    /// external cancel request can find it. No-op if the submission has
    /// since been released.
    pub async fn attach_child(&self, submission_id: &str, child: Option<ChildHandle>) {
        let mut map = self.inner.lock().await;
        if let Some(req) = map.get_mut(submission_id) {
            req.child = child;
        }
    }

    /// Release the Active-request record. Idempotent.
    pub async fn release(&self, submission_id: &str) {
        self.inner.lock().await.remove(submission_id);
    }

    /// Signal cancellation. Returns the child to terminate, if one is
    /// attached and the submission is still admitted. The caller performs
    /// the actual process-group kill outside this registry's lock, per
    /// SPEC_FULL.md §4.1 ("termination... happens outside that domain").
    pub async fn cancel(&self, submission_id: &str) -> (CancelStatus, Option<ChildHandle>) {
        let mut map = self.inner.lock().await;
        match map.get_mut(submission_id) {
            Some(req) => {
                req.cancel_token.cancel();
                let child = req.child.clone();
                let status = if child.is_some() {
                    CancelStatus::Cancelled
                } else {
                    CancelStatus::NoProcess
                };
                (status, child)
            }
            None => (CancelStatus::NotFound, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_submission_for_same_project_is_rejected() {
        let reg = AdmissionRegistry::new();
        reg.try_admit("demo", "s1").await.unwrap();
        let err = reg.try_admit("demo", "s2").await.unwrap_err();
        match err {
            AdmitConflict::ProjectBusy { active_submission_id } => {
                assert_eq!(active_submission_id, "s1");
            }
            other => panic!("expected ProjectBusy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_submission_id_for_different_project_is_rejected() {
        let reg = AdmissionRegistry::new();
        reg.try_admit("demo", "s1").await.unwrap();
        let err = reg.try_admit("other", "s1").await.unwrap_err();
        assert!(matches!(err, AdmitConflict::RequestIdBusy));
    }

    #[tokio::test]
    async fn release_then_readmit_succeeds() {
        let reg = AdmissionRegistry::new();
        reg.try_admit("demo", "s1").await.unwrap();
        reg.release("s1").await;
        assert!(reg.try_admit("demo", "s2").await.is_ok());
    }

    #[tokio::test]
    async fn cancel_unknown_submission_reports_not_found() {
        let reg = AdmissionRegistry::new();
        let (status, child) = reg.cancel("ghost").await;
        assert_eq!(status, CancelStatus::NotFound);
        assert!(child.is_none());
    }

    #[tokio::test]
    async fn cancel_without_attached_child_reports_no_process() {
        let reg = AdmissionRegistry::new();
        reg.try_admit("demo", "s1").await.unwrap();
        let (status, child) = reg.cancel("s1").await;
        assert_eq!(status, CancelStatus::NoProcess);
        assert!(child.is_none());
    }

    #[tokio::test]
    async fn cancel_with_attached_child_reports_cancelled() {
        let reg = AdmissionRegistry::new();
        let token = reg.try_admit("demo", "s1").await.unwrap();
        reg.attach_child("s1", Some(ChildHandle { pid: 1234 })).await;
        let (status, child) = reg.cancel("s1").await;
        assert_eq!(status, CancelStatus::Cancelled);
        assert_eq!(child.unwrap().pid, 1234);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn double_cancel_is_idempotent() {
        let reg = AdmissionRegistry::new();
        reg.try_admit("demo", "s1").await.unwrap();
        reg.attach_child("s1", Some(ChildHandle { pid: 1 })).await;
        let first = reg.cancel("s1").await.0;
        let second = reg.cancel("s1").await.0;
        assert_eq!(first, second);
    }
}
