//! Admission guard: at most one non-terminal session per scope.
//!
//! The guard never queues. A second request while a session is active is
//! rejected immediately so an interactive caller can tell the user at
//! once. `release` is idempotent and keyed by session id: releasing twice,
//! or releasing a session that is no longer the active one, does nothing.

use crate::catalog::OperationFamily;
use crate::error::DocOpsError;
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, warn};

/// The session currently holding the guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub id: SessionId,
    pub family: OperationFamily,
    pub admitted_at: DateTime<Utc>,
}

/// Mutual-exclusion gate for operation sessions.
#[derive(Debug, Default)]
pub struct AdmissionGuard {
    active: Mutex<Option<ActiveSession>>,
}

impl AdmissionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `id` unless another session holds the guard.
    pub fn try_admit(&self, id: SessionId, family: &OperationFamily) -> Result<(), DocOpsError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = active.as_ref() {
            warn!(
                "Rejected '{}': session {} ({}) still in progress",
                family, current.id, current.family
            );
            return Err(DocOpsError::AdmissionRejected {
                active: current.id,
                family: current.family.clone(),
            });
        }
        *active = Some(ActiveSession {
            id,
            family: family.clone(),
            admitted_at: Utc::now(),
        });
        debug!("Admitted session {} for '{}'", id, family);
        Ok(())
    }

    /// Release the guard if `id` holds it. Returns whether it did.
    pub fn release(&self, id: SessionId) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.as_ref() {
            Some(current) if current.id == id => {
                *active = None;
                debug!("Released guard held by session {}", id);
                true
            }
            _ => false,
        }
    }

    pub fn active(&self) -> Option<ActiveSession> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_busy(&self) -> bool {
        self.active().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fam(name: &str) -> OperationFamily {
        OperationFamily::new(name).unwrap()
    }

    #[test]
    fn second_admission_is_rejected() {
        let guard = AdmissionGuard::new();
        let first = SessionId::new_v4();
        guard.try_admit(first, &fam("merge")).unwrap();

        let err = guard
            .try_admit(SessionId::new_v4(), &fam("compress"))
            .unwrap_err();
        match err {
            DocOpsError::AdmissionRejected { active, family } => {
                assert_eq!(active, first);
                assert_eq!(family, fam("merge"));
            }
            other => panic!("expected AdmissionRejected, got {other:?}"),
        }
    }

    #[test]
    fn release_is_idempotent() {
        let guard = AdmissionGuard::new();
        let id = SessionId::new_v4();
        guard.try_admit(id, &fam("merge")).unwrap();
        assert!(guard.release(id));
        assert!(!guard.release(id));
        assert!(!guard.is_busy());
    }

    #[test]
    fn stale_release_does_not_free_a_newer_session() {
        let guard = AdmissionGuard::new();
        let old = SessionId::new_v4();
        guard.try_admit(old, &fam("merge")).unwrap();
        guard.release(old);

        let new = SessionId::new_v4();
        guard.try_admit(new, &fam("compress")).unwrap();
        assert!(!guard.release(old));
        assert_eq!(guard.active().map(|a| a.id), Some(new));
    }
}
