//! Operation session: one user-triggered action through its lifecycle.
//!
//! ## State machine
//!
//! ```text
//! Idle ──▶ Admitted ──▶ Uploading ──▶ Processing ──▶ Completed
//!             │             │  │          │  ▲ │
//!             │             │  │          │  └─┘ fallback (attempt_index + 1)
//!             │             │  └──────────┼──────▶ Failed
//!             └─────────────┴─────────────┴──────▶ Cancelled
//! ```
//!
//! No state is re-entered once left, except `Processing → Processing` when
//! the session falls back to the next technology of its attempt plan.
//! A fallback from `Uploading` also lands in `Processing`; the upload of
//! the first attempt is over either way.
//!
//! [`OperationSession`] is the plain state machine. [`SessionCell`] wraps
//! it in a mutex together with the cancellation token, the admission
//! guard and the event bus, and is the only place transitions are applied.
//! Every terminal transition, whichever path reaches it first, releases
//! the guard and publishes one terminal notification; later attempts to
//! finish the same session find it terminal and do nothing.

use crate::catalog::{OperationFamily, TechnologyId};
use crate::error::FailureReason;
use crate::events::{EventBus, NoticeLevel, Notification, ProgressUpdate, SessionEvent};
use crate::exchange::ExchangeResponse;
use crate::guard::AdmissionGuard;
use crate::progress::{ProcessingEstimate, UploadProgress};
use crate::resolver::AttemptPlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Unique id of an operation session.
pub type SessionId = uuid::Uuid;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Admitted,
    Uploading,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// Whether the lifecycle allows `self → to`.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, Admitted)
                | (Admitted, Uploading)
                | (Admitted, Cancelled)
                | (Uploading, Processing)
                | (Uploading, Failed)
                | (Uploading, Cancelled)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Admitted => "admitted",
            SessionState::Uploading => "uploading",
            SessionState::Processing => "processing",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from} → {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// One applied state change, as published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub session_id: SessionId,
    pub family: OperationFamily,
    pub from: SessionState,
    pub to: SessionState,
    pub attempt_index: usize,
    pub technology: Option<TechnologyId>,
    pub at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed {
        technology: TechnologyId,
        attempts: usize,
        response: ExchangeResponse,
    },
    Failed {
        reason: FailureReason,
        attempts: usize,
    },
    Cancelled {
        attempts: usize,
    },
}

impl SessionOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            SessionOutcome::Completed { .. } => SessionState::Completed,
            SessionOutcome::Failed { .. } => SessionState::Failed,
            SessionOutcome::Cancelled { .. } => SessionState::Cancelled,
        }
    }

    pub fn attempts(&self) -> usize {
        match self {
            SessionOutcome::Completed { attempts, .. }
            | SessionOutcome::Failed { attempts, .. }
            | SessionOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Read-only view of a session for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub family: OperationFamily,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub upload_percent: u8,
    /// Advisory estimate; see [`crate::progress::ProcessingEstimate`].
    pub processing_percent: u8,
    pub attempt_index: usize,
    pub technology: Option<TechnologyId>,
    pub plan: Option<Vec<TechnologyId>>,
    pub failures: Vec<FailureReason>,
}

// ── State machine ────────────────────────────────────────────────────────

/// The unit of work: state, progress and attempt bookkeeping.
#[derive(Debug)]
pub struct OperationSession {
    id: SessionId,
    family: OperationFamily,
    state: SessionState,
    started_at: DateTime<Utc>,
    started: Instant,
    ended_at: Option<DateTime<Utc>>,
    processing_since: Option<Instant>,
    upload: UploadProgress,
    processing: ProcessingEstimate,
    attempt_index: usize,
    plan: Option<AttemptPlan>,
    failures: Vec<FailureReason>,
    outcome: Option<SessionOutcome>,
}

impl OperationSession {
    pub fn new(id: SessionId, family: OperationFamily) -> Self {
        Self {
            id,
            family,
            state: SessionState::Idle,
            started_at: Utc::now(),
            started: Instant::now(),
            ended_at: None,
            processing_since: None,
            upload: UploadProgress::default(),
            processing: ProcessingEstimate::default(),
            attempt_index: 0,
            plan: None,
            failures: Vec::new(),
            outcome: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn family(&self) -> &OperationFamily {
        &self.family
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn attempt_index(&self) -> usize {
        self.attempt_index
    }

    pub fn plan(&self) -> Option<&AttemptPlan> {
        self.plan.as_ref()
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Technology of the current attempt, once a plan exists.
    pub fn technology(&self) -> Option<&TechnologyId> {
        self.plan
            .as_ref()
            .and_then(|p| p.get(self.attempt_index))
            .map(|t| &t.id)
    }

    /// Attempts made so far (the current one included once uploading).
    pub fn attempts(&self) -> usize {
        match &self.plan {
            Some(plan) => (self.attempt_index + 1).min(plan.len()),
            None => 0,
        }
    }

    fn enter(&mut self, to: SessionState) -> Result<Transition, InvalidTransition> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }
        self.state = to;
        let at = Utc::now();
        if to.is_terminal() {
            self.ended_at = Some(at);
        }
        Ok(Transition {
            session_id: self.id,
            family: self.family.clone(),
            from,
            to,
            attempt_index: self.attempt_index,
            technology: self.technology().cloned(),
            at,
            elapsed_ms: self.elapsed().as_millis() as u64,
        })
    }

    /// `Idle → Admitted`.
    pub fn admit(&mut self) -> Result<Transition, InvalidTransition> {
        self.enter(SessionState::Admitted)
    }

    /// `Admitted → Uploading`, freezing the attempt plan.
    pub fn begin_upload(&mut self, plan: AttemptPlan) -> Result<Transition, InvalidTransition> {
        if self.state != SessionState::Admitted {
            return Err(InvalidTransition {
                from: self.state,
                to: SessionState::Uploading,
            });
        }
        self.plan = Some(plan);
        self.attempt_index = 0;
        self.enter(SessionState::Uploading)
    }

    /// Record upload bytes. Moves to `Processing` when the upload reaches
    /// 100 %. Outside `Uploading` the reading is ignored.
    ///
    /// Returns `(progress_changed, transition)`.
    pub fn record_upload(&mut self, sent: u64, total: u64) -> (bool, Option<Transition>) {
        if self.state != SessionState::Uploading {
            return (false, None);
        }
        let changed = self.upload.record(sent, total);
        if self.upload.is_complete() {
            return (changed, self.begin_processing().ok());
        }
        (changed, None)
    }

    /// `Uploading → Processing`.
    pub fn begin_processing(&mut self) -> Result<Transition, InvalidTransition> {
        if self.state != SessionState::Uploading {
            return Err(InvalidTransition {
                from: self.state,
                to: SessionState::Processing,
            });
        }
        self.upload.complete();
        self.processing_since = Some(Instant::now());
        self.enter(SessionState::Processing)
    }

    /// Re-estimate advisory processing progress. Returns `true` on change.
    pub fn tick_processing(&mut self, expected: Duration) -> bool {
        match (self.state, self.processing_since) {
            (SessionState::Processing, Some(since)) => {
                self.processing.advance(since.elapsed(), expected)
            }
            _ => false,
        }
    }

    /// Record `reason` for the current attempt and continue with the next
    /// candidate: `Uploading | Processing → Processing`, attempt index + 1.
    pub fn fall_back(&mut self, reason: FailureReason) -> Result<Transition, InvalidTransition> {
        let to = SessionState::Processing;
        let has_next = self
            .plan
            .as_ref()
            .is_some_and(|p| self.attempt_index + 1 < p.len());
        if !has_next || !matches!(self.state, SessionState::Uploading | SessionState::Processing) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        if self.state == SessionState::Uploading {
            self.upload.complete();
        }
        self.failures.push(reason);
        self.attempt_index += 1;
        self.processing = ProcessingEstimate::default();
        self.processing_since = Some(Instant::now());
        self.enter(to)
    }

    /// `Processing → Completed`. From `Uploading` the session passes
    /// through `Processing` first; both transitions are returned.
    pub fn complete(
        &mut self,
        response: ExchangeResponse,
    ) -> Result<Vec<Transition>, InvalidTransition> {
        let mut transitions = Vec::with_capacity(2);
        if self.state == SessionState::Uploading {
            transitions.push(self.begin_processing()?);
        }
        if self.state != SessionState::Processing {
            return Err(InvalidTransition {
                from: self.state,
                to: SessionState::Completed,
            });
        }
        let technology = self
            .technology()
            .cloned()
            .unwrap_or_else(|| TechnologyId::new("unknown"));
        let attempts = self.attempts();
        transitions.push(self.enter(SessionState::Completed)?);
        self.processing.complete();
        self.outcome = Some(SessionOutcome::Completed {
            technology,
            attempts,
            response,
        });
        Ok(transitions)
    }

    /// `Uploading | Processing → Failed`.
    pub fn fail(&mut self, reason: FailureReason) -> Result<Transition, InvalidTransition> {
        let transition = self.enter(SessionState::Failed)?;
        self.failures.push(reason.clone());
        self.outcome = Some(SessionOutcome::Failed {
            reason,
            attempts: self.attempts(),
        });
        Ok(transition)
    }

    /// `Admitted | Uploading | Processing → Cancelled`.
    pub fn cancel(&mut self) -> Result<Transition, InvalidTransition> {
        let transition = self.enter(SessionState::Cancelled)?;
        self.outcome = Some(SessionOutcome::Cancelled {
            attempts: self.attempts(),
        });
        Ok(transition)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            family: self.family.clone(),
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            elapsed_ms: self.elapsed().as_millis() as u64,
            upload_percent: self.upload.percent(),
            processing_percent: self.processing.percent(),
            attempt_index: self.attempt_index,
            technology: self.technology().cloned(),
            plan: self.plan.as_ref().map(|p| p.ids()),
            failures: self.failures.clone(),
        }
    }

    fn progress_update(&self) -> ProgressUpdate {
        ProgressUpdate {
            session_id: self.id,
            family: self.family.clone(),
            upload_percent: self.upload.percent(),
            processing_percent: self.processing.percent(),
            attempt_index: self.attempt_index,
            elapsed_ms: self.elapsed().as_millis() as u64,
        }
    }

    fn terminal_notification(&self) -> Option<Notification> {
        let outcome = self.outcome.as_ref()?;
        let (level, message, technology, reason) = match outcome {
            SessionOutcome::Completed {
                technology,
                attempts,
                ..
            } => (
                NoticeLevel::Success,
                format!(
                    "{} completed with {} after {} attempt(s)",
                    self.family, technology, attempts
                ),
                Some(technology.clone()),
                None,
            ),
            SessionOutcome::Failed { reason, attempts } => (
                NoticeLevel::Error,
                format!(
                    "{} failed after {} attempt(s): {}",
                    self.family, attempts, reason
                ),
                self.technology().cloned(),
                Some(reason.clone()),
            ),
            SessionOutcome::Cancelled { .. } => (
                NoticeLevel::Cancelled,
                format!("{} cancelled", self.family),
                self.technology().cloned(),
                None,
            ),
        };
        Some(Notification {
            session_id: self.id,
            family: self.family.clone(),
            level,
            terminal: true,
            message,
            technology,
            reason,
            attempts: outcome.attempts(),
        })
    }
}

// ── Shared cell ──────────────────────────────────────────────────────────

/// A session shared between its runner task and the UI.
pub(crate) struct SessionCell {
    session: Mutex<OperationSession>,
    token: CancellationToken,
    guard: Arc<AdmissionGuard>,
    events: EventBus,
}

impl SessionCell {
    pub(crate) fn new(session: OperationSession, guard: Arc<AdmissionGuard>, events: EventBus) -> Self {
        Self {
            session: Mutex::new(session),
            token: CancellationToken::new(),
            guard,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, OperationSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.lock().is_terminal()
    }

    pub(crate) fn outcome(&self) -> Option<SessionOutcome> {
        self.lock().outcome().cloned()
    }

    /// Current `(technology descriptor index, attempt_index)` while the
    /// session is still running.
    pub(crate) fn current_attempt(&self) -> Option<(crate::catalog::TechnologyDescriptor, usize)> {
        let s = self.lock();
        if s.is_terminal() {
            return None;
        }
        let plan = s.plan()?;
        plan.get(s.attempt_index())
            .cloned()
            .map(|t| (t, s.attempt_index()))
    }

    /// Publish a transition; on a terminal one release the guard and send
    /// the terminal notification. Called with the session lock held so
    /// event order matches transition order.
    fn publish(&self, session: &OperationSession, transition: Transition) {
        debug!(
            "Session {} ({}): {} → {} [attempt {}]",
            transition.session_id,
            transition.family,
            transition.from,
            transition.to,
            transition.attempt_index
        );
        let terminal = transition.to.is_terminal();
        self.events.publish(SessionEvent::Transition(transition));
        if terminal {
            self.guard.release(session.id());
            if let Some(notice) = session.terminal_notification() {
                info!("{}", notice.message);
                self.events.publish(SessionEvent::Notice(notice));
            }
        }
    }

    fn apply(
        &self,
        f: impl FnOnce(&mut OperationSession) -> Result<Transition, InvalidTransition>,
    ) -> bool {
        let mut s = self.lock();
        match f(&mut *s) {
            Ok(t) => {
                self.publish(&s, t);
                true
            }
            Err(e) => {
                debug!("Session {}: {}", s.id(), e);
                false
            }
        }
    }

    pub(crate) fn admit(&self) -> bool {
        self.apply(|s| s.admit())
    }

    pub(crate) fn begin_upload(&self, plan: AttemptPlan) -> bool {
        self.apply(|s| s.begin_upload(plan))
    }

    pub(crate) fn record_upload(&self, sent: u64, total: u64) {
        let mut s = self.lock();
        let (changed, transition) = s.record_upload(sent, total);
        if changed {
            self.events.publish(SessionEvent::Progress(s.progress_update()));
        }
        if let Some(t) = transition {
            self.publish(&s, t);
        }
    }

    pub(crate) fn tick_processing(&self, expected: Duration) {
        let mut s = self.lock();
        if s.tick_processing(expected) {
            self.events.publish(SessionEvent::Progress(s.progress_update()));
        }
    }

    /// Fall back to the next candidate, publishing the informational
    /// notice before the `Processing → Processing` transition.
    pub(crate) fn fall_back(&self, reason: FailureReason) -> bool {
        let mut s = self.lock();
        let failed_tech = s.technology().cloned();
        let attempts = s.attempts();
        let family = s.family().clone();
        let id = s.id();
        match s.fall_back(reason.clone()) {
            Ok(t) => {
                let next = s.technology().cloned();
                let message = format!(
                    "{} failed ({}); retrying with a different engine: {}",
                    failed_tech.as_ref().map(|t| t.as_str()).unwrap_or("?"),
                    reason,
                    next.as_ref().map(|t| t.as_str()).unwrap_or("?"),
                );
                warn!("Session {}: {}", id, message);
                self.events.publish(SessionEvent::Notice(Notification {
                    session_id: id,
                    family,
                    level: NoticeLevel::Info,
                    terminal: false,
                    message,
                    technology: next,
                    reason: Some(reason),
                    attempts,
                }));
                self.publish(&s, t);
                true
            }
            Err(e) => {
                debug!("Session {}: {}", id, e);
                false
            }
        }
    }

    pub(crate) fn complete(&self, response: ExchangeResponse) -> bool {
        let mut s = self.lock();
        match s.complete(response) {
            Ok(transitions) => {
                for t in transitions {
                    self.publish(&s, t);
                }
                true
            }
            Err(e) => {
                debug!("Session {}: completion discarded: {}", s.id(), e);
                false
            }
        }
    }

    pub(crate) fn fail(&self, reason: FailureReason) -> bool {
        self.apply(|s| s.fail(reason))
    }

    /// Fail a session whose runner died. A session still in `Admitted`
    /// first enters `Uploading` with an empty plan, as `Failed` is only
    /// reachable from there. Outstanding exchange work is signalled to stop.
    pub(crate) fn abandon(&self, reason: FailureReason) -> bool {
        let failed = {
            let mut s = self.lock();
            if s.state() == SessionState::Admitted {
                let plan = AttemptPlan::empty(s.family().clone(), Vec::new());
                if let Ok(t) = s.begin_upload(plan) {
                    self.publish(&s, t);
                }
            }
            match s.fail(reason) {
                Ok(t) => {
                    self.publish(&s, t);
                    true
                }
                Err(e) => {
                    debug!("Session {}: {}", s.id(), e);
                    false
                }
            }
        };
        self.token.cancel();
        failed
    }

    /// Signal the token and move to `Cancelled`. A no-op once terminal.
    pub(crate) fn cancel(&self) -> bool {
        let applied = self.apply(|s| s.cancel());
        if applied {
            self.token.cancel();
        }
        applied
    }
}

// ── Handle ───────────────────────────────────────────────────────────────

/// The UI's reference to a running session.
///
/// Dropping the handle does not cancel the session: it still runs to a
/// terminal state (bounded by the exchange timeout) and releases the
/// admission guard on its own.
pub struct SessionHandle {
    id: SessionId,
    family: OperationFamily,
    cell: Arc<SessionCell>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        family: OperationFamily,
        cell: Arc<SessionCell>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            family,
            cell,
            task,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn family(&self) -> &OperationFamily {
        &self.family
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.cell.snapshot()
    }

    pub fn is_terminal(&self) -> bool {
        self.cell.is_terminal()
    }

    /// Request cancellation. Returns `true` if this call cancelled the
    /// session; `false` if it was already terminal.
    pub fn cancel(&self) -> bool {
        self.cell.cancel()
    }

    /// Wait for the session to end and consume its outcome.
    pub async fn wait(self) -> SessionOutcome {
        if let Err(e) = self.task.await {
            warn!("Session {} runner ended abnormally: {}", self.id, e);
            if e.is_panic() {
                self.cell.abandon(FailureReason::Internal {
                    detail: "session runner panicked".into(),
                });
            } else {
                self.cell.cancel();
            }
        }
        self.cell.outcome().unwrap_or(SessionOutcome::Cancelled { attempts: 0 })
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("family", &self.family)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TechnologyCatalog;
    use crate::resolver::resolve_order;

    fn fam(name: &str) -> OperationFamily {
        OperationFamily::new(name).unwrap()
    }

    fn plan(family: &str, ids: &[&str]) -> AttemptPlan {
        let ids: Vec<TechnologyId> = ids.iter().map(|s| TechnologyId::new(*s)).collect();
        resolve_order(&TechnologyCatalog::builtin(), &fam(family), &ids).unwrap()
    }

    fn transport(tech: &str) -> FailureReason {
        FailureReason::Transport {
            technology: TechnologyId::new(tech),
            detail: "connection reset".into(),
        }
    }

    fn response() -> ExchangeResponse {
        ExchangeResponse::new(serde_json::json!({"ok": true}))
    }

    fn uploading(family: &str, ids: &[&str]) -> OperationSession {
        let mut s = OperationSession::new(SessionId::new_v4(), fam(family));
        s.admit().unwrap();
        s.begin_upload(plan(family, ids)).unwrap();
        s
    }

    #[test]
    fn happy_path() {
        let mut s = uploading("compress", &["adobe", "pdf_lib"]);
        assert_eq!(s.technology(), Some(&TechnologyId::new("adobe")));
        let (changed, t) = s.record_upload(40, 100);
        assert!(changed && t.is_none());
        let (_, t) = s.record_upload(100, 100);
        assert_eq!(t.map(|t| t.to), Some(SessionState::Processing));
        let ts = s.complete(response()).unwrap();
        assert_eq!(ts.len(), 1);
        assert_eq!(s.state(), SessionState::Completed);
        assert_eq!(s.outcome().map(|o| o.attempts()), Some(1));
    }

    #[test]
    fn completion_from_uploading_passes_through_processing() {
        let mut s = uploading("compress", &["adobe"]);
        let ts = s.complete(response()).unwrap();
        let path: Vec<_> = ts.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            path,
            vec![
                (SessionState::Uploading, SessionState::Processing),
                (SessionState::Processing, SessionState::Completed)
            ]
        );
        assert_eq!(s.snapshot().upload_percent, 100);
    }

    #[test]
    fn fallback_increments_attempt_and_switches_technology() {
        let mut s = uploading("compress", &["adobe", "pdf_lib"]);
        let t = s.fall_back(transport("adobe")).unwrap();
        assert_eq!((t.from, t.to), (SessionState::Uploading, SessionState::Processing));
        assert_eq!(t.attempt_index, 1);
        assert_eq!(t.technology, Some(TechnologyId::new("pdf_lib")));
        // no third candidate
        assert!(s.fall_back(transport("pdf_lib")).is_err());
        s.fail(transport("pdf_lib")).unwrap();
        match s.outcome() {
            Some(SessionOutcome::Failed { attempts, .. }) => assert_eq!(*attempts, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(s.snapshot().failures.len(), 2);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut s = uploading("compress", &["adobe"]);
        s.cancel().unwrap();
        assert!(s.cancel().is_err());
        assert!(s.complete(response()).is_err());
        assert!(s.fail(transport("adobe")).is_err());
        assert_eq!(s.state(), SessionState::Cancelled);
    }

    #[test]
    fn failed_not_reachable_from_admitted() {
        let mut s = OperationSession::new(SessionId::new_v4(), fam("compress"));
        s.admit().unwrap();
        assert!(s.fail(transport("adobe")).is_err());
        assert!(s.cancel().is_ok());
    }

    #[test]
    fn upload_progress_never_decreases() {
        let mut s = uploading("compress", &["adobe"]);
        s.record_upload(60, 100);
        s.record_upload(30, 100);
        assert_eq!(s.snapshot().upload_percent, 60);
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Admitted));
        assert!(!Idle.can_transition_to(Uploading));
        assert!(!Admitted.can_transition_to(Failed));
        assert!(!Uploading.can_transition_to(Uploading));
        assert!(Processing.can_transition_to(Processing));
        for terminal in [Completed, Failed, Cancelled] {
            for to in [Idle, Admitted, Uploading, Processing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn cell_releases_guard_once_and_publishes_one_terminal_notice() {
        let guard = Arc::new(AdmissionGuard::new());
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let id = SessionId::new_v4();
        guard.try_admit(id, &fam("compress")).unwrap();

        let cell = SessionCell::new(OperationSession::new(id, fam("compress")), guard.clone(), events);
        assert!(cell.admit());
        assert!(cell.begin_upload(plan("compress", &["adobe"])));
        assert!(cell.cancel());
        assert!(!cell.cancel());
        assert!(!cell.complete(response()));
        assert!(cell.token().is_cancelled());
        assert!(!guard.is_busy());

        let mut terminal_notices = 0;
        let mut cancelled_transitions = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::Notice(n) if n.terminal => terminal_notices += 1,
                SessionEvent::Transition(t) if t.to == SessionState::Cancelled => {
                    cancelled_transitions += 1
                }
                _ => {}
            }
        }
        assert_eq!(terminal_notices, 1);
        assert_eq!(cancelled_transitions, 1);
    }

    #[test]
    fn abandoned_admitted_session_fails_instead_of_cancelling() {
        let guard = Arc::new(AdmissionGuard::new());
        let id = SessionId::new_v4();
        guard.try_admit(id, &fam("ocr")).unwrap();
        let cell = SessionCell::new(OperationSession::new(id, fam("ocr")), guard.clone(), EventBus::new(64));
        assert!(cell.admit());

        let reason = FailureReason::Internal {
            detail: "runner panicked".into(),
        };
        assert!(cell.abandon(reason.clone()));
        assert!(!cell.abandon(reason.clone()));
        assert!(!guard.is_busy());
        assert!(cell.token().is_cancelled());
        match cell.outcome() {
            Some(SessionOutcome::Failed { reason: got, attempts }) => {
                assert_eq!(got, reason);
                assert_eq!(attempts, 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
