//! The facade exposed to the UI collaborator.
//!
//! ## Run flow
//!
//! ```text
//! admit_and_run ─┬─ validate (sync, no session on failure)
//!                ├─ guard.try_admit (sync, reject, never queue)
//!                └─ spawn runner ──▶ refresh catalog (Admitted)
//!                                    snapshot priority + resolve
//!                                    begin_upload (plan frozen)
//!                                    attempt → fallback → attempt …
//!                                    terminal: guard released, one notice
//! ```
//!
//! Everything apart from the runner task is synchronous. Settings
//! mutations (`swap_up`, `reset`) may run at any time; a running session
//! holds its own copy of the attempt plan and is unaffected.

use crate::catalog::{CatalogSource, FallbackPolicy, OperationFamily, TechnologyCatalog};
use crate::config::OrchestratorConfig;
use crate::error::{DocOpsError, FailureReason};
use crate::events::{EventBus, SessionEvent, SessionEventStream};
use crate::exchange::{ExchangeExecutor, ExchangeRequest, OperationRequest};
use crate::fileset::OrderedFileSet;
use crate::guard::{ActiveSession, AdmissionGuard};
use crate::pipeline::attempt::{run_attempt, AttemptResult};
use crate::pipeline::validate::validate_request;
use crate::priority::{PersistenceSink, PriorityList, PriorityStore};
use crate::resolver::{resolve_order, AttemptPlan};
use crate::session::{OperationSession, SessionCell, SessionHandle, SessionId};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Admits, runs and observes operation sessions.
///
/// Cheap to clone; clones share the guard, the priority store and the
/// event bus.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    catalog: RwLock<Arc<TechnologyCatalog>>,
    catalog_source: Option<Arc<dyn CatalogSource>>,
    priorities: PriorityStore,
    guard: Arc<AdmissionGuard>,
    executor: Arc<dyn ExchangeExecutor>,
    events: EventBus,
}

impl Orchestrator {
    /// Build an orchestrator over a fixed catalog.
    pub fn new(
        config: OrchestratorConfig,
        catalog: TechnologyCatalog,
        executor: Arc<dyn ExchangeExecutor>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Result<Self, DocOpsError> {
        Self::build(config, catalog, None, executor, sink)
    }

    /// Build an orchestrator whose catalog is fetched from `source` now
    /// and, if configured, again at every session start.
    pub async fn from_source(
        config: OrchestratorConfig,
        source: Arc<dyn CatalogSource>,
        executor: Arc<dyn ExchangeExecutor>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Result<Self, DocOpsError> {
        config.validate()?;
        let catalog = source.fetch().await?;
        info!(
            "Loaded catalog from {}: {} families, {} technologies",
            source.name(),
            catalog.families().len(),
            catalog.technologies().len()
        );
        Self::build(config, catalog, Some(source), executor, sink)
    }

    fn build(
        config: OrchestratorConfig,
        catalog: TechnologyCatalog,
        catalog_source: Option<Arc<dyn CatalogSource>>,
        executor: Arc<dyn ExchangeExecutor>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Result<Self, DocOpsError> {
        config.validate()?;
        let priorities = PriorityStore::load(&catalog, sink)?;
        let events = EventBus::new(config.event_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                catalog: RwLock::new(Arc::new(catalog)),
                catalog_source,
                priorities,
                guard: Arc::new(AdmissionGuard::new()),
                executor,
                events,
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// The catalog currently in effect.
    pub fn catalog(&self) -> Arc<TechnologyCatalog> {
        self.inner.current_catalog()
    }

    /// The session holding the admission guard, if any.
    pub fn active_session(&self) -> Option<ActiveSession> {
        self.inner.guard.active()
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// Validate, admit and start a session for `request`.
    ///
    /// Fails synchronously with `Validation`/`InputNotFound`/`UnknownFamily`
    /// when the request is malformed and with `AdmissionRejected` while
    /// another session is non-terminal; neither creates a session. Must be
    /// called from within a tokio runtime.
    pub fn admit_and_run(&self, request: OperationRequest) -> Result<SessionHandle, DocOpsError> {
        let catalog = self.catalog();
        validate_request(&catalog, &request)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DocOpsError::NoRuntime)?;

        let id = SessionId::new_v4();
        let family = request.family.clone();
        self.inner.guard.try_admit(id, &family)?;

        let cell = Arc::new(SessionCell::new(
            OperationSession::new(id, family.clone()),
            self.inner.guard.clone(),
            self.inner.events.clone(),
        ));
        if !cell.admit() {
            self.inner.guard.release(id);
            return Err(DocOpsError::Internal(format!(
                "session {} could not be admitted",
                id
            )));
        }
        info!(
            "Admitted session {} for '{}' ({} input(s))",
            id,
            family,
            request.inputs.len()
        );

        let inner = self.inner.clone();
        let runner_cell = cell.clone();
        let operation = Arc::new(request);
        let task = runtime.spawn(async move {
            let run = AssertUnwindSafe(inner.drive(&runner_cell, operation)).catch_unwind();
            if run.await.is_err() {
                error!("Session {} runner panicked; failing session", id);
                runner_cell.abandon(FailureReason::Internal {
                    detail: "session runner panicked".into(),
                });
            }
        });

        Ok(SessionHandle::new(id, family, cell, task))
    }

    /// Cancel a session. Idempotent: returns `false` if it had already
    /// reached a terminal state.
    pub fn cancel(&self, handle: &SessionHandle) -> bool {
        let cancelled = handle.cancel();
        if cancelled {
            info!("Session {} cancelled by user", handle.id());
        }
        cancelled
    }

    // ── Priorities ───────────────────────────────────────────────────────

    pub fn get_priority(&self, family: &str) -> Result<PriorityList, DocOpsError> {
        let family = self.catalog().parse_family(family)?;
        self.inner.priorities.get(&family)
    }

    /// Move the entry at `index` one place up. `index == 0` is a no-op.
    pub fn swap_up(&self, family: &str, index: usize) -> Result<PriorityList, DocOpsError> {
        let catalog = self.catalog();
        let family = catalog.parse_family(family)?;
        self.inner.priorities.swap_up(&family, index, &catalog)
    }

    /// Restore the catalog's default order for `family`.
    pub fn reset(&self, family: &str) -> Result<PriorityList, DocOpsError> {
        let catalog = self.catalog();
        let family = catalog.parse_family(family)?;
        self.inner.priorities.reset(&family, &catalog)
    }

    // ── File sets ────────────────────────────────────────────────────────

    /// Relocate one input of a multi-file operation.
    pub fn reorder<T>(
        &self,
        files: &mut OrderedFileSet<T>,
        from: usize,
        to: usize,
    ) -> Result<(), DocOpsError> {
        files.move_item(from, to)
    }

    // ── Events ───────────────────────────────────────────────────────────

    /// Stream of every session event from now on.
    pub fn subscribe(&self) -> SessionEventStream {
        self.inner.events.stream()
    }

    /// Raw broadcast receiver for callers that handle lag themselves.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("active", &self.inner.guard.active())
            .finish()
    }
}

// ── Runner ───────────────────────────────────────────────────────────────

impl Inner {
    fn current_catalog(&self) -> Arc<TechnologyCatalog> {
        self.catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-fetch the catalog at session start. The previous catalog stays in
    /// effect when the fetch fails, times out, is cancelled, or returns a
    /// catalog that no longer serves `family`.
    async fn catalog_for_session(
        &self,
        family: &OperationFamily,
        token: &CancellationToken,
    ) -> Arc<TechnologyCatalog> {
        let current = self.current_catalog();
        let source = match &self.catalog_source {
            Some(source) if self.config.refresh_catalog_on_start => source,
            _ => return current,
        };

        let fetch = tokio::time::timeout(self.config.exchange_timeout(), source.fetch());
        let fetched = tokio::select! {
            _ = token.cancelled() => return current,
            r = fetch => r,
        };

        match fetched {
            Ok(Ok(next)) if next.supports(family) => {
                let next = Arc::new(next);
                *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = next.clone();
                self.priorities.adopt_catalog(&next);
                next
            }
            Ok(Ok(_)) => {
                warn!(
                    "Refreshed catalog from {} no longer serves '{}'; keeping previous catalog",
                    source.name(),
                    family
                );
                current
            }
            Ok(Err(e)) => {
                warn!("Catalog refresh failed, keeping previous catalog: {}", e);
                current
            }
            Err(_) => {
                warn!(
                    "Catalog refresh from {} timed out, keeping previous catalog",
                    source.name()
                );
                current
            }
        }
    }

    /// Drive one session from `Admitted` to a terminal state.
    async fn drive(&self, cell: &SessionCell, operation: Arc<OperationRequest>) {
        let family = operation.family.clone();
        let snapshot = cell.snapshot();
        let catalog = self.catalog_for_session(&family, cell.token()).await;
        if cell.is_terminal() {
            return;
        }

        // Snapshot-on-start: the plan is resolved once and frozen.
        let priority = self
            .priorities
            .get(&family)
            .map(|l| l.ids().to_vec())
            .unwrap_or_default();
        let plan = match resolve_order(&catalog, &family, &priority) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Session {}: {}", snapshot.id, e);
                if cell.begin_upload(AttemptPlan::empty(family.clone(), priority)) {
                    cell.fail(FailureReason::NoCandidates { family });
                }
                return;
            }
        };
        if !plan.dropped().is_empty() {
            warn!(
                "Session {}: ignoring stale priority entries {:?} for '{}'",
                snapshot.id,
                plan.dropped(),
                family
            );
        }
        info!(
            "Session {} attempt plan for '{}': {:?}",
            snapshot.id,
            family,
            plan.ids()
        );
        if !cell.begin_upload(plan) {
            return;
        }

        while let Some((technology, attempt_index)) = cell.current_attempt() {
            let request = ExchangeRequest {
                session_id: snapshot.id,
                attempt_index,
                technology,
                operation: operation.clone(),
            };
            info!(
                "Session {} attempt {} with {}",
                snapshot.id,
                attempt_index + 1,
                request.technology.id
            );

            match run_attempt(cell, self.executor.as_ref(), &request, &self.config).await {
                AttemptResult::Completed(response) => {
                    cell.complete(response);
                    return;
                }
                AttemptResult::Cancelled => {
                    cell.cancel();
                    return;
                }
                AttemptResult::Failed(reason) => {
                    let policy = request.technology.fallback_policy(&family);
                    if policy == FallbackPolicy::FallThrough && cell.fall_back(reason.clone()) {
                        continue;
                    }
                    if policy == FallbackPolicy::HardStop {
                        info!(
                            "Session {}: '{}' does not fall back on {}; stopping",
                            snapshot.id, family, request.technology.id
                        );
                    }
                    cell.fail(reason);
                    return;
                }
            }
        }
    }
}
