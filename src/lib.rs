//! # edgequake-docops
//!
//! Operation orchestration and technology fallback for document-processing
//! consoles.
//!
//! ## Why this crate?
//!
//! A document console offers dozens of operations (compress, merge, OCR,
//! format conversion, AI summaries …) and several interchangeable engines
//! that can fulfil each one: a cloud service, a local renderer, a pure
//! library fallback. The hard part is not calling an engine, it is
//! everything around the call: letting only one long operation run at a
//! time, tracking its lifecycle and progress, cancelling it cleanly, and
//! falling back to the next engine when one fails without surprising the
//! user. This crate is that core, with the UI reduced to a subscriber.
//!
//! ## Session lifecycle
//!
//! ```text
//! admit_and_run
//!  │
//!  ├─ 1. Validate  arity and inputs (no session on failure)
//!  ├─ 2. Admit     single-slot guard, reject while busy
//!  ├─ 3. Resolve   priority list → frozen attempt plan
//!  ├─ 4. Upload    bytes-based progress (authoritative)
//!  ├─ 5. Process   time-based estimate (advisory), fallback per family
//!  └─ 6. Finish    Completed | Failed(reason) | Cancelled, one notice
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docops::{
//!     HttpExchangeExecutor, InputArtifact, MemorySink, OperationFamily, OperationRequest,
//!     Orchestrator, OrchestratorConfig, TechnologyCatalog, TechnologyId,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = HttpExchangeExecutor::new()?
//!         .with_endpoint(TechnologyId::new("adobe"), "https://adobe.internal.example")
//!         .with_endpoint(TechnologyId::new("pdf_lib"), "http://localhost:8081");
//!     let orchestrator = Orchestrator::new(
//!         OrchestratorConfig::default(),
//!         TechnologyCatalog::builtin(),
//!         Arc::new(executor),
//!         Arc::new(MemorySink::new()),
//!     )?;
//!
//!     let request = OperationRequest::new(OperationFamily::new("compress")?)
//!         .with_input(InputArtifact::from_path("report.pdf"));
//!     let handle = orchestrator.admit_and_run(request)?;
//!     println!("{:?}", handle.wait().await);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docops` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-docops = { version = "0.5", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod fileset;
pub mod guard;
pub mod orchestrator;
pub mod pipeline;
pub mod priority;
pub mod progress;
pub mod resolver;
pub mod session;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use catalog::{
    CatalogSource, FallbackPolicy, FamilyCapability, FamilySpec, HttpCatalogSource,
    JsonFileCatalogSource, OperationFamily, StaticCatalogSource, TechnologyCatalog,
    TechnologyDescriptor, TechnologyId, TechnologyKind,
};
pub use config::{OrchestratorConfig, OrchestratorConfigBuilder};
pub use error::{DocOpsError, ErrorKind, ExchangeError, FailureReason};
pub use events::{EventBus, NoticeLevel, Notification, ProgressUpdate, SessionEvent, SessionEventStream};
pub use exchange::{
    ExchangeContext, ExchangeExecutor, ExchangeRequest, ExchangeResponse, HttpExchangeExecutor,
    InputArtifact, OperationRequest, UploadReporter,
};
pub use fileset::OrderedFileSet;
pub use guard::{ActiveSession, AdmissionGuard};
pub use orchestrator::Orchestrator;
pub use priority::{JsonFileSink, MemorySink, PersistenceSink, PriorityList, PriorityStore};
pub use progress::{ProcessingEstimate, UploadProgress};
pub use resolver::{resolve_order, AttemptPlan, PlanOrigin};
pub use session::{
    InvalidTransition, OperationSession, SessionHandle, SessionId, SessionOutcome, SessionSnapshot,
    SessionState, Transition,
};
