//! Exchange Executor boundary.
//!
//! The core never talks to a backend directly. One attempt against one
//! technology is handed to an [`ExchangeExecutor`] together with an
//! [`ExchangeContext`] carrying the attempt's cancellation token and an
//! [`UploadReporter`] for real bytes sent. Everything past this trait is
//! opaque: the session only sees `Ok(ExchangeResponse)` or a classified
//! [`ExchangeError`].
//!
//! [`HttpExchangeExecutor`] is the bundled reqwest implementation used by
//! the CLI:
//!
//! ```text
//! PUT  {base}/uploads/{session}/{index}   one streamed body per input
//! POST {base}/operations/{family}         {session, attempt, inputs, params}
//! ```

use crate::catalog::{OperationFamily, TechnologyDescriptor, TechnologyId};
use crate::error::{DocOpsError, ExchangeError};
use crate::fileset::OrderedFileSet;
use crate::session::SessionId;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ── Request / response ───────────────────────────────────────────────────

/// One input file of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputArtifact {
    /// Name sent to the backend (file name by default).
    pub name: String,
    pub path: PathBuf,
}

impl InputArtifact {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Use the file name of `path` as the artifact name.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { name, path }
    }
}

/// What the user asked for: a family, its inputs in order, and
/// family-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub family: OperationFamily,
    pub inputs: Vec<InputArtifact>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl OperationRequest {
    pub fn new(family: OperationFamily) -> Self {
        Self {
            family,
            inputs: Vec::new(),
            params: serde_json::Value::Null,
        }
    }

    /// Inputs in the order of a user-arranged file set.
    pub fn from_file_set(family: OperationFamily, files: &OrderedFileSet<PathBuf>) -> Self {
        Self {
            family,
            inputs: files.iter().map(InputArtifact::from_path).collect(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_input(mut self, input: InputArtifact) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// One attempt: the user's request bound to a chosen technology.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub session_id: SessionId,
    pub attempt_index: usize,
    pub technology: TechnologyDescriptor,
    pub operation: Arc<OperationRequest>,
}

impl ExchangeRequest {
    pub fn family(&self) -> &OperationFamily {
        &self.operation.family
    }
}

/// Success payload returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub payload: serde_json::Value,
}

impl ExchangeResponse {
    pub fn new(payload: serde_json::Value) -> Self {
        Self { payload }
    }
}

// ── Context ──────────────────────────────────────────────────────────────

/// Channel for authoritative upload progress: `(bytes_sent, bytes_total)`.
#[derive(Debug, Clone)]
pub struct UploadReporter {
    tx: Option<mpsc::UnboundedSender<(u64, u64)>>,
}

impl UploadReporter {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<(u64, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter nobody listens to.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, sent: u64, total: u64) {
        if let Some(tx) = &self.tx {
            let _ = tx.send((sent, total));
        }
    }
}

/// Per-attempt context handed to the executor.
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    /// Signalled when the user cancels the session. Executors should stop
    /// I/O promptly; the session treats the attempt as aborted either way.
    pub cancellation: CancellationToken,
    pub upload: UploadReporter,
}

impl ExchangeContext {
    pub fn new(cancellation: CancellationToken, upload: UploadReporter) -> Self {
        Self {
            cancellation,
            upload,
        }
    }
}

/// Performs one outbound exchange against one technology.
#[async_trait]
pub trait ExchangeExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &ExchangeRequest,
        ctx: ExchangeContext,
    ) -> Result<ExchangeResponse, ExchangeError>;
}

// ── HTTP executor ────────────────────────────────────────────────────────

/// reqwest-backed executor. Each technology id maps to a base URL.
pub struct HttpExchangeExecutor {
    client: reqwest::Client,
    endpoints: HashMap<TechnologyId, String>,
}

impl HttpExchangeExecutor {
    pub fn new() -> Result<Self, DocOpsError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("edgequake-docops/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DocOpsError::Internal(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoints: HashMap::new(),
        })
    }

    pub fn with_endpoint(mut self, technology: TechnologyId, base_url: impl Into<String>) -> Self {
        let url: String = base_url.into();
        self.endpoints
            .insert(technology, url.trim_end_matches('/').to_string());
        self
    }

    pub fn endpoint(&self, technology: &TechnologyId) -> Option<&str> {
        self.endpoints.get(technology).map(String::as_str)
    }

    async fn run(
        &self,
        request: &ExchangeRequest,
        base: &str,
        reporter: &UploadReporter,
    ) -> Result<ExchangeResponse, ExchangeError> {
        let op = &request.operation;

        let mut total = 0u64;
        for input in &op.inputs {
            total += file_len(&input.path).await?;
        }
        reporter.report(0, total);

        let mut sent_before = 0u64;
        for (index, input) in op.inputs.iter().enumerate() {
            let url = format!("{}/uploads/{}/{}", base, request.session_id, index);
            let len = file_len(&input.path).await?;
            let file = tokio::fs::File::open(&input.path)
                .await
                .map_err(|e| ExchangeError::Transport(format!("{}: {}", input.path.display(), e)))?;

            let counter = reporter.clone();
            let mut sent = sent_before;
            let stream = ReaderStream::new(file).inspect(move |chunk| {
                if let Ok(bytes) = chunk {
                    sent += bytes.len() as u64;
                    counter.report(sent, total);
                }
            });

            debug!("PUT {} ({} bytes)", url, len);
            let response = self
                .client
                .put(&url)
                .header("content-length", len)
                .header("x-file-name", input.name.as_str())
                .body(reqwest::Body::wrap_stream(stream))
                .send()
                .await
                .map_err(|e| ExchangeError::Transport(e.to_string()))?;
            check_status(response).await?;
            sent_before += len;
        }
        reporter.report(total, total);

        let url = format!("{}/operations/{}", base, op.family);
        let body = serde_json::json!({
            "session": request.session_id,
            "attempt": request.attempt_index,
            "inputs": op.inputs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            "params": op.params,
        });
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
        let response = check_status(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
        Ok(ExchangeResponse::new(parse_payload(&bytes)?))
    }
}

#[async_trait]
impl ExchangeExecutor for HttpExchangeExecutor {
    async fn execute(
        &self,
        request: &ExchangeRequest,
        ctx: ExchangeContext,
    ) -> Result<ExchangeResponse, ExchangeError> {
        let base = self.endpoint(&request.technology.id).ok_or_else(|| {
            ExchangeError::Transport(format!(
                "no endpoint configured for '{}'",
                request.technology.id
            ))
        })?;
        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(ExchangeError::Cancelled),
            result = self.run(request, base, &ctx.upload) => result,
        }
    }
}

async fn file_len(path: &Path) -> Result<u64, ExchangeError> {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .map_err(|e| ExchangeError::Transport(format!("{}: {}", path.display(), e)))
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ExchangeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), detail))
}

/// Map a non-2xx status: 5xx is a transport-level problem, anything else
/// means the remote declined the request.
fn classify_status(status: u16, detail: String) -> ExchangeError {
    let detail = if detail.trim().is_empty() {
        format!("HTTP {}", status)
    } else {
        detail.trim().chars().take(500).collect()
    };
    if (500..600).contains(&status) {
        ExchangeError::Transport(format!("HTTP {}: {}", status, detail))
    } else {
        ExchangeError::RemoteRefusal {
            status: Some(status),
            detail,
        }
    }
}

/// Decode a JSON reply. An empty body is `null`.
fn parse_payload(bytes: &[u8]) -> Result<serde_json::Value, ExchangeError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(bytes)
        .map_err(|e| ExchangeError::Transport(format!("invalid response body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transport() {
        assert!(matches!(
            classify_status(503, "overloaded".into()),
            ExchangeError::Transport(_)
        ));
    }

    #[test]
    fn client_errors_are_refusals() {
        match classify_status(402, "quota exhausted".into()) {
            ExchangeError::RemoteRefusal { status, detail } => {
                assert_eq!(status, Some(402));
                assert_eq!(detail, "quota exhausted");
            }
            other => panic!("unexpected {other:?}"),
        }
        match classify_status(415, "  ".into()) {
            ExchangeError::RemoteRefusal { detail, .. } => assert_eq!(detail, "HTTP 415"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reply_body_is_decoded_as_json() {
        let payload = parse_payload(br#"{"pages": 3}"#).unwrap();
        assert_eq!(payload["pages"], 3);
        assert_eq!(parse_payload(b"").unwrap(), serde_json::Value::Null);
        assert!(matches!(
            parse_payload(b"<html>oops</html>"),
            Err(ExchangeError::Transport(_))
        ));
    }

    #[test]
    fn artifact_name_defaults_to_file_name() {
        let a = InputArtifact::from_path("/tmp/in/report.pdf");
        assert_eq!(a.name, "report.pdf");
    }

    #[test]
    fn request_follows_file_set_order() {
        let mut files: OrderedFileSet<PathBuf> =
            ["a.pdf", "b.pdf", "c.pdf"].iter().map(PathBuf::from).collect();
        files.move_item(2, 0).unwrap();
        let req = OperationRequest::from_file_set(OperationFamily::new("merge").unwrap(), &files);
        let names: Vec<_> = req.inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["c.pdf", "a.pdf", "b.pdf"]);
    }

    #[tokio::test]
    async fn missing_endpoint_is_a_transport_error() {
        let exec = HttpExchangeExecutor::new().unwrap();
        let catalog = crate::catalog::TechnologyCatalog::builtin();
        let tech = catalog
            .technology(&TechnologyId::new("adobe"))
            .cloned()
            .unwrap();
        let req = ExchangeRequest {
            session_id: SessionId::new_v4(),
            attempt_index: 0,
            technology: tech,
            operation: Arc::new(OperationRequest::new(OperationFamily::new("compress").unwrap())),
        };
        let ctx = ExchangeContext::new(CancellationToken::new(), UploadReporter::disabled());
        let err = exec.execute(&req, ctx).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Transport(_)));
    }

    #[tokio::test]
    async fn reporter_delivers_readings() {
        let (reporter, mut rx) = UploadReporter::channel();
        reporter.report(10, 100);
        assert_eq!(rx.recv().await, Some((10, 100)));
        UploadReporter::disabled().report(1, 1);
    }
}
