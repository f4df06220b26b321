//! One attempt against one technology.
//!
//! The exchange future is raced against three other signals:
//!
//! ```text
//!             ┌─ session token cancelled ──▶ Cancelled (exchange dropped)
//! select! ────┼─ exchange / timeout ───────▶ Completed | Failed(reason)
//!             ├─ upload reading ───────────▶ session.record_upload
//!             └─ progress tick ────────────▶ session.tick_processing
//! ```
//!
//! Cancellation is polled first so a cancel that races a completion wins:
//! once the user has cancelled, no completion is reported.

use crate::config::OrchestratorConfig;
use crate::error::{ExchangeError, FailureReason};
use crate::exchange::{ExchangeContext, ExchangeExecutor, ExchangeRequest, ExchangeResponse, UploadReporter};
use crate::session::SessionCell;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// How one attempt ended.
#[derive(Debug)]
pub(crate) enum AttemptResult {
    Completed(ExchangeResponse),
    Failed(FailureReason),
    Cancelled,
}

pub(crate) async fn run_attempt(
    cell: &SessionCell,
    executor: &dyn ExchangeExecutor,
    request: &ExchangeRequest,
    config: &OrchestratorConfig,
) -> AttemptResult {
    let technology = request.technology.id.clone();
    let session_token = cell.token();
    let attempt_token = session_token.child_token();
    let (reporter, mut uploads) = UploadReporter::channel();
    let ctx = ExchangeContext::new(attempt_token.clone(), reporter);

    let timeout = config.exchange_timeout();
    let exchange = tokio::time::timeout(timeout, executor.execute(request, ctx));
    tokio::pin!(exchange);

    let mut ticker = tokio::time::interval(config.progress_tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let expected = config.expected_processing();
    let mut uploads_open = true;

    loop {
        tokio::select! {
            biased;

            _ = session_token.cancelled() => {
                attempt_token.cancel();
                debug!("Attempt {} on {} aborted by cancellation", request.attempt_index, technology);
                return AttemptResult::Cancelled;
            }

            result = &mut exchange => {
                while let Ok((sent, total)) = uploads.try_recv() {
                    cell.record_upload(sent, total);
                }
                return match result {
                    Err(_elapsed) => {
                        attempt_token.cancel();
                        AttemptResult::Failed(FailureReason::Timeout {
                            technology,
                            secs: config.exchange_timeout_secs,
                        })
                    }
                    Ok(Ok(response)) => AttemptResult::Completed(response),
                    Ok(Err(err)) => classify(&technology, err, session_token.is_cancelled()),
                };
            }

            reading = uploads.recv(), if uploads_open => match reading {
                Some((sent, total)) => cell.record_upload(sent, total),
                None => uploads_open = false,
            },

            _ = ticker.tick() => cell.tick_processing(expected),
        }
    }
}

/// An executor reporting `Cancelled` without a user cancel aborted on its
/// own; that is a transport failure, not a cancellation.
fn classify(
    technology: &crate::catalog::TechnologyId,
    err: ExchangeError,
    user_cancelled: bool,
) -> AttemptResult {
    match FailureReason::classify(technology, err) {
        Some(reason) => AttemptResult::Failed(reason),
        None if user_cancelled => AttemptResult::Cancelled,
        None => AttemptResult::Failed(FailureReason::Transport {
            technology: technology.clone(),
            detail: "exchange aborted by executor".into(),
        }),
    }
}
