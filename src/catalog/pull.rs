//! Retrying progress stream for model pulls.

use super::{ModelNameBody, PullProgress, PullRegistration};
use crate::config::CatalogConfig;
use crate::error::{Result, RuntimeError};
use crate::ndjson::LineScanner;
use crate::retry::{backoff_delay, classify_reqwest_error};
use crate::server::ServerSupervisor;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stream of pull progress records, ending after a terminal record or a
/// final error.
pub type PullStream = Pin<Box<dyn Stream<Item = Result<PullProgress>> + Send>>;

/// Whether `error` ends the pull at `attempt` out of `attempts`.
fn give_up(attempt: u32, attempts: u32, error: &RuntimeError) -> bool {
    attempt + 1 >= attempts || !error.is_retryable()
}

fn pull_failed(model: &str, last_error: &RuntimeError) -> RuntimeError {
    RuntimeError::PullFailed {
        model: model.to_string(),
        detail: last_error.to_string(),
    }
}

/// Build the pull stream for `model`.
///
/// The registration guard moves into the stream, so the active-pull
/// entry clears on every exit path: terminal success, final error, and
/// the consumer dropping the stream early.
pub(super) fn pull_stream(
    client: reqwest::Client,
    supervisor: Arc<ServerSupervisor>,
    config: CatalogConfig,
    model: String,
    max_retries: u32,
    registration: PullRegistration,
) -> PullStream {
    let stream = async_stream::stream! {
        let _registration = registration;
        let pull_id = uuid::Uuid::new_v4().to_string();
        let attempts = max_retries.max(1);
        let stall_window = Duration::from_secs(config.stall_timeout_secs);
        let url = format!("{}/api/pull", supervisor.config().base_url());

        if let Err(e) = supervisor.ensure_running().await {
            yield Err(e);
            return;
        }

        info!(model = %model, pull_id = %pull_id, attempts, "starting pull");
        let mut last_error = RuntimeError::StreamEnded("pull produced no data".into());

        'attempts: for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(attempt, config.backoff_base_ms, config.backoff_cap_ms);
                info!(
                    model = %model,
                    pull_id = %pull_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "retrying pull"
                );
                yield Ok(PullProgress::retrying(&last_error));
                tokio::time::sleep(delay).await;
            }

            let response = match client
                .post(&url)
                .json(&ModelNameBody { name: &model })
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = classify_reqwest_error(&e);
                    if give_up(attempt, attempts, &last_error) {
                        yield Err(pull_failed(&model, &last_error));
                        return;
                    }
                    continue 'attempts;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                last_error = RuntimeError::HttpStatus {
                    status: status.as_u16(),
                    detail,
                };
                if give_up(attempt, attempts, &last_error) {
                    yield Err(pull_failed(&model, &last_error));
                    return;
                }
                continue 'attempts;
            }

            let mut bytes = response.bytes_stream();
            let mut scanner = LineScanner::new();

            loop {
                // Watchdog: a healthy pull delivers data continuously,
                // so a long quiet gap means the connection died.
                let next = tokio::time::timeout(stall_window, bytes.next()).await;
                match next {
                    Err(_) => {
                        last_error = RuntimeError::Stalled(config.stall_timeout_secs);
                        warn!(model = %model, pull_id = %pull_id, "pull stalled");
                        if give_up(attempt, attempts, &last_error) {
                            yield Err(pull_failed(&model, &last_error));
                            return;
                        }
                        continue 'attempts;
                    }
                    Ok(None) => {
                        // Connection closed. Anything still buffered may
                        // hold the terminal record.
                        if let Some(text) = scanner.flush()
                            && let Ok(record) = serde_json::from_str::<PullProgress>(&text)
                        {
                            if let Some(failure) = record.failure() {
                                last_error = RuntimeError::Protocol(failure);
                                if give_up(attempt, attempts, &last_error) {
                                    yield Err(pull_failed(&model, &last_error));
                                    return;
                                }
                                continue 'attempts;
                            }
                            let terminal = record.is_terminal();
                            yield Ok(record);
                            if terminal {
                                info!(model = %model, pull_id = %pull_id, "pull complete");
                                return;
                            }
                        }
                        last_error = RuntimeError::StreamEnded(
                            "pull stream ended without a terminal status".into(),
                        );
                        if give_up(attempt, attempts, &last_error) {
                            yield Err(pull_failed(&model, &last_error));
                            return;
                        }
                        continue 'attempts;
                    }
                    Ok(Some(Err(e))) => {
                        last_error = classify_reqwest_error(&e);
                        warn!(model = %model, pull_id = %pull_id, error = %last_error, "pull read failed");
                        if give_up(attempt, attempts, &last_error) {
                            yield Err(pull_failed(&model, &last_error));
                            return;
                        }
                        continue 'attempts;
                    }
                    Ok(Some(Ok(chunk))) => {
                        for text in scanner.push(&chunk) {
                            let Ok(record) = serde_json::from_str::<PullProgress>(&text) else {
                                debug!(model = %model, "skipping undecodable pull record");
                                continue;
                            };
                            if let Some(failure) = record.failure() {
                                last_error = RuntimeError::Protocol(failure);
                                if give_up(attempt, attempts, &last_error) {
                                    yield Err(pull_failed(&model, &last_error));
                                    return;
                                }
                                continue 'attempts;
                            }
                            let terminal = record.is_terminal();
                            yield Ok(record);
                            if terminal {
                                info!(model = %model, pull_id = %pull_id, "pull complete");
                                return;
                            }
                        }
                    }
                }
            }
        }
    };
    Box::pin(stream)
}
