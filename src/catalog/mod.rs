//! Model catalog operations against the runtime API.
//!
//! [`ModelCatalog`] lists and deletes installed models and pulls new ones
//! with retrying progress streaming. Every operation ensures the server
//! is running first. Pulls are admitted through an active-pull registry:
//! at most one pull per model name at any time, enforced synchronously
//! before any network traffic.

mod pull;

pub use pull::PullStream;

use crate::config::CatalogConfig;
use crate::error::{Result, RuntimeError};
use crate::server::ServerSupervisor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// An installed model as reported by `GET /api/tags`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledModel {
    /// Model name, e.g. `llama3.2:3b`.
    pub name: String,
    /// Size on disk in bytes.
    #[serde(default)]
    pub size: u64,
    /// Content digest of the model manifest.
    #[serde(default)]
    pub digest: String,
    /// When the model was last modified.
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

/// Wire shape of the `GET /api/tags` payload.
#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<InstalledModel>,
}

/// Request body naming a model, used by delete and pull.
#[derive(Debug, Serialize)]
struct ModelNameBody<'a> {
    name: &'a str,
}

/// One progress record from a model pull.
///
/// Mirrors the server's NDJSON records. The `retrying` records injected
/// between attempts use the same shape with `status: "retrying"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PullProgress {
    /// Phase description, e.g. `pulling manifest`, `success`.
    pub status: String,
    /// Content layer this record refers to, when downloading.
    pub digest: Option<String>,
    /// Total bytes for the current layer.
    pub total: Option<u64>,
    /// Bytes downloaded so far for the current layer.
    pub completed: Option<u64>,
    /// Server-reported error detail.
    pub error: Option<String>,
}

impl PullProgress {
    /// Synthetic record emitted before a retry attempt.
    pub(crate) fn retrying(last_error: &RuntimeError) -> Self {
        Self {
            status: "retrying".to_string(),
            error: Some(last_error.to_string()),
            ..Self::default()
        }
    }

    /// Whether this record ends the pull successfully.
    pub fn is_terminal(&self) -> bool {
        self.status.eq_ignore_ascii_case("success") || self.status.eq_ignore_ascii_case("complete")
    }

    /// Whether this is a locally injected retry marker.
    pub fn is_retrying(&self) -> bool {
        self.status == "retrying"
    }

    /// The failure this record reports, if any.
    pub(crate) fn failure(&self) -> Option<String> {
        if let Some(error) = self.error.as_deref()
            && !error.is_empty()
            && !self.is_retrying()
        {
            return Some(error.to_string());
        }
        if self.status.eq_ignore_ascii_case("error") {
            return Some("pull record reported status error".to_string());
        }
        None
    }
}

/// Names with a pull in flight, generation-stamped.
///
/// The generation lets a registration guard from a superseded pull drop
/// without clearing a successor's entry: after `cancel_pull` frees a
/// name, a new pull registers a higher generation, and the old stream's
/// guard no longer matches.
#[derive(Debug, Default, Clone)]
pub(crate) struct ActivePulls {
    table: Arc<Mutex<PullTable>>,
}

#[derive(Debug, Default)]
struct PullTable {
    next_generation: u64,
    active: HashMap<String, u64>,
}

impl ActivePulls {
    /// Register a pull, failing when one is already active for `name`.
    fn register(&self, name: &str) -> Result<PullRegistration> {
        let mut table = self.lock();
        if table.active.contains_key(name) {
            return Err(RuntimeError::AlreadyPulling(name.to_string()));
        }
        table.next_generation += 1;
        let generation = table.next_generation;
        table.active.insert(name.to_string(), generation);
        Ok(PullRegistration {
            table: Arc::clone(&self.table),
            name: name.to_string(),
            generation,
        })
    }

    /// Clear the registration for `name`; returns whether one existed.
    fn cancel(&self, name: &str) -> bool {
        self.lock().active.remove(name).is_some()
    }

    /// Whether a pull is registered for `name`.
    fn is_active(&self, name: &str) -> bool {
        self.lock().active.contains_key(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PullTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Guard owned by a pull stream; clears the registration on drop.
///
/// Dropping covers every exit path at once: terminal success, retry
/// exhaustion, and the consumer discarding the stream mid-pull.
#[derive(Debug)]
pub(crate) struct PullRegistration {
    table: Arc<Mutex<PullTable>>,
    name: String,
    generation: u64,
}

impl Drop for PullRegistration {
    fn drop(&mut self) {
        let mut table = match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if table.active.get(&self.name) == Some(&self.generation) {
            table.active.remove(&self.name);
        }
    }
}

/// Client for model catalog operations.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    config: CatalogConfig,
    supervisor: Arc<ServerSupervisor>,
    client: reqwest::Client,
    pulls: ActivePulls,
}

impl ModelCatalog {
    /// Create a catalog client sharing `supervisor` for readiness checks.
    pub fn new(config: CatalogConfig, supervisor: Arc<ServerSupervisor>) -> Self {
        Self {
            config,
            supervisor,
            // Deliberately no client-wide timeout: pull bodies stream for
            // as long as a download takes. List/delete set per-request
            // timeouts instead.
            client: reqwest::Client::new(),
            pulls: ActivePulls::default(),
        }
    }

    fn base_url(&self) -> String {
        self.supervisor.config().base_url()
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    /// List installed models.
    ///
    /// Always re-fetches; the result is a snapshot, never cached.
    ///
    /// # Errors
    ///
    /// Start failures propagate as-is; request and decode failures
    /// surface as [`RuntimeError::CatalogUnavailable`].
    pub async fn list_models(&self) -> Result<Vec<InstalledModel>> {
        self.supervisor.ensure_running().await?;

        let url = format!("{}/api/tags", self.base_url());
        let resp = self
            .client
            .get(&url)
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(|e| RuntimeError::CatalogUnavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(RuntimeError::CatalogUnavailable(format!(
                "server returned {status}: {detail}"
            )));
        }

        let payload: TagsResponse = resp
            .json()
            .await
            .map_err(|e| RuntimeError::CatalogUnavailable(format!("invalid tags payload: {e}")))?;
        debug!(count = payload.models.len(), "listed installed models");
        Ok(payload.models)
    }

    /// Delete an installed model by name.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidRequest`] for an empty name and
    /// [`RuntimeError::DeleteFailed`] when the server refuses.
    pub async fn delete_model(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RuntimeError::InvalidRequest("model name is empty".into()));
        }
        self.supervisor.ensure_running().await?;

        let url = format!("{}/api/delete", self.base_url());
        let resp = self
            .client
            .delete(&url)
            .json(&ModelNameBody { name })
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(|e| RuntimeError::DeleteFailed {
                model: name.to_string(),
                detail: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(RuntimeError::DeleteFailed {
                model: name.to_string(),
                detail: format!("server returned {status}: {detail}"),
            });
        }
        debug!(model = name, "deleted model");
        Ok(())
    }

    /// Pull a model, streaming progress records.
    ///
    /// Uses the configured attempt budget; see
    /// [`ModelCatalog::pull_model_with_retries`].
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::AlreadyPulling`] when a pull for `name` is
    /// registered, before any network traffic.
    pub fn pull_model(&self, name: &str) -> Result<PullStream> {
        self.pull_model_with_retries(name, self.config.pull_max_retries)
    }

    /// Pull a model with an explicit attempt budget.
    ///
    /// Registration happens here, synchronously: a duplicate name is
    /// rejected immediately and the registry entry exists before the
    /// returned stream is first polled. The entry is cleared on every
    /// exit path, including the consumer dropping the stream.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidRequest`] for an empty name and
    /// [`RuntimeError::AlreadyPulling`] for a duplicate pull.
    pub fn pull_model_with_retries(&self, name: &str, max_retries: u32) -> Result<PullStream> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RuntimeError::InvalidRequest("model name is empty".into()));
        }
        let registration = self.pulls.register(name)?;
        Ok(pull::pull_stream(
            self.client.clone(),
            Arc::clone(&self.supervisor),
            self.config.clone(),
            name.to_string(),
            max_retries,
            registration,
        ))
    }

    /// Clear the active-pull registration for `name`.
    ///
    /// Returns whether a pull was registered. This updates bookkeeping
    /// only: the name becomes free for a new pull, but the underlying
    /// network stream is not aborted here — it stops when its consumer
    /// drops it or the server closes the connection. A detached consumer
    /// can therefore keep receiving records for a cancelled name.
    pub fn cancel_pull(&self, name: &str) -> bool {
        let cancelled = self.pulls.cancel(name);
        if cancelled {
            debug!(model = name, "cancelled pull registration");
        }
        cancelled
    }

    /// Whether a pull is currently registered for `name`.
    pub fn is_pulling(&self, name: &str) -> bool {
        self.pulls.is_active(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── PullProgress ──────────────────────────────────────────

    #[test]
    fn progress_terminal_statuses() {
        for status in ["success", "SUCCESS", "complete", "Complete"] {
            let record = PullProgress {
                status: status.to_string(),
                ..Default::default()
            };
            assert!(record.is_terminal(), "{status} should be terminal");
        }
        let record = PullProgress {
            status: "pulling manifest".to_string(),
            ..Default::default()
        };
        assert!(!record.is_terminal());
    }

    #[test]
    fn progress_failure_from_error_field() {
        let record: PullProgress =
            serde_json::from_str(r#"{"error":"pull model manifest: not found"}"#)
                .unwrap_or_default();
        assert_eq!(
            record.failure().as_deref(),
            Some("pull model manifest: not found")
        );
    }

    #[test]
    fn progress_failure_from_error_status() {
        let record = PullProgress {
            status: "error".to_string(),
            ..Default::default()
        };
        assert!(record.failure().is_some());
    }

    #[test]
    fn progress_ordinary_record_is_not_failure() {
        let record: PullProgress = serde_json::from_str(
            r#"{"status":"pulling abc","digest":"sha256:abc","total":100,"completed":5}"#,
        )
        .unwrap_or_default();
        assert!(record.failure().is_none());
        assert!(!record.is_terminal());
        assert_eq!(record.completed, Some(5));
        assert_eq!(record.total, Some(100));
    }

    #[test]
    fn retrying_record_shape() {
        let record = PullProgress::retrying(&RuntimeError::Stalled(120));
        assert!(record.is_retrying());
        assert!(!record.is_terminal());
        // The retry marker itself is not a server failure record.
        assert!(record.failure().is_none());
        assert!(record.error.as_deref().is_some_and(|e| e.contains("STALLED")));
    }

    #[test]
    fn installed_model_deserializes_tags_payload() {
        let json = r#"{
            "models": [
                {
                    "name": "llama3.2:3b",
                    "size": 2019393189,
                    "digest": "sha256:a80c4f17acd5",
                    "modified_at": "2025-05-04T17:37:44.706015396-07:00"
                }
            ]
        }"#;
        let payload: TagsResponse = serde_json::from_str(json).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(payload.models.len(), 1);
        assert_eq!(payload.models[0].name, "llama3.2:3b");
        assert_eq!(payload.models[0].size, 2019393189);
        assert!(payload.models[0].modified_at.is_some());
    }

    #[test]
    fn tags_payload_missing_models_is_empty() {
        let payload: TagsResponse = serde_json::from_str("{}").unwrap_or_else(|e| panic!("{e}"));
        assert!(payload.models.is_empty());
    }

    // ── ActivePulls ───────────────────────────────────────────

    #[test]
    fn register_rejects_duplicate() {
        let pulls = ActivePulls::default();
        let _first = pulls.register("llama3.2").unwrap_or_else(|e| panic!("{e}"));
        let second = pulls.register("llama3.2");
        assert!(matches!(second, Err(RuntimeError::AlreadyPulling(_))));
    }

    #[test]
    fn distinct_names_register_concurrently() {
        let pulls = ActivePulls::default();
        let _a = pulls.register("llama3.2").unwrap_or_else(|e| panic!("{e}"));
        let _b = pulls.register("qwen2.5").unwrap_or_else(|e| panic!("{e}"));
        assert!(pulls.is_active("llama3.2"));
        assert!(pulls.is_active("qwen2.5"));
    }

    #[test]
    fn drop_clears_registration() {
        let pulls = ActivePulls::default();
        {
            let _guard = pulls.register("llama3.2").unwrap_or_else(|e| panic!("{e}"));
            assert!(pulls.is_active("llama3.2"));
        }
        assert!(!pulls.is_active("llama3.2"));
    }

    #[test]
    fn cancel_frees_name_for_new_pull() {
        let pulls = ActivePulls::default();
        let _guard = pulls.register("llama3.2").unwrap_or_else(|e| panic!("{e}"));
        assert!(pulls.cancel("llama3.2"));
        assert!(!pulls.cancel("llama3.2"));
        assert!(pulls.register("llama3.2").is_ok());
    }

    #[test]
    fn stale_guard_does_not_clear_successor() {
        let pulls = ActivePulls::default();
        let stale = pulls.register("llama3.2").unwrap_or_else(|e| panic!("{e}"));
        pulls.cancel("llama3.2");
        let _successor = pulls.register("llama3.2").unwrap_or_else(|e| panic!("{e}"));

        // The stale guard belongs to a cancelled generation; dropping it
        // must leave the successor registered.
        drop(stale);
        assert!(pulls.is_active("llama3.2"));
    }
}
