//! Thin HTTP boundary for configuration uploads: a single `POST /config`
//! endpoint that deserializes a [`RawUploadPayload`], normalizes it, hands
//! it to the orchestrator, and atomically persists it to disk. Kept
//! deliberately small: no reporting/CSV/diagram surface, just the one
//! narrow control route.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::orchestrator::Orchestrator;
use crate::plan::RawUploadPayload;

#[derive(Clone)]
pub struct UploadState {
    pub orchestrator: Arc<Orchestrator>,
    pub persist_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    ok: bool,
    processing_ms: u128,
}

pub fn router(state: UploadState) -> Router {
    Router::new().route("/config", post(handle_upload)).with_state(state)
}

async fn handle_upload(State(state): State<UploadState>, Json(payload): Json<RawUploadPayload>) -> Response {
    let started = Instant::now();

    if let Err(e) = persist_raw_payload(&state.persist_path, &payload).await {
        tracing::warn!(error = %e, "failed to persist uploaded configuration");
    }

    match state.orchestrator.apply_plan(payload).await {
        Ok(()) => {
            let processing_ms = started.elapsed().as_millis();
            Json(UploadResponse { ok: true, processing_ms }).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to apply uploaded configuration");
            (StatusCode::UNPROCESSABLE_ENTITY, format!("failed to apply configuration: {e}")).into_response()
        }
    }
}

/// Write-to-temp-then-rename so a crash mid-write never leaves a partial
/// `parsed_data.json` on disk.
async fn persist_raw_payload(path: &std::path::Path, payload: &RawUploadPayload) -> std::io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(payload)?;

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(&body).await?;
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{InstanceInfo, UploadMetrics};
    use std::collections::BTreeMap;

    fn sample_payload() -> RawUploadPayload {
        RawUploadPayload {
            instance_info: InstanceInfo {
                nodes: 1,
                colors: 1,
                run_time: 0.1,
                solution_cost: 0.0,
            },
            deployment: BTreeMap::new(),
            routes: BTreeMap::new(),
            metrics: UploadMetrics {
                num_nodes_deployed: 0,
                average_path_weight: 0.0,
                percentage_covered: 0.0,
            },
            wl_nodes: vec![],
            table_entries: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn persists_payload_atomically_via_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parsed_data.json");
        persist_raw_payload(&path, &sample_payload()).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
