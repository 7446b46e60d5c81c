use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::{
    extractors::ValidatedJson,
    models::session::{
        RecordExposureRequest, RecordSessionRequest, SelectSessionRequest, SelectSessionResponse,
    },
    services::{
        catalog_service::CatalogService,
        completion_service::{CompletionError, CompletionService},
        recorder_service::RecorderService,
        selector_service::{SelectorError, SelectorService},
        AppState,
    },
};

pub async fn next_session(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<SelectSessionRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    tracing::info!(
        "Selecting session for assignment_id={}, student_id={}, session_size={}",
        req.assignment_id,
        req.student_id,
        req.session_size
    );

    let catalog = CatalogService::new(state.http_client.clone(), state.config.catalog_api_url.clone());
    let service = SelectorService::new(state.mongo.clone(), catalog);

    match service.next_session(&req).await {
        Ok(items) => Ok((
            StatusCode::OK,
            Json(SelectSessionResponse {
                assignment_id: req.assignment_id,
                student_id: req.student_id,
                items,
            }),
        )),
        Err(e) => {
            tracing::error!("Failed to select session: {}", e);
            Err((selector_error_status(&e), e.to_string()))
        }
    }
}

fn selector_error_status(error: &SelectorError) -> StatusCode {
    match error {
        SelectorError::EmptyPool(_) => StatusCode::NOT_FOUND,
        SelectorError::Catalog(_) => StatusCode::BAD_GATEWAY,
    }
}

pub async fn record_session(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<RecordSessionRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    tracing::info!(
        "Recording session result for assignment_id={}, student_id={}, game_id={}",
        req.assignment_id,
        req.student_id,
        req.game_id
    );

    let service = RecorderService::new(state.mongo.clone(), state.redis.clone());

    match service.record_session(&req).await {
        Ok(response) => Ok((StatusCode::OK, Json(response))),
        Err(e) => {
            tracing::error!("Failed to record session result: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn record_exposure(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<RecordExposureRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let service = RecorderService::new(state.mongo.clone(), state.redis.clone());

    match service.record_item_exposure(&req).await {
        Ok(()) => Ok((StatusCode::NO_CONTENT, ())),
        Err(e) => {
            tracing::error!("Failed to record exposure: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn get_completion(
    State(state): State<Arc<AppState>>,
    Path((assignment_id, student_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    tracing::info!(
        "Evaluating completion for assignment_id={}, student_id={}",
        assignment_id,
        student_id
    );

    let service = CompletionService::new(state.mongo.clone());

    match service.evaluate(&assignment_id, &student_id).await {
        Ok(status) => Ok((StatusCode::OK, Json(status))),
        Err(CompletionError::GoalNotFound(id)) => Err((
            StatusCode::NOT_FOUND,
            format!("No completion goal configured for assignment {}", id),
        )),
        Err(CompletionError::Storage(e)) => {
            tracing::error!("Failed to evaluate completion: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_errors_map_to_stable_status_codes() {
        assert_eq!(
            selector_error_status(&SelectorError::EmptyPool("a1".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            selector_error_status(&SelectorError::Catalog(anyhow::anyhow!(
                "catalog timed out"
            ))),
            StatusCode::BAD_GATEWAY
        );
    }
}
