use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use log::error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::logic::{Executability, PipelineError, VersionStaging, WorkflowCompletion};
use crate::model::{
    CompletionRequest, Id, InstanceId, NewSqlVersion, SqlVersion, UserContext, VersionFilter,
    VersionSummary, WorkflowSummary,
};
use crate::store::traits::Store;

pub type AppState<S> = Arc<S>;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Workflows finalized before a batch completion failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<Vec<String>>,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
            completed: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AdmissionRequest {
    pub instance_ids: Vec<InstanceId>,
}

#[derive(Debug, Serialize)]
pub struct AdmissionResponse {
    pub admitted: bool,
}

#[derive(Debug, Deserialize)]
pub struct AssociateWorkflowsRequest {
    pub workflow_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AssociateWorkflowsResponse {
    pub version_id: Id,
    pub stage_id: Id,
    pub workflow_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteWorkflowsRequest {
    pub workflows: Vec<CompletionRequest>,
}

#[derive(Debug, Serialize)]
pub struct CompleteWorkflowsResponse {
    pub completed: Vec<String>,
}

fn status_for(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::PermissionDenied => StatusCode::FORBIDDEN,
        PipelineError::AlreadyBound { .. } => StatusCode::CONFLICT,
        PipelineError::InstancesNotContained { .. }
        | PipelineError::WorkflowAlreadyInStage { .. }
        | PipelineError::NoInstances
        | PipelineError::VersionLocked(_)
        | PipelineError::InvalidVersion(_)
        | PipelineError::NotExecutable(_)
        | PipelineError::InvalidWorkflowStatus(_)
        | PipelineError::NoSteps(_) => StatusCode::BAD_REQUEST,
        PipelineError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: PipelineError) -> (StatusCode, Json<ErrorResponse>) {
    let status = status_for(&error);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("{}", error);
        return (status, Json(ErrorResponse::new("internal storage error")));
    }
    (status, Json(ErrorResponse::new(&error.to_string())))
}

/// POST /projects/{project_id}/versions
pub async fn create_version<S: Store>(
    State(store): State<AppState<S>>,
    Path(project_id): Path<String>,
    _user: UserContext,
    RequestJson(req): RequestJson<NewSqlVersion>,
) -> ApiResult<SqlVersion> {
    VersionStaging::create_version(&*store, &project_id, &req)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /projects/{project_id}/versions
///
/// Newest first. `total` counts every match, not only the returned page.
pub async fn list_versions<S: Store>(
    State(store): State<AppState<S>>,
    Path(project_id): Path<String>,
    Query(filter): Query<VersionFilter>,
    _user: UserContext,
) -> ApiResult<ListResponse<VersionSummary>> {
    let (items, total) = VersionStaging::list_versions(&*store, &project_id, &filter)
        .await
        .map_err(error_response)?;
    Ok(Json(ListResponse { items, total }))
}

/// GET /projects/{project_id}/versions/{version_id}
pub async fn get_version<S: Store>(
    State(store): State<AppState<S>>,
    Path((project_id, version_id)): Path<(String, Id)>,
    _user: UserContext,
) -> ApiResult<SqlVersion> {
    VersionStaging::get_version(&*store, &project_id, version_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /projects/{project_id}/versions/{version_id}/stages/{stage_id}/eligible-workflows
pub async fn list_eligible_workflows<S: Store>(
    State(store): State<AppState<S>>,
    Path((project_id, version_id, stage_id)): Path<(String, Id, Id)>,
    _user: UserContext,
) -> ApiResult<ListResponse<WorkflowSummary>> {
    let items =
        VersionStaging::list_eligible_workflows(&*store, &project_id, version_id, stage_id)
            .await
            .map_err(error_response)?;
    Ok(Json(ListResponse {
        total: items.len() as u64,
        items,
    }))
}

/// POST /projects/{project_id}/versions/{version_id}/first-stage/check
pub async fn check_first_stage_admission<S: Store>(
    State(store): State<AppState<S>>,
    Path((project_id, version_id)): Path<(String, Id)>,
    _user: UserContext,
    RequestJson(req): RequestJson<AdmissionRequest>,
) -> ApiResult<AdmissionResponse> {
    VersionStaging::get_version(&*store, &project_id, version_id)
        .await
        .map_err(error_response)?;

    VersionStaging::check_first_stage_admission(&*store, version_id, &req.instance_ids)
        .await
        .map_err(error_response)?;
    Ok(Json(AdmissionResponse { admitted: true }))
}

/// POST /projects/{project_id}/versions/{version_id}/stages/{stage_id}/workflows
pub async fn batch_associate_workflows<S: Store>(
    State(store): State<AppState<S>>,
    Path((project_id, version_id, stage_id)): Path<(String, Id, Id)>,
    _user: UserContext,
    RequestJson(req): RequestJson<AssociateWorkflowsRequest>,
) -> ApiResult<AssociateWorkflowsResponse> {
    let workflow_ids = &req.workflow_ids;
    VersionStaging::batch_associate(&*store, &project_id, version_id, stage_id, workflow_ids)
        .await
        .map_err(error_response)?;
    Ok(Json(AssociateWorkflowsResponse {
        version_id,
        stage_id,
        workflow_ids: req.workflow_ids,
    }))
}

/// GET /projects/{project_id}/workflows/{workflow_id}/executable
pub async fn check_workflow_executable<S: Store>(
    State(store): State<AppState<S>>,
    Path((project_id, workflow_id)): Path<(String, String)>,
    _user: UserContext,
) -> ApiResult<Executability> {
    VersionStaging::check_executable(&*store, &project_id, &workflow_id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /projects/{project_id}/workflows/complete
///
/// Workflows are committed one at a time. On failure the response carries
/// the ids that were completed before it.
pub async fn complete_workflows<S: Store>(
    State(store): State<AppState<S>>,
    Path(project_id): Path<String>,
    user: UserContext,
    RequestJson(req): RequestJson<CompleteWorkflowsRequest>,
) -> ApiResult<CompleteWorkflowsResponse> {
    let result =
        WorkflowCompletion::complete_workflows(&*store, &project_id, &user, &req.workflows).await;
    match result {
        Ok(completed) => Ok(Json(CompleteWorkflowsResponse { completed })),
        Err(e) => {
            let completed = e.completed;
            let (status, Json(mut body)) = error_response(e.source);
            body.completed = Some(completed);
            Err((status, Json(body)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&PipelineError::not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&PipelineError::PermissionDenied), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&PipelineError::AlreadyBound {
                version_id: 1,
                stage_id: 2
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(&PipelineError::NoInstances), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&PipelineError::VersionLocked(3)), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&PipelineError::InvalidVersion("no stages".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&PipelineError::InvalidWorkflowStatus("finished".to_string())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_store_errors_are_not_leaked() {
        let (status, Json(body)) = error_response(PipelineError::Store {
            context: "Failed to load stage 1".to_string(),
            source: anyhow::anyhow!("password authentication failed for user \"sqlver\""),
        });
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "internal storage error");
    }

    #[test]
    fn test_error_body_omits_empty_completion_list() {
        let body = serde_json::to_value(ErrorResponse::new("nope")).unwrap();
        assert_eq!(body, serde_json::json!({"error": "nope"}));
    }
}
