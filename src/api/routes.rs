use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::store::traits::Store;

pub fn create_router<S: Store + 'static>() -> Router<Arc<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Versions and stages
        .route(
            "/projects/:project_id/versions",
            post(handlers::create_version::<S>).get(handlers::list_versions::<S>),
        )
        .route(
            "/projects/:project_id/versions/:version_id",
            get(handlers::get_version::<S>),
        )
        .route(
            "/projects/:project_id/versions/:version_id/first-stage/check",
            post(handlers::check_first_stage_admission::<S>),
        )
        .route(
            "/projects/:project_id/versions/:version_id/stages/:stage_id/eligible-workflows",
            get(handlers::list_eligible_workflows::<S>),
        )
        .route(
            "/projects/:project_id/versions/:version_id/stages/:stage_id/workflows",
            post(handlers::batch_associate_workflows::<S>),
        )
        // Workflows
        .route(
            "/projects/:project_id/workflows/:workflow_id/executable",
            get(handlers::check_workflow_executable::<S>),
        )
        .route(
            "/projects/:project_id/workflows/complete",
            post(handlers::complete_workflows::<S>),
        )
}
