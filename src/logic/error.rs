use thiserror::Error;

use crate::model::{Id, InstanceId};

/// Failures of the staging pipeline and workflow completion.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0} not found")]
    NotFound(String),

    #[error(
        "can not attach workflow to stage '{stage}': instance {instance_id} of the workflow does not belong to this stage, the instances of the workflow are not entirely a subset of the stage"
    )]
    InstancesNotContained { stage: String, instance_id: InstanceId },

    #[error("can not associate workflow to stage, workflow already exist in this stage. stage name: {stage}, workflow subject: {subject}")]
    WorkflowAlreadyInStage { stage: String, subject: String },

    #[error("workflow can only be bound with a stage, this workflow has bound with another stage of version, version id {version_id} stage id {stage_id}")]
    AlreadyBound { version_id: Id, stage_id: Id },

    #[error("the workflow does not use any instance")]
    NoInstances,

    #[error("sql version {0} is locked and no longer accepts workflows")]
    VersionLocked(Id),

    #[error("invalid sql version: {0}")]
    InvalidVersion(String),

    #[error("the current user does not have permission to end these work orders")]
    PermissionDenied,

    #[error("{0}")]
    NotExecutable(String),

    #[error("workflow status is {0}, not allow operate it")]
    InvalidWorkflowStatus(String),

    #[error("workflow '{0}' has no approval step")]
    NoSteps(String),

    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        PipelineError::NotFound(what.into())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Attach stage/version context to a store failure.
pub trait StoreContext<T> {
    fn store_context<F: FnOnce() -> String>(self, context: F) -> PipelineResult<T>;
}

impl<T> StoreContext<T> for anyhow::Result<T> {
    fn store_context<F: FnOnce() -> String>(self, context: F) -> PipelineResult<T> {
        self.map_err(|source| PipelineError::Store {
            context: context(),
            source,
        })
    }
}

/// Error of a batch completion: the workflows finalized before the failure
/// stay finalized.
#[derive(Debug, Error)]
#[error("failed to complete workflow '{workflow_id}' after completing {} workflow(s): {source}", .completed.len())]
pub struct BatchCompletionError {
    pub completed: Vec<String>,
    pub workflow_id: String,
    #[source]
    pub source: PipelineError,
}
