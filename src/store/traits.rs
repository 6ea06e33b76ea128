use crate::model::{
    Id, InstanceId, InstanceRecord, NewSqlVersion, SqlVersion, Stage, VersionFilter,
    VersionSummary, Workflow, WorkflowFields, WorkflowStageBinding, WorkflowStep, WorkflowSummary,
};
use anyhow::Result;
use chrono::{DateTime, Utc};

/// Versions, their stages, and the workflow-to-stage bindings.
///
/// Stages handed out by implementations carry their instance and workflow
/// lists, with workflows ordered by sequence and `next_stage_id` derived from
/// stage sequence order.
#[async_trait::async_trait]
pub trait VersionStore: Send + Sync {
    /// Create the version with its stages and stage instances in one atomic write.
    async fn create_version(
        &self,
        project_id: &str,
        version: &NewSqlVersion,
    ) -> Result<SqlVersion>;
    async fn get_version(&self, version_id: Id) -> Result<Option<SqlVersion>>;
    /// Versions of a project, newest first, with the total count before paging
    async fn list_versions(
        &self,
        project_id: &str,
        filter: &VersionFilter,
    ) -> Result<(Vec<VersionSummary>, u64)>;
    async fn get_stage_of_version(&self, version_id: Id, stage_id: Id) -> Result<Option<Stage>>;
    /// Stage with the lowest sequence of the version
    async fn get_first_stage_of_version(&self, version_id: Id) -> Result<Option<Stage>>;
    /// Stage the workflow is currently bound to, if any
    async fn get_stage_of_workflow(&self, workflow_id: &str) -> Result<Option<Stage>>;
    async fn get_workflow_stage_binding(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowStageBinding>>;
    /// Bind all workflows to the stage in one atomic write.
    ///
    /// Must fail without writing anything if any workflow is already bound
    /// (to any stage) or appears twice in `workflow_ids`, or if the stage's
    /// version is locked.
    async fn batch_insert_workflow_stage_bindings(
        &self,
        stage: &Stage,
        workflow_ids: &[String],
    ) -> Result<()>;
    /// Flip every releasing version whose lock time is at or before `now` to locked.
    async fn lock_expired_versions(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Read/write access to workflow records owned by the workflow engine.
#[async_trait::async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Workflow of a project, with steps and instance records
    async fn get_workflow(&self, project_id: &str, workflow_id: &str) -> Result<Option<Workflow>>;
    /// Workflow by external id regardless of project
    async fn get_workflow_by_id(&self, workflow_id: &str) -> Result<Option<Workflow>>;
    /// Instances used by a workflow of the project; empty for unknown workflows
    async fn get_instance_ids_for_workflow(
        &self,
        project_id: &str,
        workflow_id: &str,
    ) -> Result<Vec<InstanceId>>;
    /// Open, unbound workflows of the project whose instances all fall inside `instance_ids`
    async fn get_workflows_eligible_for_stage(
        &self,
        project_id: &str,
        instance_ids: &[InstanceId],
    ) -> Result<Vec<WorkflowSummary>>;
    /// Persist a completed workflow, its last step, and the records marked executed, atomically
    async fn persist_completion(
        &self,
        workflow: &Workflow,
        last_step: &WorkflowStep,
        needs_exec: &[InstanceRecord],
    ) -> Result<()>;
    async fn update_workflow_fields(
        &self,
        workflow_id: &str,
        fields: WorkflowFields,
    ) -> Result<()>;
}

#[async_trait::async_trait]
pub trait PermissionStore: Send + Sync {
    async fn can_operate_project(&self, user_id: &str, project_id: &str) -> Result<bool>;
}

pub trait Store: VersionStore + WorkflowStore + PermissionStore + Send + Sync {}
