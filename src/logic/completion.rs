use log::{debug, info, warn};

use crate::logic::error::{BatchCompletionError, PipelineError, PipelineResult, StoreContext};
use crate::logic::staging::VersionStaging;
use crate::model::{
    CompletionRequest, InstanceRecord, StepState, UserContext, Workflow, WorkflowFields,
    WorkflowStatus,
};
use crate::store::traits::{Store, WorkflowStore};

/// Forces workflows to "finished" without running them.
pub struct WorkflowCompletion;

impl WorkflowCompletion {
    /// Load the workflow and check it sits in a status that may be completed.
    pub async fn check_can_complete<S: WorkflowStore>(
        store: &S,
        project_id: &str,
        workflow_id: &str,
    ) -> PipelineResult<Workflow> {
        let workflow = store
            .get_workflow(project_id, workflow_id)
            .await
            .store_context(|| format!("Failed to load workflow '{}'", workflow_id))?
            .ok_or_else(|| {
                PipelineError::not_found(format!(
                    "workflow '{}' of project '{}'",
                    workflow_id, project_id
                ))
            })?;

        match workflow.status {
            WorkflowStatus::WaitForExecution | WorkflowStatus::ExecFailed => Ok(workflow),
            other => Err(PipelineError::InvalidWorkflowStatus(other.to_string())),
        }
    }

    /// Complete a single workflow.
    ///
    /// Preconditions are checked in order: pipeline executability, the
    /// can-complete status rule, then caller permission. The completion
    /// itself is one store transaction. The remark is a separate update made
    /// afterwards; if it fails the workflow still counts as completed.
    pub async fn complete_workflow<S: Store>(
        store: &S,
        project_id: &str,
        user: &UserContext,
        request: &CompletionRequest,
    ) -> PipelineResult<()> {
        let workflow_id = request.workflow_id.as_str();

        let executability =
            VersionStaging::check_executable(store, project_id, workflow_id).await?;
        if !executability.executable {
            return Err(PipelineError::NotExecutable(executability.reason));
        }

        let mut workflow = Self::check_can_complete(store, project_id, workflow_id).await?;

        let can_operate = store
            .can_operate_project(&user.user_id, project_id)
            .await
            .store_context(|| {
                format!("Failed to resolve permissions of user '{}'", user.user_id)
            })?;

        // A workflow without steps has no assignees
        let is_assignee = workflow
            .last_step()
            .map(|step| step.is_assignee(&user.user_id))
            .unwrap_or(false);
        if !can_operate && !is_assignee {
            return Err(PipelineError::PermissionDenied);
        }

        let last_step = workflow
            .steps
            .last_mut()
            .ok_or_else(|| PipelineError::NoSteps(workflow_id.to_string()))?;

        last_step.state = StepState::Approved;
        last_step.operation_user_id = Some(user.user_id.clone());
        let last_step = last_step.clone();

        workflow.status = WorkflowStatus::Finished;
        workflow.current_step_id = None;

        let mut needs_exec: Vec<InstanceRecord> = Vec::new();
        for record in workflow.instance_records.iter_mut().filter(|r| r.needs_exec()) {
            record.is_sql_executed = true;
            record.execution_user_id = Some(user.user_id.clone());
            needs_exec.push(record.clone());
        }
        debug!(
            "Marking {} instance record(s) of workflow '{}' as executed by '{}'",
            needs_exec.len(),
            workflow_id,
            user.user_id
        );

        store
            .persist_completion(&workflow, &last_step, &needs_exec)
            .await
            .store_context(|| {
                format!("Failed to persist completion of workflow '{}'", workflow_id)
            })?;

        if let Some(remark) = request.remark.as_deref().filter(|r| !r.is_empty()) {
            let fields = WorkflowFields {
                description: Some(append_remark(&workflow.description, remark)),
            };
            if let Err(e) = store.update_workflow_fields(workflow_id, fields).await {
                warn!(
                    "Workflow '{}' is completed but its remark was not saved: {:#}",
                    workflow_id, e
                );
            }
        }

        info!(
            "Workflow '{}' in project '{}' completed by '{}'",
            workflow_id, project_id, user.user_id
        );
        Ok(())
    }

    /// Complete workflows one by one, committing each independently.
    ///
    /// Stops at the first failure. Workflows completed before it stay
    /// completed and are reported in the error.
    pub async fn complete_workflows<S: Store>(
        store: &S,
        project_id: &str,
        user: &UserContext,
        requests: &[CompletionRequest],
    ) -> Result<Vec<String>, BatchCompletionError> {
        let mut completed = Vec::with_capacity(requests.len());

        for request in requests {
            if let Err(source) = Self::complete_workflow(store, project_id, user, request).await {
                warn!(
                    "Refused to complete workflow '{}' in project '{}' for '{}': {} ({} already completed)",
                    request.workflow_id,
                    project_id,
                    user.user_id,
                    source,
                    completed.len()
                );
                return Err(BatchCompletionError {
                    completed,
                    workflow_id: request.workflow_id.clone(),
                    source,
                });
            }
            completed.push(request.workflow_id.clone());
        }

        Ok(completed)
    }
}

fn append_remark(description: &str, remark: &str) -> String {
    if description.is_empty() {
        remark.to_string()
    } else {
        format!("{}\n{}", description, remark)
    }
}
