use crate::model::{Id, InstanceId, ProjectId, WorkflowId};
use anyhow::anyhow;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    WaitForAudit,
    WaitForExecution,
    Executing,
    ExecFailed,
    Finished,
    Canceled,
    Rejected,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::WaitForAudit => "wait_for_audit",
            WorkflowStatus::WaitForExecution => "wait_for_execution",
            WorkflowStatus::Executing => "executing",
            WorkflowStatus::ExecFailed => "exec_failed",
            WorkflowStatus::Finished => "finished",
            WorkflowStatus::Canceled => "canceled",
            WorkflowStatus::Rejected => "rejected",
        }
    }

    /// Finished or canceled workflows no longer hold back later workflows in a stage.
    pub fn is_closed(&self) -> bool {
        matches!(self, WorkflowStatus::Finished | WorkflowStatus::Canceled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait_for_audit" => Ok(WorkflowStatus::WaitForAudit),
            "wait_for_execution" => Ok(WorkflowStatus::WaitForExecution),
            "executing" => Ok(WorkflowStatus::Executing),
            "exec_failed" => Ok(WorkflowStatus::ExecFailed),
            "finished" => Ok(WorkflowStatus::Finished),
            "canceled" => Ok(WorkflowStatus::Canceled),
            "rejected" => Ok(WorkflowStatus::Rejected),
            other => Err(anyhow!("Unknown workflow status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Initialized,
    Approved,
    Rejected,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Initialized => "initialized",
            StepState::Approved => "approved",
            StepState::Rejected => "rejected",
        }
    }
}

impl FromStr for StepState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(StepState::Initialized),
            "approved" => Ok(StepState::Approved),
            "rejected" => Ok(StepState::Rejected),
            other => Err(anyhow!("Unknown step state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Initialized,
    Audited,
    Executing,
    ExecSucceeded,
    ExecFailed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Initialized => "initialized",
            TaskStatus::Audited => "audited",
            TaskStatus::Executing => "executing",
            TaskStatus::ExecSucceeded => "exec_succeeded",
            TaskStatus::ExecFailed => "exec_failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(TaskStatus::Initialized),
            "audited" => Ok(TaskStatus::Audited),
            "executing" => Ok(TaskStatus::Executing),
            "exec_succeeded" => Ok(TaskStatus::ExecSucceeded),
            "exec_failed" => Ok(TaskStatus::ExecFailed),
            other => Err(anyhow!("Unknown task status '{}'", other)),
        }
    }
}

/// One approval step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Id,
    /// Comma-separated user ids, matched entry by entry without trimming
    pub assignees: String,
    pub state: StepState,
    pub operation_user_id: Option<String>,
}

impl WorkflowStep {
    pub fn is_assignee(&self, user_id: &str) -> bool {
        !user_id.is_empty() && self.assignees.split(',').any(|assignee| assignee == user_id)
    }
}

/// The per-instance task of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: Id,
    pub instance_id: InstanceId,
    pub task_status: TaskStatus,
    pub is_sql_executed: bool,
    pub execution_user_id: Option<String>,
}

impl InstanceRecord {
    /// Records that were audited or failed execution still count as "not run".
    pub fn needs_exec(&self) -> bool {
        matches!(self.task_status, TaskStatus::ExecFailed | TaskStatus::Audited)
    }
}

/// A SQL change workflow, owned by the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Id,
    pub workflow_id: WorkflowId,
    pub project_id: ProjectId,
    pub subject: String,
    pub description: String,
    pub status: WorkflowStatus,
    pub current_step_id: Option<Id>,
    pub steps: Vec<WorkflowStep>,
    pub instance_records: Vec<InstanceRecord>,
}

impl Workflow {
    pub fn last_step(&self) -> Option<&WorkflowStep> {
        self.steps.last()
    }

    /// Distinct instances touched by the workflow, in ascending order.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.instance_records
            .iter()
            .map(|record| record.instance_id)
            .sorted()
            .dedup()
            .collect()
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id,
            workflow_id: self.workflow_id.clone(),
            subject: self.subject.clone(),
            description: self.description.clone(),
            status: self.status,
        }
    }
}

/// Lightweight view of a workflow returned by candidate listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: Id,
    pub workflow_id: WorkflowId,
    pub subject: String,
    pub description: String,
    pub status: WorkflowStatus,
}

/// Fields of a workflow that may be updated outside the completion transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFields {
    pub description: Option<String>,
}

/// One entry of a batch completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

impl CompletionRequest {
    pub fn new(workflow_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            remark: None,
        }
    }

    pub fn with_remark(workflow_id: &str, remark: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            remark: Some(remark.to_string()),
        }
    }
}
