#![allow(dead_code)]

use sqlver_rust::{
    Id, InstanceId, InstanceRecord, MemoryStore, SqlVersion, Stage, StageInstance, StepState,
    TaskStatus, Workflow, WorkflowStatus, WorkflowStep,
};

pub const PROJECT: &str = "project-1";
pub const VERSION: Id = 1;
pub const DEV: Id = 10;
pub const TEST: Id = 20;
pub const PROD: Id = 30;

/// dev {1, 2} -> test {3, 4} -> prod {5}, plus a second version whose first
/// stage covers every instance.
pub fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.insert_version(SqlVersion::new(
        VERSION,
        PROJECT.to_string(),
        "2024.06".to_string(),
        vec![
            // Stages are declared out of order; sequence decides
            Stage::new(
                PROD,
                "prod",
                3,
                vec![StageInstance::new(5, 5, None)],
            ),
            Stage::new(
                DEV,
                "dev",
                1,
                vec![StageInstance::new(1, 1, Some(3)), StageInstance::new(2, 2, Some(4))],
            ),
            Stage::new(
                TEST,
                "test",
                2,
                vec![StageInstance::new(3, 3, Some(5)), StageInstance::new(4, 4, Some(5))],
            ),
        ],
    ));
    store.insert_version(SqlVersion::new(
        2,
        PROJECT.to_string(),
        "2024.07".to_string(),
        vec![Stage::new(
            40,
            "all",
            1,
            (1..=5).map(|i| StageInstance::new(100 + i, i, None)).collect(),
        )],
    ));
    store
}

pub fn workflow(workflow_id: &str, id: Id, instance_ids: &[InstanceId]) -> Workflow {
    Workflow {
        id,
        workflow_id: workflow_id.to_string(),
        project_id: PROJECT.to_string(),
        subject: format!("change {}", workflow_id),
        description: String::new(),
        status: WorkflowStatus::WaitForExecution,
        current_step_id: Some(id * 10 + 2),
        steps: vec![
            WorkflowStep {
                id: id * 10 + 1,
                assignees: "reviewer".to_string(),
                state: StepState::Approved,
                operation_user_id: Some("reviewer".to_string()),
            },
            WorkflowStep {
                id: id * 10 + 2,
                assignees: "alice,bob".to_string(),
                state: StepState::Initialized,
                operation_user_id: None,
            },
        ],
        instance_records: instance_ids
            .iter()
            .enumerate()
            .map(|(i, instance_id)| InstanceRecord {
                id: id * 100 + i as Id,
                instance_id: *instance_id,
                task_status: TaskStatus::Audited,
                is_sql_executed: false,
                execution_user_id: None,
            })
            .collect(),
    }
}

pub fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}
