mod common;

use common::{ids, seeded_store, workflow, DEV, PROD, PROJECT, TEST, VERSION};
use sqlver_rust::store::{VersionStore, WorkflowStore};
use sqlver_rust::{
    CompletionRequest, MemoryStore, PipelineError, UserContext, VersionStaging,
    WorkflowCompletion, WorkflowReleaseStatus, WorkflowStatus,
};

async fn status_of(store: &MemoryStore, workflow_id: &str) -> WorkflowStatus {
    store.get_workflow_by_id(workflow_id).await.unwrap().unwrap().status
}

#[tokio::test]
async fn test_containment_is_subset_check() {
    let store = seeded_store();
    let dev = store.get_stage_of_version(VERSION, DEV).await.unwrap().unwrap();

    assert!(dev.contains_instances(&[1, 2]).is_ok());
    assert!(dev.contains_instances(&[2]).is_ok());

    let err = dev.contains_instances(&[2, 4]).unwrap_err();
    match err {
        PipelineError::InstancesNotContained { ref stage, instance_id } => {
            assert_eq!(stage, "dev");
            assert_eq!(instance_id, 4);
        }
        other => panic!("expected containment error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_binding_is_exclusive_across_stages_and_versions() {
    let store = seeded_store();
    store.insert_workflow(workflow("w1", 1, &[3]));

    VersionStaging::batch_associate(&store, PROJECT, VERSION, TEST, &ids(&["w1"]))
        .await
        .unwrap();

    // Same stage again, then a stage of another version
    let again = VersionStaging::batch_associate(&store, PROJECT, VERSION, TEST, &ids(&["w1"]))
        .await
        .unwrap_err();
    assert!(matches!(
        again,
        PipelineError::AlreadyBound {
            version_id: VERSION,
            stage_id: TEST
        }
    ));

    let elsewhere = VersionStaging::batch_associate(&store, PROJECT, 2, 40, &ids(&["w1"]))
        .await
        .unwrap_err();
    assert!(matches!(elsewhere, PipelineError::AlreadyBound { .. }));

    let binding = store.get_workflow_stage_binding("w1").await.unwrap().unwrap();
    assert_eq!((binding.version_id, binding.stage_id, binding.sequence), (VERSION, TEST, 1));
    assert_eq!(store.binding_count(), 1);
}

#[tokio::test]
async fn test_batch_associate_is_all_or_nothing() {
    let store = seeded_store();
    store.insert_workflow(workflow("w1", 1, &[1]));
    store.insert_workflow(workflow("w2", 2, &[1, 3]));
    store.insert_workflow(workflow("w3", 3, &[2]));

    let batch = ids(&["w1", "w2", "w3"]);
    let err = VersionStaging::batch_associate(&store, PROJECT, VERSION, DEV, &batch)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InstancesNotContained { instance_id: 3, .. }));

    assert!(store.get_workflow_stage_binding("w1").await.unwrap().is_none());
    assert!(store.get_workflow_stage_binding("w3").await.unwrap().is_none());
    assert_eq!(store.binding_count(), 0);
}

#[tokio::test]
async fn test_workflow_without_instances_is_always_rejected() {
    let store = seeded_store();
    store.insert_workflow(workflow("empty", 1, &[]));

    for (version_id, stage_id) in [(VERSION, DEV), (VERSION, TEST), (VERSION, PROD), (2, 40)] {
        let err =
            VersionStaging::batch_associate(&store, PROJECT, version_id, stage_id, &ids(&["empty"]))
                .await
                .unwrap_err();
        assert!(matches!(err, PipelineError::NoInstances), "stage {}", stage_id);
    }

    // Unknown workflow ids resolve to no instances as well
    let err = VersionStaging::batch_associate(&store, PROJECT, VERSION, DEV, &ids(&["missing"]))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoInstances));
    assert_eq!(store.binding_count(), 0);
}

#[tokio::test]
async fn test_first_stage_admission_only_looks_at_first_stage() {
    let store = seeded_store();

    assert!(VersionStaging::check_first_stage_admission(&store, VERSION, &[1, 2])
        .await
        .is_ok());

    // Later stages would contain these, the first stage does not
    let err = VersionStaging::check_first_stage_admission(&store, VERSION, &[3, 4])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InstancesNotContained { ref stage, .. } if stage == "dev"
    ));

    assert!(VersionStaging::check_first_stage_admission(&store, VERSION, &[1, 5])
        .await
        .is_err());
}

#[tokio::test]
async fn test_checks_are_repeatable_against_unchanged_state() {
    let store = seeded_store();

    for instances in [vec![1, 2], vec![1, 3], vec![]] {
        let first = VersionStaging::check_first_stage_admission(&store, VERSION, &instances)
            .await
            .is_ok();
        let second = VersionStaging::check_first_stage_admission(&store, VERSION, &instances)
            .await
            .is_ok();
        assert_eq!(first, second, "instances {:?}", instances);
    }

    let dev = store.get_stage_of_version(VERSION, DEV).await.unwrap().unwrap();
    assert_eq!(
        dev.contains_instances(&[1, 9]).is_ok(),
        dev.contains_instances(&[1, 9]).is_ok()
    );
}

#[tokio::test]
async fn test_bindings_get_sequence_and_release_status() {
    let store = seeded_store();
    store.insert_workflow(workflow("w1", 1, &[1]));
    store.insert_workflow(workflow("w2", 2, &[2]));
    store.insert_workflow(workflow("w3", 3, &[1, 2]));
    store.insert_workflow(workflow("p1", 4, &[5]));

    VersionStaging::batch_associate(&store, PROJECT, VERSION, DEV, &ids(&["w2", "w1"]))
        .await
        .unwrap();
    VersionStaging::batch_associate(&store, PROJECT, VERSION, DEV, &ids(&["w3"]))
        .await
        .unwrap();
    VersionStaging::batch_associate(&store, PROJECT, VERSION, PROD, &ids(&["p1"]))
        .await
        .unwrap();

    let version = VersionStaging::get_version(&store, PROJECT, VERSION).await.unwrap();
    let names: Vec<&str> = version.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["dev", "test", "prod"]);
    assert_eq!(version.stages[0].next_stage_id, Some(TEST));
    assert_eq!(version.stages[2].next_stage_id, None);

    let dev: Vec<(&str, i32, WorkflowReleaseStatus)> = version.stages[0]
        .workflows
        .iter()
        .map(|w| (w.workflow_id.as_str(), w.sequence, w.release_status))
        .collect();
    assert_eq!(
        dev,
        vec![
            ("w2", 1, WorkflowReleaseStatus::BeingReleased),
            ("w1", 2, WorkflowReleaseStatus::BeingReleased),
            ("w3", 3, WorkflowReleaseStatus::BeingReleased),
        ]
    );
    assert_eq!(
        version.stages[2].workflows[0].release_status,
        WorkflowReleaseStatus::NotNeedReleased
    );
}

#[tokio::test]
async fn test_only_operators_and_last_step_assignees_can_complete() {
    let store = seeded_store();
    store.grant_project_operator(PROJECT, "admin");
    store.insert_workflow(workflow("by-assignee", 1, &[1]));
    store.insert_workflow(workflow("by-operator", 2, &[2]));
    store.insert_workflow(workflow("by-outsider", 3, &[3]));

    WorkflowCompletion::complete_workflow(
        &store,
        PROJECT,
        &UserContext::new("bob"),
        &CompletionRequest::new("by-assignee"),
    )
    .await
    .unwrap();
    WorkflowCompletion::complete_workflow(
        &store,
        PROJECT,
        &UserContext::new("admin"),
        &CompletionRequest::new("by-operator"),
    )
    .await
    .unwrap();

    // "reviewer" is an assignee of the first step only
    let err = WorkflowCompletion::complete_workflow(
        &store,
        PROJECT,
        &UserContext::new("reviewer"),
        &CompletionRequest::new("by-outsider"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PipelineError::PermissionDenied));

    assert_eq!(status_of(&store, "by-assignee").await, WorkflowStatus::Finished);
    assert_eq!(status_of(&store, "by-operator").await, WorkflowStatus::Finished);
    assert_eq!(status_of(&store, "by-outsider").await, WorkflowStatus::WaitForExecution);
}

#[tokio::test]
async fn test_completion_batch_commits_each_workflow_independently() {
    let store = seeded_store();
    let mut restricted = workflow("w2", 2, &[2]);
    restricted.steps[1].assignees = "carol".to_string();
    store.insert_workflow(workflow("w1", 1, &[1]));
    store.insert_workflow(restricted);

    let err = WorkflowCompletion::complete_workflows(
        &store,
        PROJECT,
        &UserContext::new("alice"),
        &[CompletionRequest::new("w1"), CompletionRequest::new("w2")],
    )
    .await
    .unwrap_err();

    assert_eq!(err.completed, vec!["w1".to_string()]);
    assert!(matches!(err.source, PipelineError::PermissionDenied));

    let w2 = store.get_workflow_by_id("w2").await.unwrap().unwrap();
    assert_eq!(status_of(&store, "w1").await, WorkflowStatus::Finished);
    assert_eq!(w2.status, WorkflowStatus::WaitForExecution);
    assert_eq!(w2.current_step_id, Some(22));
}

#[tokio::test]
async fn test_stage_order_gates_completion() {
    let store = seeded_store();
    store.insert_workflow(workflow("first", 1, &[1]));
    store.insert_workflow(workflow("second", 2, &[2]));
    VersionStaging::batch_associate(&store, PROJECT, VERSION, DEV, &ids(&["first", "second"]))
        .await
        .unwrap();

    let alice = UserContext::new("alice");
    let second = CompletionRequest::new("second");
    let blocked = WorkflowCompletion::complete_workflow(&store, PROJECT, &alice, &second)
        .await
        .unwrap_err();
    assert!(matches!(blocked, PipelineError::NotExecutable(_)));

    WorkflowCompletion::complete_workflows(
        &store,
        PROJECT,
        &alice,
        &[CompletionRequest::new("first"), CompletionRequest::new("second")],
    )
    .await
    .unwrap();

    let executable = VersionStaging::check_executable(&store, PROJECT, "second").await.unwrap();
    assert!(executable.executable);
}

#[tokio::test]
async fn test_eligible_workflows_exclude_bound_ones() {
    let store = seeded_store();
    store.insert_workflow(workflow("a", 1, &[1]));
    store.insert_workflow(workflow("b", 2, &[1, 2]));
    store.insert_workflow(workflow("c", 3, &[3]));

    let before = VersionStaging::list_eligible_workflows(&store, PROJECT, VERSION, DEV)
        .await
        .unwrap();
    assert_eq!(
        before.iter().map(|w| w.workflow_id.as_str()).collect::<Vec<_>>(),
        vec!["a", "b"]
    );

    VersionStaging::batch_associate(&store, PROJECT, VERSION, DEV, &ids(&["a"]))
        .await
        .unwrap();

    let after = VersionStaging::list_eligible_workflows(&store, PROJECT, VERSION, DEV)
        .await
        .unwrap();
    assert_eq!(
        after.iter().map(|w| w.workflow_id.as_str()).collect::<Vec<_>>(),
        vec!["b"]
    );
}

#[tokio::test]
async fn test_workflows_of_other_projects_are_never_staged() {
    let store = seeded_store();
    let mut foreign = workflow("foreign", 1, &[1]);
    foreign.project_id = "project-2".to_string();
    store.insert_workflow(foreign);
    store.insert_workflow(workflow("local", 2, &[2]));

    let eligible = VersionStaging::list_eligible_workflows(&store, PROJECT, VERSION, DEV)
        .await
        .unwrap();
    assert_eq!(
        eligible.iter().map(|w| w.workflow_id.as_str()).collect::<Vec<_>>(),
        vec!["local"]
    );

    // The whole batch is refused, the local workflow included
    let err = VersionStaging::batch_associate(
        &store,
        PROJECT,
        VERSION,
        DEV,
        &ids(&["local", "foreign"]),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PipelineError::NoInstances));
    assert_eq!(store.binding_count(), 0);
}

#[tokio::test]
async fn test_assignee_entries_must_match_exactly() {
    let store = seeded_store();
    let mut spaced = workflow("spaced", 1, &[1]);
    spaced.steps[1].assignees = "alice, bob".to_string();
    store.insert_workflow(spaced);

    let err = WorkflowCompletion::complete_workflow(
        &store,
        PROJECT,
        &UserContext::new("bob"),
        &CompletionRequest::new("spaced"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PipelineError::PermissionDenied));

    WorkflowCompletion::complete_workflow(
        &store,
        PROJECT,
        &UserContext::new("alice"),
        &CompletionRequest::new("spaced"),
    )
    .await
    .unwrap();
    assert_eq!(status_of(&store, "spaced").await, WorkflowStatus::Finished);
}
