use std::collections::HashSet;

use crate::logic::error::{PipelineError, PipelineResult};
use crate::model::{InstanceId, Stage, WorkflowSummary};

impl Stage {
    /// Check that every instance is declared by this stage.
    ///
    /// Fails on the first instance that is missing. An empty input is
    /// vacuously contained; callers that must reject workflows without
    /// instances do so before calling this.
    pub fn contains_instances(&self, instance_ids: &[InstanceId]) -> PipelineResult<()> {
        let declared: HashSet<InstanceId> = self.instances.iter().map(|i| i.instance_id).collect();

        match instance_ids.iter().find(|id| !declared.contains(*id)) {
            Some(missing) => Err(PipelineError::InstancesNotContained {
                stage: self.name.clone(),
                instance_id: *missing,
            }),
            None => Ok(()),
        }
    }

    /// Check that the workflow is not already bound to this stage.
    pub fn contains_workflow(&self, workflow: &WorkflowSummary) -> PipelineResult<()> {
        let bound: HashSet<&str> = self
            .workflows
            .iter()
            .map(|w| w.workflow_id.as_str())
            .collect();

        if bound.contains(workflow.workflow_id.as_str()) {
            return Err(PipelineError::WorkflowAlreadyInStage {
                stage: self.name.clone(),
                subject: workflow.subject.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::logic::error::PipelineError;
    use crate::model::{
        Stage, StageInstance, StageWorkflow, WorkflowReleaseStatus, WorkflowStatus, WorkflowSummary,
    };

    fn stage_with_instances(ids: &[u64]) -> Stage {
        let instances = ids
            .iter()
            .enumerate()
            .map(|(i, id)| StageInstance::new(i as u64 + 1, *id, None))
            .collect();
        Stage::new(1, "staging", 2, instances)
    }

    fn summary(workflow_id: &str) -> WorkflowSummary {
        WorkflowSummary {
            id: 1,
            workflow_id: workflow_id.to_string(),
            subject: "add index on orders".to_string(),
            description: String::new(),
            status: WorkflowStatus::WaitForExecution,
        }
    }

    #[test]
    fn test_contains_instances_subset() {
        let stage = stage_with_instances(&[1, 2, 3]);
        assert!(stage.contains_instances(&[2, 3]).is_ok());
        assert!(stage.contains_instances(&[3, 2, 1]).is_ok());
        assert!(stage.contains_instances(&[2, 2]).is_ok());
    }

    #[test]
    fn test_contains_instances_reports_first_missing() {
        let stage = stage_with_instances(&[1, 2, 3]);
        match stage.contains_instances(&[2, 4, 5]) {
            Err(PipelineError::InstancesNotContained { stage, instance_id }) => {
                assert_eq!(stage, "staging");
                assert_eq!(instance_id, 4);
            }
            other => panic!("expected containment error, got {:?}", other),
        }
    }

    #[test]
    fn test_contains_instances_empty_input_is_vacuous() {
        assert!(stage_with_instances(&[1]).contains_instances(&[]).is_ok());
        assert!(stage_with_instances(&[]).contains_instances(&[]).is_ok());
        assert!(stage_with_instances(&[]).contains_instances(&[1]).is_err());
    }

    #[test]
    fn test_contains_instances_is_repeatable() {
        let stage = stage_with_instances(&[1, 2]);
        let first = stage.contains_instances(&[1, 9]).is_ok();
        let second = stage.contains_instances(&[1, 9]).is_ok();
        assert_eq!(first, second);
    }

    #[test]
    fn test_contains_workflow() {
        let mut stage = stage_with_instances(&[1]);
        assert!(stage.contains_workflow(&summary("wf-1")).is_ok());

        stage.workflows.push(StageWorkflow {
            id: 1,
            workflow_id: "wf-1".to_string(),
            sequence: 1,
            release_status: WorkflowReleaseStatus::BeingReleased,
            subject: "add index on orders".to_string(),
            description: String::new(),
        });
        let err = stage.contains_workflow(&summary("wf-1")).unwrap_err();
        assert!(matches!(err, PipelineError::WorkflowAlreadyInStage { .. }));
        assert!(err.to_string().contains("stage name: staging"));
        assert!(err.to_string().contains("workflow subject: add index on orders"));
        assert!(stage.contains_workflow(&summary("wf-2")).is_ok());
    }
}
