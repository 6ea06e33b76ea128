use itertools::Itertools;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::logic::error::{PipelineError, PipelineResult, StoreContext};
use crate::model::{
    Id, InstanceId, NewSqlVersion, SqlVersion, Stage, VersionFilter, VersionSummary,
    WorkflowSummary,
};
use crate::store::traits::{VersionStore, WorkflowStore};

/// Whether a workflow may run under the staging rules, and why not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Executability {
    pub executable: bool,
    pub reason: String,
}

impl Executability {
    fn ready(reason: &str) -> Self {
        Self {
            executable: true,
            reason: reason.to_string(),
        }
    }

    fn blocked(reason: String) -> Self {
        Self {
            executable: false,
            reason,
        }
    }
}

/// Sort stages by sequence and check the shape of a version before it is stored.
///
/// The last stage promotes nowhere, so its `next_instance_id`s are dropped.
/// Any other promotion target must be an instance of the following stage.
fn normalize_new_version(version: &NewSqlVersion) -> PipelineResult<NewSqlVersion> {
    let invalid = |message: String| -> PipelineResult<NewSqlVersion> {
        Err(PipelineError::InvalidVersion(message))
    };

    if version.version.trim().is_empty() {
        return invalid("version name is required".to_string());
    }
    if version.stages.is_empty() {
        return invalid("at least one stage is required".to_string());
    }
    if let Some(sequence) = version.stages.iter().map(|s| s.sequence).duplicates().next() {
        return invalid(format!("stage sequence {} is used more than once", sequence));
    }

    let mut normalized = version.clone();
    normalized.stages.sort_by_key(|stage| stage.sequence);

    for stage in &normalized.stages {
        if stage.name.trim().is_empty() {
            return invalid(format!("stage with sequence {} has no name", stage.sequence));
        }
        let twice = stage.instances.iter().map(|i| i.instance_id).duplicates().next();
        if let Some(instance_id) = twice {
            return invalid(format!(
                "instance {} is listed more than once in stage '{}'",
                instance_id, stage.name
            ));
        }
    }

    let next_ranges: Vec<Option<Vec<InstanceId>>> = normalized
        .stages
        .iter()
        .skip(1)
        .map(|stage| Some(stage.instances.iter().map(|i| i.instance_id).collect()))
        .chain(std::iter::once(None))
        .collect();

    for (stage, next_range) in normalized.stages.iter_mut().zip(next_ranges) {
        for instance in &mut stage.instances {
            match (&next_range, instance.next_instance_id) {
                (None, _) => instance.next_instance_id = None,
                (Some(range), Some(next)) if !range.contains(&next) => {
                    return invalid(format!(
                        "instance {} of stage '{}' promotes to instance {}, which is not in the next stage",
                        instance.instance_id, stage.name, next
                    ));
                }
                _ => {}
            }
        }
    }

    Ok(normalized)
}

/// Owns every mutation of stage/workflow bindings.
pub struct VersionStaging;

impl VersionStaging {
    /// Create a version of the project with its stages, in releasing status.
    pub async fn create_version<S: VersionStore>(
        store: &S,
        project_id: &str,
        version: &NewSqlVersion,
    ) -> PipelineResult<SqlVersion> {
        let normalized = normalize_new_version(version)?;

        let created = store
            .create_version(project_id, &normalized)
            .await
            .store_context(|| {
                format!(
                    "Failed to create sql version '{}' of project '{}'",
                    version.version, project_id
                )
            })?;

        info!(
            "Created sql version '{}' ({}) with {} stage(s) in project '{}'",
            created.version,
            created.id,
            created.stages.len(),
            project_id
        );
        Ok(created)
    }

    /// Versions of a project matching the filter, newest first, plus the total count
    pub async fn list_versions<S: VersionStore>(
        store: &S,
        project_id: &str,
        filter: &VersionFilter,
    ) -> PipelineResult<(Vec<VersionSummary>, u64)> {
        store
            .list_versions(project_id, filter)
            .await
            .store_context(|| format!("Failed to list sql versions of project '{}'", project_id))
    }

    /// Version of a project with its stages in sequence order
    pub async fn get_version<S: VersionStore>(
        store: &S,
        project_id: &str,
        version_id: Id,
    ) -> PipelineResult<SqlVersion> {
        store
            .get_version(version_id)
            .await
            .store_context(|| format!("Failed to load sql version {}", version_id))?
            .filter(|version| version.project_id == project_id)
            .ok_or_else(|| {
                PipelineError::not_found(format!(
                    "sql version {} of project '{}'",
                    version_id, project_id
                ))
            })
    }

    async fn load_stage<S: VersionStore>(
        store: &S,
        version_id: Id,
        stage_id: Id,
    ) -> PipelineResult<Stage> {
        store
            .get_stage_of_version(version_id, stage_id)
            .await
            .store_context(|| {
                format!("Failed to load stage {} of sql version {}", stage_id, version_id)
            })?
            .ok_or_else(|| {
                PipelineError::not_found(format!(
                    "stage {} of sql version {}",
                    stage_id, version_id
                ))
            })
    }

    /// Workflows of the project that could be bound to the stage, in store order
    pub async fn list_eligible_workflows<S: VersionStore + WorkflowStore>(
        store: &S,
        project_id: &str,
        version_id: Id,
        stage_id: Id,
    ) -> PipelineResult<Vec<WorkflowSummary>> {
        Self::get_version(store, project_id, version_id).await?;
        let stage = Self::load_stage(store, version_id, stage_id).await?;
        let instance_range: Vec<InstanceId> = stage.instance_ids().into_iter().unique().collect();

        store
            .get_workflows_eligible_for_stage(project_id, &instance_range)
            .await
            .store_context(|| {
                format!(
                    "Failed to list workflows eligible for stage {} of sql version {}",
                    stage_id, version_id
                )
            })
    }

    /// Entry gate of the pipeline: the instances must all belong to the first stage.
    pub async fn check_first_stage_admission<S: VersionStore>(
        store: &S,
        version_id: Id,
        instance_ids: &[InstanceId],
    ) -> PipelineResult<()> {
        let first_stage = store
            .get_first_stage_of_version(version_id)
            .await
            .store_context(|| {
                format!("could not resolve first stage of sql version {}", version_id)
            })?
            .ok_or_else(|| {
                PipelineError::not_found(format!("first stage of sql version {}", version_id))
            })?;

        first_stage.contains_instances(instance_ids)
    }

    /// A workflow may be bound to at most one stage in the whole system.
    pub async fn check_binding_exclusivity<S: VersionStore>(
        store: &S,
        workflow_id: &str,
    ) -> PipelineResult<()> {
        let binding = store
            .get_workflow_stage_binding(workflow_id)
            .await
            .store_context(|| {
                format!("Failed to look up stage binding of workflow '{}'", workflow_id)
            })?;

        match binding {
            Some(binding) => Err(PipelineError::AlreadyBound {
                version_id: binding.version_id,
                stage_id: binding.stage_id,
            }),
            None => Ok(()),
        }
    }

    async fn validate_candidate<S: VersionStore + WorkflowStore>(
        store: &S,
        project_id: &str,
        stage: &Stage,
        workflow_id: &str,
    ) -> PipelineResult<()> {
        // Workflows of other projects resolve to no instances
        let instance_ids = store
            .get_instance_ids_for_workflow(project_id, workflow_id)
            .await
            .store_context(|| format!("Failed to load instances of workflow '{}'", workflow_id))?;
        if instance_ids.is_empty() {
            return Err(PipelineError::NoInstances);
        }

        stage.contains_instances(&instance_ids)?;
        Self::check_binding_exclusivity(store, workflow_id).await
    }

    /// Bind the workflows to one stage, all or nothing.
    ///
    /// The version must belong to the project and still be releasing. Every
    /// workflow is validated in input order before anything is written; the
    /// first failure aborts the call and no binding is created. The store
    /// write itself is a single atomic batch.
    pub async fn batch_associate<S: VersionStore + WorkflowStore>(
        store: &S,
        project_id: &str,
        version_id: Id,
        stage_id: Id,
        workflow_ids: &[String],
    ) -> PipelineResult<()> {
        let version = Self::get_version(store, project_id, version_id).await?;
        if version.is_locked() {
            warn!(
                "Refused to bind workflows to stage {} of locked sql version {} in project '{}'",
                stage_id, version_id, project_id
            );
            return Err(PipelineError::VersionLocked(version_id));
        }
        let stage = Self::load_stage(store, version_id, stage_id).await?;

        for workflow_id in workflow_ids {
            debug!(
                "Validating workflow '{}' for stage '{}' ({}) of sql version {}",
                workflow_id, stage.name, stage_id, version_id
            );
            if let Err(e) = Self::validate_candidate(store, project_id, &stage, workflow_id).await {
                warn!(
                    "Rejected binding workflows to stage {} of sql version {} in project '{}': workflow '{}': {}",
                    stage_id, version_id, project_id, workflow_id, e
                );
                return Err(e);
            }
        }

        if workflow_ids.is_empty() {
            return Ok(());
        }

        store
            .batch_insert_workflow_stage_bindings(&stage, workflow_ids)
            .await
            .store_context(|| {
                format!(
                    "Failed to bind workflows to stage {} of sql version {}",
                    stage_id, version_id
                )
            })?;

        info!(
            "Bound {} workflow(s) to stage '{}' ({}) of sql version {} in project '{}'",
            workflow_ids.len(),
            stage.name,
            stage_id,
            version_id,
            project_id
        );
        Ok(())
    }

    /// A bound workflow may run only once every workflow ahead of it in its
    /// stage is finished or canceled. Unbound workflows are always executable.
    pub async fn check_executable<S: VersionStore + WorkflowStore>(
        store: &S,
        project_id: &str,
        workflow_id: &str,
    ) -> PipelineResult<Executability> {
        let stage = store
            .get_stage_of_workflow(workflow_id)
            .await
            .store_context(|| format!("Failed to load stage of workflow '{}'", workflow_id))?;

        let Some(mut stage) = stage else {
            return Ok(Executability::ready(""));
        };
        stage.sort_workflows();

        for bound in &stage.workflows {
            if bound.workflow_id == workflow_id {
                return Ok(Executability::ready(""));
            }

            let predecessor = store
                .get_workflow_by_id(&bound.workflow_id)
                .await
                .store_context(|| {
                    format!(
                        "when checking if workflow can execute, find a workflow before this workflow failed, workflow id is {}",
                        bound.workflow_id
                    )
                })?;

            match predecessor {
                None => {
                    return Ok(Executability::blocked(format!(
                        "when checking if workflow can execute, can not find a workflow before this workflow, workflow id is {}",
                        bound.workflow_id
                    )));
                }
                Some(predecessor) if predecessor.status.is_closed() => continue,
                Some(predecessor) => {
                    debug!(
                        "Workflow '{}' in project '{}' is held back by '{}' ({})",
                        workflow_id, project_id, predecessor.workflow_id, predecessor.status
                    );
                    return Ok(Executability::blocked(format!(
                        "can not execute or scheduled execute workflow that bind with stage of sql version, before this workflow. there were still workflow with a {} status, sql version id is {}",
                        predecessor.status, stage.version_id
                    )));
                }
            }
        }

        Ok(Executability::ready("the previous workflows are executed as expected"))
    }
}
