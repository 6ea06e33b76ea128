use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::{
    Id, InstanceId, InstanceRecord, NewSqlVersion, SqlVersion, Stage, StageInstance, StageWorkflow,
    VersionFilter, VersionStatus, VersionSummary, Workflow, WorkflowFields, WorkflowStageBinding,
    WorkflowStatus, WorkflowStep, WorkflowSummary,
};
use crate::store::traits::{PermissionStore, Store, VersionStore, WorkflowStore};

#[derive(Debug, Default)]
struct MemoryState {
    versions: BTreeMap<Id, SqlVersion>,
    workflows: HashMap<String, Workflow>,
    /// (project_id, user_id)
    operators: HashSet<(String, String)>,
    next_binding_id: Id,
}

impl MemoryState {
    fn binding_of(&self, workflow_id: &str) -> Option<(&SqlVersion, &Stage, &StageWorkflow)> {
        self.versions.values().find_map(|version| {
            version.stages.iter().find_map(|stage| {
                stage
                    .workflows
                    .iter()
                    .find(|workflow| workflow.workflow_id == workflow_id)
                    .map(|workflow| (version, stage, workflow))
            })
        })
    }

    // Ids continue after anything inserted directly by tests
    fn next_stage_ids(&self) -> (Id, Id) {
        let stages = self.versions.values().flat_map(|version| version.stages.iter());
        let (mut stage_id, mut instance_id) = (0, 0);
        for stage in stages {
            stage_id = stage_id.max(stage.id);
            for instance in &stage.instances {
                instance_id = instance_id.max(instance.id);
            }
        }
        (stage_id + 1, instance_id + 1)
    }
}

/// In-memory store used by tests and local development.
///
/// A single lock guards all state, so every trait method is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a version; stages are re-linked by sequence.
    pub fn insert_version(&self, mut version: SqlVersion) {
        version.link_stages();
        self.state.write().versions.insert(version.id, version);
    }

    pub fn insert_workflow(&self, workflow: Workflow) {
        self.state
            .write()
            .workflows
            .insert(workflow.workflow_id.clone(), workflow);
    }

    pub fn grant_project_operator(&self, project_id: &str, user_id: &str) {
        self.state
            .write()
            .operators
            .insert((project_id.to_string(), user_id.to_string()));
    }

    /// Total number of workflow-to-stage bindings across all versions.
    pub fn binding_count(&self) -> usize {
        self.state
            .read()
            .versions
            .values()
            .flat_map(|version| version.stages.iter())
            .map(|stage| stage.workflows.len())
            .sum()
    }
}

#[async_trait::async_trait]
impl VersionStore for MemoryStore {
    async fn create_version(
        &self,
        project_id: &str,
        version: &NewSqlVersion,
    ) -> Result<SqlVersion> {
        let mut state = self.state.write();

        let version_id = state.versions.keys().next_back().copied().unwrap_or(0) + 1;
        let (mut stage_id, mut instance_row_id) = state.next_stage_ids();

        let mut stages = Vec::with_capacity(version.stages.len());
        for new_stage in &version.stages {
            let instances = new_stage
                .instances
                .iter()
                .map(|instance| {
                    let row = StageInstance::new(
                        instance_row_id,
                        instance.instance_id,
                        instance.next_instance_id,
                    );
                    instance_row_id += 1;
                    row
                })
                .collect();
            stages.push(Stage::new(stage_id, &new_stage.name, new_stage.sequence, instances));
            stage_id += 1;
        }

        let mut created = SqlVersion::new(
            version_id,
            project_id.to_string(),
            version.version.clone(),
            stages,
        );
        created.description = version.description.clone();
        created.lock_time = version.lock_time;

        state.versions.insert(version_id, created.clone());
        Ok(created)
    }

    async fn get_version(&self, version_id: Id) -> Result<Option<SqlVersion>> {
        Ok(self.state.read().versions.get(&version_id).cloned())
    }

    async fn list_versions(
        &self,
        project_id: &str,
        filter: &VersionFilter,
    ) -> Result<(Vec<VersionSummary>, u64)> {
        let state = self.state.read();
        let mut matching: Vec<&SqlVersion> = state
            .versions
            .values()
            .filter(|version| version.project_id == project_id && filter.matches(version))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let page: Vec<VersionSummary> = match filter.limit_offset() {
            Some((limit, offset)) => matching
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .map(SqlVersion::summary)
                .collect(),
            None => matching.into_iter().map(SqlVersion::summary).collect(),
        };
        Ok((page, total))
    }

    async fn get_stage_of_version(&self, version_id: Id, stage_id: Id) -> Result<Option<Stage>> {
        Ok(self
            .state
            .read()
            .versions
            .get(&version_id)
            .and_then(|version| version.stage(stage_id))
            .cloned())
    }

    async fn get_first_stage_of_version(&self, version_id: Id) -> Result<Option<Stage>> {
        Ok(self
            .state
            .read()
            .versions
            .get(&version_id)
            .and_then(|version| version.first_stage())
            .cloned())
    }

    async fn get_stage_of_workflow(&self, workflow_id: &str) -> Result<Option<Stage>> {
        Ok(self
            .state
            .read()
            .binding_of(workflow_id)
            .map(|(_, stage, _)| stage.clone()))
    }

    async fn get_workflow_stage_binding(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowStageBinding>> {
        Ok(self
            .state
            .read()
            .binding_of(workflow_id)
            .map(|(version, stage, workflow)| WorkflowStageBinding {
                workflow_id: workflow.workflow_id.clone(),
                version_id: version.id,
                stage_id: stage.id,
                sequence: workflow.sequence,
            }))
    }

    async fn batch_insert_workflow_stage_bindings(
        &self,
        stage: &Stage,
        workflow_ids: &[String],
    ) -> Result<()> {
        let mut state = self.state.write();

        // Uniqueness on workflow_id, checked before anything is written
        let mut seen = HashSet::new();
        for workflow_id in workflow_ids {
            if !seen.insert(workflow_id.as_str()) {
                bail!("Workflow '{}' appears more than once in the batch", workflow_id);
            }
            if let Some((version, bound_stage, _)) = state.binding_of(workflow_id) {
                bail!(
                    "Workflow '{}' is already bound to stage {} of version {}",
                    workflow_id,
                    bound_stage.id,
                    version.id
                );
            }
        }

        let MemoryState {
            versions,
            workflows,
            next_binding_id,
            ..
        } = &mut *state;

        let version = versions
            .get_mut(&stage.version_id)
            .ok_or_else(|| anyhow!("Version {} not found", stage.version_id))?;
        if version.is_locked() {
            bail!("Version {} is locked", version.id);
        }
        let target = version
            .stages
            .iter_mut()
            .find(|s| s.id == stage.id)
            .ok_or_else(|| {
                anyhow!("Stage {} of version {} not found", stage.id, stage.version_id)
            })?;

        let release_status = target.initial_release_status();
        let existing = target.workflows.len();
        for (index, workflow_id) in workflow_ids.iter().enumerate() {
            let (subject, description) = workflows
                .get(workflow_id)
                .map(|w| (w.subject.clone(), w.description.clone()))
                .unwrap_or_default();
            *next_binding_id += 1;
            target.workflows.push(StageWorkflow {
                id: *next_binding_id,
                workflow_id: workflow_id.clone(),
                sequence: (existing + index + 1) as i32,
                release_status,
                subject,
                description,
            });
        }

        Ok(())
    }

    async fn lock_expired_versions(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write();
        let mut locked = 0;
        for version in state.versions.values_mut() {
            if version.is_lock_due(now) {
                version.status = VersionStatus::Locked;
                locked += 1;
            }
        }
        Ok(locked)
    }
}

#[async_trait::async_trait]
impl WorkflowStore for MemoryStore {
    async fn get_workflow(&self, project_id: &str, workflow_id: &str) -> Result<Option<Workflow>> {
        Ok(self
            .state
            .read()
            .workflows
            .get(workflow_id)
            .filter(|workflow| workflow.project_id == project_id)
            .cloned())
    }

    async fn get_workflow_by_id(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        Ok(self.state.read().workflows.get(workflow_id).cloned())
    }

    async fn get_instance_ids_for_workflow(
        &self,
        project_id: &str,
        workflow_id: &str,
    ) -> Result<Vec<InstanceId>> {
        Ok(self
            .state
            .read()
            .workflows
            .get(workflow_id)
            .filter(|workflow| workflow.project_id == project_id)
            .map(|workflow| workflow.instance_ids())
            .unwrap_or_default())
    }

    async fn get_workflows_eligible_for_stage(
        &self,
        project_id: &str,
        instance_ids: &[InstanceId],
    ) -> Result<Vec<WorkflowSummary>> {
        let state = self.state.read();
        let range: HashSet<InstanceId> = instance_ids.iter().copied().collect();

        let mut eligible: Vec<&Workflow> = state
            .workflows
            .values()
            .filter(|workflow| workflow.project_id == project_id)
            .filter(|workflow| {
                !workflow.status.is_closed() && workflow.status != WorkflowStatus::Rejected
            })
            .filter(|workflow| state.binding_of(&workflow.workflow_id).is_none())
            .filter(|workflow| {
                let used = workflow.instance_ids();
                !used.is_empty() && used.iter().all(|id| range.contains(id))
            })
            .collect();
        eligible.sort_by_key(|workflow| workflow.id);

        Ok(eligible.into_iter().map(Workflow::summary).collect())
    }

    async fn persist_completion(
        &self,
        workflow: &Workflow,
        last_step: &WorkflowStep,
        needs_exec: &[InstanceRecord],
    ) -> Result<()> {
        let mut state = self.state.write();
        let stored = state
            .workflows
            .get_mut(&workflow.workflow_id)
            .ok_or_else(|| anyhow!("Workflow '{}' not found", workflow.workflow_id))?;

        stored.status = workflow.status;
        stored.current_step_id = workflow.current_step_id;
        if let Some(step) = stored.steps.iter_mut().find(|s| s.id == last_step.id) {
            *step = last_step.clone();
        }
        for executed in needs_exec {
            if let Some(record) = stored
                .instance_records
                .iter_mut()
                .find(|r| r.id == executed.id)
            {
                *record = executed.clone();
            }
        }
        Ok(())
    }

    async fn update_workflow_fields(
        &self,
        workflow_id: &str,
        fields: WorkflowFields,
    ) -> Result<()> {
        let mut state = self.state.write();
        let stored = state
            .workflows
            .get_mut(workflow_id)
            .ok_or_else(|| anyhow!("Workflow '{}' not found", workflow_id))?;
        if let Some(description) = fields.description {
            stored.description = description;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PermissionStore for MemoryStore {
    async fn can_operate_project(&self, user_id: &str, project_id: &str) -> Result<bool> {
        Ok(self
            .state
            .read()
            .operators
            .contains(&(project_id.to_string(), user_id.to_string())))
    }
}

impl Store for MemoryStore {}
