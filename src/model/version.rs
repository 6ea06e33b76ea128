use crate::model::{Id, InstanceId, ProjectId, WorkflowId};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Releasing, // Stages may still take new workflows
    Locked,    // Lock time has passed, version is frozen
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Releasing => "releasing",
            VersionStatus::Locked => "locked",
        }
    }
}

impl FromStr for VersionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "releasing" => Ok(VersionStatus::Releasing),
            "locked" => Ok(VersionStatus::Locked),
            other => Err(anyhow!("Unknown version status '{}'", other)),
        }
    }
}

/// A SQL version: a release train of ordered stages owned by one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlVersion {
    pub id: Id,
    pub project_id: ProjectId,
    pub version: String,
    pub description: String,
    pub status: VersionStatus,
    pub lock_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub stages: Vec<Stage>,
}

impl SqlVersion {
    pub fn new(id: Id, project_id: ProjectId, version: String, stages: Vec<Stage>) -> Self {
        let mut sql_version = Self {
            id,
            project_id,
            version,
            description: String::new(),
            status: VersionStatus::Releasing,
            lock_time: None,
            created_at: Utc::now(),
            stages,
        };
        sql_version.link_stages();
        sql_version
    }

    /// Sort stages by sequence and rebuild every `next_stage_id` from that order.
    ///
    /// Sequence is the only source of truth for stage order; stored forward
    /// pointers are never trusted.
    pub fn link_stages(&mut self) {
        self.stages.sort_by_key(|stage| stage.sequence);
        let next_ids: Vec<Option<Id>> = self
            .stages
            .iter()
            .skip(1)
            .map(|stage| Some(stage.id))
            .chain(std::iter::once(None))
            .collect();
        for (stage, next_id) in self.stages.iter_mut().zip(next_ids) {
            stage.version_id = self.id;
            stage.next_stage_id = next_id;
            stage.sort_workflows();
        }
    }

    /// The entry stage of the pipeline (lowest sequence).
    pub fn first_stage(&self) -> Option<&Stage> {
        self.stages.iter().min_by_key(|stage| stage.sequence)
    }

    pub fn stage(&self, stage_id: Id) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.id == stage_id)
    }

    /// True once the lock time has been reached while still releasing.
    pub fn is_lock_due(&self, now: DateTime<Utc>) -> bool {
        self.status == VersionStatus::Releasing
            && self.lock_time.map(|lock_time| lock_time <= now).unwrap_or(false)
    }

    pub fn is_locked(&self) -> bool {
        self.status == VersionStatus::Locked
    }

    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            id: self.id,
            version: self.version.clone(),
            description: self.description.clone(),
            status: self.status,
            lock_time: self.lock_time,
            created_at: self.created_at,
            has_associated_workflow: self.stages.iter().any(|stage| !stage.workflows.is_empty()),
        }
    }
}

/// Version row as shown in listings, without its stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: Id,
    pub version: String,
    pub description: String,
    pub status: VersionStatus,
    pub lock_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub has_associated_workflow: bool,
}

/// A version to be created, with its stages and their instance links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSqlVersion {
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub lock_time: Option<DateTime<Utc>>,
    pub stages: Vec<NewStage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStage {
    pub name: String,
    pub sequence: i32,
    #[serde(default)]
    pub instances: Vec<NewStageInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStageInstance {
    pub instance_id: InstanceId,
    #[serde(default)]
    pub next_instance_id: Option<InstanceId>,
}

// A missing value is outside any bounded range
fn in_range(
    value: Option<DateTime<Utc>>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> bool {
    match (value, from, to) {
        (_, None, None) => true,
        (None, _, _) => false,
        (Some(value), from, to) => {
            from.map_or(true, |from| value >= from) && to.map_or(true, |to| value <= to)
        }
    }
}

/// Filters of the version listing. Every bound is inclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionFilter {
    pub created_at_from: Option<DateTime<Utc>>,
    pub created_at_to: Option<DateTime<Utc>>,
    pub lock_time_from: Option<DateTime<Utc>>,
    pub lock_time_to: Option<DateTime<Utc>>,
    pub status: Option<VersionStatus>,
    /// Substring of the version name or description
    pub fuzzy_search: Option<String>,
    /// 1-based
    pub page_index: Option<u32>,
    pub page_size: Option<u32>,
}

impl VersionFilter {
    /// `(limit, offset)` when paging was asked for.
    pub fn limit_offset(&self) -> Option<(u32, u32)> {
        let page_size = self.page_size.filter(|size| *size > 0)?;
        let page_index = self.page_index.unwrap_or(1).max(1);
        Some((page_size, (page_index - 1) * page_size))
    }

    pub fn matches(&self, version: &SqlVersion) -> bool {
        let within = in_range(Some(version.created_at), self.created_at_from, self.created_at_to)
            && in_range(version.lock_time, self.lock_time_from, self.lock_time_to);
        within
            && self.status.map_or(true, |status| version.status == status)
            && self.fuzzy_search.as_deref().map_or(true, |needle| {
                version.version.contains(needle) || version.description.contains(needle)
            })
    }
}

/// One stage of a version's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: Id,
    pub version_id: Id,
    /// Derived from sequence order; `None` on the last stage.
    pub next_stage_id: Option<Id>,
    pub name: String,
    pub sequence: i32,
    pub instances: Vec<StageInstance>,
    pub workflows: Vec<StageWorkflow>,
}

impl Stage {
    pub fn new(id: Id, name: &str, sequence: i32, instances: Vec<StageInstance>) -> Self {
        Self {
            id,
            version_id: 0,
            next_stage_id: None,
            name: name.to_string(),
            sequence,
            instances,
            workflows: Vec::new(),
        }
    }

    pub fn is_last(&self) -> bool {
        self.next_stage_id.is_none()
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.instances.iter().map(|i| i.instance_id).collect()
    }

    pub fn sort_workflows(&mut self) {
        self.workflows.sort_by_key(|workflow| workflow.sequence);
    }

    /// Release status a workflow receives when it is bound to this stage.
    pub fn initial_release_status(&self) -> WorkflowReleaseStatus {
        if self.is_last() {
            WorkflowReleaseStatus::NotNeedReleased
        } else {
            WorkflowReleaseStatus::BeingReleased
        }
    }
}

/// Declares that a database instance takes part in a stage, and which
/// instance of the next stage it promotes to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInstance {
    pub id: Id,
    pub instance_id: InstanceId,
    pub next_instance_id: Option<InstanceId>,
}

impl StageInstance {
    pub fn new(id: Id, instance_id: InstanceId, next_instance_id: Option<InstanceId>) -> Self {
        Self {
            id,
            instance_id,
            next_instance_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowReleaseStatus {
    BeingReleased,
    NotNeedReleased,
}

impl WorkflowReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowReleaseStatus::BeingReleased => "being_released",
            WorkflowReleaseStatus::NotNeedReleased => "not_need_released",
        }
    }
}

impl FromStr for WorkflowReleaseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "being_released" => Ok(WorkflowReleaseStatus::BeingReleased),
            "not_need_released" => Ok(WorkflowReleaseStatus::NotNeedReleased),
            other => Err(anyhow!("Unknown workflow release status '{}'", other)),
        }
    }
}

/// A workflow bound to a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageWorkflow {
    pub id: Id,
    pub workflow_id: WorkflowId,
    pub sequence: i32,
    pub release_status: WorkflowReleaseStatus,
    pub subject: String,
    pub description: String,
}

/// Where a workflow is bound, as recorded by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStageBinding {
    pub workflow_id: WorkflowId,
    pub version_id: Id,
    pub stage_id: Id,
    pub sequence: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(id: Id, sequence: i32) -> Stage {
        Stage::new(id, &format!("stage-{}", id), sequence, vec![])
    }

    #[test]
    fn test_link_stages_derives_next_pointers_from_sequence() {
        // Declared out of order on purpose
        let version = SqlVersion::new(
            7,
            "project-1".to_string(),
            "v1.0".to_string(),
            vec![stage(30, 3), stage(10, 1), stage(20, 2)],
        );

        let ids: Vec<Id> = version.stages.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert_eq!(version.stages[0].next_stage_id, Some(20));
        assert_eq!(version.stages[1].next_stage_id, Some(30));
        assert_eq!(version.stages[2].next_stage_id, None);
        assert!(version.stages.iter().all(|s| s.version_id == 7));
    }

    #[test]
    fn test_first_stage_is_lowest_sequence() {
        let mut version = SqlVersion::new(1, "p".to_string(), "v".to_string(), vec![]);
        version.stages = vec![stage(2, 2), stage(1, 1)];
        assert_eq!(version.first_stage().map(|s| s.id), Some(1));
    }

    #[test]
    fn test_initial_release_status_depends_on_last_stage() {
        let version = SqlVersion::new(
            1,
            "p".to_string(),
            "v".to_string(),
            vec![stage(1, 1), stage(2, 2)],
        );
        assert_eq!(
            version.stages[0].initial_release_status(),
            WorkflowReleaseStatus::BeingReleased
        );
        assert_eq!(
            version.stages[1].initial_release_status(),
            WorkflowReleaseStatus::NotNeedReleased
        );
    }

    #[test]
    fn test_is_lock_due() {
        let now = Utc::now();
        let mut version = SqlVersion::new(1, "p".to_string(), "v".to_string(), vec![]);
        assert!(!version.is_lock_due(now), "no lock time means never due");

        version.lock_time = Some(now - chrono::Duration::minutes(1));
        assert!(version.is_lock_due(now));

        version.status = VersionStatus::Locked;
        assert!(!version.is_lock_due(now), "already locked");
    }

    #[test]
    fn test_version_filter_bounds_and_paging() {
        let now = Utc::now();
        let mut version = SqlVersion::new(1, "p".to_string(), "2024.06".to_string(), vec![]);
        version.description = "june train".to_string();
        version.lock_time = Some(now);

        assert!(VersionFilter::default().matches(&version));
        let filter = VersionFilter {
            lock_time_from: Some(now - chrono::Duration::hours(1)),
            lock_time_to: Some(now),
            fuzzy_search: Some("june".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&version));

        let filter = VersionFilter {
            status: Some(VersionStatus::Locked),
            ..Default::default()
        };
        assert!(!filter.matches(&version));

        version.lock_time = None;
        let filter = VersionFilter {
            lock_time_to: Some(now),
            ..Default::default()
        };
        assert!(!filter.matches(&version), "no lock time never falls inside a lock time range");

        let paged = VersionFilter {
            page_index: Some(3),
            page_size: Some(10),
            ..Default::default()
        };
        assert_eq!(paged.limit_offset(), Some((10, 20)));
        assert_eq!(VersionFilter::default().limit_offset(), None);
    }

    #[test]
    fn test_status_strings_round_trip() {
        assert_eq!("locked".parse::<VersionStatus>().unwrap(), VersionStatus::Locked);
        assert!("frozen".parse::<VersionStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&WorkflowReleaseStatus::NotNeedReleased).unwrap(),
            "\"not_need_released\""
        );
    }
}
