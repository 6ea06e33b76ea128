use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};

use crate::model::{
    Id, InstanceId, InstanceRecord, NewSqlVersion, SqlVersion, Stage, StageInstance,
    StageWorkflow, VersionFilter, VersionStatus, VersionSummary, Workflow, WorkflowFields,
    WorkflowStageBinding, WorkflowStep, WorkflowSummary,
};
use crate::store::traits::{PermissionStore, Store, VersionStore, WorkflowStore};

// next_stage_id is derived from stage_sequence, never stored
const STAGE_SELECT: &str = r#"
    SELECT s.id, s.sql_version_id, s.name, s.stage_sequence,
        (SELECT n.id FROM sql_version_stages n
         WHERE n.sql_version_id = s.sql_version_id AND n.stage_sequence > s.stage_sequence
         ORDER BY n.stage_sequence ASC LIMIT 1) AS next_stage_id
    FROM sql_version_stages s
"#;

const WORKFLOW_SELECT: &str = r#"
    SELECT id, workflow_id, project_id, subject, description, status, current_step_id
    FROM workflows
"#;

const VERSION_SUMMARY_SELECT: &str = r#"
    SELECT sv.id, sv.version, sv.description, sv.status, sv.lock_time, sv.created_at,
        EXISTS (SELECT 1 FROM workflow_version_stages b WHERE b.sql_version_id = sv.id)
            AS has_associated_workflow
    FROM sql_versions sv
"#;

fn to_db(id: u64) -> i64 {
    id as i64
}

fn from_db(id: i64) -> u64 {
    id as u64
}

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    async fn load_stage(&self, row: PgRow) -> Result<Stage> {
        let stage_id: i64 = row.try_get("id")?;
        let next_stage_id: Option<i64> = row.try_get("next_stage_id")?;

        let instances = sqlx::query(
            r#"
            SELECT id, stage_instance_id, next_stage_instance_id
            FROM sql_version_stage_instances
            WHERE sql_version_stage_id = $1
            ORDER BY id
            "#,
        )
        .bind(stage_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch stage instances")?
        .into_iter()
        .map(|row| -> Result<StageInstance> {
            let next: Option<i64> = row.try_get("next_stage_instance_id")?;
            Ok(StageInstance {
                id: from_db(row.try_get("id")?),
                instance_id: from_db(row.try_get("stage_instance_id")?),
                next_instance_id: next.map(from_db),
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let workflows = sqlx::query(
            r#"
            SELECT b.id, b.workflow_id, b.workflow_sequence, b.workflow_release_status,
                COALESCE(w.subject, '') AS subject, COALESCE(w.description, '') AS description
            FROM workflow_version_stages b
            LEFT JOIN workflows w ON w.workflow_id = b.workflow_id
            WHERE b.sql_version_stage_id = $1
            ORDER BY b.workflow_sequence
            "#,
        )
        .bind(stage_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch stage workflows")?
        .into_iter()
        .map(|row| -> Result<StageWorkflow> {
            let release_status: String = row.try_get("workflow_release_status")?;
            Ok(StageWorkflow {
                id: from_db(row.try_get("id")?),
                workflow_id: row.try_get("workflow_id")?,
                sequence: row.try_get("workflow_sequence")?,
                release_status: release_status.parse()?,
                subject: row.try_get("subject")?,
                description: row.try_get("description")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(Stage {
            id: from_db(stage_id),
            version_id: from_db(row.try_get("sql_version_id")?),
            next_stage_id: next_stage_id.map(from_db),
            name: row.try_get("name")?,
            sequence: row.try_get("stage_sequence")?,
            instances,
            workflows,
        })
    }

    async fn load_workflow(&self, row: PgRow) -> Result<Workflow> {
        let workflow_id: String = row.try_get("workflow_id")?;

        let steps = sqlx::query(
            r#"
            SELECT id, assignees, state, operation_user_id
            FROM workflow_steps
            WHERE workflow_id = $1
            ORDER BY id
            "#,
        )
        .bind(&workflow_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch workflow steps")?
        .into_iter()
        .map(|row| -> Result<WorkflowStep> {
            let state: String = row.try_get("state")?;
            Ok(WorkflowStep {
                id: from_db(row.try_get("id")?),
                assignees: row.try_get("assignees")?,
                state: state.parse()?,
                operation_user_id: row.try_get("operation_user_id")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let instance_records = sqlx::query(
            r#"
            SELECT id, instance_id, task_status, is_sql_executed, execution_user_id
            FROM workflow_instance_records
            WHERE workflow_id = $1
            ORDER BY id
            "#,
        )
        .bind(&workflow_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch workflow instance records")?
        .into_iter()
        .map(|row| -> Result<InstanceRecord> {
            let task_status: String = row.try_get("task_status")?;
            Ok(InstanceRecord {
                id: from_db(row.try_get("id")?),
                instance_id: from_db(row.try_get("instance_id")?),
                task_status: task_status.parse()?,
                is_sql_executed: row.try_get("is_sql_executed")?,
                execution_user_id: row.try_get("execution_user_id")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let status: String = row.try_get("status")?;
        let current_step_id: Option<i64> = row.try_get("current_step_id")?;
        Ok(Workflow {
            id: from_db(row.try_get("id")?),
            workflow_id,
            project_id: row.try_get("project_id")?,
            subject: row.try_get("subject")?,
            description: row.try_get("description")?,
            status: status.parse()?,
            current_step_id: current_step_id.map(from_db),
            steps,
            instance_records,
        })
    }
}

// WHERE clause shared by the version listing and its count
fn push_version_filter(
    builder: &mut QueryBuilder<'_, Postgres>,
    project_id: &str,
    filter: &VersionFilter,
) {
    builder
        .push(" WHERE sv.project_id = ")
        .push_bind(project_id.to_string());
    if let Some(from) = filter.created_at_from {
        builder.push(" AND sv.created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.created_at_to {
        builder.push(" AND sv.created_at <= ").push_bind(to);
    }
    if let Some(from) = filter.lock_time_from {
        builder.push(" AND sv.lock_time >= ").push_bind(from);
    }
    if let Some(to) = filter.lock_time_to {
        builder.push(" AND sv.lock_time <= ").push_bind(to);
    }
    if let Some(status) = filter.status {
        builder.push(" AND sv.status = ").push_bind(status.as_str());
    }
    if let Some(needle) = filter.fuzzy_search.as_deref() {
        let pattern = format!("%{}%", needle);
        builder
            .push(" AND (sv.version LIKE ")
            .push_bind(pattern.clone())
            .push(" OR sv.description LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[async_trait::async_trait]
impl VersionStore for PostgresStore {
    async fn create_version(
        &self,
        project_id: &str,
        version: &NewSqlVersion,
    ) -> Result<SqlVersion> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let version_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sql_versions (project_id, version, description, status, lock_time)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(project_id)
        .bind(&version.version)
        .bind(&version.description)
        .bind(VersionStatus::Releasing.as_str())
        .bind(version.lock_time)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert sql version")?;

        for stage in &version.stages {
            let stage_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO sql_version_stages (sql_version_id, name, stage_sequence)
                VALUES ($1, $2, $3)
                RETURNING id
                "#,
            )
            .bind(version_id)
            .bind(&stage.name)
            .bind(stage.sequence)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert stage '{}'", stage.name))?;

            for instance in &stage.instances {
                sqlx::query(
                    r#"
                    INSERT INTO sql_version_stage_instances
                        (sql_version_stage_id, stage_instance_id, next_stage_instance_id)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(stage_id)
                .bind(to_db(instance.instance_id))
                .bind(instance.next_instance_id.map(to_db))
                .execute(&mut *tx)
                .await
                .with_context(|| {
                    format!(
                        "Failed to add instance {} to stage '{}'",
                        instance.instance_id, stage.name
                    )
                })?;
            }
        }

        tx.commit().await.context("Failed to commit sql version")?;

        self.get_version(from_db(version_id))
            .await?
            .with_context(|| format!("Sql version {} missing after insert", version_id))
    }

    async fn get_version(&self, version_id: Id) -> Result<Option<SqlVersion>> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, version, description, status, lock_time, created_at
            FROM sql_versions
            WHERE id = $1
            "#,
        )
        .bind(to_db(version_id))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch sql version")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let stage_rows = sqlx::query(&format!(
            "{} WHERE s.sql_version_id = $1 ORDER BY s.stage_sequence",
            STAGE_SELECT
        ))
        .bind(to_db(version_id))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch version stages")?;

        let mut stages = Vec::with_capacity(stage_rows.len());
        for stage_row in stage_rows {
            stages.push(self.load_stage(stage_row).await?);
        }

        let status: String = row.try_get("status")?;
        let lock_time: Option<DateTime<Utc>> = row.try_get("lock_time")?;
        let mut version = SqlVersion {
            id: from_db(row.try_get("id")?),
            project_id: row.try_get("project_id")?,
            version: row.try_get("version")?,
            description: row.try_get("description")?,
            status: status.parse()?,
            lock_time,
            created_at: row.try_get("created_at")?,
            stages,
        };
        version.link_stages();
        Ok(Some(version))
    }

    async fn list_versions(
        &self,
        project_id: &str,
        filter: &VersionFilter,
    ) -> Result<(Vec<VersionSummary>, u64)> {
        let mut count_query = QueryBuilder::new("SELECT COUNT(*) FROM sql_versions sv");
        push_version_filter(&mut count_query, project_id, filter);
        let total: i64 = count_query
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .context("Failed to count sql versions")?;

        let mut list_query = QueryBuilder::new(VERSION_SUMMARY_SELECT);
        push_version_filter(&mut list_query, project_id, filter);
        list_query.push(" ORDER BY sv.created_at DESC, sv.id DESC");
        if let Some((limit, offset)) = filter.limit_offset() {
            list_query
                .push(" LIMIT ")
                .push_bind(i64::from(limit))
                .push(" OFFSET ")
                .push_bind(i64::from(offset));
        }

        let versions = list_query
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list sql versions")?
            .into_iter()
            .map(|row| -> Result<VersionSummary> {
                let status: String = row.try_get("status")?;
                Ok(VersionSummary {
                    id: from_db(row.try_get("id")?),
                    version: row.try_get("version")?,
                    description: row.try_get("description")?,
                    status: status.parse()?,
                    lock_time: row.try_get("lock_time")?,
                    created_at: row.try_get("created_at")?,
                    has_associated_workflow: row.try_get("has_associated_workflow")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((versions, total as u64))
    }

    async fn get_stage_of_version(&self, version_id: Id, stage_id: Id) -> Result<Option<Stage>> {
        let row = sqlx::query(&format!(
            "{} WHERE s.id = $1 AND s.sql_version_id = $2",
            STAGE_SELECT
        ))
        .bind(to_db(stage_id))
        .bind(to_db(version_id))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch stage of sql version")?;

        match row {
            Some(row) => Ok(Some(self.load_stage(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_first_stage_of_version(&self, version_id: Id) -> Result<Option<Stage>> {
        let row = sqlx::query(&format!(
            "{} WHERE s.sql_version_id = $1 ORDER BY s.stage_sequence ASC LIMIT 1",
            STAGE_SELECT
        ))
        .bind(to_db(version_id))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch first stage of sql version")?;

        match row {
            Some(row) => Ok(Some(self.load_stage(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_stage_of_workflow(&self, workflow_id: &str) -> Result<Option<Stage>> {
        let row = sqlx::query(&format!(
            r#"{}
            JOIN workflow_version_stages b ON b.sql_version_stage_id = s.id
            WHERE b.workflow_id = $1"#,
            STAGE_SELECT
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch stage of workflow")?;

        match row {
            Some(row) => Ok(Some(self.load_stage(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_workflow_stage_binding(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowStageBinding>> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, sql_version_id, sql_version_stage_id, workflow_sequence
            FROM workflow_version_stages
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch workflow stage binding")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(WorkflowStageBinding {
            workflow_id: row.try_get("workflow_id")?,
            version_id: from_db(row.try_get("sql_version_id")?),
            stage_id: from_db(row.try_get("sql_version_stage_id")?),
            sequence: row.try_get("workflow_sequence")?,
        }))
    }

    async fn batch_insert_workflow_stage_bindings(
        &self,
        stage: &Stage,
        workflow_ids: &[String],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        // Serializes sequence assignment on the stage and holds off the lock sweep
        let open_stage: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT s.id
            FROM sql_version_stages s
            JOIN sql_versions v ON v.id = s.sql_version_id
            WHERE s.id = $1 AND v.status = 'releasing'
            FOR UPDATE OF s
            FOR SHARE OF v
            "#,
        )
        .bind(to_db(stage.id))
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("Failed to lock stage {}", stage.id))?;
        if open_stage.is_none() {
            bail!("Stage {} not found or its version is locked", stage.id);
        }

        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workflow_version_stages WHERE sql_version_stage_id = $1",
        )
        .bind(to_db(stage.id))
        .fetch_one(&mut *tx)
        .await
        .context("Failed to count stage workflows")?;

        let release_status = stage.initial_release_status();
        for (index, workflow_id) in workflow_ids.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO workflow_version_stages (
                    workflow_id, sql_version_id, sql_version_stage_id,
                    workflow_sequence, workflow_release_status
                )
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(workflow_id)
            .bind(to_db(stage.version_id))
            .bind(to_db(stage.id))
            .bind(existing as i32 + index as i32 + 1)
            .bind(release_status.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind workflow '{}' to stage {} of version {}",
                    workflow_id, stage.id, stage.version_id
                )
            })?;
        }

        tx.commit().await.context("Failed to commit workflow stage bindings")?;
        Ok(())
    }

    async fn lock_expired_versions(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sql_versions SET status = 'locked'
            WHERE status = 'releasing' AND lock_time IS NOT NULL AND lock_time <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to lock expired sql versions")?;

        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl WorkflowStore for PostgresStore {
    async fn get_workflow(&self, project_id: &str, workflow_id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query(&format!(
            "{} WHERE project_id = $1 AND workflow_id = $2",
            WORKFLOW_SELECT
        ))
        .bind(project_id)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch workflow")?;

        match row {
            Some(row) => Ok(Some(self.load_workflow(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_workflow_by_id(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query(&format!("{} WHERE workflow_id = $1", WORKFLOW_SELECT))
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch workflow")?;

        match row {
            Some(row) => Ok(Some(self.load_workflow(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_instance_ids_for_workflow(
        &self,
        project_id: &str,
        workflow_id: &str,
    ) -> Result<Vec<InstanceId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT r.instance_id
            FROM workflow_instance_records r
            JOIN workflows w ON w.workflow_id = r.workflow_id
            WHERE w.project_id = $1 AND r.workflow_id = $2
            ORDER BY r.instance_id
            "#,
        )
        .bind(project_id)
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch instance ids of workflow")?;

        Ok(ids.into_iter().map(from_db).collect())
    }

    async fn get_workflows_eligible_for_stage(
        &self,
        project_id: &str,
        instance_ids: &[InstanceId],
    ) -> Result<Vec<WorkflowSummary>> {
        let range: Vec<i64> = instance_ids.iter().copied().map(to_db).collect();
        let rows = sqlx::query(
            r#"
            SELECT w.id, w.workflow_id, w.subject, w.description, w.status
            FROM workflows w
            WHERE w.project_id = $2
              AND w.status NOT IN ('finished', 'canceled', 'rejected')
              AND NOT EXISTS (
                  SELECT 1 FROM workflow_version_stages b WHERE b.workflow_id = w.workflow_id
              )
              AND EXISTS (
                  SELECT 1 FROM workflow_instance_records r WHERE r.workflow_id = w.workflow_id
              )
              AND NOT EXISTS (
                  SELECT 1 FROM workflow_instance_records r
                  WHERE r.workflow_id = w.workflow_id AND NOT (r.instance_id = ANY($1))
              )
            ORDER BY w.id
            "#,
        )
        .bind(&range)
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch workflows eligible for stage")?;

        rows.into_iter()
            .map(|row| -> Result<WorkflowSummary> {
                let status: String = row.try_get("status")?;
                Ok(WorkflowSummary {
                    id: from_db(row.try_get("id")?),
                    workflow_id: row.try_get("workflow_id")?,
                    subject: row.try_get("subject")?,
                    description: row.try_get("description")?,
                    status: status.parse()?,
                })
            })
            .collect()
    }

    async fn persist_completion(
        &self,
        workflow: &Workflow,
        last_step: &WorkflowStep,
        needs_exec: &[InstanceRecord],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            "UPDATE workflow_steps SET state = $1, operation_user_id = $2 WHERE id = $3",
        )
            .bind(last_step.state.as_str())
            .bind(&last_step.operation_user_id)
            .bind(to_db(last_step.id))
            .execute(&mut *tx)
            .await
            .context("Failed to update last workflow step")?;

        sqlx::query(
            "UPDATE workflows SET status = $1, current_step_id = $2 WHERE workflow_id = $3",
        )
            .bind(workflow.status.as_str())
            .bind(workflow.current_step_id.map(to_db))
            .bind(&workflow.workflow_id)
            .execute(&mut *tx)
            .await
            .context("Failed to update workflow status")?;

        for record in needs_exec {
            sqlx::query(
                r#"
                UPDATE workflow_instance_records
                SET is_sql_executed = $1, execution_user_id = $2
                WHERE id = $3
                "#,
            )
            .bind(record.is_sql_executed)
            .bind(&record.execution_user_id)
            .bind(to_db(record.id))
            .execute(&mut *tx)
            .await
            .context("Failed to update workflow instance record")?;
        }

        tx.commit().await.context("Failed to commit workflow completion")?;
        Ok(())
    }

    async fn update_workflow_fields(
        &self,
        workflow_id: &str,
        fields: WorkflowFields,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workflows SET description = COALESCE($1, description) WHERE workflow_id = $2",
        )
            .bind(fields.description)
            .bind(workflow_id)
            .execute(&self.pool)
            .await
            .context("Failed to update workflow fields")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PermissionStore for PostgresStore {
    async fn can_operate_project(&self, user_id: &str, project_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM project_operators WHERE project_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check project permission")?;

        Ok(exists)
    }
}

impl Store for PostgresStore {}
