//! libSQL implementation of the job and manual stores.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::config::ManualConfig;
use crate::error::DatabaseError;
use crate::hitl::ResolutionContext;
use crate::job::{Job, JobResult, JobStatus};
use crate::manual::{Manual, ManualSource};
use crate::store::migrations;
use crate::store::traits::{JobEvent, JobInteraction, JobStore, ManualStore};

pub struct LibSqlBackend {
    _db: Database,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and bring the schema up to
    /// date.
    pub async fn new_local(path: &str) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        Self::from_database(db).await
    }

    /// In-memory database for tests and local tooling.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        Self::from_database(db).await
    }

    async fn from_database(db: Database) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self { _db: db, conn })
    }
}

fn q(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

fn fmt_dt(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // datetime('now') defaults come back in SQLite's plain format.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|n| n.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("bad datetime '{s}': {e}")))
}

fn opt_text(row: &libsql::Row, idx: i32) -> Result<Option<String>, DatabaseError> {
    match row.get_value(idx).map_err(q)? {
        libsql::Value::Null => Ok(None),
        libsql::Value::Text(s) => Ok(Some(s)),
        other => Err(DatabaseError::Serialization(format!(
            "expected text at column {idx}, got {other:?}"
        ))),
    }
}

fn opt_dt(row: &libsql::Row, idx: i32) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    opt_text(row, idx)?.map(|s| parse_dt(&s)).transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn parse_json(s: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const JOB_COLUMNS: &str = "id, status, target_url, task_type, input_data, user_id, \
     retry_count, max_retries, timeout_seconds, preset, worker_id, last_heartbeat, \
     created_at, started_at, finished_at";

fn job_from_row(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let status: JobStatus = row
        .get::<String>(1)
        .map_err(q)?
        .parse()
        .map_err(DatabaseError::Serialization)?;
    Ok(Job {
        id: parse_uuid(&row.get::<String>(0).map_err(q)?)?,
        status,
        target_url: row.get::<String>(2).map_err(q)?,
        task_type: row.get::<String>(3).map_err(q)?,
        input_data: parse_json(&row.get::<String>(4).map_err(q)?)?,
        user_id: row.get::<String>(5).map_err(q)?,
        retry_count: row.get::<i64>(6).map_err(q)? as u32,
        max_retries: row.get::<i64>(7).map_err(q)? as u32,
        timeout_seconds: row.get::<i64>(8).map_err(q)? as u64,
        preset: opt_text(row, 9)?,
        worker_id: opt_text(row, 10)?,
        last_heartbeat: opt_dt(row, 11)?,
        created_at: parse_dt(&row.get::<String>(12).map_err(q)?)?,
        started_at: opt_dt(row, 13)?,
        finished_at: opt_dt(row, 14)?,
    })
}

fn source_str(source: ManualSource) -> &'static str {
    match source {
        ManualSource::Trace => "trace",
        ManualSource::Imported => "imported",
    }
}

fn source_from_str(s: &str) -> Result<ManualSource, DatabaseError> {
    match s {
        "trace" => Ok(ManualSource::Trace),
        "imported" => Ok(ManualSource::Imported),
        other => Err(DatabaseError::Serialization(format!(
            "unknown manual source '{other}'"
        ))),
    }
}

fn manual_from_row(row: &libsql::Row) -> Result<Manual, DatabaseError> {
    Ok(Manual {
        id: parse_uuid(&row.get::<String>(0).map_err(q)?)?,
        url_pattern: row.get::<String>(1).map_err(q)?,
        task_pattern: row.get::<String>(2).map_err(q)?,
        platform: row.get::<String>(3).map_err(q)?,
        steps: serde_json::from_str(&row.get::<String>(4).map_err(q)?)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        health_score: row.get::<f64>(5).map_err(q)?,
        source: source_from_str(&row.get::<String>(6).map_err(q)?)?,
        success_count: row.get::<i64>(7).map_err(q)? as u32,
        failure_count: row.get::<i64>(8).map_err(q)? as u32,
        created_at: parse_dt(&row.get::<String>(9).map_err(q)?)?,
        updated_at: parse_dt(&row.get::<String>(10).map_err(q)?)?,
    })
}

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let input = serde_json::to_string(&job.input_data)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO jobs (id, status, target_url, task_type, input_data, user_id, \
                 retry_count, max_retries, timeout_seconds, preset, worker_id, last_heartbeat, \
                 created_at, started_at, finished_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    job.id.to_string(),
                    job.status.to_string(),
                    job.target_url.clone(),
                    job.task_type.clone(),
                    input,
                    job.user_id.clone(),
                    job.retry_count as i64,
                    job.max_retries as i64,
                    job.timeout_seconds as i64,
                    job.preset.clone(),
                    job.worker_id.clone(),
                    job.last_heartbeat.as_ref().map(fmt_dt),
                    fmt_dt(&job.created_at),
                    job.started_at.as_ref().map(fmt_dt),
                    job.finished_at.as_ref().map(fmt_dt),
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(job_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_status(&self, id: Uuid) -> Result<Option<JobStatus>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT status FROM jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => {
                let status: JobStatus = row
                    .get::<String>(0)
                    .map_err(q)?
                    .parse()
                    .map_err(DatabaseError::Serialization)?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<(), DatabaseError> {
        let now = fmt_dt(&Utc::now());
        let affected = self
            .conn
            .execute(
                "UPDATE jobs SET status = ?2, \
                 started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL \
                     THEN ?3 ELSE started_at END, \
                 finished_at = CASE WHEN ?2 IN ('completed','failed','cancelled','expired') \
                     THEN ?3 ELSE finished_at END \
                 WHERE id = ?1",
                params![id.to_string(), status.to_string(), now],
            )
            .await
            .map_err(q)?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "job".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<Job>, DatabaseError> {
        let now = fmt_dt(&Utc::now());
        let mut rows = self
            .conn
            .query(
                "UPDATE jobs SET worker_id = ?1, status = 'queued', last_heartbeat = ?2 \
                 WHERE id = ( \
                     SELECT id FROM jobs \
                     WHERE status = 'pending' AND worker_id IS NULL \
                       AND (next_attempt_at IS NULL OR next_attempt_at <= ?2) \
                     ORDER BY created_at ASC LIMIT 1 \
                 ) RETURNING id",
                params![worker_id, now],
            )
            .await
            .map_err(q)?;

        let Some(row) = rows.next().await.map_err(q)? else {
            return Ok(None);
        };
        let id = parse_uuid(&row.get::<String>(0).map_err(q)?)?;
        self.get_job(id).await
    }

    async fn release_claim(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE jobs SET worker_id = NULL WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn requeue_for_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let affected = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'pending', worker_id = NULL, \
                 retry_count = ?2, next_attempt_at = ?3 WHERE id = ?1",
                params![id.to_string(), retry_count as i64, fmt_dt(&next_attempt_at)],
            )
            .await
            .map_err(q)?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "job".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE jobs SET last_heartbeat = ?3 WHERE id = ?1 AND worker_id = ?2",
                params![id.to_string(), worker_id, fmt_dt(&Utc::now())],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn save_result(&self, id: Uuid, result: &JobResult) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(result)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "UPDATE jobs SET result = ?2 WHERE id = ?1",
                params![id.to_string(), json],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let affected = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'expired', worker_id = NULL, finished_at = ?1 \
                 WHERE status IN ('pending','queued','running','paused') \
                   AND datetime(COALESCE(started_at, created_at), \
                       '+' || timeout_seconds || ' seconds') < datetime(?1)",
                params![fmt_dt(&now)],
            )
            .await
            .map_err(q)?;
        Ok(affected as usize)
    }

    async fn save_interaction(&self, interaction: &JobInteraction) -> Result<(), DatabaseError> {
        let detail = serde_json::to_string(&interaction.detail)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO job_interactions \
                 (id, job_id, kind, blocker_category, screenshot_ref, detail, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    interaction.id.to_string(),
                    interaction.job_id.to_string(),
                    interaction.kind.clone(),
                    interaction.blocker_category.clone(),
                    interaction.screenshot_ref.clone(),
                    detail,
                    fmt_dt(&interaction.created_at),
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn list_interactions(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<JobInteraction>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, job_id, kind, blocker_category, screenshot_ref, detail, created_at \
                 FROM job_interactions WHERE job_id = ?1 ORDER BY created_at ASC, id ASC",
                params![job_id.to_string()],
            )
            .await
            .map_err(q)?;

        let mut interactions = Vec::new();
        while let Some(row) = rows.next().await.map_err(q)? {
            interactions.push(JobInteraction {
                id: parse_uuid(&row.get::<String>(0).map_err(q)?)?,
                job_id: parse_uuid(&row.get::<String>(1).map_err(q)?)?,
                kind: row.get::<String>(2).map_err(q)?,
                blocker_category: opt_text(&row, 3)?,
                screenshot_ref: opt_text(&row, 4)?,
                detail: parse_json(&row.get::<String>(5).map_err(q)?)?,
                created_at: parse_dt(&row.get::<String>(6).map_err(q)?)?,
            });
        }
        Ok(interactions)
    }

    async fn put_resolution(
        &self,
        job_id: Uuid,
        resolution: &ResolutionContext,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO job_resolutions \
                 (job_id, resolution_type, resolution_data, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    job_id.to_string(),
                    resolution.resolution_type.as_str(),
                    resolution.data.as_ref().map(|d| d.expose_secret().to_string()),
                    fmt_dt(&Utc::now()),
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn take_resolution(
        &self,
        job_id: Uuid,
    ) -> Result<Option<ResolutionContext>, DatabaseError> {
        // DELETE ... RETURNING keeps read-and-clear a single statement, so a
        // payload can never be observed twice.
        let mut rows = self
            .conn
            .query(
                "DELETE FROM job_resolutions WHERE job_id = ?1 \
                 RETURNING resolution_type, resolution_data",
                params![job_id.to_string()],
            )
            .await
            .map_err(q)?;

        let Some(row) = rows.next().await.map_err(q)? else {
            return Ok(None);
        };
        let resolution_type = row
            .get::<String>(0)
            .map_err(q)?
            .parse()
            .map_err(DatabaseError::Serialization)?;
        let data = opt_text(&row, 1)?.map(SecretString::from);
        Ok(Some(ResolutionContext {
            resolution_type,
            data,
        }))
    }

    async fn save_screenshot(&self, job_id: Uuid, bytes: &[u8]) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO job_screenshots (id, job_id, data, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.clone(),
                    job_id.to_string(),
                    bytes.to_vec(),
                    fmt_dt(&Utc::now()),
                ],
            )
            .await
            .map_err(q)?;
        Ok(id)
    }

    async fn append_event(&self, event: &JobEvent) -> Result<(), DatabaseError> {
        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO gh_job_events (job_id, event_type, metadata, actor) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.job_id.to_string(),
                    event.event_type.clone(),
                    metadata,
                    event.actor.clone(),
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }
}

const MANUAL_COLUMNS: &str = "id, url_pattern, task_pattern, platform, steps, health_score, \
     source, success_count, failure_count, created_at, updated_at";

#[async_trait]
impl ManualStore for LibSqlBackend {
    async fn find_candidates(
        &self,
        target_url: &str,
        task_type: &str,
        platform: &str,
        config: &ManualConfig,
    ) -> Result<Vec<Manual>, DatabaseError> {
        // Platform and health narrow the set in SQL; glob matching against
        // the concrete URL happens here.
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {MANUAL_COLUMNS} FROM manuals \
                     WHERE platform = ?1 AND health_score >= ?2 \
                     ORDER BY health_score DESC, updated_at DESC"
                ),
                params![platform, config.usability_threshold],
            )
            .await
            .map_err(q)?;

        let mut candidates = Vec::new();
        while let Some(row) = rows.next().await.map_err(q)? {
            let manual = manual_from_row(&row)?;
            if manual.matches(target_url, task_type) {
                candidates.push(manual);
            }
        }
        Ok(candidates)
    }

    async fn insert_manual(&self, manual: &Manual) -> Result<(), DatabaseError> {
        let steps = serde_json::to_string(&manual.steps)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO manuals (id, url_pattern, task_pattern, platform, steps, \
                 health_score, source, success_count, failure_count, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    manual.id.to_string(),
                    manual.url_pattern.clone(),
                    manual.task_pattern.clone(),
                    manual.platform.clone(),
                    steps,
                    manual.health_score,
                    source_str(manual.source),
                    manual.success_count as i64,
                    manual.failure_count as i64,
                    fmt_dt(&manual.created_at),
                    fmt_dt(&manual.updated_at),
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn get_manual(&self, id: Uuid) -> Result<Option<Manual>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {MANUAL_COLUMNS} FROM manuals WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(manual_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn apply_replay_outcome(
        &self,
        id: Uuid,
        success: bool,
        config: &ManualConfig,
    ) -> Result<f64, DatabaseError> {
        // One UPDATE computes the new score in place, so concurrent replays
        // of the same manual by different workers never lose an update.
        let sql = if success {
            "UPDATE manuals SET \
             health_score = MIN(1.0, MAX(0.0, health_score + ?2 * (1.0 - health_score))), \
             success_count = success_count + 1, updated_at = ?3 \
             WHERE id = ?1 RETURNING health_score"
        } else {
            "UPDATE manuals SET \
             health_score = MIN(1.0, MAX(0.0, health_score * ?2)), \
             failure_count = failure_count + 1, updated_at = ?3 \
             WHERE id = ?1 RETURNING health_score"
        };
        let factor = if success {
            config.reinforce_gain
        } else {
            config.failure_decay
        };

        let mut rows = self
            .conn
            .query(sql, params![id.to_string(), factor, fmt_dt(&Utc::now())])
            .await
            .map_err(q)?;

        match rows.next().await.map_err(q)? {
            Some(row) => row.get::<f64>(0).map_err(q),
            None => Err(DatabaseError::NotFound {
                entity: "manual".to_string(),
                id: id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::hitl::ResolutionType;
    use crate::manual::{ManualStep, StepAction};

    fn job() -> Job {
        Job::new(
            "https://boards.greenhouse.io/acme/jobs/4021",
            "form_application",
            serde_json::json!({"name": "Ada", "email": "ada@example.com"}),
            "user-1",
        )
    }

    fn manual(health: f64, url_pattern: &str) -> Manual {
        Manual {
            id: Uuid::new_v4(),
            url_pattern: url_pattern.to_string(),
            task_pattern: "form_application".to_string(),
            platform: "greenhouse.io".to_string(),
            steps: vec![ManualStep {
                order: 1,
                action: StepAction::Click,
                locator: "button.apply".to_string(),
                value: None,
                health_score: 1.0,
            }],
            health_score: health,
            source: ManualSource::Trace,
            success_count: 0,
            failure_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn job_roundtrip_preserves_fields() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut j = job();
        j.preset = Some("economy".to_string());
        store.insert_job(&j).await.unwrap();

        let loaded = store.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, j.id);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.target_url, j.target_url);
        assert_eq!(loaded.input_data["email"], "ada@example.com");
        assert_eq!(loaded.preset.as_deref(), Some("economy"));
        assert!(loaded.worker_id.is_none());
    }

    #[tokio::test]
    async fn claim_takes_oldest_and_marks_queued() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut first = job();
        first.created_at = Utc::now() - Duration::minutes(2);
        let second = job();
        store.insert_job(&first).await.unwrap();
        store.insert_job(&second).await.unwrap();

        let claimed = store.claim_next_pending("worker-a").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Queued);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-a"));

        let other = store.claim_next_pending("worker-b").await.unwrap().unwrap();
        assert_eq!(other.id, second.id);

        assert!(store.claim_next_pending("worker-c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeued_job_waits_out_its_backoff() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let j = job();
        store.insert_job(&j).await.unwrap();
        store.claim_next_pending("worker-a").await.unwrap().unwrap();

        store
            .requeue_for_retry(j.id, 1, Utc::now() + Duration::seconds(30))
            .await
            .unwrap();
        assert!(
            store.claim_next_pending("worker-a").await.unwrap().is_none(),
            "backoff not yet elapsed"
        );

        store
            .requeue_for_retry(j.id, 1, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        let claimed = store.claim_next_pending("worker-a").await.unwrap().unwrap();
        assert_eq!(claimed.id, j.id);
        assert_eq!(claimed.retry_count, 1);
    }

    #[tokio::test]
    async fn status_updates_track_timestamps() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let j = job();
        store.insert_job(&j).await.unwrap();

        store.update_status(j.id, JobStatus::Running).await.unwrap();
        let running = store.get_job(j.id).await.unwrap().unwrap();
        assert!(running.started_at.is_some());
        assert!(running.finished_at.is_none());

        store.update_status(j.id, JobStatus::Completed).await.unwrap();
        let done = store.get_job(j.id).await.unwrap().unwrap();
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn resolution_is_deleted_when_read() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let id = Uuid::new_v4();
        store
            .put_resolution(id, &ResolutionContext::code("438291"))
            .await
            .unwrap();

        let taken = store.take_resolution(id).await.unwrap().unwrap();
        assert_eq!(taken.resolution_type, ResolutionType::CodeEntry);
        assert_eq!(taken.data.unwrap().expose_secret(), "438291");

        assert!(store.take_resolution(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interactions_and_screenshots_roundtrip() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let job_id = Uuid::new_v4();

        let reference = store.save_screenshot(job_id, &[1, 2, 3]).await.unwrap();
        let interaction = JobInteraction::blocker(
            job_id,
            "captcha",
            Some(reference),
            serde_json::json!({"confidence": 0.95}),
        );
        store.save_interaction(&interaction).await.unwrap();

        let listed = store.list_interactions(job_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, "blocker");
        assert_eq!(listed[0].blocker_category.as_deref(), Some("captcha"));
        assert!(listed[0].screenshot_ref.is_some());
    }

    #[tokio::test]
    async fn candidates_filter_by_health_glob_and_order() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let config = ManualConfig::default();
        let strong = manual(0.9, "https://boards.greenhouse.io/*/jobs/*");
        let weak = manual(0.5, "https://boards.greenhouse.io/*/jobs/*");
        let evicted = manual(0.2, "https://boards.greenhouse.io/*/jobs/*");
        let wrong_url = manual(0.9, "https://careers.greenhouse.io/*");
        for m in [&strong, &weak, &evicted, &wrong_url] {
            store.insert_manual(m).await.unwrap();
        }

        let found = store
            .find_candidates(
                "https://boards.greenhouse.io/acme/jobs/4021",
                "form_application",
                "greenhouse.io",
                &config,
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, strong.id);
        assert_eq!(found[1].id, weak.id);
    }

    #[tokio::test]
    async fn replay_outcomes_update_health_in_place() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let config = ManualConfig::default();
        let m = manual(0.8, "https://boards.greenhouse.io/*/jobs/*");
        store.insert_manual(&m).await.unwrap();

        let reinforced = store.apply_replay_outcome(m.id, true, &config).await.unwrap();
        assert!((reinforced - 0.82).abs() < 1e-9);

        let decayed = store.apply_replay_outcome(m.id, false, &config).await.unwrap();
        assert!((decayed - 0.82 * 0.7).abs() < 1e-9);

        let stored = store.get_manual(m.id).await.unwrap().unwrap();
        assert_eq!(stored.success_count, 1);
        assert_eq!(stored.failure_count, 1);

        let missing = store
            .apply_replay_outcome(Uuid::new_v4(), true, &config)
            .await;
        assert!(matches!(missing, Err(DatabaseError::NotFound { .. })));
    }
}
