//! Plan records: persisted plans linked to the jobs that produced them.

use std::path::Path;

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;
use vpo_model::{Plan, PlanRecord, PlanRecordStatus};

use crate::error::{CoreError, Result};

use super::files::parse_uuid;
use super::{from_db_time, to_db_time, Store};

impl Store {
    pub async fn insert_plan_record(&self, job_id: Uuid, plan: &Plan) -> Result<PlanRecord> {
        let record = PlanRecord {
            id: Uuid::new_v4(),
            job_id,
            file_path: plan.path.clone(),
            status: PlanRecordStatus::Pending,
            plan_json: serde_json::to_value(plan)?,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO plans (id, job_id, file_path, status, plan_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(record.id.to_string())
        .bind(record.job_id.to_string())
        .bind(record.file_path.to_string_lossy().as_ref())
        .bind(record.status.as_str())
        .bind(record.plan_json.to_string())
        .bind(to_db_time(record.created_at))
        .bind(to_db_time(record.updated_at))
        .execute(self.writer())
        .await?;
        Ok(record)
    }

    /// Advance a plan record, enforcing the transition table:
    /// pending -> approved/rejected, approved -> executed/failed.
    pub async fn transition_plan_record(
        &self,
        plan_id: Uuid,
        next: PlanRecordStatus,
    ) -> Result<()> {
        let Some(record) = self.plan_record(plan_id).await? else {
            return Err(CoreError::DataIntegrity(format!(
                "plan record {plan_id} does not exist"
            )));
        };
        if !record.status.can_transition_to(next) {
            return Err(CoreError::DataIntegrity(format!(
                "plan record {plan_id}: illegal transition {} -> {}",
                record.status.as_str(),
                next.as_str()
            )));
        }
        sqlx::query("UPDATE plans SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(next.as_str())
            .bind(to_db_time(Utc::now()))
            .bind(plan_id.to_string())
            .execute(self.writer())
            .await?;
        Ok(())
    }

    pub async fn plan_record(&self, plan_id: Uuid) -> Result<Option<PlanRecord>> {
        let row = sqlx::query("SELECT * FROM plans WHERE id = ?1")
            .bind(plan_id.to_string())
            .fetch_optional(self.reader())
            .await?;
        row.as_ref().map(plan_record_from_row).transpose()
    }

    pub async fn plan_records_for_job(&self, job_id: Uuid) -> Result<Vec<PlanRecord>> {
        let rows = sqlx::query("SELECT * FROM plans WHERE job_id = ?1 ORDER BY created_at")
            .bind(job_id.to_string())
            .fetch_all(self.reader())
            .await?;
        rows.iter().map(plan_record_from_row).collect()
    }
}

fn plan_record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PlanRecord> {
    let status_raw: String = row.try_get("status")?;
    let plan_json: String = row.try_get("plan_json")?;
    Ok(PlanRecord {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        job_id: parse_uuid(&row.try_get::<String, _>("job_id")?)?,
        file_path: Path::new(&row.try_get::<String, _>("file_path")?).to_path_buf(),
        status: PlanRecordStatus::parse(&status_raw).ok_or_else(|| {
            CoreError::DataIntegrity(format!("unknown plan status {status_raw:?}"))
        })?,
        plan_json: serde_json::from_str(&plan_json)?,
        created_at: from_db_time(&row.try_get::<String, _>("created_at")?)?,
        updated_at: from_db_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpo_model::{Job, JobKind, PlannedAction};

    async fn store_with_job() -> (Store, Uuid) {
        let store = Store::open_in_memory().await.unwrap();
        let queue = crate::queue::JobQueue::new(store.clone());
        let job = Job::new(JobKind::Apply, "/m.mkv".into(), Some("p".into()), 100);
        queue.enqueue(&job).await.unwrap();
        (store, job.id)
    }

    fn sample_plan() -> Plan {
        let mut plan = Plan::new("/m.mkv".into(), "mkv".into());
        plan.actions.push(PlannedAction::SetForced {
            track_index: 2,
            current_value: false,
            desired_value: true,
        });
        plan
    }

    #[tokio::test]
    async fn insert_and_rehydrate_identical_actions() {
        let (store, job_id) = store_with_job().await;
        let plan = sample_plan();
        let record = store.insert_plan_record(job_id, &plan).await.unwrap();

        let fetched = store.plan_record(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PlanRecordStatus::Pending);
        let rehydrated: Plan = serde_json::from_value(fetched.plan_json).unwrap();
        assert_eq!(rehydrated, plan);
    }

    #[tokio::test]
    async fn legal_transition_chain() {
        let (store, job_id) = store_with_job().await;
        let record = store.insert_plan_record(job_id, &sample_plan()).await.unwrap();

        store
            .transition_plan_record(record.id, PlanRecordStatus::Approved)
            .await
            .unwrap();
        store
            .transition_plan_record(record.id, PlanRecordStatus::Executed)
            .await
            .unwrap();
        let fetched = store.plan_record(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, PlanRecordStatus::Executed);
    }

    #[tokio::test]
    async fn illegal_transitions_rejected() {
        let (store, job_id) = store_with_job().await;
        let record = store.insert_plan_record(job_id, &sample_plan()).await.unwrap();

        // pending -> executed skips approval.
        assert!(store
            .transition_plan_record(record.id, PlanRecordStatus::Executed)
            .await
            .is_err());

        store
            .transition_plan_record(record.id, PlanRecordStatus::Rejected)
            .await
            .unwrap();
        // Terminal states are immutable.
        assert!(store
            .transition_plan_record(record.id, PlanRecordStatus::Approved)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn records_listed_per_job() {
        let (store, job_id) = store_with_job().await;
        store.insert_plan_record(job_id, &sample_plan()).await.unwrap();
        store.insert_plan_record(job_id, &sample_plan()).await.unwrap();
        let records = store.plan_records_for_job(job_id).await.unwrap();
        assert_eq!(records.len(), 2);
    }
}
