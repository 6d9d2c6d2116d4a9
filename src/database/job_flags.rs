//! `job_state` flag writes shared by both scopes

use sqlx::{Postgres, Transaction};

use crate::database::error::{DatabaseError, DbResult};
use crate::database::models::{JobEntity, JobState};

/// An UPDATE that matches no row takes no lock, so concurrent bookings only
/// contend on the flag while it is down. The shared lock keeps a sweep's
/// `lock_job` waiting until this transaction's work is visible to its count.
pub(crate) async fn mark_active(
    tx: &mut Transaction<'static, Postgres>,
    entity: JobEntity,
) -> DbResult<()> {
    sqlx::query("UPDATE job_state SET active = TRUE WHERE entity = $1 AND NOT active")
        .bind(entity.as_str())
        .execute(&mut **tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

    let seeded = sqlx::query_scalar::<_, bool>(
        "SELECT active FROM job_state WHERE entity = $1 FOR SHARE",
    )
    .bind(entity.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(DatabaseError::from_sqlx)?;

    if seeded.is_none() {
        sqlx::query(
            "INSERT INTO job_state (entity, active) VALUES ($1, TRUE)
             ON CONFLICT (entity) DO UPDATE SET active = TRUE",
        )
        .bind(entity.as_str())
        .execute(&mut **tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    }
    Ok(())
}

pub(crate) async fn lock(
    tx: &mut Transaction<'static, Postgres>,
    entity: JobEntity,
) -> DbResult<JobState> {
    let state = sqlx::query_as::<_, JobState>(
        "SELECT entity, active, last_run FROM job_state WHERE entity = $1 FOR UPDATE",
    )
    .bind(entity.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(DatabaseError::from_sqlx)?;

    Ok(state.unwrap_or_else(|| JobState::inactive(entity)))
}
