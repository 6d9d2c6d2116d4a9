//! Deferred issuance promotion sweep

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::WorkerResult;
use crate::database::models::{IssuanceStatus, JobEntity};
use crate::services::EngineContext;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssuancePromotionReport {
    pub skipped: bool,
    pub issued: usize,
    pub coins_issued: i64,
}

pub struct IssuancePromotionSweep {
    ctx: Arc<EngineContext>,
    batch_size: i64,
}

impl IssuancePromotionSweep {
    pub fn new(ctx: Arc<EngineContext>, batch_size: i64) -> Self {
        Self {
            ctx,
            batch_size: batch_size.max(1),
        }
    }

    /// Turn armed, due rows into coin lots. Rows already issued are never
    /// selected again, so repeated runs do nothing.
    pub async fn run_once(&self) -> WorkerResult<IssuancePromotionReport> {
        let now = self.ctx.clock.now();
        let mut tx = self.ctx.users.begin().await?;

        if !tx.job_state(JobEntity::IssuancePromotion).await?.active {
            tx.rollback().await?;
            debug!("issuance promotion sweep idle");
            return Ok(IssuancePromotionReport {
                skipped: true,
                ..IssuancePromotionReport::default()
            });
        }

        let expiry_days = self.ctx.ledger.config().issued_lot_expiry_days;
        let due = tx.lock_due_issuances(now, self.batch_size).await?;
        let mut report = IssuancePromotionReport::default();

        for issuance in due {
            if issuance.coins_to_issue <= 0 {
                warn!(
                    issuance_id = %issuance.id,
                    coins = issuance.coins_to_issue,
                    "dropping issuance without coins"
                );
                tx.set_issuance_state(issuance.id, false, IssuanceStatus::Cancelled)
                    .await?;
                continue;
            }

            let lot = self
                .ctx
                .ledger
                .issue(
                    &mut *tx,
                    issuance.user_id,
                    issuance.coins_to_issue,
                    issuance.source_type,
                    now + Duration::days(expiry_days),
                    issuance.id,
                    &format!("{} reward", issuance.source_type),
                    now,
                )
                .await?;
            tx.set_issuance_state(issuance.id, true, IssuanceStatus::Issued)
                .await?;

            report.issued += 1;
            report.coins_issued += lot.amount;
            info!(
                issuance_id = %issuance.id,
                user_id = %issuance.user_id,
                lot_id = %lot.id,
                coins = lot.amount,
                "deferred coins issued"
            );
        }

        tx.lock_job(JobEntity::IssuancePromotion).await?;
        let still_armed = tx.count_armed_issuances().await?;
        tx.finish_job_run(JobEntity::IssuancePromotion, now, still_armed > 0)
            .await?;
        tx.commit().await?;

        Ok(report)
    }
}
