//! Drives both sweeps on fixed intervals until shutdown

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use super::hold_expiry::HoldExpirySweep;
use super::issuance_promotion::IssuancePromotionSweep;
use crate::config::SchedulerConfig;
use crate::services::EngineContext;

pub struct Scheduler {
    hold_expiry: HoldExpirySweep,
    issuance_promotion: IssuancePromotionSweep,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(ctx: Arc<EngineContext>, config: SchedulerConfig) -> Self {
        Self {
            hold_expiry: HoldExpirySweep::new(ctx.clone(), config.batch_size),
            issuance_promotion: IssuancePromotionSweep::new(ctx, config.batch_size),
            config,
        }
    }

    pub fn hold_expiry(&self) -> &HoldExpirySweep {
        &self.hold_expiry
    }

    pub fn issuance_promotion(&self) -> &IssuancePromotionSweep {
        &self.issuance_promotion
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let hold_every = Duration::from_secs(self.config.hold_expiry_interval_secs.max(1));
        let issuance_every = Duration::from_secs(self.config.issuance_interval_secs.max(1));
        info!(
            hold_expiry_interval_secs = hold_every.as_secs(),
            issuance_interval_secs = issuance_every.as_secs(),
            batch_size = self.config.batch_size,
            "scheduler started"
        );

        let mut hold_timer = interval(hold_every);
        hold_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut issuance_timer = interval(issuance_every);
        issuance_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler stopping");
                        break;
                    }
                }
                _ = hold_timer.tick() => {
                    if let Err(e) = self.hold_expiry.run_once().await {
                        warn!(error = %e, "hold expiry sweep failed");
                    }
                }
                _ = issuance_timer.tick() => {
                    if let Err(e) = self.issuance_promotion.run_once().await {
                        warn!(error = %e, "issuance promotion sweep failed");
                    }
                }
            }
        }

        info!("scheduler stopped");
    }
}
