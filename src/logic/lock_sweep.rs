use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info};
use tokio::task::JoinHandle;

use crate::logic::error::{PipelineResult, StoreContext};
use crate::store::traits::VersionStore;

/// Locks versions whose lock time has passed.
///
/// Not used by the staging operations themselves; it runs on its own timer.
pub struct VersionLocker;

impl VersionLocker {
    pub async fn sweep<S: VersionStore>(store: &S, now: DateTime<Utc>) -> PipelineResult<u64> {
        let locked = store
            .lock_expired_versions(now)
            .await
            .store_context(|| format!("Failed to lock sql versions due at {}", now))?;
        if locked > 0 {
            info!("Locked {} sql version(s) whose lock time passed", locked);
        }
        Ok(locked)
    }

    /// Run `sweep` every `period` until the task is aborted.
    pub fn spawn<S: VersionStore + 'static>(store: Arc<S>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = Self::sweep(store.as_ref(), Utc::now()).await {
                    error!("Version lock sweep failed: {}", e);
                }
            }
        })
    }
}
