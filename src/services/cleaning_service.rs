use crate::config::RenderQueueConfig;
use crate::db::{self, DbPool};
use crate::error::CoreResult;
use crate::services::image_store::ImageStore;
use crate::services::rate_limiter::RateLimiter;
use crate::services::render_queue::{self, RetryPolicy};
use crate::services::{content_cache, plugin_service, settings_service};
use chrono::{Duration as ChronoDuration, Utc};
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

const SWEEP_INTERVAL_SECS: u64 = 5 * 60;

/// Processing jobs with no attempt in this long were abandoned by a
/// worker that died mid-render.
const STALE_PROCESSING_SECS: i64 = 15 * 60;

/// Unreferenced files younger than this may belong to a render that has
/// not committed its row yet.
const ORPHAN_GRACE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub purged_plugin_files: usize,
    pub orphaned_files: usize,
    pub purged_jobs: usize,
    pub requeued_jobs: usize,
    pub abandoned_jobs: usize,
}

/// One pass of the cleanup sweep.
pub fn sweep(
    conn: &mut SqliteConnection,
    images: &ImageStore,
    queue: &RenderQueueConfig,
    orphan_grace: Duration,
) -> CoreResult<SweepReport> {
    let now = Utc::now().naive_utc();
    let mut report = SweepReport::default();

    let released = plugin_service::purge_scheduled(conn)?;
    for name in &released {
        if images.delete(name)? {
            report.purged_plugin_files += 1;
        }
    }

    let stale = render_queue::requeue_stale(
        conn,
        now - ChronoDuration::seconds(STALE_PROCESSING_SECS),
        RetryPolicy::from_config(queue).max_attempts,
    )?;
    report.requeued_jobs = stale.requeued;
    report.abandoned_jobs = stale.failed;
    report.purged_jobs = render_queue::purge_finished(
        conn,
        now - ChronoDuration::hours(queue.completed_retention_hours.max(1)),
    )?;

    let referenced = content_cache::referenced_paths(conn)?;
    report.orphaned_files = images.remove_unreferenced(&referenced, orphan_grace)?.len();

    Ok(report)
}

pub async fn run(db_pool: DbPool, images: ImageStore, queue: RenderQueueConfig, limiter: Arc<RateLimiter>) {
    let mut tick = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));

    // The first tick completes immediately, so a sweep also runs at startup.
    loop {
        tick.tick().await;

        let (images, queue) = (images.clone(), queue.clone());
        let result = db::with_conn(&db_pool, move |conn| {
            let report = sweep(conn, &images, &queue, ORPHAN_GRACE)?;
            let window = settings_service::load_tunables(conn)?.webhook_rate_window_secs;
            Ok((report, window))
        })
        .await;

        match result {
            Ok((report, window)) => {
                limiter.prune(Duration::from_secs(window.max(1)));
                if report != SweepReport::default() {
                    tracing::info!(
                        "Cleanup: {} orphaned bitmaps, {} purged plugin bitmaps, {} old jobs removed, {} stuck jobs requeued, {} stuck jobs failed",
                        report.orphaned_files,
                        report.purged_plugin_files,
                        report.purged_jobs,
                        report.requeued_jobs,
                        report.abandoned_jobs
                    );
                }
            }
            Err(e) => tracing::error!("Cleanup task failed: {}", e),
        }
    }
}
