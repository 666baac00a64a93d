use crate::config::RenderQueueConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::{JobStatus, NewRenderJob, RenderJob};
use chrono::{Duration, NaiveDateTime};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use rand::Rng;

pub const PRIORITY_ROUTINE: i32 = 0;
pub const PRIORITY_DATA_CHANGE: i32 = 5;
pub const PRIORITY_PREVIEW: i32 = 10;
pub const PRIORITY_URGENT: i32 = 20;

const OPEN_STATUSES: [&str; 2] = ["pending", "processing"];
const FINISHED_STATUSES: [&str; 3] = ["completed", "cancelled", "failed"];

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub instance_id: i32,
    pub device_id: Option<i32>,
    pub priority: i32,
    pub scheduled_for: NaiveDateTime,
    pub independent: bool,
}

impl EnqueueRequest {
    pub fn routine(instance_id: i32, scheduled_for: NaiveDateTime) -> Self {
        Self {
            instance_id,
            device_id: None,
            priority: PRIORITY_ROUTINE,
            scheduled_for,
            independent: false,
        }
    }

    /// One-off render for a single device or a preview; never rescheduled.
    pub fn one_off(
        instance_id: i32,
        device_id: Option<i32>,
        priority: i32,
        scheduled_for: NaiveDateTime,
    ) -> Self {
        Self {
            instance_id,
            device_id,
            priority,
            scheduled_for,
            independent: true,
        }
    }
}

/// Bounded exponential backoff for failed render jobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RenderQueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::seconds(config.backoff_base_secs.max(1)),
            max: Duration::seconds(config.backoff_max_secs.max(config.backoff_base_secs.max(1))),
        }
    }

    /// Delay before attempt `attempts + 1`, without jitter.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = (attempts.max(1) - 1).min(30) as u32;
        let factor = 2_i64.saturating_pow(exponent);
        let millis = self.base.num_milliseconds().saturating_mul(factor);
        Duration::milliseconds(millis.min(self.max.num_milliseconds()))
    }

    /// When the job may run again, or `None` once the budget is spent.
    pub fn next_attempt_at(&self, now: NaiveDateTime, attempts: i32) -> Option<NaiveDateTime> {
        if attempts >= self.max_attempts {
            return None;
        }
        let delay = self.backoff(attempts);
        let jitter_ceiling = delay.num_milliseconds() / 10;
        let jitter = if jitter_ceiling > 0 {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        } else {
            0
        };
        Some(now + delay + Duration::milliseconds(jitter))
    }
}

pub fn get_job(conn: &mut SqliteConnection, job_id: i32) -> CoreResult<RenderJob> {
    use crate::schema::render_queue::dsl::*;

    render_queue
        .find(job_id)
        .select(RenderJob::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::not_found(format!("render job {}", job_id)))
}

pub fn status_of(conn: &mut SqliteConnection, job_id: i32) -> CoreResult<Option<JobStatus>> {
    use crate::schema::render_queue::dsl::*;

    let raw: Option<String> = render_queue
        .find(job_id)
        .select(status)
        .first(conn)
        .optional()?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

/// Open one-off job for the same (instance, device) target. A pending
/// entry takes the higher priority; one waiting out a retry backoff keeps
/// its due time.
fn coalesce_one_off(conn: &mut SqliteConnection, request: &EnqueueRequest) -> CoreResult<Option<RenderJob>> {
    use crate::schema::render_queue::dsl::*;

    let mut query = render_queue
        .filter(plugin_instance_id.eq(request.instance_id))
        .filter(status.eq_any(OPEN_STATUSES))
        .filter(independent_render.eq(true))
        .into_boxed();
    query = match request.device_id {
        Some(d) => query.filter(device_id.eq(d)),
        None => query.filter(device_id.is_null()),
    };
    let Some(job) = query
        .order(id.asc())
        .select(RenderJob::as_select())
        .first(conn)
        .optional()?
    else {
        return Ok(None);
    };

    if job.status() != Some(JobStatus::Pending) {
        return Ok(Some(job));
    }
    let when = if job.attempts == 0 {
        job.scheduled_for.min(request.scheduled_for)
    } else {
        job.scheduled_for
    };
    let updated = diesel::update(
        render_queue
            .find(job.id)
            .filter(status.eq(JobStatus::Pending.as_str())),
    )
    .set((
        scheduled_for.eq(when),
        priority.eq(job.priority.max(request.priority)),
        updated_at.eq(chrono::Utc::now().naive_utc()),
    ))
    .returning(RenderJob::as_select())
    .get_result(conn)
    .optional()?;

    match updated {
        Some(job) => Ok(Some(job)),
        // Claimed between the read and the update.
        None => get_job(conn, job.id).map(Some),
    }
}

/// Add a job. A routine request folds into an existing routine pending
/// entry for the same target, pulling it forward and raising its priority.
/// A one-off request joins an open one-off for the same target.
pub fn enqueue(conn: &mut SqliteConnection, request: EnqueueRequest) -> CoreResult<RenderJob> {
    use crate::schema::render_queue::dsl::*;

    if request.independent {
        if let Some(job) = coalesce_one_off(conn, &request)? {
            tracing::debug!(
                "Joined one-off render request for instance {} to job {}",
                request.instance_id,
                job.id
            );
            return Ok(job);
        }
    } else {
        let mut query = render_queue
            .filter(plugin_instance_id.eq(request.instance_id))
            .filter(status.eq(JobStatus::Pending.as_str()))
            .filter(independent_render.eq(false))
            .into_boxed();
        query = match request.device_id {
            Some(d) => query.filter(device_id.eq(d)),
            None => query.filter(device_id.is_null()),
        };
        let existing: Option<RenderJob> = query
            .order(scheduled_for.asc())
            .select(RenderJob::as_select())
            .first(conn)
            .optional()?;

        if let Some(job) = existing {
            let when = job.scheduled_for.min(request.scheduled_for);
            let rank = job.priority.max(request.priority);
            let updated = diesel::update(
                render_queue
                    .find(job.id)
                    .filter(status.eq(JobStatus::Pending.as_str())),
            )
            .set((
                scheduled_for.eq(when),
                priority.eq(rank),
                updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .returning(RenderJob::as_select())
            .get_result(conn)
            .optional()?;

            if let Some(job) = updated {
                tracing::debug!(
                    "Coalesced render request for instance {} into job {}",
                    request.instance_id,
                    job.id
                );
                return Ok(job);
            }
            // Claimed between the read and the update; fall through and insert.
        }
    }

    let job = diesel::insert_into(render_queue)
        .values(&NewRenderJob {
            plugin_instance_id: request.instance_id,
            device_id: request.device_id,
            priority: request.priority,
            scheduled_for: request.scheduled_for,
            status: JobStatus::Pending.as_str().to_string(),
            independent_render: request.independent,
        })
        .returning(RenderJob::as_select())
        .get_result(conn)?;

    tracing::debug!(
        "Enqueued render job {} for instance {} (priority {}, due {})",
        job.id,
        job.plugin_instance_id,
        job.priority,
        job.scheduled_for
    );
    Ok(job)
}

/// Pending jobs due at `now`, highest priority first, earlier due first.
pub fn due_candidates(
    conn: &mut SqliteConnection,
    now: NaiveDateTime,
    limit: i64,
) -> CoreResult<Vec<RenderJob>> {
    use crate::schema::render_queue::dsl::*;

    Ok(render_queue
        .filter(status.eq(JobStatus::Pending.as_str()))
        .filter(scheduled_for.le(now))
        .order((priority.desc(), scheduled_for.asc(), id.asc()))
        .limit(limit)
        .select(RenderJob::as_select())
        .load(conn)?)
}

/// Atomically move a job from pending to processing. Exactly one caller
/// wins; the rest see `false`.
pub fn claim(conn: &mut SqliteConnection, job_id: i32, now: NaiveDateTime) -> CoreResult<bool> {
    use crate::schema::render_queue::dsl::*;

    let affected = diesel::update(
        render_queue
            .find(job_id)
            .filter(status.eq(JobStatus::Pending.as_str())),
    )
    .set((
        status.eq(JobStatus::Processing.as_str()),
        attempts.eq(attempts + 1),
        last_attempt.eq(Some(now)),
        updated_at.eq(now),
    ))
    .execute(conn)?;

    Ok(affected == 1)
}

/// Claim the best due job, skipping any lost to another worker.
pub fn dequeue(conn: &mut SqliteConnection, now: NaiveDateTime) -> CoreResult<Option<RenderJob>> {
    for candidate in due_candidates(conn, now, 16)? {
        if claim(conn, candidate.id, now)? {
            return get_job(conn, candidate.id).map(Some);
        }
    }
    Ok(None)
}

fn transition(
    conn: &mut SqliteConnection,
    job_id: i32,
    from: JobStatus,
    to: JobStatus,
    message: Option<&str>,
) -> CoreResult<bool> {
    use crate::schema::render_queue::dsl::*;

    debug_assert!(from.can_transition(to));
    let affected = diesel::update(render_queue.find(job_id).filter(status.eq(from.as_str())))
        .set((
            status.eq(to.as_str()),
            error_message.eq(message),
            updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(affected == 1)
}

pub fn complete(conn: &mut SqliteConnection, job_id: i32) -> CoreResult<bool> {
    transition(conn, job_id, JobStatus::Processing, JobStatus::Completed, None)
}

pub fn fail(conn: &mut SqliteConnection, job_id: i32, message: &str) -> CoreResult<bool> {
    transition(
        conn,
        job_id,
        JobStatus::Processing,
        JobStatus::Failed,
        Some(message),
    )
}

/// Put a failed job back in line at `at`, keeping its attempt count and
/// last error.
pub fn rearm(conn: &mut SqliteConnection, job_id: i32, at: NaiveDateTime) -> CoreResult<bool> {
    use crate::schema::render_queue::dsl::*;

    let affected = diesel::update(
        render_queue
            .find(job_id)
            .filter(status.eq(JobStatus::Failed.as_str())),
    )
    .set((
        status.eq(JobStatus::Pending.as_str()),
        scheduled_for.eq(at),
        updated_at.eq(chrono::Utc::now().naive_utc()),
    ))
    .execute(conn)?;
    Ok(affected == 1)
}

/// Operator retry of a job that used up its budget. Starts a fresh budget.
pub fn retry_now(conn: &mut SqliteConnection, job_id: i32, now: NaiveDateTime) -> CoreResult<RenderJob> {
    use crate::schema::render_queue::dsl::*;

    let job = get_job(conn, job_id)?;
    if job.status() != Some(JobStatus::Failed) {
        return Err(CoreError::consistency(format!(
            "render job {} is {}, only failed jobs can be retried",
            job_id, job.status
        )));
    }

    Ok(diesel::update(
        render_queue
            .find(job_id)
            .filter(status.eq(JobStatus::Failed.as_str())),
    )
    .set((
        status.eq(JobStatus::Pending.as_str()),
        attempts.eq(0),
        scheduled_for.eq(now),
        updated_at.eq(now),
    ))
    .returning(RenderJob::as_select())
    .get_result(conn)?)
}

pub fn cancel(conn: &mut SqliteConnection, job_id: i32, reason: &str) -> CoreResult<bool> {
    use crate::schema::render_queue::dsl::*;

    let affected = diesel::update(render_queue.find(job_id).filter(status.eq_any(OPEN_STATUSES)))
        .set((
            status.eq(JobStatus::Cancelled.as_str()),
            error_message.eq(Some(reason)),
            updated_at.eq(chrono::Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(affected == 1)
}

/// Flip every pending or processing job for the instance to cancelled.
pub fn cancel_for_instance(conn: &mut SqliteConnection, instance_id: i32) -> CoreResult<usize> {
    use crate::schema::render_queue::dsl::*;

    let affected = diesel::update(
        render_queue
            .filter(plugin_instance_id.eq(instance_id))
            .filter(status.eq_any(OPEN_STATUSES)),
    )
    .set((
        status.eq(JobStatus::Cancelled.as_str()),
        error_message.eq(Some("plugin instance removed")),
        updated_at.eq(chrono::Utc::now().naive_utc()),
    ))
    .execute(conn)?;

    if affected > 0 {
        tracing::info!("Cancelled {} render jobs for instance {}", affected, instance_id);
    }
    Ok(affected)
}

pub fn delete_for_instance(conn: &mut SqliteConnection, instance_id: i32) -> CoreResult<usize> {
    use crate::schema::render_queue::dsl::*;

    Ok(diesel::delete(render_queue.filter(plugin_instance_id.eq(instance_id))).execute(conn)?)
}

/// Whether the instance's routine chain is alive (or parked as failed,
/// waiting for an operator).
pub fn has_outstanding(conn: &mut SqliteConnection, instance_id: i32) -> CoreResult<bool> {
    use crate::schema::render_queue::dsl::*;

    let latest: Option<String> = render_queue
        .filter(plugin_instance_id.eq(instance_id))
        .filter(independent_render.eq(false))
        .filter(device_id.is_null())
        .order(id.desc())
        .select(status)
        .first(conn)
        .optional()?;

    Ok(matches!(
        latest.and_then(|s| s.parse::<JobStatus>().ok()),
        Some(JobStatus::Pending | JobStatus::Processing | JobStatus::Failed)
    ))
}

/// Jobs that exhausted their retry budget.
pub fn list_failed(conn: &mut SqliteConnection, max_attempts: i32) -> CoreResult<Vec<RenderJob>> {
    use crate::schema::render_queue::dsl::*;

    Ok(render_queue
        .filter(status.eq(JobStatus::Failed.as_str()))
        .filter(attempts.ge(max_attempts))
        .order(updated_at.desc())
        .select(RenderJob::as_select())
        .load(conn)?)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StaleJobs {
    pub requeued: usize,
    pub failed: usize,
}

/// Settle jobs stuck in processing since before `older_than` (a worker
/// died mid-flight). Jobs with attempts left go back to pending; the rest
/// end as failed.
pub fn requeue_stale(
    conn: &mut SqliteConnection,
    older_than: NaiveDateTime,
    max_attempts: i32,
) -> CoreResult<StaleJobs> {
    use crate::schema::render_queue::dsl::*;

    let now = chrono::Utc::now().naive_utc();
    let failed = diesel::update(
        render_queue
            .filter(status.eq(JobStatus::Processing.as_str()))
            .filter(last_attempt.lt(older_than))
            .filter(attempts.ge(max_attempts)),
    )
    .set((
        status.eq(JobStatus::Failed.as_str()),
        error_message.eq(Some("transient: worker stopped before finishing, retry budget used up")),
        updated_at.eq(now),
    ))
    .execute(conn)?;

    let requeued = diesel::update(
        render_queue
            .filter(status.eq(JobStatus::Processing.as_str()))
            .filter(last_attempt.lt(older_than)),
    )
    .set((
        status.eq(JobStatus::Pending.as_str()),
        error_message.eq(Some("transient: worker stopped before finishing")),
        updated_at.eq(now),
    ))
    .execute(conn)?;

    if requeued > 0 {
        tracing::warn!("Requeued {} render jobs abandoned in processing", requeued);
    }
    if failed > 0 {
        tracing::warn!("Failed {} abandoned render jobs with no attempts left", failed);
    }
    Ok(StaleJobs { requeued, failed })
}

/// Drop completed, cancelled and failed rows last touched before `older_than`.
pub fn purge_finished(conn: &mut SqliteConnection, older_than: NaiveDateTime) -> CoreResult<usize> {
    use crate::schema::render_queue::dsl::*;

    Ok(diesel::delete(
        render_queue
            .filter(status.eq_any(FINISHED_STATUSES))
            .filter(updated_at.lt(older_than)),
    )
    .execute(conn)?)
}
