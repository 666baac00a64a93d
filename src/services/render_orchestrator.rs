use crate::config::{Config, DisplayConfig, RenderQueueConfig};
use crate::db::{self, DbPool};
use crate::error::{CoreError, CoreResult};
use crate::models::{Device, JobStatus, LifecycleState, PluginDefinition, PluginInstance, RenderJob};
use crate::services::content_cache::{self, CacheEntry};
use crate::services::image_store::{self, ImageStore};
use crate::services::plugin_service::PluginSettings;
use crate::services::render_queue::{self, EnqueueRequest, RetryPolicy, PRIORITY_URGENT};
use crate::services::renderer::{RenderRequest, RenderedImage, Renderer};
use crate::services::{merge_engine, schedule_resolver};
use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;

const PLANNER_INTERVAL_SECS: u64 = 30;

/// Published whenever a job attempt ends.
#[derive(Debug, Clone, Serialize)]
pub struct RenderEvent {
    pub job_id: i32,
    pub instance_id: i32,
    pub device_id: Option<i32>,
    pub status: JobStatus,
}

#[derive(Debug, Clone)]
struct TargetGroup {
    width: i32,
    height: i32,
    bit_depth: i32,
    devices: Vec<Option<i32>>,
}

#[derive(Debug)]
struct RenderPlan {
    template: String,
    data: Value,
    settings: Value,
    refresh_interval: i32,
    reachable: bool,
    groups: Vec<TargetGroup>,
}

impl RenderPlan {
    fn targets(&self) -> Vec<Option<i32>> {
        self.groups.iter().flat_map(|g| g.devices.clone()).collect()
    }
}

/// How one claimed attempt ended, before the queue row is settled.
#[derive(Debug)]
enum Attempt {
    Rendered(RenderPlan),
    Cancel(String),
    Fail(CoreError, Vec<Option<i32>>),
    Discarded,
}

#[derive(Debug)]
enum JobContext {
    Cancel(String),
    Fail(CoreError),
    Render(RenderPlan),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Stored { changed: bool },
    Cancelled,
}

/// Owns the render queue workers. Shared through `AppState` as an `Arc`.
pub struct RenderOrchestrator {
    db: DbPool,
    renderer: Arc<dyn Renderer>,
    images: ImageStore,
    queue: RenderQueueConfig,
    display: DisplayConfig,
    render_timeout: Duration,
    retry: RetryPolicy,
    wake: Notify,
    events: broadcast::Sender<RenderEvent>,
}

impl RenderOrchestrator {
    pub fn new(db: DbPool, renderer: Arc<dyn Renderer>, config: &Config) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            db,
            renderer,
            images: ImageStore::new(&config.storage.directory),
            queue: config.render_queue.clone(),
            display: config.display.clone(),
            render_timeout: Duration::from_secs(config.renderer.timeout_secs),
            retry: RetryPolicy::from_config(&config.render_queue),
            wake: Notify::new(),
            events,
        }
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RenderEvent> {
        self.events.subscribe()
    }

    async fn blocking<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut SqliteConnection) -> CoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        db::with_conn(&self.db, f).await
    }

    /// Wake one idle worker to look for due jobs.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Enqueue and wake an idle worker.
    pub fn enqueue(&self, conn: &mut SqliteConnection, request: EnqueueRequest) -> CoreResult<RenderJob> {
        let job = render_queue::enqueue(conn, request)?;
        self.wake.notify_one();
        Ok(job)
    }

    /// Start the worker pool and the refresh planner.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = (0..self.queue.workers)
            .map(|worker_id| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.worker_loop(worker_id).await })
            })
            .collect();

        let this = Arc::clone(self);
        handles.push(tokio::spawn(async move { this.planner_loop().await }));
        tracing::info!("Started {} render workers", self.queue.workers);
        handles
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        let mut tick = interval(Duration::from_secs(self.queue.poll_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.wake.notified() => {}
            }

            loop {
                match self.run_once().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        tracing::error!("Render worker {} error: {}", worker_id, e);
                        break;
                    }
                }
            }
        }
    }

    async fn planner_loop(self: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(PLANNER_INTERVAL_SECS));

        loop {
            tick.tick().await;

            match self.plan_refreshes().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Refresh planner queued {} instances", n),
                Err(e) => tracing::error!("Refresh planner error: {}", e),
            }
        }
    }

    /// Claim and process one due job. Returns false when nothing was due.
    pub async fn run_once(&self) -> CoreResult<bool> {
        let job = self
            .blocking(|conn| render_queue::dequeue(conn, Utc::now().naive_utc()))
            .await?;

        match job {
            Some(job) => {
                self.process_job(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Carry a claimed job to its next state. Any error after the claim
    /// is recorded on the job like a render failure.
    pub async fn process_job(&self, job: RenderJob) -> CoreResult<JobStatus> {
        tracing::debug!(
            "Processing render job {} for instance {} (attempt {})",
            job.id,
            job.plugin_instance_id,
            job.attempts
        );

        let attempt = match self.attempt(&job).await {
            Ok(attempt) => attempt,
            Err(e) => {
                tracing::error!("Render job {} aborted: {}", job.id, e);
                Attempt::Fail(e, Vec::new())
            }
        };

        match attempt {
            Attempt::Rendered(plan) => self.finish_completed(&job, &plan).await,
            Attempt::Cancel(reason) => self.finish_cancelled(&job, reason).await,
            Attempt::Fail(err, targets) => self.finish_failed(&job, err, targets).await,
            Attempt::Discarded => {
                tracing::info!(
                    "Render job {} was cancelled mid-flight, result discarded",
                    job.id
                );
                self.publish(&job, JobStatus::Cancelled);
                Ok(JobStatus::Cancelled)
            }
        }
    }

    async fn attempt(&self, job: &RenderJob) -> CoreResult<Attempt> {
        let display = self.display.clone();
        let snapshot = job.clone();
        let context = self
            .blocking(move |conn| load_context(conn, &snapshot, &display, Utc::now()))
            .await?;

        let plan = match context {
            JobContext::Cancel(reason) => return Ok(Attempt::Cancel(reason)),
            JobContext::Fail(err) => return Ok(Attempt::Fail(err, Vec::new())),
            JobContext::Render(plan) => plan,
        };

        for group in &plan.groups {
            let request = RenderRequest {
                template: plan.template.clone(),
                data: plan.data.clone(),
                settings: plan.settings.clone(),
                width: group.width,
                height: group.height,
                bit_depth: group.bit_depth,
            };

            let mut image = match tokio::time::timeout(self.render_timeout, self.renderer.render(&request)).await {
                Ok(Ok(image)) => image,
                Ok(Err(e)) => return Ok(Attempt::Fail(e, plan.targets())),
                Err(_) => {
                    let err = CoreError::transient(format!(
                        "render timed out after {}s",
                        self.render_timeout.as_secs()
                    ));
                    return Ok(Attempt::Fail(err, plan.targets()));
                }
            };
            image.content_hash = image_store::accept_hash(Some(image.content_hash.as_str()), &image.bytes);

            let image = Arc::new(image);
            for device in &group.devices {
                let images = self.images.clone();
                let image = Arc::clone(&image);
                let (job_id, instance_id, device) = (job.id, job.plugin_instance_id, *device);
                let (width, height, bit_depth) = (group.width, group.height, group.bit_depth);
                let committed = self
                    .blocking(move |conn| {
                        commit_render(
                            conn,
                            &images,
                            job_id,
                            CacheEntry {
                                instance_id,
                                device_id: device,
                                width,
                                height,
                                bit_depth,
                                image_path: String::new(),
                                content_hash: image.content_hash.clone(),
                            },
                            &image,
                            Utc::now().naive_utc(),
                        )
                    })
                    .await;

                match committed {
                    Ok(CommitOutcome::Cancelled) => return Ok(Attempt::Discarded),
                    Ok(CommitOutcome::Stored { .. }) => {}
                    Err(e) => return Ok(Attempt::Fail(e, plan.targets())),
                }
            }
        }

        Ok(Attempt::Rendered(plan))
    }

    async fn finish_completed(&self, job: &RenderJob, plan: &RenderPlan) -> CoreResult<JobStatus> {
        let (job_id, instance_id) = (job.id, job.plugin_instance_id);
        let follow_up = !job.independent_render && plan.reachable;
        let refresh_interval = plan.refresh_interval.max(1) as i64;

        let status = self
            .blocking(move |conn| {
                if !render_queue::complete(conn, job_id)? {
                    return Ok(JobStatus::Cancelled);
                }
                if follow_up {
                    let due = Utc::now().naive_utc() + chrono::Duration::seconds(refresh_interval);
                    let next = render_queue::enqueue(conn, EnqueueRequest::routine(instance_id, due))?;
                    tracing::debug!("Rescheduled instance {} as job {} at {}", instance_id, next.id, due);
                }
                Ok(JobStatus::Completed)
            })
            .await?;

        if status == JobStatus::Completed {
            tracing::info!("Render job {} completed for instance {}", job.id, instance_id);
        }
        self.publish(job, status);
        Ok(status)
    }

    async fn finish_cancelled(&self, job: &RenderJob, reason: String) -> CoreResult<JobStatus> {
        let job_id = job.id;
        tracing::info!("Cancelling render job {}: {}", job_id, reason);
        self.blocking(move |conn| render_queue::cancel(conn, job_id, &reason))
            .await?;
        self.publish(job, JobStatus::Cancelled);
        Ok(JobStatus::Cancelled)
    }

    async fn finish_failed(
        &self,
        job: &RenderJob,
        err: CoreError,
        targets: Vec<Option<i32>>,
    ) -> CoreResult<JobStatus> {
        let message = format!("{}: {}", err.kind(), err);
        let retryable = !matches!(err, CoreError::Config(_));
        let retry = self.retry.clone();
        let (job_id, instance_id, attempts) = (job.id, job.plugin_instance_id, job.attempts);
        let logged = message.clone();

        let status = self
            .blocking(move |conn| {
                if !render_queue::fail(conn, job_id, &message)? {
                    return Ok(JobStatus::Cancelled);
                }
                for device in targets {
                    content_cache::record_failure(conn, instance_id, device)?;
                }
                if !retryable {
                    return Ok(JobStatus::Failed);
                }
                match retry.next_attempt_at(Utc::now().naive_utc(), attempts) {
                    Some(at) => {
                        render_queue::rearm(conn, job_id, at)?;
                        tracing::info!("Render job {} will retry at {}", job_id, at);
                        Ok(JobStatus::Pending)
                    }
                    None => {
                        tracing::warn!(
                            "Render job {} exhausted {} attempts, leaving it failed",
                            job_id,
                            attempts
                        );
                        Ok(JobStatus::Failed)
                    }
                }
            })
            .await?;

        tracing::warn!(
            "Render job {} for instance {} failed (attempt {}): {}",
            job.id,
            instance_id,
            attempts,
            logged
        );
        self.publish(job, status);
        Ok(status)
    }

    fn publish(&self, job: &RenderJob, status: JobStatus) {
        let _ = self.events.send(RenderEvent {
            job_id: job.id,
            instance_id: job.plugin_instance_id,
            device_id: job.device_id,
            status,
        });
    }

    /// Give every instance reachable from an active playlist item a live
    /// routine job. Returns the number of instances queued.
    pub async fn plan_refreshes(&self) -> CoreResult<usize> {
        let planned = self
            .blocking(|conn| {
                let now = Utc::now();
                let mut planned = 0;
                for instance in servable_instances(conn)? {
                    if render_queue::has_outstanding(conn, instance.id)? {
                        continue;
                    }
                    if schedule_resolver::reachable_device_ids(conn, instance.id, now)?.is_empty() {
                        continue;
                    }
                    let due = match content_cache::last_rendered_at(conn, instance.id)? {
                        Some(last) => {
                            last + chrono::Duration::seconds(instance.refresh_interval.max(1) as i64)
                        }
                        None => now.naive_utc(),
                    };
                    render_queue::enqueue(conn, EnqueueRequest::routine(instance.id, due))?;
                    planned += 1;
                }
                Ok(planned)
            })
            .await?;

        if planned > 0 {
            self.wake.notify_one();
        }
        Ok(planned)
    }

    /// Queue an urgent one-off render and wait for its attempt to end.
    /// Returns `None` when `wait` elapses first.
    pub async fn request_render_and_wait(
        &self,
        instance_id: i32,
        device_id: Option<i32>,
        wait: Duration,
    ) -> CoreResult<Option<JobStatus>> {
        let mut events = self.subscribe();
        let job = {
            let request = EnqueueRequest::one_off(
                instance_id,
                device_id,
                PRIORITY_URGENT,
                Utc::now().naive_utc(),
            );
            self.blocking(move |conn| render_queue::enqueue(conn, request))
                .await?
        };
        self.wake.notify_one();

        let job_id = job.id;
        let waited = tokio::time::timeout(wait, async {
            loop {
                match events.recv().await {
                    Ok(event) if event.job_id == job_id => return Some(event.status),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Render event stream lagged by {}", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await;

        match waited {
            Ok(status) => Ok(status),
            Err(_) => {
                tracing::debug!(
                    "Gave up waiting for render job {} after {:?}",
                    job_id,
                    wait
                );
                Ok(None)
            }
        }
    }
}

/// Instances that may be rendered: active, configured, with an active definition.
fn servable_instances(conn: &mut SqliteConnection) -> CoreResult<Vec<PluginInstance>> {
    use crate::schema::{plugin_definitions, plugin_instances};

    Ok(plugin_instances::table
        .inner_join(plugin_definitions::table)
        .filter(plugin_instances::lifecycle_state.eq(LifecycleState::Active.as_str()))
        .filter(plugin_instances::needs_config_update.eq(false))
        .filter(plugin_definitions::lifecycle_state.eq(LifecycleState::Active.as_str()))
        .order(plugin_instances::id.asc())
        .select(PluginInstance::as_select())
        .load(conn)?)
}

fn load_context(
    conn: &mut SqliteConnection,
    job: &RenderJob,
    display: &DisplayConfig,
    now: chrono::DateTime<Utc>,
) -> CoreResult<JobContext> {
    use crate::schema::{devices, plugin_definitions, plugin_instances};

    let found: Option<(PluginInstance, PluginDefinition)> = plugin_instances::table
        .inner_join(plugin_definitions::table)
        .filter(plugin_instances::id.eq(job.plugin_instance_id))
        .select((PluginInstance::as_select(), PluginDefinition::as_select()))
        .first(conn)
        .optional()?;

    let Some((instance, definition)) = found else {
        return Ok(JobContext::Cancel(format!(
            "plugin instance {} no longer exists",
            job.plugin_instance_id
        )));
    };

    if instance.lifecycle() != LifecycleState::Active
        || definition.lifecycle() != LifecycleState::Active
    {
        return Ok(JobContext::Cancel(format!(
            "plugin instance {} is not active",
            instance.id
        )));
    }

    if instance.needs_config_update {
        return Ok(JobContext::Fail(CoreError::config(format!(
            "plugin instance {} requires reconfiguration",
            instance.id
        ))));
    }

    let reachable = schedule_resolver::reachable_device_ids(conn, instance.id, now)?;

    let targets: Vec<(Option<i32>, i32, i32, i32)> = match job.device_id {
        Some(device_id) => {
            let device: Option<Device> = devices::table
                .find(device_id)
                .select(Device::as_select())
                .first(conn)
                .optional()?;
            match device {
                Some(d) => vec![(Some(d.id), d.width, d.height, d.bit_depth)],
                None => {
                    return Ok(JobContext::Cancel(format!("device {} no longer exists", device_id)))
                }
            }
        }
        None if reachable.is_empty() => vec![(
            None,
            display.default_width,
            display.default_height,
            display.default_bit_depth,
        )],
        None => devices::table
            .filter(devices::id.eq_any(&reachable))
            .order(devices::id.asc())
            .select(Device::as_select())
            .load::<Device>(conn)?
            .into_iter()
            .map(|d| (Some(d.id), d.width, d.height, d.bit_depth))
            .collect(),
    };

    let mut by_geometry: BTreeMap<(i32, i32, i32), Vec<Option<i32>>> = BTreeMap::new();
    for (device, width, height, bit_depth) in targets {
        by_geometry
            .entry((width, height, bit_depth))
            .or_default()
            .push(device);
    }

    let settings = match PluginSettings::for_instance(&definition, &instance) {
        Ok(decoded) => decoded.to_value()?,
        Err(e) => return Ok(JobContext::Fail(e)),
    };

    Ok(JobContext::Render(RenderPlan {
        template: definition.template,
        data: merge_engine::current_data(conn, instance.id)?,
        settings,
        refresh_interval: instance.refresh_interval,
        reachable: !reachable.is_empty(),
        groups: by_geometry
            .into_iter()
            .map(|((width, height, bit_depth), devices)| TargetGroup {
                width,
                height,
                bit_depth,
                devices,
            })
            .collect(),
    }))
}

/// Record one render result. The job must still be processing when the
/// write lock is taken; otherwise nothing is stored. An unchanged hash
/// skips the file write.
pub fn commit_render(
    conn: &mut SqliteConnection,
    images: &ImageStore,
    job_id: i32,
    entry: CacheEntry,
    image: &RenderedImage,
    now: NaiveDateTime,
) -> CoreResult<CommitOutcome> {
    let mut written: Option<String> = None;

    let result = conn.immediate_transaction(|conn| {
        if render_queue::status_of(conn, job_id)? != Some(JobStatus::Processing) {
            return Ok(CommitOutcome::Cancelled);
        }

        if let Some(current) = content_cache::get(conn, entry.instance_id, entry.device_id)? {
            if current.content_hash == image.content_hash {
                content_cache::touch(conn, current.id, now)?;
                tracing::debug!(
                    "Render for instance {} unchanged ({}), skipped write",
                    entry.instance_id,
                    image.content_hash.get(..12).unwrap_or(&image.content_hash)
                );
                return Ok(CommitOutcome::Stored { changed: false });
            }
        }

        let name = images.write(
            entry.instance_id,
            entry.device_id,
            &image.content_hash,
            &image.bytes,
        )?;
        written = Some(name.clone());
        let outcome = content_cache::put(
            conn,
            CacheEntry {
                image_path: name,
                ..entry.clone()
            },
            now,
        )?;

        // Removed under the write lock, and only when no row points at the
        // name any more; another job may have stored the same file.
        if let Some(old) = outcome.replaced_path {
            if !content_cache::is_referenced(conn, &old)? {
                if let Err(e) = images.delete(&old) {
                    tracing::warn!("Failed to delete replaced bitmap {}: {}", old, e);
                }
            }
        }
        Ok::<_, CoreError>(CommitOutcome::Stored { changed: true })
    });

    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            if let Some(name) = written {
                let _ = images.delete(&name);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::playlist_service::{self, ItemOptions};
    use crate::services::plugin_service;
    use crate::test_support::{self, FakeRenderer, TestDb};

    fn orchestrator(db: &TestDb, renderer: Arc<FakeRenderer>) -> RenderOrchestrator {
        RenderOrchestrator::new(db.pool.clone(), renderer, &test_support::config(db))
    }

    fn files_in(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }

    fn preview(conn: &mut SqliteConnection, instance_id: i32, device: Option<i32>) -> RenderJob {
        render_queue::enqueue(
            conn,
            EnqueueRequest::one_off(
                instance_id,
                device,
                render_queue::PRIORITY_PREVIEW,
                Utc::now().naive_utc(),
            ),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_identical_renders_write_once() {
        let db = TestDb::new();
        let renderer = Arc::new(FakeRenderer::new(b"BM same bits"));
        let orch = orchestrator(&db, renderer.clone());
        let (device, instance) = {
            let mut conn = db.conn();
            let pair = test_support::device_showing(&mut conn, "dedup");
            preview(&mut conn, pair.1.id, Some(pair.0.id));
            pair
        };

        assert!(orch.run_once().await.unwrap());
        let first = {
            let mut conn = db.conn();
            content_cache::get(&mut conn, instance.id, Some(device.id))
                .unwrap()
                .unwrap()
        };

        preview(&mut db.conn(), instance.id, Some(device.id));
        assert!(orch.run_once().await.unwrap());
        let second = content_cache::get(&mut db.conn(), instance.id, Some(device.id))
            .unwrap()
            .unwrap();

        assert_eq!(renderer.calls(), 2);
        assert_eq!(files_in(&db.storage_dir()), 1);
        assert_eq!(second.content_hash, first.content_hash);
        assert_eq!(second.image_path, first.image_path);
        assert_eq!(second.previous_hash, None);
        assert!(second.last_checked_at >= first.last_checked_at);
    }

    #[tokio::test]
    async fn test_changed_render_replaces_file() {
        let db = TestDb::new();
        let renderer = Arc::new(FakeRenderer::new(b"BM version one"));
        let orch = orchestrator(&db, renderer.clone());
        let (device, instance) = test_support::device_showing(&mut db.conn(), "swap");

        preview(&mut db.conn(), instance.id, Some(device.id));
        orch.run_once().await.unwrap();
        renderer.set_bytes(b"BM version two");
        preview(&mut db.conn(), instance.id, Some(device.id));
        orch.run_once().await.unwrap();

        let content = content_cache::get(&mut db.conn(), instance.id, Some(device.id))
            .unwrap()
            .unwrap();
        assert_eq!(
            content.previous_hash.as_deref(),
            Some(crate::services::image_store::content_hash(b"BM version one").as_str())
        );
        assert_eq!(files_in(&db.storage_dir()), 1);
        assert!(db.storage_dir().join(&content.image_path).exists());
    }

    #[tokio::test]
    async fn test_routine_job_reschedules_only_when_reachable() {
        let db = TestDb::new();
        let orch = orchestrator(&db, Arc::new(FakeRenderer::new(b"BM")));
        let mut conn = db.conn();
        let (_, shown) = test_support::device_showing(&mut conn, "shown");
        let hidden = test_support::webhook_instance(&mut conn, "hidden");
        let now = Utc::now().naive_utc();
        let shown_job = render_queue::enqueue(&mut conn, EnqueueRequest::routine(shown.id, now)).unwrap();
        let hidden_job = render_queue::enqueue(&mut conn, EnqueueRequest::routine(hidden.id, now)).unwrap();
        drop(conn);

        assert!(orch.run_once().await.unwrap());
        assert!(orch.run_once().await.unwrap());
        assert!(!orch.run_once().await.unwrap());

        let mut conn = db.conn();
        assert_eq!(
            render_queue::status_of(&mut conn, shown_job.id).unwrap(),
            Some(JobStatus::Completed)
        );
        assert_eq!(
            render_queue::status_of(&mut conn, hidden_job.id).unwrap(),
            Some(JobStatus::Completed)
        );
        assert!(render_queue::has_outstanding(&mut conn, shown.id).unwrap());
        assert!(!render_queue::has_outstanding(&mut conn, hidden.id).unwrap());

        // Unreachable instances still render, device-agnostic.
        assert!(content_cache::get(&mut conn, hidden.id, None).unwrap().is_some());

        let follow_up = render_queue::due_candidates(
            &mut conn,
            now + chrono::Duration::seconds(660),
            10,
        )
        .unwrap();
        assert_eq!(follow_up.len(), 1);
        assert_eq!(follow_up[0].plugin_instance_id, shown.id);
        assert!(follow_up[0].scheduled_for >= now + chrono::Duration::seconds(600));
    }

    #[tokio::test]
    async fn test_independent_render_has_no_follow_up() {
        let db = TestDb::new();
        let orch = orchestrator(&db, Arc::new(FakeRenderer::new(b"BM")));
        let (device, instance) = test_support::device_showing(&mut db.conn(), "once");
        preview(&mut db.conn(), instance.id, Some(device.id));

        orch.run_once().await.unwrap();
        assert!(!render_queue::has_outstanding(&mut db.conn(), instance.id).unwrap());
        assert!(!orch.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_failures_back_off_then_stop() {
        let db = TestDb::new();
        let renderer = Arc::new(FakeRenderer::new(b"BM"));
        renderer.set_failing(true);
        let mut config = test_support::config(&db);
        config.render_queue.max_attempts = 2;
        let orch = RenderOrchestrator::new(db.pool.clone(), renderer, &config);

        let (device, instance) = test_support::device_showing(&mut db.conn(), "broken");
        {
            let mut conn = db.conn();
            content_cache::put(
                &mut conn,
                CacheEntry {
                    instance_id: instance.id,
                    device_id: Some(device.id),
                    width: 800,
                    height: 480,
                    bit_depth: 1,
                    image_path: "old.bmp".to_string(),
                    content_hash: "old".to_string(),
                },
                Utc::now().naive_utc(),
            )
            .unwrap();
        }
        let job = preview(&mut db.conn(), instance.id, Some(device.id));

        orch.run_once().await.unwrap();
        let mut conn = db.conn();
        let after_first = render_queue::get_job(&mut conn, job.id).unwrap();
        assert_eq!(after_first.status(), Some(JobStatus::Pending));
        assert_eq!(after_first.attempts, 1);
        assert!(after_first.scheduled_for > Utc::now().naive_utc());
        assert!(after_first
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("transient"));

        // Pull the retry forward and fail it once more.
        diesel::update(crate::schema::render_queue::table.find(job.id))
            .set(crate::schema::render_queue::scheduled_for.eq(Utc::now().naive_utc()))
            .execute(&mut conn)
            .unwrap();
        drop(conn);
        let claimed = {
            let mut conn = db.conn();
            assert!(render_queue::claim(&mut conn, job.id, Utc::now().naive_utc()).unwrap());
            render_queue::get_job(&mut conn, job.id).unwrap()
        };
        assert_eq!(orch.process_job(claimed).await.unwrap(), JobStatus::Failed);

        let mut conn = db.conn();
        let failed = render_queue::list_failed(&mut conn, 2).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, job.id);
        let cached = content_cache::get(&mut conn, instance.id, Some(device.id))
            .unwrap()
            .unwrap();
        assert_eq!(cached.render_attempts, 2);
        assert_eq!(cached.image_path, "old.bmp");
    }

    #[tokio::test]
    async fn test_stuck_render_times_out() {
        let db = TestDb::new();
        let renderer = Arc::new(FakeRenderer::new(b"BM"));
        renderer.set_delay(Duration::from_secs(5));
        let mut config = test_support::config(&db);
        config.renderer.timeout_secs = 1;
        let orch = RenderOrchestrator::new(db.pool.clone(), renderer, &config);
        let (device, instance) = test_support::device_showing(&mut db.conn(), "slow");
        let job = preview(&mut db.conn(), instance.id, Some(device.id));

        orch.run_once().await.unwrap();
        let job = render_queue::get_job(&mut db.conn(), job.id).unwrap();
        assert!(job.error_message.as_deref().unwrap().contains("timed out"));
        assert_eq!(job.status(), Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn test_reconfiguration_fails_without_retry() {
        let db = TestDb::new();
        let orch = orchestrator(&db, Arc::new(FakeRenderer::new(b"BM")));
        let (device, instance) = test_support::device_showing(&mut db.conn(), "stale-schema");
        let job = preview(&mut db.conn(), instance.id, Some(device.id));
        plugin_service::mark_definition_changed(&mut db.conn(), instance.definition_id).unwrap();

        orch.run_once().await.unwrap();
        let job = render_queue::get_job(&mut db.conn(), job.id).unwrap();
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert!(job.error_message.as_deref().unwrap().starts_with("config"));
    }

    #[tokio::test]
    async fn test_malformed_service_hash_is_replaced() {
        let db = TestDb::new();
        let renderer = Arc::new(FakeRenderer::new(b"BM odd hash"));
        let orch = orchestrator(&db, renderer.clone());
        let (device, instance) = test_support::device_showing(&mut db.conn(), "odd-hash");

        let multibyte = format!("a{}", "\u{e9}".repeat(12));
        for reported in [multibyte.as_str(), "ab/cd"] {
            renderer.set_reported_hash(reported);
            let job = preview(&mut db.conn(), instance.id, Some(device.id));
            assert!(orch.run_once().await.unwrap());
            assert_eq!(
                render_queue::status_of(&mut db.conn(), job.id).unwrap(),
                Some(JobStatus::Completed)
            );
        }

        let content = content_cache::get(&mut db.conn(), instance.id, Some(device.id))
            .unwrap()
            .unwrap();
        assert_eq!(
            content.content_hash,
            crate::services::image_store::content_hash(b"BM odd hash")
        );
        assert!(db.storage_dir().join(&content.image_path).exists());
        assert_eq!(files_in(&db.storage_dir()), 1);
    }

    #[tokio::test]
    async fn test_storage_error_after_claim_is_recorded_on_job() {
        let db = TestDb::new();
        let orch = orchestrator(&db, Arc::new(FakeRenderer::new(b"BM")));
        let (device, instance) = test_support::device_showing(&mut db.conn(), "no-disk");
        // A plain file where the bitmap directory should be.
        std::fs::write(db.storage_dir(), b"not a directory").unwrap();
        let job = preview(&mut db.conn(), instance.id, Some(device.id));

        assert!(orch.run_once().await.unwrap());
        let job = render_queue::get_job(&mut db.conn(), job.id).unwrap();
        assert_eq!(job.status(), Some(JobStatus::Pending));
        assert_eq!(job.attempts, 1);
        assert!(job.error_message.as_deref().unwrap().starts_with("io"));
        assert!(content_cache::get(&mut db.conn(), instance.id, Some(device.id))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failure_after_cancellation_reports_cancelled() {
        let db = TestDb::new();
        let renderer = Arc::new(FakeRenderer::new(b"BM"));
        renderer.set_failing(true);
        let orch = orchestrator(&db, renderer);
        let mut events = orch.subscribe();
        let (device, instance) = test_support::device_showing(&mut db.conn(), "cancel-fail");
        let job = preview(&mut db.conn(), instance.id, Some(device.id));

        let claimed = {
            let mut conn = db.conn();
            assert!(render_queue::claim(&mut conn, job.id, Utc::now().naive_utc()).unwrap());
            render_queue::cancel(&mut conn, job.id, "removed by operator").unwrap();
            render_queue::get_job(&mut conn, job.id).unwrap()
        };

        assert_eq!(orch.process_job(claimed).await.unwrap(), JobStatus::Cancelled);
        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_deactivated_instance_job_is_cancelled() {
        let db = TestDb::new();
        let renderer = Arc::new(FakeRenderer::new(b"BM"));
        let orch = orchestrator(&db, renderer.clone());
        let instance = test_support::webhook_instance(&mut db.conn(), "off");
        let job = preview(&mut db.conn(), instance.id, None);
        diesel::update(crate::schema::plugin_instances::table.find(instance.id))
            .set(crate::schema::plugin_instances::lifecycle_state.eq("deactivated"))
            .execute(&mut db.conn())
            .unwrap();

        orch.run_once().await.unwrap();
        assert_eq!(renderer.calls(), 0);
        assert_eq!(
            render_queue::status_of(&mut db.conn(), job.id).unwrap(),
            Some(JobStatus::Cancelled)
        );
    }

    #[test]
    fn test_commit_after_cancellation_writes_nothing() {
        let db = TestDb::new();
        let images = ImageStore::new(db.storage_dir());
        let mut conn = db.conn();
        let (device, instance) = test_support::device_showing(&mut conn, "race");
        let job = preview(&mut conn, instance.id, Some(device.id));
        let now = Utc::now().naive_utc();
        assert!(render_queue::claim(&mut conn, job.id, now).unwrap());
        render_queue::cancel_for_instance(&mut conn, instance.id).unwrap();

        let image = RenderedImage {
            bytes: b"BM late".to_vec(),
            content_hash: "late".to_string(),
        };
        let outcome = commit_render(
            &mut conn,
            &images,
            job.id,
            CacheEntry {
                instance_id: instance.id,
                device_id: Some(device.id),
                width: 800,
                height: 480,
                bit_depth: 1,
                image_path: String::new(),
                content_hash: image.content_hash.clone(),
            },
            &image,
            now,
        )
        .unwrap();

        assert_eq!(outcome, CommitOutcome::Cancelled);
        assert!(content_cache::get(&mut conn, instance.id, Some(device.id))
            .unwrap()
            .is_none());
        assert_eq!(files_in(&db.storage_dir()), 0);
    }

    #[tokio::test]
    async fn test_planner_restarts_chains_for_reachable_instances() {
        let db = TestDb::new();
        let orch = orchestrator(&db, Arc::new(FakeRenderer::new(b"BM")));
        let mut conn = db.conn();
        let (device, shown) = test_support::device_showing(&mut conn, "plan");
        let hidden = test_support::webhook_instance(&mut conn, "plan-hidden");
        let mut options = ItemOptions::for_instance(hidden.id);
        options.is_visible = false;
        playlist_service::add_item(&mut conn, device.id, options).unwrap();
        drop(conn);

        assert_eq!(orch.plan_refreshes().await.unwrap(), 1);
        assert_eq!(orch.plan_refreshes().await.unwrap(), 0);
        let mut conn = db.conn();
        assert!(render_queue::has_outstanding(&mut conn, shown.id).unwrap());
        assert!(!render_queue::has_outstanding(&mut conn, hidden.id).unwrap());
    }

    #[tokio::test]
    async fn test_waiting_caller_sees_completion() {
        let db = TestDb::new();
        let orch = Arc::new(orchestrator(&db, Arc::new(FakeRenderer::new(b"BM"))));
        let (device, instance) = test_support::device_showing(&mut db.conn(), "wait");

        let worker = {
            let orch = Arc::clone(&orch);
            async move {
                for _ in 0..50 {
                    if orch.run_once().await.unwrap() {
                        return true;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                false
            }
        };
        let (status, ran) = tokio::join!(
            orch.request_render_and_wait(instance.id, Some(device.id), Duration::from_secs(5)),
            worker
        );
        assert!(ran);
        assert_eq!(status.unwrap(), Some(JobStatus::Completed));
    }
}
