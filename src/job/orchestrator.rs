//! One render job from start to finish.
//!
//! Creates the log group, packs and uploads the scene, fills the frame
//! queue, launches the fleet, supervises it until every instance is gone,
//! downloads the frames and tears everything down again. Nothing is rolled
//! back on failure; `clean_up` sweeps leftovers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cloud::objects::empty_and_delete;
use crate::cloud::{Backends, CreateMode, InstanceFilter, InstanceState};
use crate::error::{JobError, ObjectStoreError, Result};
use crate::fleet::supervisor::EVENT_CAPACITY;
use crate::fleet::{
    CostEstimate, FleetEvent, FleetOutcome, FleetSpec, FleetSupervisor, estimate_fleet_cost,
    launch_fleet,
};
use crate::format;
use crate::job::bootstrap::{PACKED_SCENE_KEY, START_JOB_KEY, StartJob, WorkerBootstrap};
use crate::job::{JobSettings, ResourceNames};
use crate::logs::LogTail;
use crate::logs::writer::RETENTION_DAYS;
use crate::queue::FrameQueue;
use crate::render::{FRAMES_PREFIX, SceneInspector};

/// Answer to the launch prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Launch,
    Cancel { clean_up: bool },
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub fleet: FleetOutcome,
    /// From launch to the last instance terminating.
    pub elapsed: chrono::Duration,
    pub results_dir: PathBuf,
    pub frames_downloaded: usize,
    pub bytes_downloaded: u64,
    pub cost: Option<CostEstimate>,
    /// Instances not terminated account-wide after teardown.
    pub non_terminated: usize,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(JobReport),
    Cancelled { cleaned_up: bool },
}

pub struct RenderJob {
    backends: Backends,
    settings: JobSettings,
    inspector: Arc<dyn SceneInspector>,
    names: ResourceNames,
    work_dir: PathBuf,
    results_root: PathBuf,
    estimate_cost: bool,
    events: broadcast::Sender<FleetEvent>,
}

impl RenderJob {
    pub fn new(
        backends: Backends,
        settings: JobSettings,
        inspector: Arc<dyn SceneInspector>,
    ) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backends,
            settings,
            inspector,
            names: ResourceNames::new(Uuid::new_v4()),
            work_dir: PathBuf::from("."),
            results_root: PathBuf::from("results"),
            estimate_cost: false,
            events,
        }
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.names = ResourceNames::new(job_id);
        self
    }

    /// Directory for temporary files such as the packed scene.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Frames land in `<root>/<job id>/`.
    pub fn with_results_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_root = dir.into();
        self
    }

    pub fn with_cost_estimate(mut self, enabled: bool) -> Self {
        self.estimate_cost = enabled;
        self
    }

    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    /// Progress from the supervisor. Subscribe before [`run`](Self::run).
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    fn packed_scene(&self) -> PathBuf {
        self.work_dir.join(PACKED_SCENE_KEY)
    }

    /// Run the job. `confirm` is consulted before launching, and only when
    /// the settings allow prompting.
    pub async fn run(self, confirm: impl FnOnce(&JobSettings) -> Confirmation) -> Result<JobOutcome> {
        let job_id = self.names.job_id;
        let config = &self.settings.config;
        info!(%job_id, "Starting render job");

        self.backends
            .logs
            .create_group(&self.names.log_group, RETENTION_DAYS, CreateMode::IgnoreExisting)
            .await?;
        info!(group = %self.names.log_group, "Created log group");

        let packed = self.packed_scene();
        self.inspector
            .pack(&self.settings.blend_file, &packed)
            .await?;

        self.upload_worker_files(&packed).await?;

        let queue = FrameQueue::new(self.backends.kv.clone(), &self.names.table)
            .with_max_tier(config.max_tier);
        queue.initialize(self.settings.frames.frames()).await?;

        info!("{}", self.settings.describe());
        if self.settings.interactive {
            if let Confirmation::Cancel { clean_up } = confirm(&self.settings) {
                if clean_up {
                    self.teardown().await?;
                }
                info!(clean_up, "Job cancelled before launch");
                return Ok(JobOutcome::Cancelled {
                    cleaned_up: clean_up,
                });
            }
        }

        let bootstrap = WorkerBootstrap {
            job_id,
            bucket: self.names.bucket.clone(),
            samples: self.settings.samples,
            motion_blur: self.settings.motion_blur,
        };
        let spec = FleetSpec {
            name: self.names.worker.clone(),
            image_pattern: config.image_pattern.clone(),
            instance_type: config.instance_type.clone(),
            security_group: config.security_group.clone(),
            iam_instance_profile: config.iam_instance_profile.clone(),
            key_name: config.key_name.clone(),
            user_data: bootstrap.to_user_data(),
            count: config.instance_count,
        };
        let fleet = launch_fleet(self.backends.compute.as_ref(), &spec).await?;

        let tail = LogTail::with_lookback(
            self.backends.logs.clone(),
            &self.names.log_group,
            config.log_lookback,
        );
        let outcome = FleetSupervisor::new(
            self.backends.compute.clone(),
            queue,
            tail,
            fleet.instance_ids.clone(),
        )
        .with_poll_interval(config.poll_interval)
        .with_events(self.events.clone())
        .run()
        .await?;
        let elapsed = outcome.finished_at - fleet.launched_at;
        info!(elapsed = %format::elapsed(elapsed), "Fleet finished");

        let results_dir = self.results_root.join(job_id.to_string());
        let (frames_downloaded, bytes_downloaded) = self.download_results(&results_dir).await?;

        let cost = if self.estimate_cost {
            let zone = config
                .availability_zone
                .clone()
                .or(fleet.availability_zone.clone());
            estimate_fleet_cost(
                self.backends.compute.as_ref(),
                &config.instance_type,
                zone.as_deref(),
                fleet.launched_at,
                outcome.finished_at,
                fleet.instance_ids.len(),
            )
            .await?
        } else {
            None
        };

        self.teardown().await?;
        info!(%job_id, "Job completed successfully");

        let non_terminated = self.report_non_terminated().await?;

        Ok(JobOutcome::Completed(JobReport {
            job_id,
            fleet: outcome,
            elapsed,
            results_dir,
            frames_downloaded,
            bytes_downloaded,
            cost,
            non_terminated,
        }))
    }

    async fn upload_worker_files(&self, packed: &Path) -> Result<()> {
        let objects = &self.backends.objects;
        let bucket = &self.names.bucket;
        objects.create_container(bucket).await?;

        let scene = tokio::fs::read(packed).await.map_err(ObjectStoreError::Io)?;
        objects.put(bucket, PACKED_SCENE_KEY, scene).await?;

        let manifest = StartJob {
            job_id: self.names.job_id,
            file_store: self.settings.config.file_store.clone(),
            blender_archive: self.settings.config.blender_archive.clone(),
            samples: self.settings.samples,
            motion_blur: self.settings.motion_blur,
        };
        let manifest = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| JobError::Io(std::io::Error::other(e)))?;
        objects.put(bucket, START_JOB_KEY, manifest).await?;

        info!(bucket = %bucket, "Uploaded job files");
        Ok(())
    }

    /// Copy every rendered frame into `dir`. Returns the file count and
    /// total bytes.
    async fn download_results(&self, dir: &Path) -> Result<(usize, u64)> {
        tokio::fs::create_dir_all(dir).await.map_err(JobError::Io)?;

        let objects = &self.backends.objects;
        let bucket = &self.names.bucket;
        let keys = objects.list_keys(bucket, FRAMES_PREFIX).await?;

        let bodies = try_join_all(keys.iter().map(|key| objects.get(bucket, key))).await?;

        let mut total = 0u64;
        for (key, body) in keys.iter().zip(bodies) {
            let filename = key.rsplit('/').next().unwrap_or(key);
            total += body.len() as u64;
            tokio::fs::write(dir.join(filename), body)
                .await
                .map_err(JobError::Io)?;
            info!(file = %filename, "Downloaded");
        }

        info!(
            count = keys.len(),
            size = %format::size(total),
            dir = %dir.display(),
            "Downloaded results"
        );
        Ok((keys.len(), total))
    }

    /// Delete the log group, bucket, table and temporary files.
    async fn teardown(&self) -> Result<()> {
        self.backends.logs.delete_group(&self.names.log_group).await?;
        empty_and_delete(self.backends.objects.as_ref(), &self.names.bucket).await?;
        FrameQueue::new(self.backends.kv.clone(), &self.names.table)
            .destroy()
            .await?;
        info!("Deleted log group, bucket and table");

        match tokio::fs::remove_file(self.packed_scene()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(JobError::Io(e).into()),
        }
        info!("Deleted temporary files");
        Ok(())
    }

    /// Count instances in any state but terminated, whichever job they
    /// belong to.
    async fn report_non_terminated(&self) -> Result<usize> {
        let states: Vec<InstanceState> = InstanceState::ALL
            .into_iter()
            .filter(|s| *s != InstanceState::Terminated)
            .collect();
        let count = self
            .backends
            .compute
            .describe(&InstanceFilter::States(states))
            .await?
            .len();
        if count > 0 {
            warn!(count, "Instances are still running");
        } else {
            info!("No instances are still running");
        }
        Ok(count)
    }
}
