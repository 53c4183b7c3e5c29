//! Local fleet simulation.
//!
//! [`LocalFleet`] is a compute provider over the in-memory backends whose
//! launched instances actually do the work: each one boots after a delay,
//! reads its bootstrap user data, fetches the packed scene from the job
//! bucket and runs a [`FrameWorker`] as a tokio task. When the worker runs
//! out of frames the instance shuts itself down. Terminating an instance
//! aborts its task.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cloud::memory::MemoryCloud;
use crate::cloud::{
    Backends, ComputeProvider, Instance, InstanceFilter, InstanceState, LaunchRequest,
    MachineImage, ObjectStore, SpotPrice,
};
use crate::error::{ComputeError, JobError, ObjectStoreError, RenderError, Result};
use crate::job::bootstrap::{PACKED_SCENE_KEY, WorkerBootstrap};
use crate::job::ResourceNames;
use crate::logs::StreamLogger;
use crate::queue::{FrameQueue, MAX_TIER};
use crate::render::{FrameRenderer, FrameWorker, SceneAttributes, SceneInspector};

/// Builds the renderer an instance uses for its copy of the packed scene.
pub type RendererFactory =
    Arc<dyn Fn(&Path, &WorkerBootstrap) -> Arc<dyn FrameRenderer> + Send + Sync>;

/// How long simulated instances take to change state.
#[derive(Debug, Clone)]
pub struct LocalTimings {
    pub boot: Duration,
    pub shutdown: Duration,
}

impl Default for LocalTimings {
    fn default() -> Self {
        Self {
            boot: Duration::from_secs(1),
            shutdown: Duration::from_secs(1),
        }
    }
}

pub struct LocalFleet {
    cloud: MemoryCloud,
    renderers: RendererFactory,
    work_root: PathBuf,
    timings: LocalTimings,
    max_tier: i64,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LocalFleet {
    /// Instances get scratch directories under `work_root`.
    pub fn new(cloud: MemoryCloud, work_root: impl Into<PathBuf>, renderers: RendererFactory) -> Self {
        Self {
            cloud,
            renderers,
            work_root: work_root.into(),
            timings: LocalTimings::default(),
            max_tier: MAX_TIER,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timings(mut self, timings: LocalTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_max_tier(mut self, max_tier: i64) -> Self {
        self.max_tier = max_tier;
        self
    }

    /// Backends whose compute provider is this fleet.
    pub fn backends(self: &Arc<Self>) -> Backends {
        Backends {
            kv: self.cloud.kv.clone(),
            logs: self.cloud.logs.clone(),
            compute: self.clone(),
            objects: self.cloud.objects.clone(),
        }
    }

    /// Abort every instance task still running.
    pub async fn shutdown(&self) {
        for (_, handle) in self.workers.lock().await.drain() {
            handle.abort();
        }
    }

    fn spawn_instance(&self, instance: &Instance) -> JoinHandle<()> {
        let id = instance.id.clone();
        let user_data = instance.user_data.clone().unwrap_or_default();
        let cloud = self.cloud.clone();
        let renderers = self.renderers.clone();
        let work_dir = self.work_root.join(&id);
        let timings = self.timings.clone();
        let max_tier = self.max_tier;

        tokio::spawn(async move {
            tokio::time::sleep(timings.boot).await;
            if cloud.compute.set_state(&id, InstanceState::Running).await.is_err() {
                return;
            }
            debug!(instance = %id, "Instance booted");

            let outcome =
                run_instance(&cloud, &renderers, &id, &user_data, &work_dir, max_tier).await;
            match outcome {
                Ok(rendered) => info!(instance = %id, rendered, "Instance worker finished"),
                Err(e) => warn!(instance = %id, error = %e, "Instance worker failed"),
            }
            let _ = tokio::fs::remove_dir_all(&work_dir).await;

            tokio::time::sleep(timings.shutdown).await;
            // Shutting down terminates; the next describe reports it gone.
            if let Some(state) = cloud.compute.state_of(&id).await {
                if !matches!(state, InstanceState::ShuttingDown | InstanceState::Terminated) {
                    let _ = cloud
                        .compute
                        .set_state(&id, InstanceState::ShuttingDown)
                        .await;
                }
            }
        })
    }
}

impl Drop for LocalFleet {
    fn drop(&mut self) {
        for (_, handle) in self.workers.get_mut().drain() {
            handle.abort();
        }
    }
}

async fn run_instance(
    cloud: &MemoryCloud,
    renderers: &RendererFactory,
    instance_id: &str,
    user_data: &str,
    work_dir: &Path,
    max_tier: i64,
) -> Result<usize> {
    let bootstrap = WorkerBootstrap::from_user_data(user_data)?;
    let names = ResourceNames::new(bootstrap.job_id);

    tokio::fs::create_dir_all(work_dir).await.map_err(JobError::Io)?;
    let scene = work_dir.join(PACKED_SCENE_KEY);
    let packed = cloud.objects.get(&bootstrap.bucket, PACKED_SCENE_KEY).await?;
    tokio::fs::write(&scene, packed)
        .await
        .map_err(ObjectStoreError::Io)?;

    let renderer = renderers(&scene, &bootstrap);
    let logger = StreamLogger::open(cloud.logs.clone(), &names.log_group, instance_id).await?;
    let queue = FrameQueue::new(cloud.kv.clone(), &names.table).with_max_tier(max_tier);

    FrameWorker::new(queue, cloud.objects.clone(), &bootstrap.bucket, renderer, logger)
        .run()
        .await
}

#[async_trait]
impl ComputeProvider for LocalFleet {
    async fn latest_image(&self, name_pattern: &str) -> std::result::Result<MachineImage, ComputeError> {
        self.cloud.compute.latest_image(name_pattern).await
    }

    async fn launch(&self, request: &LaunchRequest) -> std::result::Result<Vec<Instance>, ComputeError> {
        let instances = self.cloud.compute.launch(request).await?;
        let mut workers = self.workers.lock().await;
        for instance in &instances {
            workers.insert(instance.id.clone(), self.spawn_instance(instance));
        }
        info!(count = instances.len(), "Local instances launched");
        Ok(instances)
    }

    async fn wait_until_exist(
        &self,
        ids: &[String],
        timeout: Duration,
    ) -> std::result::Result<(), ComputeError> {
        self.cloud.compute.wait_until_exist(ids, timeout).await
    }

    async fn describe(&self, filter: &InstanceFilter) -> std::result::Result<Vec<Instance>, ComputeError> {
        self.cloud.compute.describe(filter).await
    }

    async fn terminate(&self, ids: &[String]) -> std::result::Result<(), ComputeError> {
        self.cloud.compute.terminate(ids).await?;
        let mut workers = self.workers.lock().await;
        for id in ids {
            if let Some(handle) = workers.remove(id) {
                handle.abort();
                debug!(instance = %id, "Instance task aborted");
            }
        }
        Ok(())
    }

    async fn spot_price_history(
        &self,
        instance_type: &str,
        availability_zone: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> std::result::Result<Vec<SpotPrice>, ComputeError> {
        self.cloud
            .compute
            .spot_price_history(instance_type, availability_zone, start, end)
            .await
    }
}

/// Scene handling without Blender: fixed attributes, packing is a copy.
#[derive(Debug, Clone)]
pub struct SimulatedScene {
    attributes: SceneAttributes,
}

impl SimulatedScene {
    pub fn new(attributes: SceneAttributes) -> Self {
        Self { attributes }
    }
}

impl Default for SimulatedScene {
    fn default() -> Self {
        Self::new(SceneAttributes {
            frame_start: 1,
            frame_end: 10,
            frame_step: 1,
            samples: 16,
            motion_blur: true,
            file_format: "PNG".to_string(),
            is_movie_format: false,
        })
    }
}

#[async_trait]
impl SceneInspector for SimulatedScene {
    async fn scene_attributes(&self, _blend_file: &Path) -> std::result::Result<SceneAttributes, RenderError> {
        Ok(self.attributes.clone())
    }

    async fn pack(&self, blend_file: &Path, output: &Path) -> std::result::Result<(), RenderError> {
        tokio::fs::copy(blend_file, output).await?;
        Ok(())
    }
}

/// Writes a small placeholder image per frame after a random delay.
#[derive(Debug, Clone)]
pub struct SimulatedRender {
    output_dir: PathBuf,
    samples: u32,
    frame_millis: RangeInclusive<u64>,
}

impl SimulatedRender {
    pub fn new(output_dir: impl Into<PathBuf>, samples: u32) -> Self {
        Self {
            output_dir: output_dir.into(),
            samples,
            frame_millis: 500..=1500,
        }
    }

    pub fn with_frame_time(mut self, millis: RangeInclusive<u64>) -> Self {
        self.frame_millis = millis;
        self
    }

    /// A factory rendering next to each instance's packed scene.
    pub fn factory(frame_millis: RangeInclusive<u64>) -> RendererFactory {
        Arc::new(move |scene: &Path, bootstrap: &WorkerBootstrap| {
            let dir = scene.parent().unwrap_or(Path::new(".")).to_path_buf();
            Arc::new(
                SimulatedRender::new(dir, bootstrap.samples).with_frame_time(frame_millis.clone()),
            ) as Arc<dyn FrameRenderer>
        })
    }
}

#[async_trait]
impl FrameRenderer for SimulatedRender {
    async fn render_frame(&self, frame: i64) -> std::result::Result<PathBuf, RenderError> {
        let millis = rand::thread_rng().gen_range(self.frame_millis.clone());
        tokio::time::sleep(Duration::from_millis(millis)).await;

        let path = self.output_dir.join(format!("frame-{frame:04}.png"));
        tokio::fs::write(&path, format!("frame {frame} at {} samples\n", self.samples)).await?;
        Ok(path)
    }
}
