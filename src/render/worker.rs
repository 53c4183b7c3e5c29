//! The loop each fleet instance runs: claim a frame, render it, upload it,
//! mark it done, repeat until the queue has nothing left to hand out.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::cloud::{ObjectStore, StoreLocation};
use crate::error::{JobError, ObjectStoreError, Result};
use crate::logs::StreamLogger;
use crate::queue::FrameQueue;
use crate::render::FrameRenderer;

/// Key prefix rendered frames are uploaded under.
pub const FRAMES_PREFIX: &str = "frames/";

pub struct FrameWorker {
    queue: FrameQueue,
    objects: Arc<dyn ObjectStore>,
    bucket: String,
    renderer: Arc<dyn FrameRenderer>,
    logger: StreamLogger,
}

impl FrameWorker {
    pub fn new(
        queue: FrameQueue,
        objects: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        renderer: Arc<dyn FrameRenderer>,
        logger: StreamLogger,
    ) -> Self {
        Self {
            queue,
            objects,
            bucket: bucket.into(),
            renderer,
            logger,
        }
    }

    /// Work until no frame can be claimed. Returns the number of frames this
    /// worker rendered.
    pub async fn run(mut self) -> Result<usize> {
        self.logger.info("job started").await?;

        let mut rendered = 0;
        while let Some(frame) = self.queue.claim_next().await? {
            self.logger.info(format!("rendering frame {frame}")).await?;
            let output = self.renderer.render_frame(frame).await?;
            let location = self.upload(frame, &output).await?;
            tokio::fs::remove_file(&output).await.map_err(JobError::Io)?;
            self.queue.complete(frame).await?;
            self.logger
                .info(format!("completed and uploaded {location}"))
                .await?;
            rendered += 1;
        }

        info!(stream = %self.logger.stream(), rendered, "Worker finished");
        self.logger.info("exiting").await?;
        Ok(rendered)
    }

    async fn upload(&self, frame: i64, output: &Path) -> Result<StoreLocation> {
        let basename = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("frame-{frame}"));
        let key = format!("{FRAMES_PREFIX}{basename}");
        let body = tokio::fs::read(output).await.map_err(ObjectStoreError::Io)?;
        self.objects.put(&self.bucket, &key, body).await?;
        Ok(StoreLocation::object(&self.bucket, key))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;

    use super::*;
    use crate::cloud::memory::{MemoryKeyValueStore, MemoryLogService, MemoryObjectStore};
    use crate::error::RenderError;

    /// Writes `frame-NNNN.png` into a directory.
    struct FileRenderer {
        dir: PathBuf,
    }

    #[async_trait]
    impl FrameRenderer for FileRenderer {
        async fn render_frame(&self, frame: i64) -> std::result::Result<PathBuf, RenderError> {
            let path = self.dir.join(format!("frame-{frame:04}.png"));
            tokio::fs::write(&path, frame.to_string()).await?;
            Ok(path)
        }
    }

    #[tokio::test]
    async fn renders_uploads_and_logs_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(MemoryKeyValueStore::new());
        let logs = Arc::new(MemoryLogService::new());
        let objects = Arc::new(MemoryObjectStore::new());
        objects.create_container("bucket").await.unwrap();

        let queue = FrameQueue::new(kv.clone(), "frames");
        queue.initialize([1, 2]).await.unwrap();

        let logger = StreamLogger::open(logs.clone(), "group", "i-1").await.unwrap();
        let worker = FrameWorker::new(
            FrameQueue::new(kv, "frames"),
            objects.clone(),
            "bucket",
            Arc::new(FileRenderer {
                dir: dir.path().to_path_buf(),
            }),
            logger,
        );

        assert_eq!(worker.run().await.unwrap(), 2);
        assert_eq!(queue.remaining_count().await.unwrap(), 0);
        assert_eq!(
            objects.list_keys("bucket", FRAMES_PREFIX).await.unwrap(),
            vec!["frames/frame-0001.png", "frames/frame-0002.png"]
        );
        assert_eq!(objects.get("bucket", "frames/frame-0002.png").await.unwrap(), b"2");
        // Local output is removed after upload.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        assert_eq!(
            logs.messages("group").await,
            vec![
                "job started",
                "rendering frame 1",
                "completed and uploaded s3://bucket/frames/frame-0001.png",
                "rendering frame 2",
                "completed and uploaded s3://bucket/frames/frame-0002.png",
                "exiting",
            ]
        );
    }

    #[tokio::test]
    async fn render_failure_leaves_frame_claimable() {
        struct Broken;

        #[async_trait]
        impl FrameRenderer for Broken {
            async fn render_frame(&self, _: i64) -> std::result::Result<PathBuf, RenderError> {
                Err(RenderError::AmbiguousOutput { count: 0 })
            }
        }

        let kv = Arc::new(MemoryKeyValueStore::new());
        let queue = FrameQueue::new(kv.clone(), "frames");
        queue.initialize([1]).await.unwrap();
        let logger = StreamLogger::open(Arc::new(MemoryLogService::new()), "g", "s")
            .await
            .unwrap();
        let worker = FrameWorker::new(
            FrameQueue::new(kv.clone(), "frames"),
            Arc::new(MemoryObjectStore::new()),
            "bucket",
            Arc::new(Broken),
            logger,
        );

        assert!(worker.run().await.is_err());
        assert_eq!(queue.remaining_count().await.unwrap(), 1);
        let mut retry = FrameQueue::new(kv, "frames");
        assert_eq!(retry.claim_next().await.unwrap(), Some(1));
    }
}
