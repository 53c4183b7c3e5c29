//! What a freshly booted worker instance is told about its job.
//!
//! The launch user data is a few `KEY=value` lines; everything else the
//! worker needs (the packed scene and the `start_job` manifest) sits in the
//! job's bucket.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Object key of the packed scene in the job bucket.
pub const PACKED_SCENE_KEY: &str = "packed.blend";

/// Object key of the job manifest in the job bucket.
pub const START_JOB_KEY: &str = "start_job";

const JOB_ID: &str = "RENDER_JOB_ID";
const BUCKET: &str = "BUCKET";
const SAMPLES: &str = "SAMPLES";
const MOTION_BLUR: &str = "MOTION_BLUR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerBootstrap {
    pub job_id: Uuid,
    pub bucket: String,
    pub samples: u32,
    pub motion_blur: bool,
}

impl WorkerBootstrap {
    pub fn to_user_data(&self) -> String {
        let motion_blur = if self.motion_blur { "enable" } else { "disable" };
        format!(
            "{JOB_ID}={}\n{BUCKET}={}\n{SAMPLES}={}\n{MOTION_BLUR}={motion_blur}\n",
            self.job_id, self.bucket, self.samples
        )
    }

    pub fn from_user_data(user_data: &str) -> Result<Self, JobError> {
        let value = |key: &str| -> Result<&str, JobError> {
            user_data
                .lines()
                .filter_map(|line| line.split_once('='))
                .find(|(k, _)| k.trim() == key)
                .map(|(_, v)| v.trim())
                .ok_or_else(|| JobError::MissingBootstrap {
                    key: key.to_string(),
                })
        };
        let malformed = |key: &str| JobError::MissingBootstrap {
            key: format!("{key} (malformed)"),
        };

        Ok(Self {
            job_id: value(JOB_ID)?.parse().map_err(|_| malformed(JOB_ID))?,
            bucket: value(BUCKET)?.to_string(),
            samples: value(SAMPLES)?.parse().map_err(|_| malformed(SAMPLES))?,
            motion_blur: match value(MOTION_BLUR)? {
                "enable" => true,
                "disable" => false,
                _ => return Err(malformed(MOTION_BLUR)),
            },
        })
    }
}

/// Manifest uploaded as `start_job`: where the worker fetches Blender from
/// and how to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartJob {
    pub job_id: Uuid,
    pub file_store: String,
    pub blender_archive: String,
    pub samples: u32,
    pub motion_blur: bool,
}
