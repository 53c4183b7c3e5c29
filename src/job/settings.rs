//! Job settings: configuration, command line and scene attributes combined
//! and checked before anything is created in the cloud.
//!
//! Frame range, step and sample count come from the scene unless overridden.

use std::fmt;
use std::path::PathBuf;

use clap::Args;

use crate::cloud::{ObjectStore, StoreLocation};
use crate::config::FleetConfig;
use crate::error::{ConfigError, Result};
use crate::render::SceneAttributes;

/// Per-job command line options.
#[derive(Args, Debug, Clone, Default)]
pub struct JobArgs {
    /// The .blend file to render
    pub blend_file: PathBuf,

    /// Start frame (inclusive)
    #[arg(long)]
    pub start: Option<i64>,

    /// End frame (inclusive)
    #[arg(long)]
    pub end: Option<i64>,

    /// Step from one frame to the next
    #[arg(long)]
    pub step: Option<i64>,

    /// Comma separated list of frame numbers
    #[arg(long, value_delimiter = ',')]
    pub frames: Option<Vec<i64>>,

    /// Samples to render for each pixel
    #[arg(long)]
    pub samples: Option<u32>,

    /// Number of instances to launch
    #[arg(long)]
    pub instances: Option<usize>,

    /// Root directory of the Blender installation
    #[arg(long)]
    pub blender_home: Option<PathBuf>,

    /// Render with motion blur even if the scene disables it
    #[arg(long, conflicts_with = "disable_motion_blur")]
    pub enable_motion_blur: bool,

    /// Confirm rendering without motion blur
    #[arg(long)]
    pub disable_motion_blur: bool,

    /// Never prompt for input
    #[arg(long)]
    pub disable_interactive: bool,
}

impl JobArgs {
    fn motion_blur(&self) -> Option<bool> {
        match (self.enable_motion_blur, self.disable_motion_blur) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

/// The frames a job renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSelection {
    /// `start..=end` every `step` frames.
    Range { start: i64, end: i64, step: i64 },
    List(Vec<i64>),
}

impl FrameSelection {
    pub fn frames(&self) -> Vec<i64> {
        match self {
            Self::Range { start, end, step } => (*start..=*end).step_by(*step as usize).collect(),
            Self::List(frames) => frames.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for FrameSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range { start, end, step } => {
                write!(f, "frames = {start} to {end} inclusive")?;
                if *step != 1 {
                    write!(f, ", steps = {step}")?;
                }
                Ok(())
            }
            Self::List(frames) => write!(f, "frames = {frames:?}"),
        }
    }
}

/// Everything a job needs, validated.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Configuration with command line overrides applied.
    pub config: FleetConfig,
    pub blend_file: PathBuf,
    pub frames: FrameSelection,
    pub file_format: String,
    pub samples: u32,
    pub motion_blur: bool,
    /// Prompt before launching. Only ever true when stdin is a terminal.
    pub interactive: bool,
}

impl JobSettings {
    /// Combine the sources. `stdin_is_terminal` gates prompting.
    pub fn build(
        args: &JobArgs,
        mut config: FleetConfig,
        attrs: &SceneAttributes,
        stdin_is_terminal: bool,
    ) -> std::result::Result<Self, ConfigError> {
        if let Some(home) = &args.blender_home {
            config.blender_home = home.clone();
        }
        if let Some(count) = args.instances {
            config.instance_count = count;
        }

        let frames = match &args.frames {
            Some(list) => {
                if args.start.is_some() || args.end.is_some() || args.step.is_some() {
                    return Err(ConfigError::Conflict(
                        "--frames cannot be used in combination with --start, --end or --step"
                            .to_string(),
                    ));
                }
                FrameSelection::List(list.clone())
            }
            None => {
                let step = args.step.unwrap_or(attrs.frame_step);
                if step < 1 {
                    return Err(ConfigError::InvalidValue {
                        key: "step".to_string(),
                        message: format!("must be at least 1 but is {step}"),
                    });
                }
                FrameSelection::Range {
                    start: args.start.unwrap_or(attrs.frame_start),
                    end: args.end.unwrap_or(attrs.frame_end),
                    step,
                }
            }
        };

        let motion_blur = match args.motion_blur() {
            Some(explicit) => explicit,
            None if attrs.motion_blur => true,
            None => {
                return Err(ConfigError::InvalidValue {
                    key: "motion blur".to_string(),
                    message: format!(
                        "motion blur is disabled in {}, use --disable-motion-blur to confirm this \
                         is OK or use --enable-motion-blur to enable it",
                        args.blend_file.display()
                    ),
                });
            }
        };

        if attrs.is_movie_format {
            return Err(ConfigError::InvalidValue {
                key: "file format".to_string(),
                message: format!(
                    "the .blend file is using the movie format {}, an image format like PNG \
                     or EXR must be used",
                    attrs.file_format
                ),
            });
        }

        if !config.file_store.starts_with("s3://") {
            return Err(ConfigError::InvalidValue {
                key: "file store".to_string(),
                message: format!(
                    "the file store URI should start with s3:// but is {}",
                    config.file_store
                ),
            });
        }

        let frame_count = frames.len();
        if frame_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "frames".to_string(),
                message: format!("{frames} selects no frames"),
            });
        }
        if config.instance_count > frame_count {
            return Err(ConfigError::InvalidValue {
                key: "instances".to_string(),
                message: format!(
                    "the instance count {} must be less than or equal to the frame count {frame_count}",
                    config.instance_count
                ),
            });
        }

        Ok(Self {
            config,
            blend_file: args.blend_file.clone(),
            frames,
            file_format: attrs.file_format.clone(),
            samples: args.samples.unwrap_or(attrs.samples),
            motion_blur,
            interactive: !args.disable_interactive && stdin_is_terminal,
        })
    }

    /// Location of the Blender archive workers download.
    pub fn blender_archive(&self) -> Result<StoreLocation> {
        let store = StoreLocation::parse(&self.config.file_store)?;
        let container = store.container_name().to_string();
        let key = match store {
            StoreLocation::Object { key, .. } => {
                format!("{}/{}", key.trim_end_matches('/'), self.config.blender_archive)
            }
            StoreLocation::Container { .. } => self.config.blender_archive.clone(),
        };
        Ok(StoreLocation::object(container, key))
    }

    /// Check the Blender archive has been copied to the file store.
    pub async fn verify_blender_archive(&self, objects: &dyn ObjectStore) -> Result<()> {
        let archive = self.blender_archive()?;
        let (container, key) = match &archive {
            StoreLocation::Object { container, key } => (container.as_str(), key.as_str()),
            StoreLocation::Container { name } => (name.as_str(), ""),
        };
        if !objects.exists(container, key).await? {
            return Err(ConfigError::MissingRequired {
                key: "blender archive".to_string(),
                hint: format!("{archive} does not exist"),
            }
            .into());
        }
        Ok(())
    }

    /// One line describing the job, for the launch confirmation.
    pub fn describe(&self) -> String {
        format!(
            "instance count = {}, .blend file = {}, {}, samples = {} and motion_blur = {}",
            self.config.instance_count,
            self.blend_file.display(),
            self.frames,
            self.samples,
            self.motion_blur
        )
    }
}
