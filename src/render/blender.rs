//! Blender driven as a background subprocess.
//!
//! Every invocation loads the scene file first and then runs a Python
//! expression against it; putting the expression before the file would
//! evaluate it against Blender's default scene. The working directory is the
//! scene's directory so relative resource paths resolve.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::RenderError;

const START_MARKER: &str = "START>";
const END_MARKER: &str = "<END";

static ATTRIBUTES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"START>(.*)<END").unwrap());

/// GPU backend for Cycles.
const CYCLES_DEVICE: &str = "CUDA";

/// Default file name prefix for rendered frames.
pub const DEFAULT_OUTPUT_PREFIX: &str = "frame-";

/// Render settings read from a scene file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneAttributes {
    pub frame_start: i64,
    pub frame_end: i64,
    pub frame_step: i64,
    pub samples: u32,
    pub motion_blur: bool,
    pub file_format: String,
    pub is_movie_format: bool,
}

/// Reads and packages scene files.
#[async_trait]
pub trait SceneInspector: Send + Sync {
    async fn scene_attributes(&self, blend_file: &Path) -> Result<SceneAttributes, RenderError>;

    /// Write a copy of `blend_file` with every external resource packed in.
    async fn pack(&self, blend_file: &Path, output: &Path) -> Result<(), RenderError>;
}

/// Renders single frames of one scene.
#[async_trait]
pub trait FrameRenderer: Send + Sync {
    /// Render `frame` and return the path of the one output file.
    async fn render_frame(&self, frame: i64) -> Result<PathBuf, RenderError>;
}

/// A Blender installation.
#[derive(Debug, Clone)]
pub struct Blender {
    executable: PathBuf,
}

impl Blender {
    /// `home` is the installation root containing the `blender` binary.
    pub fn new(home: impl AsRef<Path>) -> Self {
        Self {
            executable: home.as_ref().join("blender"),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    async fn run(
        &self,
        input: &Path,
        python: &str,
        extra_args: &[String],
    ) -> Result<String, RenderError> {
        let cwd = match input.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        debug!(executable = %self.executable.display(), input = %input.display(), "Running Blender");
        let output = Command::new(&self.executable)
            .arg("--background")
            .arg(input)
            .arg("--python-expr")
            .arg(python)
            .args(extra_args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(RenderError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn attributes_expr() -> String {
    format!(
        r#"import bpy, json
scene = bpy.context.scene
attributes = {{
    "frame_start": scene.frame_start,
    "frame_end": scene.frame_end,
    "frame_step": scene.frame_step,
    "samples": scene.cycles.samples,
    "motion_blur": scene.render.use_motion_blur,
    "file_format": scene.render.image_settings.file_format,
    "is_movie_format": scene.render.is_movie_format,
}}
print(f"{START_MARKER}{{json.dumps(attributes)}}{END_MARKER}")
"#
    )
}

fn pack_expr(output: &Path) -> String {
    format!(
        r#"import sys, traceback, bpy
try:
    bpy.ops.file.pack_all()
    bpy.ops.wm.save_as_mainfile(filepath={path:?}, compress=True, copy=True)
except Exception:
    traceback.print_exc()
    sys.exit(1)
"#,
        path = output.display().to_string()
    )
}

fn render_expr(samples: u32, motion_blur: bool) -> String {
    let motion_blur = if motion_blur { "True" } else { "False" };
    format!(
        "import bpy\n\
         bpy.context.scene.cycles.samples = {samples}\n\
         bpy.context.scene.render.use_motion_blur = {motion_blur}\n"
    )
}

/// Extract the attribute record printed between the markers.
pub fn parse_attributes(stdout: &str) -> Result<SceneAttributes, RenderError> {
    let captures = ATTRIBUTES
        .captures(stdout)
        .ok_or(RenderError::MissingAttributes)?;
    Ok(serde_json::from_str(&captures[1])?)
}

#[async_trait]
impl SceneInspector for Blender {
    async fn scene_attributes(&self, blend_file: &Path) -> Result<SceneAttributes, RenderError> {
        let stdout = self.run(blend_file, &attributes_expr(), &[]).await?;
        parse_attributes(&stdout)
    }

    async fn pack(&self, blend_file: &Path, output: &Path) -> Result<(), RenderError> {
        // Blender rejects relative save paths.
        let output = std::path::absolute(output)?;
        self.run(blend_file, &pack_expr(&output), &[]).await?;
        info!(input = %blend_file.display(), output = %output.display(), "Packed scene");
        Ok(())
    }
}

/// Renders frames of one scene with fixed sample count and motion blur.
#[derive(Debug, Clone)]
pub struct BlenderRender {
    blender: Blender,
    scene: PathBuf,
    samples: u32,
    motion_blur: bool,
    output_prefix: String,
}

impl BlenderRender {
    pub fn new(blender: Blender, scene: impl Into<PathBuf>, samples: u32, motion_blur: bool) -> Self {
        Self {
            blender,
            scene: scene.into(),
            samples,
            motion_blur,
            output_prefix: DEFAULT_OUTPUT_PREFIX.to_string(),
        }
    }

    /// Output prefix relative to the scene's directory.
    pub fn with_output_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = prefix.into();
        self
    }
}

/// Files in the scene's directory whose names start with `prefix`.
pub async fn output_files(scene: &Path, prefix: &str) -> Result<Vec<PathBuf>, RenderError> {
    if Path::new(prefix).is_absolute() {
        return Err(RenderError::AbsolutePrefix(prefix.to_string()));
    }
    let base = scene.parent().unwrap_or(Path::new("")).join(prefix);
    let dir = match base.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name_prefix = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(&name_prefix) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

#[async_trait]
impl FrameRenderer for BlenderRender {
    async fn render_frame(&self, frame: i64) -> Result<PathBuf, RenderError> {
        // Anything already there was not cleaned up after an upload.
        let leftover = output_files(&self.scene, &self.output_prefix).await?;
        if !leftover.is_empty() {
            return Err(RenderError::LeftoverOutput { files: leftover });
        }

        let args = [
            "-E".to_string(),
            "CYCLES".to_string(),
            "-o".to_string(),
            format!("//{}", self.output_prefix),
            "-f".to_string(),
            frame.to_string(),
            "--".to_string(),
            "--cycles-device".to_string(),
            CYCLES_DEVICE.to_string(),
        ];
        self.blender
            .run(&self.scene, &render_expr(self.samples, self.motion_blur), &args)
            .await?;

        let mut produced = output_files(&self.scene, &self.output_prefix).await?;
        // More than one usually means two workers share a directory.
        if produced.len() != 1 {
            return Err(RenderError::AmbiguousOutput {
                count: produced.len(),
            });
        }
        Ok(produced.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_between_markers() {
        let stdout = "Blender 3.6\nRead blend\nSTART>{\"frame_start\": 1, \"frame_end\": 250, \
            \"frame_step\": 1, \"samples\": 128, \"motion_blur\": true, \
            \"file_format\": \"PNG\", \"is_movie_format\": false}<END\nBlender quit\n";
        let attrs = parse_attributes(stdout).unwrap();
        assert_eq!(attrs.frame_end, 250);
        assert_eq!(attrs.samples, 128);
        assert!(attrs.motion_blur);
        assert_eq!(attrs.file_format, "PNG");
    }

    #[test]
    fn missing_or_malformed_attributes() {
        assert!(matches!(
            parse_attributes("Blender quit"),
            Err(RenderError::MissingAttributes)
        ));
        assert!(matches!(
            parse_attributes("START>{\"frame_start\": 1}<END"),
            Err(RenderError::Attributes(_))
        ));
    }

    #[test]
    fn render_expression_sets_samples_and_motion_blur() {
        let expr = render_expr(64, false);
        assert!(expr.contains("cycles.samples = 64"));
        assert!(expr.contains("use_motion_blur = False"));
    }

    #[tokio::test]
    async fn refuses_leftover_frames() {
        let dir = tempfile::tempdir().unwrap();
        let scene = dir.path().join("packed.blend");
        std::fs::write(dir.path().join("frame-0007.png"), b"old").unwrap();

        let render = BlenderRender::new(Blender::new(dir.path()), &scene, 16, true);
        match render.render_frame(8).await {
            Err(RenderError::LeftoverOutput { files }) => {
                assert_eq!(files, vec![dir.path().join("frame-0007.png")])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn refuses_absolute_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let render = BlenderRender::new(Blender::new(dir.path()), dir.path().join("s.blend"), 16, true)
            .with_output_prefix("/tmp/frame-");
        assert!(matches!(
            render.render_frame(1).await,
            Err(RenderError::AbsolutePrefix(_))
        ));
    }

    #[tokio::test]
    async fn output_files_only_match_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("frame-0001.png"), b"").unwrap();
        std::fs::write(dir.path().join("packed.blend"), b"").unwrap();
        let found = output_files(&dir.path().join("packed.blend"), "frame-")
            .await
            .unwrap();
        assert_eq!(found, vec![dir.path().join("frame-0001.png")]);
    }
}
