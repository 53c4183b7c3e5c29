//! Rendering: the Blender subprocess and the per-instance worker loop.

pub mod blender;
pub mod worker;

pub use blender::{Blender, BlenderRender, FrameRenderer, SceneAttributes, SceneInspector};
pub use worker::{FRAMES_PREFIX, FrameWorker};
