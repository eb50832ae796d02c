use super::{FrameOutcome, HybridRenderer};
use crate::camera::CameraState;
use crate::error::PrismError;
use crate::gpu::GpuDevice;
use crate::scene::SceneProvider;
use crate::util::frame_timing::FrameTiming;

/// Counters kept by the renderer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames that reached the surface (including suboptimal ones).
    pub presented: u64,
    /// Frames abandoned at acquire because the surface was out of date.
    pub dropped: u64,
    /// Runs of the resize protocol.
    pub resizes: u64,
    /// TLAS builds recorded.
    pub tlas_builds: usize,
    /// Frames whose TLAS build was skipped (unchanged scene).
    pub tlas_skips: usize,
    /// Global scene buffer rebuilds after a mesh-set change.
    pub scene_rebuilds: u64,
}

/// How [`run_frames`] ended.
#[derive(Debug)]
pub enum LoopExit {
    /// Every requested frame was rendered.
    Completed {
        /// Frames rendered.
        frames: u64,
    },
    /// A fatal error stopped the loop. The renderer must still be shut
    /// down.
    Fatal(PrismError),
}

/// Render `frames` frames of `scene` from `camera`.
///
/// Recoverable surface staleness is handled inside each frame. The first
/// fatal error is logged and ends the loop; teardown is left to
/// [`HybridRenderer::shutdown`].
pub fn run_frames<D: GpuDevice, S: SceneProvider + ?Sized>(
    renderer: &mut HybridRenderer<D>,
    scene: &S,
    camera: &CameraState,
    frames: u64,
) -> LoopExit {
    let mut timing = FrameTiming::new();
    for frame in 0..frames {
        match renderer.render_frame(scene, camera) {
            Ok(FrameOutcome::Presented | FrameOutcome::Resized) => {}
            Ok(outcome) => log::debug!("frame {frame}: {outcome:?}"),
            Err(e) => {
                log::error!("frame {frame} failed: {e}");
                return LoopExit::Fatal(e);
            }
        }
        timing.end_frame();
        let _ = timing.report();
    }
    LoopExit::Completed { frames }
}
