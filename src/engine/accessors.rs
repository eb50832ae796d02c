use super::{FrameStats, HybridRenderer};
use crate::frame::FrameSlotManager;
use crate::gpu::{
    BindingTableId, BufferId, Extent2d, GpuContext, GpuDevice, SwapchainInfo,
};
use crate::options::Options;
use crate::renderer::{GBuffer, OutputPair, TlasBuilder};

impl<D: GpuDevice> HybridRenderer<D> {
    /// The backend device.
    #[must_use]
    pub fn device(&self) -> &D {
        &self.ctx.device
    }

    /// Mutable backend device, for window-system notifications and fault
    /// injection.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.ctx.device
    }

    /// Device plus allocator.
    #[must_use]
    pub const fn context(&self) -> &GpuContext<D> {
        &self.ctx
    }

    /// Mutable context, for uploading scene assets between frames.
    pub fn context_mut(&mut self) -> &mut GpuContext<D> {
        &mut self.ctx
    }

    /// Current options.
    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    /// Frame counters, including the TLAS builder's.
    #[must_use]
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            tlas_builds: self.raytrace.tlas().builds(),
            tlas_skips: self.raytrace.tlas().skips(),
            ..self.stats
        }
    }

    /// The configured surface.
    #[must_use]
    pub const fn swapchain(&self) -> &SwapchainInfo {
        &self.swapchain
    }

    /// Internal render resolution (surface extent × render scale).
    #[must_use]
    pub fn render_extent(&self) -> Extent2d {
        self.geometry.extent()
    }

    /// G-buffer targets.
    #[must_use]
    pub const fn gbuffer(&self) -> &GBuffer {
        self.geometry.gbuffer()
    }

    /// Ray tracing output pair.
    #[must_use]
    pub const fn outputs(&self) -> &OutputPair {
        self.raytrace.outputs()
    }

    /// The 13-slot ray tracing binding table.
    #[must_use]
    pub const fn ray_tracing_table(&self) -> BindingTableId {
        self.raytrace.table()
    }

    /// Top-level acceleration structure builder.
    #[must_use]
    pub const fn tlas(&self) -> &TlasBuilder {
        self.raytrace.tlas()
    }

    /// Frames blended into the previous image since the last reset.
    #[must_use]
    pub const fn accumulated_frames(&self) -> u32 {
        self.accumulator.frames()
    }

    /// Frame slots.
    #[must_use]
    pub const fn slots(&self) -> &FrameSlotManager {
        &self.slots
    }

    /// Per-frame scene uniform buffer.
    #[must_use]
    pub const fn scene_uniform(&self) -> BufferId {
        self.scene_uniform.id()
    }
}
