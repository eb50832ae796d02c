//! Resize protocol.
//!
//! Triggered by a stale acquire or present, an explicit window-size
//! notification or a render-scale change. Waits for the queue to drain,
//! reconfigures the surface, then rebuilds only what is sized by it: the
//! G-buffer, the extent-sized pipelines, the output pair and the
//! image-valued bindings. Acceleration structures and the global scene
//! buffers are left alone.

use super::HybridRenderer;
use crate::error::PrismError;
use crate::gpu::{Extent2d, GpuDevice};

impl<D: GpuDevice> HybridRenderer<D> {
    /// Rebuild the surface-sized state for a window of `window` pixels.
    ///
    /// An empty extent (minimized window) is ignored. Resizing twice to
    /// the same extent leaves every binding as the first resize left it.
    ///
    /// # Errors
    ///
    /// Device failure or missing programs; both are fatal.
    pub fn resize(&mut self, window: Extent2d) -> Result<(), PrismError> {
        if window.is_empty() {
            log::debug!("resize to {window} ignored");
            return Ok(());
        }
        self.ctx.device.wait_idle()?;

        let swapchain = self.ctx.device.configure_surface(window)?;
        self.slots
            .recreate_render_finished(&mut self.ctx.device, swapchain.images.len())?;

        let render_extent = window.scaled(self.options.render.render_scale);
        if render_extent != self.geometry.extent() {
            self.geometry.resize(
                &mut self.ctx,
                &self.library,
                &mut self.tracker,
                render_extent,
            )?;
            self.raytrace
                .resize(&mut self.ctx, &mut self.tracker, self.geometry.gbuffer())?;
            self.compositor.rebind(&mut self.ctx, self.geometry.gbuffer())?;
        }
        if swapchain.extent != self.compositor.extent()
            || swapchain.format != self.compositor.surface_format()
        {
            self.compositor.resize(
                &mut self.ctx,
                &self.library,
                swapchain.format,
                swapchain.extent,
            )?;
        }

        self.swapchain = swapchain;
        self.accumulator.reset();
        self.stats.resizes += 1;
        log::info!(
            "resized: surface {}, render {}",
            self.swapchain.extent,
            render_extent
        );
        Ok(())
    }

    /// Resize to whatever the window system reports now, or rebuild at
    /// the current extent when it reports nothing.
    pub(super) fn resize_to_window(&mut self) -> Result<(), PrismError> {
        let window = self
            .ctx
            .device
            .current_surface_extent()
            .unwrap_or(self.swapchain.extent);
        self.resize(window)
    }
}
