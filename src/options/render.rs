use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Per-frame toggles consumed by the frame pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[schemars(title = "Render", inline)]
#[serde(default)]
pub struct RenderOptions {
    /// Compose the ray-traced image; when off, the G-buffer is lit by a
    /// full-screen raster pass instead.
    #[schemars(title = "Ray Tracing")]
    pub ray_tracing: bool,
    /// Internal render resolution relative to the surface.
    #[schemars(title = "Render Scale", range(min = 0.25, max = 2.0), extend("step" = 0.05))]
    pub render_scale: f32,
    /// Samples traced per pixel per frame.
    #[schemars(title = "Samples Per Pixel", range(min = 1, max = 64))]
    pub samples_per_pixel: u32,
    /// Color of pixels no geometry covers in the raster composite.
    #[schemars(skip)]
    pub clear_color: [f32; 4],
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            ray_tracing: true,
            render_scale: 1.0,
            samples_per_pixel: 1,
            clear_color: [0.02, 0.02, 0.03, 1.0],
        }
    }
}
